//! dental: command-line front-end for dental scan processing.
//!
//! Segments scans into teeth, checks segment files for collisions and turns
//! tooth movements into staged aligner plans, suitable for scripting and
//! batch pipelines.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=dental_mesh=info` - Basic operation logging
//! - `RUST_LOG=dental_mesh=debug` - Detailed progress logging
//! - `RUST_LOG=dental_mesh::timing=debug` - Performance timing
//! - `RUST_LOG=debug` - All debug output
//!
//! # Example
//!
//! ```bash
//! # Split a scan into per-tooth STL files
//! RUST_LOG=dental_mesh=info dental autoseg scan.stl -o teeth/
//!
//! # Check the result for collisions, as JSON
//! dental --format json intersect teeth/*.stl
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use dental_mesh::DentalConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;

use commands::{autoseg, config, info, intersect, plan};

/// dental - segment, check and plan dental scans.
#[derive(Parser)]
#[command(name = "dental")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for results
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress all non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (.toml or .json)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display scan statistics
    Info {
        /// Input mesh file
        input: PathBuf,
    },

    /// Split a scan into per-tooth segment files
    Autoseg {
        /// Input mesh file
        input: PathBuf,

        /// Directory for the segment STL files
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the gum and teeth halves of the height split
        #[arg(long)]
        gum: bool,
    },

    /// Detect collisions between segment files
    Intersect {
        /// Segment mesh files
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,

        /// Skip the bounding-box fallback for pairs without sampled contact
        #[arg(long)]
        strict: bool,

        /// Write an ASCII STL of each colliding pair's world triangles to this directory
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Apply tooth movements and print the aligner plan
    Plan {
        /// Segment mesh files, one tooth each
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Movement as FILE_STEM:AXIS:MM, e.g. tooth_01:vertical:3.0
        #[arg(long = "move", short = 'm', value_name = "MOVE")]
        moves: Vec<String>,

        /// Override a step count as FILE_STEM:AXIS:STEPS
        #[arg(long = "steps", value_name = "OVERRIDE")]
        overrides: Vec<String>,
    },

    /// Print a configuration file with every default filled in
    Config {
        /// Start from a preset
        #[arg(long, default_value = "default")]
        preset: Preset,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Preset {
    /// Library defaults
    Default,
    /// Strict, dense detection and conservative steps
    Clinical,
    /// Curvature-guided selection
    DentalAware,
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v flags
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "dental_mesh=info",
            2 => "dental_mesh=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

/// The `--config` file, or defaults.
pub fn load_config(path: Option<&Path>) -> Result<DentalConfig> {
    match path {
        Some(path) => DentalConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => Ok(DentalConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Info { input } => info::run(input, &cli),
        Commands::Autoseg { input, output, gum } => autoseg::run(input, output, *gum, &cli),
        Commands::Intersect {
            inputs,
            strict,
            export,
        } => intersect::run(inputs, *strict, export.as_deref(), &cli),
        Commands::Plan {
            inputs,
            moves,
            overrides,
        } => plan::run(inputs, moves, overrides, &cli),
        Commands::Config { preset, output } => config::run(*preset, output.as_deref(), &cli),
    };

    if let Err(e) = &result {
        if !cli.quiet {
            if let Some(dental_err) = e.downcast_ref::<dental_mesh::DentalError>() {
                eprintln!("{}: {}", "Error".red().bold(), dental_err);
                eprintln!("  {}: {}", "Code".cyan(), dental_err.code());
                eprintln!(
                    "  {}: {}",
                    "Suggestion".green(),
                    dental_err.recovery_suggestion()
                );
                if let Some(location) = dental_err.location() {
                    eprintln!("  {}: {}", "Location".yellow(), location);
                }
            } else {
                eprintln!("{}: {}", "Error".red().bold(), e);
                for cause in e.chain().skip(1) {
                    eprintln!("  {}: {}", "Caused by".yellow(), cause);
                }
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
