//! dental config command - write out a complete configuration file.

use std::path::Path;

use anyhow::{Context, Result};
use dental_mesh::DentalConfig;

use crate::{Cli, OutputFormat, Preset, output};

pub fn run(preset: Preset, output_path: Option<&Path>, cli: &Cli) -> Result<()> {
    let config = match preset {
        Preset::Default => DentalConfig::default(),
        Preset::Clinical => DentalConfig::preset_clinical(),
        Preset::DentalAware => DentalConfig::preset_dental_aware(),
    };

    if let Some(path) = output_path {
        config
            .save(path)
            .with_context(|| format!("Failed to write configuration to {:?}", path))?;
        output::success(&format!("Wrote {}", path.display()), cli.quiet);
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => output::print(&config, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                print!("{}", config.to_toml()?);
            }
        }
    }
    Ok(())
}
