//! Shared output helpers.

use colored::Colorize;
use serde::Serialize;

use crate::OutputFormat;

/// Print `value` as pretty JSON. Text output is written by each command.
pub fn print<T: Serialize>(value: &T, format: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    if let OutputFormat::Json = format {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}: failed to encode JSON: {}", "Error".red().bold(), e),
        }
    }
}

/// `[x, y, z]` of a point.
pub fn xyz(v: &nalgebra::Point3<f64>) -> [f64; 3] {
    [v.x, v.y, v.z]
}

pub fn success(message: &str, quiet: bool) {
    if !quiet {
        println!("{} {}", "✓".green().bold(), message);
    }
}

pub fn warning(message: &str, quiet: bool) {
    if !quiet {
        println!("{} {}", "!".yellow().bold(), message);
    }
}
