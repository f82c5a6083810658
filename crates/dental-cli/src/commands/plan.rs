//! dental plan command - move teeth and stage the movement into aligner steps.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use colored::Colorize;
use dental_mesh::{
    MovementAxis, MovementController, OrthodonticTreatmentPlan, SegmentId,
};
use nalgebra::Vector3;
use serde::Serialize;

use super::load_segments;
use crate::{Cli, OutputFormat, load_config, output};

/// Default view direction when none is given: looking down -Z at the arch.
const VIEW_FORWARD: [f64; 3] = [0.0, 0.0, -1.0];

#[derive(Serialize)]
struct PlanReport<'a> {
    moves: Vec<String>,
    plan: &'a OrthodonticTreatmentPlan,
}

fn parse_axis(s: &str) -> Result<MovementAxis> {
    match s.trim().to_ascii_lowercase().as_str() {
        "anteroposterior" | "ap" | "mesial" => Ok(MovementAxis::Anteroposterior),
        "vertical" | "v" | "root" => Ok(MovementAxis::Vertical),
        "transverse" | "t" | "buccal" => Ok(MovementAxis::Transverse),
        other => bail!(
            "Unknown movement axis {:?} (expected anteroposterior, vertical or transverse)",
            other
        ),
    }
}

/// Split `NAME:AXIS:VALUE`, taking the last two fields so names may contain ':'.
fn split_triplet(arg: &str) -> Result<(&str, MovementAxis, &str)> {
    let mut parts = arg.rsplitn(3, ':');
    let value = parts.next();
    let axis = parts.next();
    let name = parts.next();
    match (name, axis, value) {
        (Some(name), Some(axis), Some(value)) if !name.is_empty() => {
            Ok((name, parse_axis(axis)?, value))
        }
        _ => bail!("Expected NAME:AXIS:VALUE, got {:?}", arg),
    }
}

pub fn run(inputs: &[PathBuf], moves: &[String], overrides: &[String], cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let (mut model, names) = load_segments(inputs)?;
    let by_name: HashMap<String, SegmentId> =
        names.iter().map(|(id, name)| (name.clone(), *id)).collect();
    let lookup = |name: &str| {
        by_name
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("No segment named {:?}; names are input file stems", name))
    };

    let mut controller = MovementController::new(config.movement.clone());
    let forward = Vector3::from(VIEW_FORWARD);
    let mut applied = Vec::with_capacity(moves.len());
    for arg in moves {
        let (name, axis, value) = split_triplet(arg)?;
        let distance: f64 = value
            .parse()
            .with_context(|| format!("Invalid distance in {:?}", arg))?;
        let record = controller.apply_movement(&mut model, lookup(name)?, axis, distance, &forward)?;
        applied.push(format!("{}: {}", name, record));
    }

    let mut plan = OrthodonticTreatmentPlan::generate(&model, &config.planning);
    for arg in overrides {
        let (name, axis, value) = split_triplet(arg)?;
        let steps: u32 = value
            .parse()
            .with_context(|| format!("Invalid step count in {:?}", arg))?;
        plan.set_override(lookup(name)?, axis, Some(steps))
            .with_context(|| format!("Cannot apply override {:?}", arg))?;
    }

    match cli.format {
        OutputFormat::Json => output::print(
            &PlanReport {
                moves: applied,
                plan: &plan,
            },
            cli.format,
            cli.quiet,
        ),
        OutputFormat::Text => {
            if cli.quiet {
                return Ok(());
            }
            println!("{}", "Treatment Plan".bold().underline());
            for line in &applied {
                println!("  {}", line);
            }
            if plan.is_empty() {
                output::warning("No movement above the noise threshold; nothing to plan", cli.quiet);
                return Ok(());
            }
            print!("{}", plan);
            output::success(&format!("{} aligner steps", plan.total_steps()), cli.quiet);
        }
    }

    Ok(())
}
