//! dental intersect command - collision check between segment files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use dental_mesh::intersect::SegmentSnapshot;
use dental_mesh::{IntersectionDetector, SegmentId, Severity, save_ascii_stl};
use serde::Serialize;

use super::load_segments;
use crate::{Cli, OutputFormat, load_config, output};

#[derive(Serialize)]
struct PairReport {
    segment1: String,
    segment2: String,
    #[serde(flatten)]
    result: dental_mesh::IntersectionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    export: Option<String>,
}

#[derive(Serialize)]
struct IntersectReport {
    segments: usize,
    pairs_checked: usize,
    intersections: Vec<PairReport>,
}

pub fn run(inputs: &[PathBuf], strict: bool, export: Option<&Path>, cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let (model, names) = load_segments(inputs)?;
    let names: HashMap<SegmentId, String> = names.into_iter().collect();

    let mut params = config.intersection;
    if strict {
        params.bbox_fallback = false;
    }
    let snapshots = SegmentSnapshot::visible_in(&model)?;
    let results = IntersectionDetector::new(params).detect_all(&snapshots);

    if let Some(dir) = export {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create export directory {:?}", dir))?;
    }

    let name_of = |id: SegmentId| names.get(&id).cloned().unwrap_or_else(|| id.to_string());
    let mut intersections = Vec::with_capacity(results.len());
    for result in results {
        let (a, b) = (name_of(result.segment1), name_of(result.segment2));
        let exported = match export {
            Some(dir) => {
                let file = format!("{}__{}.stl", a, b);
                let mut triangles = model.world_triangles(result.segment1)?;
                triangles.extend(model.world_triangles(result.segment2)?);
                save_ascii_stl(&dir.join(&file), &format!("{}_{}", a, b), &triangles)?;
                Some(file)
            }
            None => None,
        };
        intersections.push(PairReport {
            segment1: a,
            segment2: b,
            result,
            export: exported,
        });
    }

    let n = snapshots.len();
    let report = IntersectReport {
        segments: n,
        pairs_checked: n * n.saturating_sub(1) / 2,
        intersections,
    };

    match cli.format {
        OutputFormat::Json => output::print(&report, cli.format, cli.quiet),
        OutputFormat::Text => {
            if cli.quiet {
                return Ok(());
            }
            println!("{}", "Intersection Check".bold().underline());
            println!(
                "  {}: {} segments, {} pairs",
                "Checked".cyan(),
                report.segments,
                report.pairs_checked
            );
            if report.intersections.is_empty() {
                output::success("No intersections", cli.quiet);
                return Ok(());
            }
            for pair in &report.intersections {
                let r = &pair.result;
                let severity = match r.severity {
                    Severity::High => r.severity.as_str().red().bold(),
                    Severity::Medium => r.severity.as_str().yellow(),
                    Severity::Low => r.severity.as_str().normal(),
                };
                println!(
                    "  {} <-> {}: {} [{}] depth {:.3} mm, volume {:.3} mm³",
                    pair.segment1,
                    pair.segment2,
                    r.intersection_type,
                    severity,
                    r.penetration_depth,
                    r.intersection_volume
                );
                if let Some(ref file) = pair.export {
                    println!("      exported {}", file);
                }
            }
            output::warning(
                &format!("{} intersecting pairs", report.intersections.len()),
                cli.quiet,
            );
        }
    }

    Ok(())
}
