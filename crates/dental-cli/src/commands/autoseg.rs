//! dental autoseg command - split a scan into per-tooth files.

use std::path::Path;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use dental_mesh::autoseg::split_gum_and_teeth;
use dental_mesh::{auto_segment, load_mesh, save_stl};
use serde::Serialize;

use crate::{Cli, OutputFormat, load_config, output};

#[derive(Serialize)]
struct SegmentFile {
    tooth_number: usize,
    tooth_type: String,
    method: String,
    file: String,
    triangles: usize,
    bbox_volume: f64,
}

#[derive(Serialize)]
struct SegmentReport {
    input: String,
    stage: Option<String>,
    score: Option<f64>,
    segments: Vec<SegmentFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_files: Vec<String>,
}

pub fn run(input: &Path, output_dir: &Path, gum: bool, cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let mesh = load_mesh(input).with_context(|| format!("Failed to load mesh from {:?}", input))?;

    let result = auto_segment(&mesh, &config.segmentation).context("Segmentation failed")?;
    if result.is_empty() && !gum {
        bail!("No tooth segments found in {:?}", input);
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;

    let mut segments = Vec::with_capacity(result.segments.len());
    for (i, segment) in result.segments.iter().enumerate() {
        let name = segment.file_name(i + 1);
        let path = output_dir.join(&name);
        save_stl(&segment.geometry.mesh, &path)
            .with_context(|| format!("Failed to write {:?}", path))?;
        segments.push(SegmentFile {
            tooth_number: i + 1,
            tooth_type: segment.tooth_type().to_string(),
            method: segment.method.clone(),
            file: name,
            triangles: segment.triangle_count(),
            bbox_volume: segment.bbox_volume(),
        });
    }

    let mut extra_files = Vec::new();
    if gum {
        let (gum_part, teeth_part) =
            split_gum_and_teeth(&mesh, config.segmentation.gum_height_percentile);
        for (name, part) in [("gum.stl", gum_part), ("teeth.stl", teeth_part)] {
            if part.mesh.faces.is_empty() {
                continue;
            }
            let path = output_dir.join(name);
            save_stl(&part.mesh, &path).with_context(|| format!("Failed to write {:?}", path))?;
            extra_files.push(name.to_string());
        }
    }

    let report = SegmentReport {
        input: input.display().to_string(),
        stage: result.stage.map(|s| s.to_string()),
        score: result.score,
        segments,
        extra_files,
    };

    match cli.format {
        OutputFormat::Json => output::print(&report, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Segmentation".bold().underline());
                println!("  {}: {}", "Result".cyan(), result);
                for s in &report.segments {
                    println!(
                        "  {:>2}. {} ({}, {} triangles)",
                        s.tooth_number, s.file, s.tooth_type, s.triangles
                    );
                }
                for f in &report.extra_files {
                    println!("      {}", f);
                }
            }
            if report.segments.is_empty() {
                output::warning("No tooth segments found; wrote the height split only", cli.quiet);
            } else {
                output::success(
                    &format!(
                        "Wrote {} segments to {}",
                        report.segments.len(),
                        output_dir.display()
                    ),
                    cli.quiet,
                );
            }
        }
    }

    Ok(())
}
