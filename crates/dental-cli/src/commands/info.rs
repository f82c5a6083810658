//! dental info command - display scan statistics.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use dental_mesh::geometry::face_components;
use dental_mesh::load_mesh;
use serde::Serialize;

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct ScanInfo {
    path: String,
    vertices: usize,
    faces: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    bounds: Option<BoundsInfo>,
    has_normals: bool,
    components: usize,
    largest_component_faces: usize,
}

#[derive(Serialize)]
struct BoundsInfo {
    min: [f64; 3],
    max: [f64; 3],
    dimensions: [f64; 3],
}

pub fn run(input: &Path, cli: &Cli) -> Result<()> {
    let mesh = load_mesh(input).with_context(|| format!("Failed to load mesh from {:?}", input))?;

    let components = face_components(&mesh);
    let bounds = mesh.bounds().map(|b| {
        let dims = b.size();
        BoundsInfo {
            min: output::xyz(&b.min),
            max: output::xyz(&b.max),
            dimensions: [dims.x, dims.y, dims.z],
        }
    });

    let info = ScanInfo {
        path: input.display().to_string(),
        vertices: mesh.vertex_count(),
        faces: mesh.face_count(),
        bounds,
        has_normals: mesh.vertices.iter().any(|v| v.normal.is_some()),
        components: components.len(),
        largest_component_faces: components.first().map_or(0, Vec::len),
    };

    match cli.format {
        OutputFormat::Json => output::print(&info, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Scan Information".bold().underline());
                println!("  {}: {}", "File".cyan(), input.display());
                println!("  {}: {}", "Vertices".cyan(), info.vertices);
                println!("  {}: {}", "Faces".cyan(), info.faces);
                println!(
                    "  {}: {} (largest {} faces)",
                    "Components".cyan(),
                    info.components,
                    info.largest_component_faces
                );
                if let Some(ref b) = info.bounds {
                    println!(
                        "  {}: {:.2} x {:.2} x {:.2} mm",
                        "Dimensions".cyan(),
                        b.dimensions[0],
                        b.dimensions[1],
                        b.dimensions[2]
                    );
                }
                println!(
                    "  {}: {}",
                    "Has normals".cyan(),
                    if info.has_normals { "yes" } else { "no" }
                );
            }
        }
    }

    Ok(())
}
