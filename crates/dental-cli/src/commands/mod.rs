//! Subcommand implementations.

pub mod autoseg;
pub mod config;
pub mod info;
pub mod intersect;
pub mod plan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dental_mesh::autoseg::classify_tooth_type;
use dental_mesh::{DentalModel, Mesh, SegmentGeometry, SegmentId, ToothType, load_mesh};
use tracing::info;

/// Load each file as one segment of an otherwise empty model, named by file stem.
pub fn load_segments(inputs: &[PathBuf]) -> Result<(DentalModel, Vec<(SegmentId, String)>)> {
    let mut model = DentalModel::new(Mesh::new());
    let mut names = Vec::with_capacity(inputs.len());
    for path in inputs {
        let mesh = load_mesh(path).with_context(|| format!("Failed to load mesh from {:?}", path))?;
        let tooth_type = mesh
            .bounds()
            .map(|b| classify_tooth_type(b.volume()))
            .unwrap_or(ToothType::Molar);
        let name = stem(path);
        let id = model.add_segment(name.clone(), SegmentGeometry::imported(mesh), tooth_type);
        names.push((id, name));
    }
    info!(segments = names.len(), "Loaded segment files");
    Ok((model, names))
}

pub fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
