//! Dental-aware growth of a stroke's selection across similar surface.
//!
//! Breadth-first over one-ring adjacency. A neighbor is admitted while its
//! curvature stays close to the seed mean and it stays near the seed centroid,
//! which keeps the flood on a tooth crown instead of leaking over the gum line.

use std::collections::{BTreeSet, VecDeque};

use hashbrown::HashSet;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::VertexAdjacency;
use crate::types::Mesh;

/// Growth limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionParams {
    pub enabled: bool,

    /// Largest admitted difference from the seeds' mean curvature.
    pub max_curvature_diff: f64,

    /// Largest admitted distance from the seed centroid, mesh-local units.
    pub max_distance: f64,

    /// Hard cap on the grown selection size.
    pub max_vertices: usize,
}

impl Default for ExpansionParams {
    fn default() -> Self {
        Self {
            enabled: false,
            max_curvature_diff: 0.5,
            max_distance: 5.0,
            max_vertices: 5000,
        }
    }
}

impl ExpansionParams {
    /// Enabled growth with default limits.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }
}

/// Grown selection.
#[derive(Debug, Clone, Default)]
pub struct ExpansionResult {
    pub vertices: BTreeSet<u32>,
    /// Vertices added beyond the seeds.
    pub added: usize,
    /// Growth stopped at `max_vertices`.
    pub capped: bool,
}

/// Grow `seeds` over `adjacency`.
///
/// `curvature` is indexed by vertex, as produced by
/// [`vertex_curvature`](crate::geometry::vertex_curvature). Seeds are always
/// kept, even when more of them than `max_vertices` are given.
pub fn expand_selection(
    mesh: &Mesh,
    adjacency: &VertexAdjacency,
    curvature: &[f64],
    seeds: &BTreeSet<u32>,
    params: &ExpansionParams,
) -> ExpansionResult {
    let n = mesh.vertices.len();
    let seeds: BTreeSet<u32> = seeds.iter().copied().filter(|&v| (v as usize) < n).collect();
    if seeds.is_empty() {
        return ExpansionResult::default();
    }

    let curvature_at = |v: u32| curvature.get(v as usize).copied().unwrap_or(0.0);
    let mean_curvature = seeds.iter().map(|&v| curvature_at(v)).sum::<f64>() / seeds.len() as f64;
    let centroid = Point3::from(
        seeds
            .iter()
            .map(|&v| mesh.vertices[v as usize].position.coords)
            .sum::<nalgebra::Vector3<f64>>()
            / seeds.len() as f64,
    );

    let mut visited: HashSet<u32> = seeds.iter().map(|&v| adjacency.representative(v)).collect();
    let mut grown: BTreeSet<u32> = visited.iter().copied().collect();
    let mut queue: VecDeque<u32> = grown.iter().copied().collect();
    let mut capped = false;

    'bfs: while let Some(v) = queue.pop_front() {
        for &nb in adjacency.neighbors(v) {
            if !visited.insert(nb) {
                continue;
            }
            let curv_ok = (curvature_at(nb) - mean_curvature).abs() <= params.max_curvature_diff;
            let dist_ok =
                (mesh.vertices[nb as usize].position - centroid).norm() <= params.max_distance;
            if !(curv_ok && dist_ok) {
                continue;
            }
            if grown.len() >= params.max_vertices {
                capped = true;
                break 'bfs;
            }
            grown.insert(nb);
            queue.push_back(nb);
        }
    }

    let mut vertices = adjacency.expand_coincident(&grown);
    vertices.extend(seeds.iter().copied());
    let added = vertices.len() - seeds.len();
    debug!(seeds = seeds.len(), added, capped, "Selection expansion");

    ExpansionResult {
        vertices,
        added,
        capped,
    }
}
