//! Brush resolution: vertices near the surface points under each stroke sample.

use std::collections::BTreeSet;

use nalgebra::Point3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{ResolveEnv, ScreenPoint, ScreenRect};
use crate::spatial::SpatialIndex;

/// Brush shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrushParams {
    /// Radius around the surface hit, in mesh-local units.
    pub radius: f64,

    /// Radius in pixels, used when no surface point is found under a sample.
    pub screen_radius: f64,

    /// 0 = soft edge, 1 = hard edge.
    pub hardness: f64,

    /// 0 selects only the exact center, 1 selects the whole radius.
    pub strength: f64,
}

impl Default for BrushParams {
    fn default() -> Self {
        Self {
            radius: 1.0,
            screen_radius: 20.0,
            hardness: 0.5,
            strength: 0.8,
        }
    }
}

impl BrushParams {
    /// Hard, full-strength brush: everything within the radius.
    pub fn hard(radius: f64) -> Self {
        Self {
            radius,
            hardness: 1.0,
            strength: 1.0,
            ..Default::default()
        }
    }

    /// Falloff weight `(1 - d/r)^(1/(hardness + 0.1))`, or `None` beyond the radius.
    pub fn falloff(&self, distance: f64, radius: f64) -> Option<f64> {
        if !(radius > 0.0) || !(distance >= 0.0) || distance > radius {
            return None;
        }
        let exponent = 1.0 / (self.hardness.max(0.0) + 0.1);
        Some((1.0 - distance / radius).powf(exponent))
    }

    /// Whether a vertex at `distance` is picked up.
    pub fn includes(&self, distance: f64, radius: f64) -> bool {
        self.falloff(distance, radius)
            .is_some_and(|f| f >= 1.0 - self.strength)
    }
}

/// Resolve brush samples to the visible vertices under them.
pub(super) fn resolve(
    env: &ResolveEnv<'_>,
    samples: &[ScreenPoint],
    params: &BrushParams,
) -> BTreeSet<u32> {
    let mut selected = BTreeSet::new();
    let mut screen_fallback = Vec::new();

    for &sample in samples {
        match surface_center(env, sample) {
            Some((center, index)) => {
                for vi in index.query(&center, params.radius) {
                    let Some(vertex) = env.mesh.vertices.get(vi as usize) else {
                        continue;
                    };
                    let d = (vertex.position - center).norm();
                    if params.includes(d, params.radius) && env.vertex_visible(vi) {
                        selected.insert(vi);
                    }
                }
            }
            None => screen_fallback.push(sample),
        }
    }

    if !screen_fallback.is_empty() {
        trace!(samples = screen_fallback.len(), "Brush using screen-space fallback");
        selected.extend(resolve_screen(env, &screen_fallback, params));
    }
    selected
}

/// Surface point under a sample, in mesh-local coordinates.
///
/// Requires a raycaster and spatial index; hits on other objects don't count.
fn surface_center<'e>(
    env: &ResolveEnv<'e>,
    sample: ScreenPoint,
) -> Option<(Point3<f64>, &'e SpatialIndex)> {
    let raycaster = env.raycaster?;
    let index = env.spatial?;
    let (ndc_x, ndc_y) = env.projector.viewport().to_ndc(sample.x, sample.y);
    let ray = env.camera.ray_through_ndc(ndc_x, ndc_y)?;
    let hit = raycaster.first_hit(&ray, f64::INFINITY)?;
    if let Some(object) = env.object
        && hit.object != object
    {
        return None;
    }
    let inverse = env.projector.model_matrix().try_inverse()?;
    Some((inverse.transform_point(&hit.point), index))
}

fn resolve_screen(
    env: &ResolveEnv<'_>,
    samples: &[ScreenPoint],
    params: &BrushParams,
) -> BTreeSet<u32> {
    let radius = params.screen_radius;
    let Some(mut rect) = ScreenRect::from_points(samples) else {
        return BTreeSet::new();
    };
    rect.grow(radius);
    let candidates = super::lasso::candidates(env, &rect);

    candidates
        .par_iter()
        .copied()
        .filter(|&vi| {
            let Some(projected) = env
                .mesh
                .vertices
                .get(vi as usize)
                .and_then(|v| env.projector.project(&v.position))
            else {
                return false;
            };
            let p = ScreenPoint::new(projected.x, projected.y);
            let nearest = samples
                .iter()
                .map(|s| s.distance(&p))
                .fold(f64::INFINITY, f64::min);
            params.includes(nearest, radius) && env.vertex_visible(vi)
        })
        .collect()
}
