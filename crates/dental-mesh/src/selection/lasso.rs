//! Lasso resolution: vertices whose projection falls inside the stroke polygon.

use std::collections::BTreeSet;

use rayon::prelude::*;
use tracing::debug;

use super::{ResolveEnv, ScreenPoint, ScreenRect};

/// Even-odd ray-casting point-in-polygon test.
///
/// The polygon is implicitly closed. Points exactly on an edge may fall
/// either way; points strictly outside are never reported inside.
pub fn point_in_polygon(p: ScreenPoint, polygon: &[ScreenPoint]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > p.y) != (pj.y > p.y) {
            let x_cross = (pj.x - pi.x) * (p.y - pi.y) / (pj.y - pi.y) + pi.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Candidate vertex indices for a screen rectangle.
///
/// With a spatial index, whole cells whose projected bounds miss the rectangle
/// are skipped. Cells with a corner behind the camera are kept.
pub(super) fn candidates(env: &ResolveEnv<'_>, rect: &ScreenRect) -> Vec<u32> {
    let Some(index) = env.spatial else {
        return (0..env.mesh.vertices.len() as u32).collect();
    };

    let mut out = Vec::new();
    let mut culled = 0usize;
    for (_, bounds, members) in index.cells() {
        let mut cell_rect: Option<ScreenRect> = None;
        let mut behind = false;
        for corner in bounds.corners() {
            match env.projector.project(&corner) {
                Some(v) => {
                    let p = ScreenPoint::new(v.x, v.y);
                    match &mut cell_rect {
                        Some(r) => r.include(p),
                        None => cell_rect = Some(ScreenRect::from_point(p)),
                    }
                }
                None => behind = true,
            }
        }
        let keep = behind || cell_rect.is_some_and(|r| r.overlaps(rect));
        if keep {
            out.extend_from_slice(members);
        } else {
            culled += members.len();
        }
    }
    out.sort_unstable();
    debug!(candidates = out.len(), culled, "Lasso cell culling");
    out
}

/// Resolve a closed stroke to the visible vertices inside it.
pub(super) fn resolve(env: &ResolveEnv<'_>, polygon: &[ScreenPoint]) -> BTreeSet<u32> {
    let Some(rect) = ScreenRect::from_points(polygon) else {
        return BTreeSet::new();
    };
    let candidates = candidates(env, &rect);

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
            let sp = ScreenPoint::new(projected.x, projected.y);
            rect.contains(sp) && point_in_polygon(sp, polygon) && env.vertex_visible(vi)
        })
        .collect()
}
