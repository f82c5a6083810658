//! Bounding volume hierarchy over a triangle set.
//!
//! Used for occlusion raycasts in the scene, inside/outside parity tests in
//! intersection detection, and surface proximity queries.

use nalgebra::{Point3, Vector3};

use crate::types::{Aabb, Mesh, Triangle};

/// Hits closer than this along a ray are treated as the same crossing
/// (a ray through a shared edge reports both triangles).
pub const HIT_MERGE_EPSILON: f64 = 1e-7;

const PARALLEL_EPSILON: f64 = 1e-12;

#[derive(Debug)]
enum BvhNode {
    Leaf {
        aabb: Aabb,
        face_idx: usize,
    },
    Internal {
        aabb: Aabb,
        left: Box<BvhNode>,
        right: Box<BvhNode>,
    },
}

impl BvhNode {
    fn build(triangles: &[Triangle], indices: &mut [usize], epsilon: f64) -> Option<Self> {
        if indices.is_empty() {
            return None;
        }

        if indices.len() == 1 {
            let idx = indices[0];
            return Some(BvhNode::Leaf {
                aabb: triangle_aabb(&triangles[idx]).expanded(epsilon),
                face_idx: idx,
            });
        }

        let mut combined = triangle_aabb(&triangles[indices[0]]);
        for &idx in indices.iter().skip(1) {
            combined = combined.union(&triangle_aabb(&triangles[idx]));
        }
        let combined = combined.expanded(epsilon);

        // Split along the longest extent at the median centroid
        let extent = combined.size();
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        indices.sort_by(|&a, &b| {
            let va = triangles[a].centroid()[axis];
            let vb = triangles[b].centroid()[axis];
            va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mid = indices.len() / 2;
        let (left_indices, right_indices) = indices.split_at_mut(mid);

        let left = BvhNode::build(triangles, left_indices, epsilon);
        let right = BvhNode::build(triangles, right_indices, epsilon);

        match (left, right) {
            (Some(l), Some(r)) => Some(BvhNode::Internal {
                aabb: combined,
                left: Box::new(l),
                right: Box::new(r),
            }),
            (Some(n), None) | (None, Some(n)) => Some(n),
            (None, None) => None,
        }
    }

    fn aabb(&self) -> &Aabb {
        match self {
            BvhNode::Leaf { aabb, .. } => aabb,
            BvhNode::Internal { aabb, .. } => aabb,
        }
    }
}

fn triangle_aabb(tri: &Triangle) -> Aabb {
    let mut aabb = Aabb::new(tri.v0, tri.v0);
    aabb.include(&tri.v1);
    aabb.include(&tri.v2);
    aabb
}

/// Möller–Trumbore ray-triangle intersection.
/// Returns the distance `t` along the ray for hits with `t > t_min`.
pub fn ray_triangle_intersect(
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    tri: &Triangle,
    t_min: f64,
) -> Option<f64> {
    let edge1 = tri.v1 - tri.v0;
    let edge2 = tri.v2 - tri.v0;

    let h = direction.cross(&edge2);
    let a = edge1.dot(&h);

    if a.abs() < PARALLEL_EPSILON {
        return None;
    }

    let f = 1.0 / a;
    let s = origin - tri.v0;
    let u = f * s.dot(&h);

    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&edge1);
    let v = f * direction.dot(&q);

    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(&q);

    if t > t_min { Some(t) } else { None }
}

/// Triangle BVH with median splits on the longest axis.
#[derive(Debug)]
pub struct TriangleBvh {
    triangles: Vec<Triangle>,
    root: Option<BvhNode>,
}

impl TriangleBvh {
    /// Build from explicit triangles.
    pub fn new(triangles: Vec<Triangle>) -> Self {
        let mut indices: Vec<usize> = (0..triangles.len()).collect();
        let root = BvhNode::build(&triangles, &mut indices, 1e-9);
        Self { triangles, root }
    }

    /// Build from a mesh in its local coordinates.
    pub fn from_mesh(mesh: &Mesh) -> Self {
        Self::new(mesh.triangles().collect())
    }

    /// Build from raw positions and faces.
    pub fn from_positions(positions: &[Point3<f64>], faces: &[[u32; 3]]) -> Self {
        let triangles = faces
            .iter()
            .map(|f| {
                Triangle::new(
                    positions[f[0] as usize],
                    positions[f[1] as usize],
                    positions[f[2] as usize],
                )
            })
            .collect();
        Self::new(triangles)
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Bounds of all triangles.
    pub fn bounds(&self) -> Option<Aabb> {
        self.root.as_ref().map(|r| *r.aabb())
    }

    /// Closest hit along the ray within `max_dist`, as `(t, face_index)`.
    ///
    /// `direction` need not be normalized; `t` is in units of its length.
    pub fn closest_hit(
        &self,
        origin: &Point3<f64>,
        direction: &Vector3<f64>,
        max_dist: f64,
    ) -> Option<(f64, usize)> {
        let root = self.root.as_ref()?;
        let dir_inv = direction.map(|c| 1.0 / c);
        self.trace_closest(root, origin, direction, &dir_inv, max_dist)
    }

    fn trace_closest(
        &self,
        node: &BvhNode,
        origin: &Point3<f64>,
        direction: &Vector3<f64>,
        dir_inv: &Vector3<f64>,
        max_dist: f64,
    ) -> Option<(f64, usize)> {
        match node.aabb().ray_intersect(origin, dir_inv) {
            Some((t_near, _)) if t_near <= max_dist => {}
            _ => return None,
        }

        match node {
            BvhNode::Leaf { face_idx, .. } => {
                ray_triangle_intersect(origin, direction, &self.triangles[*face_idx], 0.0)
                    .filter(|&t| t <= max_dist)
                    .map(|t| (t, *face_idx))
            }
            BvhNode::Internal { left, right, .. } => {
                let hit_left = self.trace_closest(left, origin, direction, dir_inv, max_dist);
                let max_right = hit_left.map(|(t, _)| t).unwrap_or(max_dist);
                let hit_right = self.trace_closest(right, origin, direction, dir_inv, max_right);
                match (hit_left, hit_right) {
                    (Some(l), Some(r)) => Some(if l.0 <= r.0 { l } else { r }),
                    (Some(h), None) | (None, Some(h)) => Some(h),
                    (None, None) => None,
                }
            }
        }
    }

    /// Every hit along the ray, sorted by distance.
    pub fn all_hits(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> Vec<(f64, usize)> {
        let mut hits = Vec::new();
        if let Some(root) = &self.root {
            let dir_inv = direction.map(|c| 1.0 / c);
            self.collect_hits(root, origin, direction, &dir_inv, &mut hits);
        }
        hits.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        hits
    }

    fn collect_hits(
        &self,
        node: &BvhNode,
        origin: &Point3<f64>,
        direction: &Vector3<f64>,
        dir_inv: &Vector3<f64>,
        hits: &mut Vec<(f64, usize)>,
    ) {
        if node.aabb().ray_intersect(origin, dir_inv).is_none() {
            return;
        }
        match node {
            BvhNode::Leaf { face_idx, .. } => {
                if let Some(t) =
                    ray_triangle_intersect(origin, direction, &self.triangles[*face_idx], 0.0)
                {
                    hits.push((t, *face_idx));
                }
            }
            BvhNode::Internal { left, right, .. } => {
                self.collect_hits(left, origin, direction, dir_inv, hits);
                self.collect_hits(right, origin, direction, dir_inv, hits);
            }
        }
    }

    /// Number of distinct surface crossings along the ray.
    ///
    /// Hits within [`HIT_MERGE_EPSILON`] of each other count once.
    pub fn count_crossings(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> usize {
        let hits = self.all_hits(origin, direction);
        let mut count = 0;
        let mut last = f64::NEG_INFINITY;
        for (t, _) in hits {
            if t - last > HIT_MERGE_EPSILON {
                count += 1;
                last = t;
            }
        }
        count
    }

    /// Distance from `p` to the nearest triangle, if one lies within `max_dist`.
    pub fn nearest_distance(&self, p: &Point3<f64>, max_dist: f64) -> Option<f64> {
        let root = self.root.as_ref()?;
        let mut best = max_dist;
        let mut found = false;
        self.nearest(root, p, &mut best, &mut found);
        found.then_some(best)
    }

    fn nearest(&self, node: &BvhNode, p: &Point3<f64>, best: &mut f64, found: &mut bool) {
        if aabb_distance(node.aabb(), p) > *best {
            return;
        }
        match node {
            BvhNode::Leaf { face_idx, .. } => {
                let q = self.triangles[*face_idx].closest_point(p);
                let d = (q - p).norm();
                if d <= *best {
                    *best = d;
                    *found = true;
                }
            }
            BvhNode::Internal { left, right, .. } => {
                let dl = aabb_distance(left.aabb(), p);
                let dr = aabb_distance(right.aabb(), p);
                let (first, second) = if dl <= dr { (left, right) } else { (right, left) };
                self.nearest(first, p, best, found);
                self.nearest(second, p, best, found);
            }
        }
    }

    /// True if some triangle lies within `eps` of `p`.
    #[inline]
    pub fn distance_within(&self, p: &Point3<f64>, eps: f64) -> bool {
        self.nearest_distance(p, eps).is_some()
    }
}

fn aabb_distance(aabb: &Aabb, p: &Point3<f64>) -> f64 {
    let dx = (aabb.min.x - p.x).max(0.0).max(p.x - aabb.max.x);
    let dy = (aabb.min.y - p.y).max(0.0).max(p.y - aabb.max.y);
    let dz = (aabb.min.z - p.z).max(0.0).max(p.z - aabb.max.z);
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_meshes::unit_cube;

    #[test]
    fn test_ray_triangle_intersect_hit() {
        let tri = Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        );
        let t = ray_triangle_intersect(
            &Point3::new(0.2, 0.2, 1.0),
            &Vector3::new(0.0, 0.0, -1.0),
            &tri,
            0.0,
        );
        assert!((t.expect("hit") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ray_triangle_parallel() {
        let tri = Triangle::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        );
        let t = ray_triangle_intersect(
            &Point3::new(0.2, 0.2, 1.0),
            &Vector3::new(1.0, 0.0, 0.0),
            &tri,
            0.0,
        );
        assert!(t.is_none());
    }

    #[test]
    fn test_closest_hit_on_cube() {
        let bvh = TriangleBvh::from_mesh(&unit_cube());
        let (t, _) = bvh
            .closest_hit(
                &Point3::new(0.5, 0.5, 5.0),
                &Vector3::new(0.0, 0.0, -1.0),
                f64::INFINITY,
            )
            .expect("hit");
        assert!((t - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_crossing_parity() {
        let bvh = TriangleBvh::from_mesh(&unit_cube());
        let dir = Vector3::new(0.013, 0.021, 1.0);
        // Inside: one crossing on the way out
        assert_eq!(bvh.count_crossings(&Point3::new(0.4, 0.45, 0.5), &dir), 1);
        // Outside below the cube: enters and exits
        assert_eq!(bvh.count_crossings(&Point3::new(0.4, 0.45, -2.0), &dir), 2);
        // Outside to the side: misses
        assert_eq!(bvh.count_crossings(&Point3::new(4.0, 0.45, 0.5), &dir), 0);
    }

    #[test]
    fn test_nearest_distance() {
        let bvh = TriangleBvh::from_mesh(&unit_cube());
        let d = bvh
            .nearest_distance(&Point3::new(0.5, 0.5, 3.0), f64::INFINITY)
            .expect("distance");
        assert!((d - 2.0).abs() < 1e-9);
        assert!(bvh.nearest_distance(&Point3::new(0.5, 0.5, 3.0), 1.0).is_none());
        assert!(bvh.distance_within(&Point3::new(1.0, 0.5, 0.5), 1e-6));
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = TriangleBvh::new(Vec::new());
        assert!(bvh.is_empty());
        assert!(
            bvh.closest_hit(&Point3::origin(), &Vector3::x(), f64::INFINITY)
                .is_none()
        );
        assert_eq!(bvh.count_crossings(&Point3::origin(), &Vector3::x()), 0);
    }
}
