//! Pairwise intersection detection between tooth segments.
//!
//! Detection works on [`SegmentSnapshot`]s: world-space copies of a segment's
//! geometry, so a pass can run off the owning thread while the model keeps
//! changing. Every unordered pair of snapshots goes through three stages:
//!
//! 1. bounding-box rejection,
//! 2. mesh sampling: stride samples of one mesh tested inside the other with
//!    six near-axis parity rays, and the reverse,
//! 3. fallbacks when no sample is inside: close sample pairs, then the
//!    bounding-box overlap itself.
//!
//! Pairs are always evaluated in id order, so `detect_pair(a, b)` and
//! `detect_pair(b, a)` return the same result.

use std::fmt;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bvh::TriangleBvh;
use crate::error::DentalResult;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::segment::{DentalModel, SegmentId, ToothSegment};
use crate::spatial::SpatialIndex;
use crate::tracing_ext::{OperationTimer, log_detection_summary};
use crate::types::Aabb;

/// Rays used by the inside test: ±X, ±Y, ±Z, each tilted off the axis so
/// they do not run along the edges of axis-aligned geometry.
const PARITY_RAYS: [[f64; 3]; 6] = [
    [1.0, 0.0123, 0.0071],
    [-1.0, 0.0071, -0.0123],
    [0.0071, 1.0, 0.0123],
    [-0.0123, -1.0, 0.0071],
    [0.0123, 0.0071, 1.0],
    [0.0071, -0.0123, -1.0],
];

/// Parity votes needed to call a point inside.
const INSIDE_VOTES: usize = 4;

/// World-space copy of one segment's geometry.
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub id: SegmentId,
    pub positions: Vec<Point3<f64>>,
    pub faces: Vec<[u32; 3]>,
    pub bounds: Aabb,
    pub visible: bool,
}

impl SegmentSnapshot {
    /// Copy a segment's world geometry. `None` for a segment without faces.
    ///
    /// Fails if the segment's transform is stale.
    pub fn from_segment(segment: &ToothSegment) -> DentalResult<Option<Self>> {
        let matrix = segment.transform.matrix_world()?;
        let positions: Vec<Point3<f64>> = segment
            .mesh
            .vertices
            .iter()
            .map(|v| matrix.transform_point(&v.position))
            .collect();
        let Some(bounds) = Aabb::from_points(positions.iter().copied()) else {
            return Ok(None);
        };
        if segment.mesh.faces.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            id: segment.id,
            positions,
            faces: segment.mesh.faces.clone(),
            bounds,
            visible: segment.visible,
        }))
    }

    /// Snapshots of every visible, non-empty segment in the model.
    pub fn visible_in(model: &DentalModel) -> DentalResult<Vec<Self>> {
        let mut snapshots = Vec::with_capacity(model.len());
        for segment in model.segments().filter(|s| s.visible) {
            if let Some(snapshot) = Self::from_segment(segment)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Vertices followed by triangle centroids.
    fn sample_candidates(&self) -> impl Iterator<Item = Point3<f64>> + '_ {
        let centroids = self.faces.iter().map(|f| {
            let [a, b, c] = f.map(|i| self.positions[i as usize]);
            Point3::from((a.coords + b.coords + c.coords) / 3.0)
        });
        self.positions.iter().copied().chain(centroids)
    }

    /// Up to `count` candidates at a fixed stride.
    fn stride_samples(&self, count: usize) -> Vec<Point3<f64>> {
        let candidates: Vec<Point3<f64>> = self.sample_candidates().collect();
        let total = candidates.len();
        if total <= count {
            return candidates;
        }
        (0..count).map(|i| candidates[i * total / count]).collect()
    }
}

/// How deeply two segments interpenetrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntersectionType {
    Contact,
    Overlap,
    Collision,
}

impl IntersectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntersectionType::Contact => "contact",
            IntersectionType::Overlap => "overlap",
            IntersectionType::Collision => "collision",
        }
    }
}

impl fmt::Display for IntersectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stage produced the intersection points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    MeshSampling,
    DistanceSampling,
    BoundingBox,
}

/// Parameters for intersection detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntersectionParams {
    /// Samples drawn from each mesh of a pair.
    pub sample_count: usize,
    /// Sample pairs closer than this count as touching in the distance fallback.
    pub distance_threshold: f64,
    /// Points this close to the other surface count as inside.
    pub surface_epsilon: f64,
    /// Scores below this are low severity.
    pub severity_low: f64,
    /// Scores below this (and at least `severity_low`) are medium.
    pub severity_medium: f64,
    /// Penetration below this is a contact.
    pub contact_depth: f64,
    /// Penetration below this (and at least `contact_depth`) is an overlap.
    pub overlap_depth: f64,
    /// Report overlapping bounding boxes when no sample is inside or close.
    pub bbox_fallback: bool,
}

impl Default for IntersectionParams {
    fn default() -> Self {
        Self {
            sample_count: 500,
            distance_threshold: 0.1,
            surface_epsilon: 1e-4,
            severity_low: 1.0,
            severity_medium: 5.0,
            contact_depth: 0.1,
            overlap_depth: 1.0,
            bbox_fallback: true,
        }
    }
}

impl IntersectionParams {
    /// Only report pairs that actually touch.
    pub fn strict() -> Self {
        Self {
            bbox_fallback: false,
            ..Default::default()
        }
    }

    /// Denser sampling for final checks.
    pub fn thorough() -> Self {
        Self {
            sample_count: 2000,
            ..Default::default()
        }
    }

    fn classify(&self, depth: f64) -> IntersectionType {
        if depth < self.contact_depth {
            IntersectionType::Contact
        } else if depth < self.overlap_depth {
            IntersectionType::Overlap
        } else {
            IntersectionType::Collision
        }
    }

    fn severity(&self, score: f64) -> Severity {
        if score < self.severity_low {
            Severity::Low
        } else if score < self.severity_medium {
            Severity::Medium
        } else {
            Severity::High
        }
    }
}

/// One intersecting pair. `segment1 < segment2` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionResult {
    pub segment1: SegmentId,
    pub segment2: SegmentId,
    pub intersection_type: IntersectionType,
    pub severity: Severity,
    pub intersection_volume: f64,
    /// Smallest extent of the intersection points' bounding box.
    ///
    /// Classification and severity use this value. It is not a ray-cast
    /// depth; see [`mean_ray_depth`](Self::mean_ray_depth) for that.
    pub penetration_depth: f64,
    pub contact_area: f64,
    pub intersection_points: Vec<Point3<f64>>,
    pub bounding_box_overlap: Aabb,
    pub method: DetectionMethod,
    /// Mean distance from the inside points to the other surface along the parity rays.
    ///
    /// Reported only; it does not feed classification or severity.
    pub mean_ray_depth: f64,
}

impl IntersectionResult {
    /// Score the severity was derived from.
    pub fn score(&self) -> f64 {
        severity_score(
            self.penetration_depth,
            self.intersection_volume,
            self.contact_area,
        )
    }

    pub fn involves(&self, id: SegmentId) -> bool {
        self.segment1 == id || self.segment2 == id
    }
}

impl fmt::Display for IntersectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <-> {}: {} ({}), depth {:.3}, volume {:.3}, {} points",
            self.segment1,
            self.segment2,
            self.intersection_type,
            self.severity,
            self.penetration_depth,
            self.intersection_volume,
            self.intersection_points.len()
        )
    }
}

#[inline]
fn severity_score(depth: f64, volume: f64, area: f64) -> f64 {
    10.0 * depth + 0.1 * volume + 0.01 * area
}

/// A snapshot with its triangle hierarchy built.
struct Prepared<'a> {
    snapshot: &'a SegmentSnapshot,
    bvh: TriangleBvh,
}

impl<'a> Prepared<'a> {
    fn new(snapshot: &'a SegmentSnapshot) -> Self {
        Self {
            snapshot,
            bvh: TriangleBvh::from_positions(&snapshot.positions, &snapshot.faces),
        }
    }
}

/// Detection pass over segment snapshots.
#[derive(Debug, Clone, Default)]
pub struct IntersectionDetector {
    params: IntersectionParams,
}

impl IntersectionDetector {
    pub fn new(params: IntersectionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &IntersectionParams {
        &self.params
    }

    /// Test a single pair. Argument order does not matter.
    pub fn detect_pair(
        &self,
        a: &SegmentSnapshot,
        b: &SegmentSnapshot,
    ) -> Option<IntersectionResult> {
        let (a, b) = if a.id <= b.id { (a, b) } else { (b, a) };
        if !a.bounds.overlaps(&b.bounds) {
            return None;
        }
        self.detect_prepared(&Prepared::new(a), &Prepared::new(b))
    }

    /// Every intersecting pair among the visible snapshots, sorted by pair.
    pub fn detect_all(&self, snapshots: &[SegmentSnapshot]) -> Vec<IntersectionResult> {
        self.detect_all_with_progress(snapshots, None)
            .unwrap_or_default()
    }

    /// As [`detect_all`](Self::detect_all), reporting per pair.
    ///
    /// Returns `None` if the callback cancelled the pass.
    pub fn detect_all_with_progress(
        &self,
        snapshots: &[SegmentSnapshot],
        callback: Option<&ProgressCallback>,
    ) -> Option<Vec<IntersectionResult>> {
        let timer = OperationTimer::new("detect_intersections");

        let mut visible: Vec<&SegmentSnapshot> = snapshots.iter().filter(|s| s.visible).collect();
        visible.sort_by_key(|s| s.id);

        let prepared: Vec<Prepared<'_>> = visible.par_iter().map(|s| Prepared::new(s)).collect();

        let pairs: Vec<(usize, usize)> = (0..prepared.len())
            .flat_map(|i| ((i + 1)..prepared.len()).map(move |j| (i, j)))
            .filter(|&(i, j)| {
                prepared[i]
                    .snapshot
                    .bounds
                    .overlaps(&prepared[j].snapshot.bounds)
            })
            .collect();

        debug!(
            segments = prepared.len(),
            candidate_pairs = pairs.len(),
            "Intersection candidates after bounds rejection"
        );

        let tracker = ProgressTracker::new(pairs.len() as u64);
        let mut results: Vec<IntersectionResult> = pairs
            .par_iter()
            .filter_map(|&(i, j)| {
                if tracker.is_cancelled() {
                    return None;
                }
                let result = self.detect_prepared(&prepared[i], &prepared[j]);
                tracker.increment();
                tracker.maybe_callback(
                    callback,
                    format!(
                        "pair {} / {}",
                        tracker.current(),
                        tracker.total()
                    ),
                );
                result
            })
            .collect();

        if tracker.is_cancelled() {
            warn!(
                completed = tracker.current(),
                total = tracker.total(),
                "Intersection detection cancelled"
            );
            return None;
        }

        results.sort_by_key(|r| (r.segment1, r.segment2));
        log_detection_summary(&results, prepared.len(), timer.elapsed_ms());
        Some(results)
    }

    fn detect_prepared(&self, a: &Prepared<'_>, b: &Prepared<'_>) -> Option<IntersectionResult> {
        let overlap = a.snapshot.bounds.intersection(&b.snapshot.bounds)?;
        let p = &self.params;

        let samples_a = a.snapshot.stride_samples(p.sample_count);
        let samples_b = b.snapshot.stride_samples(p.sample_count);

        // Samples outside the overlap box cannot be inside the other mesh.
        let region = overlap.expanded(p.surface_epsilon);
        let mut tested = 0usize;
        let mut inside = Vec::new();
        let mut ray_depths = Vec::new();
        for (samples, other) in [(&samples_a, b), (&samples_b, a)] {
            for point in samples.iter().filter(|q| region.contains(q)) {
                tested += 1;
                if let Some(depth) = self.inside_depth(point, &other.bvh) {
                    inside.push(*point);
                    ray_depths.push(depth);
                }
            }
        }

        if !inside.is_empty() {
            let fraction = inside.len() as f64 / tested as f64;
            let mean_ray_depth = ray_depths.iter().sum::<f64>() / ray_depths.len() as f64;
            return Some(self.build_result(
                a.snapshot.id,
                b.snapshot.id,
                inside,
                fraction,
                overlap,
                DetectionMethod::MeshSampling,
                mean_ray_depth,
            ));
        }

        if let Some((midpoints, fraction)) = self.close_pairs(&samples_a, &samples_b, &overlap) {
            return Some(self.build_result(
                a.snapshot.id,
                b.snapshot.id,
                midpoints,
                fraction,
                overlap,
                DetectionMethod::DistanceSampling,
                0.0,
            ));
        }

        p.bbox_fallback.then(|| {
            self.build_result(
                a.snapshot.id,
                b.snapshot.id,
                overlap.corners().to_vec(),
                1.0,
                overlap,
                DetectionMethod::BoundingBox,
                0.0,
            )
        })
    }

    /// `Some(depth)` if `point` is inside the mesh behind `bvh`.
    ///
    /// Points on the surface are inside with depth 0. Otherwise the depth is
    /// the nearest surface hit over the rays that voted inside.
    fn inside_depth(&self, point: &Point3<f64>, bvh: &TriangleBvh) -> Option<f64> {
        if bvh.distance_within(point, self.params.surface_epsilon) {
            return Some(0.0);
        }

        let mut votes = 0;
        let mut nearest = f64::INFINITY;
        for ray in PARITY_RAYS {
            let direction = Vector3::from(ray).normalize();
            if bvh.count_crossings(point, &direction) % 2 == 1 {
                votes += 1;
                if let Some((t, _)) = bvh.closest_hit(point, &direction, f64::INFINITY) {
                    nearest = nearest.min(t);
                }
            }
        }

        (votes >= INSIDE_VOTES).then(|| if nearest.is_finite() { nearest } else { 0.0 })
    }

    /// Midpoints of sample pairs closer than the distance threshold.
    fn close_pairs(
        &self,
        samples_a: &[Point3<f64>],
        samples_b: &[Point3<f64>],
        overlap: &Aabb,
    ) -> Option<(Vec<Point3<f64>>, f64)> {
        let threshold = self.params.distance_threshold;
        if !(threshold.is_finite() && threshold > 0.0) {
            return None;
        }

        let region = overlap.expanded(threshold);
        let near_b: Vec<Point3<f64>> = samples_b
            .iter()
            .copied()
            .filter(|q| region.contains(q))
            .collect();
        if near_b.is_empty() {
            return None;
        }
        let index = SpatialIndex::from_points(near_b, threshold).ok()?;

        let mut tested = 0usize;
        let mut midpoints = Vec::new();
        for point in samples_a.iter().filter(|q| region.contains(q)) {
            tested += 1;
            if let Some((j, distance)) = index.nearest(point, threshold)
                && distance < threshold
                && let Some(other) = index.position(j)
            {
                midpoints.push(nalgebra::center(point, other));
            }
        }

        (!midpoints.is_empty()).then(|| {
            let fraction = midpoints.len() as f64 / tested as f64;
            (midpoints, fraction)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_result(
        &self,
        segment1: SegmentId,
        segment2: SegmentId,
        points: Vec<Point3<f64>>,
        fraction: f64,
        overlap: Aabb,
        method: DetectionMethod,
        mean_ray_depth: f64,
    ) -> IntersectionResult {
        let point_bounds = Aabb::from_points(points.iter().copied()).unwrap_or(overlap);
        let penetration_depth = point_bounds.min_extent().max(0.0);
        let intersection_volume = point_bounds.volume() * fraction;
        let contact_area = point_bounds.largest_face_area().max(0.0);
        let score = severity_score(penetration_depth, intersection_volume, contact_area);

        IntersectionResult {
            segment1,
            segment2,
            intersection_type: self.params.classify(penetration_depth),
            severity: self.params.severity(score),
            intersection_volume,
            penetration_depth,
            contact_area,
            intersection_points: points,
            bounding_box_overlap: overlap,
            method,
            mean_ray_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_meshes::unit_cube;
    use crate::types::Mesh;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot(id: u64, mesh: &Mesh) -> SegmentSnapshot {
        let positions: Vec<Point3<f64>> = mesh.vertices.iter().map(|v| v.position).collect();
        SegmentSnapshot {
            id: SegmentId(id),
            bounds: Aabb::from_points(positions.iter().copied()).expect("non-empty"),
            positions,
            faces: mesh.faces.clone(),
            visible: true,
        }
    }

    fn cube_at(id: u64, x: f64) -> SegmentSnapshot {
        let mut mesh = unit_cube();
        mesh.translate(Vector3::new(x, 0.0, 0.0));
        snapshot(id, &mesh)
    }

    #[test]
    fn test_separated_cubes_do_not_intersect() {
        let detector = IntersectionDetector::default();
        let results = detector.detect_all(&[cube_at(1, 0.0), cube_at(2, 10.0)]);
        assert!(results.is_empty());
    }

    #[test]
    fn test_identical_cubes_collide() {
        let detector = IntersectionDetector::default();
        let result = detector
            .detect_pair(&cube_at(1, 0.0), &cube_at(2, 0.0))
            .expect("identical cubes intersect");

        assert_eq!(result.method, DetectionMethod::MeshSampling);
        assert!((result.penetration_depth - 1.0).abs() < 1e-9);
        assert_eq!(result.intersection_type, IntersectionType::Collision);
        assert_eq!(result.severity, Severity::High);
        // Every sample sits on the other surface, so the ray depth stays small
        // while the bounding-box depth drives the classification
        assert!(result.mean_ray_depth < result.penetration_depth);
    }

    #[test]
    fn test_half_overlap_is_overlap() {
        let detector = IntersectionDetector::default();
        let result = detector
            .detect_pair(&cube_at(1, 0.0), &cube_at(2, 0.5))
            .expect("overlapping cubes intersect");

        assert_eq!(result.method, DetectionMethod::MeshSampling);
        assert!((result.penetration_depth - 0.5).abs() < 1e-6);
        assert_eq!(result.intersection_type, IntersectionType::Overlap);
        assert!(result.intersection_volume > 0.0);
    }

    #[test]
    fn test_detection_is_symmetric() {
        let detector = IntersectionDetector::default();
        let a = cube_at(3, 0.0);
        let b = cube_at(7, 0.3);
        let ab = detector.detect_pair(&a, &b);
        let ba = detector.detect_pair(&b, &a);
        assert_eq!(ab, ba);
        let r = ab.expect("intersecting");
        assert_eq!((r.segment1, r.segment2), (SegmentId(3), SegmentId(7)));
    }

    #[test]
    fn test_point_inside_cube() {
        let detector = IntersectionDetector::default();
        let bvh = TriangleBvh::from_mesh(&unit_cube());
        let depth = detector
            .inside_depth(&Point3::new(0.5, 0.5, 0.25), &bvh)
            .expect("center is inside");
        assert!((depth - 0.25).abs() < 0.01);
        assert!(
            detector
                .inside_depth(&Point3::new(2.0, 0.5, 0.5), &bvh)
                .is_none()
        );
    }

    #[test]
    fn test_bbox_fallback_toggle() {
        // Two thin plates whose boxes touch along a shared face but whose
        // samples lie far apart.
        let plate = |id: u64, z: f64, corner_z: f64| {
            let mut mesh = Mesh::from_triangle_soup(&[[
                Point3::new(0.0, 0.0, z),
                Point3::new(4.0, 0.0, z),
                Point3::new(0.0, 4.0, z),
            ]]);
            mesh.vertices
                .push(crate::types::Vertex::from_coords(4.0, 4.0, corner_z));
            snapshot(id, &mesh)
        };
        let a = plate(1, 0.0, 1.0);
        let b = plate(2, 1.0, 0.0);

        let lenient = IntersectionDetector::default()
            .detect_pair(&a, &b)
            .expect("bounds overlap");
        assert_eq!(lenient.method, DetectionMethod::BoundingBox);
        assert_eq!(lenient.intersection_points.len(), 8);

        assert!(
            IntersectionDetector::new(IntersectionParams::strict())
                .detect_pair(&a, &b)
                .is_none()
        );
    }

    #[test]
    fn test_hidden_segments_skipped() {
        let mut hidden = cube_at(2, 0.0);
        hidden.visible = false;
        let results = IntersectionDetector::default().detect_all(&[cube_at(1, 0.0), hidden]);
        assert!(results.is_empty());
    }

    #[test]
    fn test_results_sorted_by_pair() {
        let snapshots = vec![cube_at(5, 0.0), cube_at(2, 0.2), cube_at(9, 0.4)];
        let results = IntersectionDetector::default().detect_all(&snapshots);
        assert_eq!(results.len(), 3);
        let keys: Vec<_> = results.iter().map(|r| (r.segment1.0, r.segment2.0)).collect();
        assert_eq!(keys, vec![(2, 5), (2, 9), (5, 9)]);
    }

    #[test]
    fn test_cancel_returns_none() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let callback: ProgressCallback = Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            false
        });
        let snapshots = vec![cube_at(1, 0.0), cube_at(2, 0.2)];
        let outcome =
            IntersectionDetector::default().detect_all_with_progress(&snapshots, Some(&callback));
        assert!(outcome.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_severity_bands() {
        let params = IntersectionParams::default();
        assert_eq!(params.severity(0.5), Severity::Low);
        assert_eq!(params.severity(1.0), Severity::Medium);
        assert_eq!(params.severity(5.0), Severity::High);
        assert_eq!(params.classify(0.05), IntersectionType::Contact);
        assert_eq!(params.classify(0.5), IntersectionType::Overlap);
        assert_eq!(params.classify(1.0), IntersectionType::Collision);
    }
}
