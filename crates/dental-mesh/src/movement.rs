//! Tooth movement along anatomical axes.
//!
//! Each segment gets three orthogonal axes derived from its geometry and
//! the current view:
//!
//! - **root**: the long axis, from the lowest to the highest point along the
//!   model's up vector (PCA major axis when those coincide),
//! - **mesial-distal**: camera forward with its root component removed,
//! - **buccal-lingual**: `root x mesial_distal`, so `(md, bl, root)` is
//!   right-handed.
//!
//! Movements are recorded against these axes, not world axes, so a rotated
//! tooth still reports anatomically meaningful deltas.

use std::fmt;

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DentalError, DentalResult};
use crate::geometry::principal_axes;
use crate::segment::{DentalModel, MovementHistory, SegmentId, ToothSegment};

/// Semantic movement direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementAxis {
    /// Mesial-distal, along the arch.
    Anteroposterior,
    /// Along the root axis (intrusion / extrusion).
    Vertical,
    /// Buccal-lingual, across the arch.
    Transverse,
}

impl MovementAxis {
    pub const ALL: [MovementAxis; 3] = [
        MovementAxis::Anteroposterior,
        MovementAxis::Vertical,
        MovementAxis::Transverse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementAxis::Anteroposterior => "anteroposterior",
            MovementAxis::Vertical => "vertical",
            MovementAxis::Transverse => "transverse",
        }
    }
}

impl fmt::Display for MovementAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit axes of one segment, in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DentalAxes {
    pub root: Vector3<f64>,
    pub mesial_distal: Vector3<f64>,
    pub buccal_lingual: Vector3<f64>,
}

impl DentalAxes {
    /// Build from a root direction and the camera's forward vector.
    ///
    /// `None` if `root` is degenerate.
    pub fn from_root(root: &Vector3<f64>, camera_forward: &Vector3<f64>) -> Option<Self> {
        let root = root.try_normalize(1e-12)?;
        let projected = camera_forward - root * camera_forward.dot(&root);
        let mesial_distal = projected
            .try_normalize(1e-9)
            .unwrap_or_else(|| any_orthogonal(&root));
        let mut buccal_lingual = root.cross(&mesial_distal).normalize();
        if mesial_distal.cross(&buccal_lingual).dot(&root) < 0.0 {
            buccal_lingual = -buccal_lingual;
        }
        Some(Self {
            root,
            mesial_distal,
            buccal_lingual,
        })
    }

    pub fn axis(&self, axis: MovementAxis) -> Vector3<f64> {
        match axis {
            MovementAxis::Anteroposterior => self.mesial_distal,
            MovementAxis::Vertical => self.root,
            MovementAxis::Transverse => self.buccal_lingual,
        }
    }

    /// Components of `displacement` along (anteroposterior, vertical, transverse).
    pub fn decompose(&self, displacement: &Vector3<f64>) -> [f64; 3] {
        [
            displacement.dot(&self.mesial_distal),
            displacement.dot(&self.root),
            displacement.dot(&self.buccal_lingual),
        ]
    }
}

fn any_orthogonal(v: &Vector3<f64>) -> Vector3<f64> {
    let helper = if v.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    (helper - v * helper.dot(v)).normalize()
}

/// Root direction of a point set, pointing along `up`.
///
/// Extreme points along `up` give the direction; when they coincide the PCA
/// major axis is used. `None` for empty or fully degenerate input.
pub fn root_axis(points: &[Point3<f64>], up: &Vector3<f64>) -> Option<Vector3<f64>> {
    let up = up.try_normalize(1e-12)?;
    let height = |p: &Point3<f64>| p.coords.dot(&up);
    let top = points
        .iter()
        .max_by(|a, b| height(a).total_cmp(&height(b)))?;
    let bottom = points
        .iter()
        .min_by(|a, b| height(a).total_cmp(&height(b)))?;

    let direction = (top - bottom)
        .try_normalize(1e-9)
        .or_else(|| principal_axes(points).map(|pa| pa.major()))?;
    Some(if direction.dot(&up) < 0.0 {
        -direction
    } else {
        direction
    })
}

/// Movement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementParams {
    /// World up vector of the scan.
    pub up: [f64; 3],
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            up: [0.0, 1.0, 0.0],
        }
    }
}

/// What one movement did.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementRecord {
    pub segment: SegmentId,
    pub axis: MovementAxis,
    pub distance: f64,
    /// World direction the segment moved along.
    pub direction: Vector3<f64>,
    pub position: Vector3<f64>,
    pub history: MovementHistory,
}

impl fmt::Display for MovementRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment {} moved {:+.3} mm {} (net: ap {:+.3}, v {:+.3}, t {:+.3})",
            self.segment,
            self.distance,
            self.axis,
            self.history.anteroposterior,
            self.history.vertical,
            self.history.transverse
        )
    }
}

/// Applies movements and caches per-segment root axes.
///
/// Root axes are cached in local space keyed by geometry version, so a
/// geometry edit recomputes them and a pure move does not.
#[derive(Debug, Clone, Default)]
pub struct MovementController {
    params: MovementParams,
    roots: HashMap<SegmentId, (u64, Vector3<f64>)>,
}

impl MovementController {
    pub fn new(params: MovementParams) -> Self {
        Self {
            params,
            roots: HashMap::new(),
        }
    }

    pub fn params(&self) -> &MovementParams {
        &self.params
    }

    fn up(&self) -> Vector3<f64> {
        Vector3::from(self.params.up)
    }

    /// Axes of `segment` for the given view.
    pub fn axes(
        &mut self,
        segment: &ToothSegment,
        camera_forward: &Vector3<f64>,
    ) -> DentalResult<DentalAxes> {
        let local_root = match self.roots.get(&segment.id) {
            Some(&(version, root)) if version == segment.geometry_version => root,
            _ => {
                // Up is a world direction; bring it into the segment's frame
                let local_up = segment.transform.rotation().inverse() * self.up();
                let root = root_axis(&segment.original_vertices, &local_up).ok_or_else(|| {
                    DentalError::empty_mesh(format!("segment {} has no usable vertices", segment.id))
                })?;
                debug!(segment = %segment.id, version = segment.geometry_version, "Root axis computed");
                self.roots.insert(segment.id, (segment.geometry_version, root));
                root
            }
        };
        let world_root = segment.transform.rotation() * local_root;
        DentalAxes::from_root(&world_root, camera_forward).ok_or_else(|| {
            DentalError::empty_mesh(format!("segment {} has a degenerate root axis", segment.id))
        })
    }

    /// Move a segment along one of its dental axes.
    ///
    /// The net displacement from the original position is re-projected onto
    /// the current axes into `movement_history`.
    pub fn apply_movement(
        &mut self,
        model: &mut DentalModel,
        id: SegmentId,
        axis: MovementAxis,
        distance: f64,
        camera_forward: &Vector3<f64>,
    ) -> DentalResult<MovementRecord> {
        if !distance.is_finite() {
            return Err(DentalError::invalid_parameter(
                "distance",
                format!("movement distance must be finite, got {distance}"),
            ));
        }
        let axes = self.axes(model.segment(id)?, camera_forward)?;
        let direction = axes.axis(axis);

        let segment = model.segment_mut(id)?;
        segment.transform.translate(direction * distance);
        segment.transform.update_matrix_world();

        let net = segment.transform.position() - segment.original_position;
        let [ap, vertical, transverse] = axes.decompose(&net);
        let history = &mut segment.movement_history;
        history.anteroposterior = ap;
        history.vertical = vertical;
        history.transverse = transverse;
        history.total_movements += 1;
        history.last_movement_type = Some(axis);
        segment.sync_movement_distance();

        let record = MovementRecord {
            segment: id,
            axis,
            distance,
            direction,
            position: segment.transform.position(),
            history: segment.movement_history.clone(),
        };
        model.touch();
        info!(segment = %id, %axis, distance, "Segment moved");
        Ok(record)
    }

    /// Return a segment to its original position and clear its history.
    pub fn reset_movement(&mut self, model: &mut DentalModel, id: SegmentId) -> DentalResult<()> {
        let segment = model.segment_mut(id)?;
        let original = segment.original_position;
        segment.transform.set_position(original);
        segment.transform.update_matrix_world();
        segment.movement_history = MovementHistory::default();
        segment.sync_movement_distance();
        model.touch();
        info!(segment = %id, "Segment movement reset");
        Ok(())
    }

    /// Reset every segment.
    pub fn reset_all(&mut self, model: &mut DentalModel) -> DentalResult<()> {
        for id in model.ids() {
            self.reset_movement(model, id)?;
        }
        Ok(())
    }

    /// Forget cached axes for a segment.
    pub fn invalidate(&mut self, id: SegmentId) {
        self.roots.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::SegmentGeometry;
    use crate::segment::ToothType;
    use crate::types::{Mesh, Vertex};

    /// Tall thin box, long along Y.
    fn tooth() -> Mesh {
        let mut mesh = Mesh::new();
        for &(x, y, z) in &[
            (0.0, 0.0, 0.0),
            (1.0, 0.0, 0.0),
            (1.0, 0.0, 1.0),
            (0.0, 0.0, 1.0),
            (0.0, 8.0, 0.0),
            (1.0, 8.0, 0.0),
            (1.0, 8.0, 1.0),
            (0.0, 8.0, 1.0),
        ] {
            mesh.vertices.push(Vertex::from_coords(x, y, z));
        }
        mesh.faces = vec![[0, 1, 5], [0, 5, 4], [2, 3, 7], [2, 7, 6]];
        mesh
    }

    fn model() -> (DentalModel, SegmentId) {
        let mut model = DentalModel::new(Mesh::new());
        let id = model.add_segment("11", SegmentGeometry::imported(tooth()), ToothType::Incisor);
        (model, id)
    }

    fn forward() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -1.0)
    }

    #[test]
    fn test_axes_are_orthonormal_right_handed() {
        let axes = DentalAxes::from_root(&Vector3::new(0.1, 1.0, 0.0), &forward()).expect("valid");
        for v in [axes.root, axes.mesial_distal, axes.buccal_lingual] {
            assert!((v.norm() - 1.0).abs() < 1e-12);
        }
        assert!(axes.root.dot(&axes.mesial_distal).abs() < 1e-12);
        assert!(axes.root.dot(&axes.buccal_lingual).abs() < 1e-12);
        assert!(axes.mesial_distal.cross(&axes.buccal_lingual).dot(&axes.root) > 0.999);
    }

    #[test]
    fn test_forward_parallel_to_root_falls_back() {
        let axes = DentalAxes::from_root(&Vector3::z(), &Vector3::z()).expect("valid");
        assert!(axes.mesial_distal.dot(&Vector3::z()).abs() < 1e-12);
    }

    #[test]
    fn test_root_axis_follows_long_side() {
        let root = root_axis(
            &tooth().vertices.iter().map(|v| v.position).collect::<Vec<_>>(),
            &Vector3::y(),
        )
        .expect("non-empty");
        assert!(root.y > 0.9);
    }

    #[test]
    fn test_vertical_move_records_history() {
        let (mut model, id) = model();
        let mut controller = MovementController::default();
        let record = controller
            .apply_movement(&mut model, id, MovementAxis::Vertical, 3.0, &forward())
            .expect("moved");

        let segment = model.get(id).expect("exists");
        assert!((segment.movement_history.vertical - 3.0).abs() < 1e-9);
        assert!(segment.movement_history.anteroposterior.abs() < 1e-9);
        assert_eq!(segment.movement_history.total_movements, 1);
        assert_eq!(segment.movement_history.last_movement_type, Some(MovementAxis::Vertical));
        assert!((segment.movement_distance - 3.0).abs() < 1e-9);
        assert!(!segment.transform.is_stale());
        assert!((record.position - segment.position()).norm() < 1e-12);
    }

    #[test]
    fn test_distance_invariant_after_mixed_moves_and_reset() {
        let (mut model, id) = model();
        let mut controller = MovementController::default();
        for (axis, d) in [
            (MovementAxis::Anteroposterior, 1.5),
            (MovementAxis::Transverse, -0.7),
            (MovementAxis::Vertical, 0.4),
        ] {
            controller
                .apply_movement(&mut model, id, axis, d, &forward())
                .expect("moved");
            let s = model.get(id).expect("exists");
            let expected = (s.position() - s.original_position).norm();
            assert!((s.movement_distance - expected).abs() < 1e-12);
        }

        controller.reset_movement(&mut model, id).expect("reset");
        let s = model.get(id).expect("exists");
        assert_eq!(s.movement_distance, 0.0);
        assert!(s.movement_history.is_zero());
        assert_eq!(s.movement_history.total_movements, 0);
    }

    #[test]
    fn test_non_finite_distance_rejected() {
        let (mut model, id) = model();
        let mut controller = MovementController::default();
        let err = controller
            .apply_movement(&mut model, id, MovementAxis::Vertical, f64::NAN, &forward())
            .unwrap_err();
        assert!(matches!(err, DentalError::InvalidParameter { name: "distance", .. }));
    }

    #[test]
    fn test_cache_refreshes_on_geometry_change() {
        let (mut model, id) = model();
        let mut controller = MovementController::default();
        let before = controller
            .axes(model.get(id).expect("exists"), &forward())
            .expect("axes");
        assert!(before.root.y > 0.9);

        // Lay the tooth on its side: long along X
        let mut flat = tooth();
        for v in &mut flat.vertices {
            v.position = Point3::new(v.position.y, v.position.x * 0.5, v.position.z);
        }
        model
            .replace_geometry(id, SegmentGeometry::imported(flat))
            .expect("exists");
        let after = controller
            .axes(model.get(id).expect("exists"), &forward())
            .expect("axes");
        assert!(after.root.x.abs() > 0.9);
    }
}
