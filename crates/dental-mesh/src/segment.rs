//! Tooth segments and the model that owns them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use hashbrown::HashSet;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::editor::{SegmentEditor, SegmentGeometry};
use crate::error::{DentalError, DentalResult};
use crate::geometry::{PositionKey, position_key};
use crate::movement::MovementAxis;
use crate::scene::{ObjectId, Scene};
use crate::transform::Transform;
use crate::types::{Aabb, Mesh, VertexColor};

/// Stable handle of a segment within a [`DentalModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToothType {
    Incisor,
    Canine,
    Premolar,
    #[default]
    Molar,
    Wisdom,
    Gum,
}

impl ToothType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToothType::Incisor => "incisor",
            ToothType::Canine => "canine",
            ToothType::Premolar => "premolar",
            ToothType::Molar => "molar",
            ToothType::Wisdom => "wisdom",
            ToothType::Gum => "gum",
        }
    }

    /// Parse a lowercase type name. Unknown names are `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "incisor" => Some(ToothType::Incisor),
            "canine" => Some(ToothType::Canine),
            "premolar" => Some(ToothType::Premolar),
            "molar" => Some(ToothType::Molar),
            "wisdom" => Some(ToothType::Wisdom),
            "gum" | "gingiva" => Some(ToothType::Gum),
            _ => None,
        }
    }
}

impl fmt::Display for ToothType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative displacement of a segment along its dental axes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementHistory {
    /// Along the mesial-distal axis.
    pub anteroposterior: f64,
    /// Along the root axis.
    pub vertical: f64,
    /// Along the buccal-lingual axis.
    pub transverse: f64,
    pub total_movements: u32,
    pub last_movement_type: Option<MovementAxis>,
}

impl MovementHistory {
    pub fn get(&self, axis: MovementAxis) -> f64 {
        match axis {
            MovementAxis::Anteroposterior => self.anteroposterior,
            MovementAxis::Vertical => self.vertical,
            MovementAxis::Transverse => self.transverse,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.anteroposterior == 0.0 && self.vertical == 0.0 && self.transverse == 0.0
    }
}

/// One tooth (or gum) mesh with its placement and movement state.
#[derive(Debug, Clone)]
pub struct ToothSegment {
    pub id: SegmentId,
    pub name: String,
    /// Geometry in local coordinates.
    pub mesh: Mesh,
    /// Local vertex positions as of the last geometry change.
    pub original_vertices: Vec<Point3<f64>>,
    /// Local-space vertex centroid.
    pub centroid: Point3<f64>,
    pub color: VertexColor,
    pub tooth_type: ToothType,
    /// FDI or universal number, when known.
    pub tooth_number: Option<u32>,
    pub is_selected: bool,
    pub visible: bool,
    pub original_position: Vector3<f64>,
    /// Always `|transform.position - original_position|`.
    pub movement_distance: f64,
    pub movement_history: MovementHistory,
    pub transform: Transform,
    /// Source-scan faces this segment was cut from.
    pub source_faces: Option<Vec<u32>>,
    /// Bumped on every geometry replacement.
    pub geometry_version: u64,
    /// How the segment was produced (`manual`, `ai`, `dbscan_eps_1.2`, ...).
    pub method: Option<String>,
}

impl ToothSegment {
    pub fn new(
        id: SegmentId,
        name: impl Into<String>,
        geometry: SegmentGeometry,
        tooth_type: ToothType,
    ) -> Self {
        let transform = Transform::identity();
        let original_position = transform.position();
        let mut segment = Self {
            id,
            name: name.into(),
            mesh: Mesh::new(),
            original_vertices: Vec::new(),
            centroid: Point3::origin(),
            color: segment_color(id),
            tooth_type,
            tooth_number: None,
            is_selected: false,
            visible: true,
            original_position,
            movement_distance: 0.0,
            movement_history: MovementHistory::default(),
            transform,
            source_faces: None,
            geometry_version: 0,
            method: None,
        };
        segment.set_geometry(geometry);
        segment.geometry_version = 0;
        segment
    }

    pub fn triangle_count(&self) -> usize {
        self.mesh.faces.len()
    }

    /// Current translation.
    pub fn position(&self) -> Vector3<f64> {
        self.transform.position()
    }

    /// Centroid in world space. Fails while the transform is stale.
    pub fn world_centroid(&self) -> DentalResult<Point3<f64>> {
        self.transform.to_world(&self.centroid)
    }

    /// World-space bounds. Fails while the transform is stale.
    pub fn world_bounds(&self) -> DentalResult<Option<Aabb>> {
        let matrix = self.transform.matrix_world()?;
        Ok(self.mesh.bounds().map(|b| b.transformed(matrix)))
    }

    /// Mesh with the transform applied. Fails while the transform is stale.
    pub fn world_mesh(&self) -> DentalResult<Mesh> {
        Ok(self.mesh.transformed(self.transform.matrix_world()?))
    }

    /// Restore `movement_distance` from the current position.
    pub fn sync_movement_distance(&mut self) {
        self.movement_distance = (self.transform.position() - self.original_position).norm();
    }

    fn set_geometry(&mut self, geometry: SegmentGeometry) {
        self.original_vertices = geometry.mesh.vertices.iter().map(|v| v.position).collect();
        self.centroid = geometry.mesh.centroid().unwrap_or_else(Point3::origin);
        self.mesh = geometry.mesh;
        self.source_faces = geometry.source_faces;
        self.geometry_version += 1;
    }
}

/// Distinct hue per segment id, golden-angle spaced.
fn segment_color(id: SegmentId) -> VertexColor {
    let hue = (id.0 as f64 * 0.618_033_988_75).fract() as f32;
    VertexColor::from_hsl(hue, 0.55, 0.65)
}

/// The aggregate root: the original scan plus its tooth segments.
///
/// Segments live in an arena keyed by [`SegmentId`]; ids are never reused, so
/// iteration order is insertion order. `revision` increases on every geometry
/// or transform change and is what detection results are keyed against.
#[derive(Debug, Clone)]
pub struct DentalModel {
    original: Mesh,
    original_transform: Transform,
    segments: BTreeMap<SegmentId, ToothSegment>,
    next_id: u64,
    revision: u64,
    bounds: Option<Aabb>,
}

impl DentalModel {
    pub fn new(original: Mesh) -> Self {
        let bounds = original.bounds();
        Self {
            original,
            original_transform: Transform::identity(),
            segments: BTreeMap::new(),
            next_id: 1,
            revision: 0,
            bounds,
        }
    }

    pub fn original(&self) -> &Mesh {
        &self.original
    }

    pub fn original_transform(&self) -> &Transform {
        &self.original_transform
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// World bounds of the scan and all segments.
    pub fn bounding_box(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &ToothSegment> {
        self.segments.values()
    }

    pub fn ids(&self) -> Vec<SegmentId> {
        self.segments.keys().copied().collect()
    }

    pub fn get(&self, id: SegmentId) -> Option<&ToothSegment> {
        self.segments.get(&id)
    }

    pub fn segment(&self, id: SegmentId) -> DentalResult<&ToothSegment> {
        self.segments
            .get(&id)
            .ok_or(DentalError::SegmentNotFound { id })
    }

    /// Mutable access. Counts as a change: the revision is bumped.
    pub fn segment_mut(&mut self, id: SegmentId) -> DentalResult<&mut ToothSegment> {
        let segment = self
            .segments
            .get_mut(&id)
            .ok_or(DentalError::SegmentNotFound { id })?;
        self.revision += 1;
        Ok(segment)
    }

    /// Add a segment, assigning it the next id.
    pub fn add_segment(
        &mut self,
        name: impl Into<String>,
        geometry: SegmentGeometry,
        tooth_type: ToothType,
    ) -> SegmentId {
        let id = SegmentId(self.next_id);
        self.next_id += 1;
        let segment = ToothSegment::new(id, name, geometry, tooth_type);
        debug!(%id, triangles = segment.triangle_count(), "Segment added");
        self.segments.insert(id, segment);
        self.revision += 1;
        self.refresh_bounds();
        id
    }

    pub fn remove_segment(&mut self, id: SegmentId) -> DentalResult<ToothSegment> {
        let segment = self
            .segments
            .remove(&id)
            .ok_or(DentalError::SegmentNotFound { id })?;
        self.revision += 1;
        self.refresh_bounds();
        Ok(segment)
    }

    /// Drop every segment, keeping the scan.
    pub fn clear_segments(&mut self) {
        if !self.segments.is_empty() {
            self.segments.clear();
            self.revision += 1;
            self.refresh_bounds();
        }
    }

    /// Swap a segment's geometry in one step.
    ///
    /// Recomputes the centroid and bumps the geometry version (dropping cached
    /// axes) and the model revision.
    pub fn replace_geometry(&mut self, id: SegmentId, geometry: SegmentGeometry) -> DentalResult<()> {
        let segment = self
            .segments
            .get_mut(&id)
            .ok_or(DentalError::SegmentNotFound { id })?;
        segment.set_geometry(geometry);
        debug!(%id, version = segment.geometry_version, "Segment geometry replaced");
        self.revision += 1;
        self.refresh_bounds();
        Ok(())
    }

    /// Cut a new segment out of the scan. Fails with `EmptySelection` when no
    /// triangle has two selected vertices.
    pub fn extract_segment(
        &mut self,
        name: impl Into<String>,
        selection: &BTreeSet<u32>,
        tooth_type: ToothType,
    ) -> DentalResult<SegmentId> {
        let extracted = SegmentEditor::new(&self.original)
            .extract(selection)
            .ok_or_else(|| {
                DentalError::empty_selection(format!(
                    "{} selected vertices cover no triangle",
                    selection.len()
                ))
            })?;
        let id = self.add_segment(name, extracted.geometry, tooth_type);
        if let Some(segment) = self.segments.get_mut(&id) {
            segment.method = Some("manual".to_string());
            info!(
                %id,
                name = %segment.name,
                triangles = segment.triangle_count(),
                dropped = extracted.dropped_vertices,
                "Segment extracted"
            );
        }
        Ok(id)
    }

    /// Grow a segment by the scan triangles touching `selection`.
    pub fn add_to_segment(&mut self, id: SegmentId, selection: &BTreeSet<u32>) -> DentalResult<()> {
        let geometry = SegmentEditor::new(&self.original).add_vertices(self.segment(id)?, selection)?;
        self.replace_geometry(id, geometry)
    }

    /// Shrink a segment by the triangles touching `selection`.
    pub fn remove_from_segment(
        &mut self,
        id: SegmentId,
        selection: &BTreeSet<u32>,
    ) -> DentalResult<()> {
        let geometry =
            SegmentEditor::new(&self.original).remove_vertices(self.segment(id)?, selection)?;
        self.replace_geometry(id, geometry)
    }

    /// Segments that contain any of the given scan vertices.
    pub fn segments_touching(&self, selection: &BTreeSet<u32>) -> Vec<SegmentId> {
        if selection.is_empty() {
            return Vec::new();
        }
        let keys: HashSet<PositionKey> = selection
            .iter()
            .filter_map(|&v| self.original.vertices.get(v as usize))
            .map(|v| position_key(&v.position))
            .collect();

        self.segments
            .values()
            .filter(|segment| match &segment.source_faces {
                Some(faces) if self.original.is_indexed() => faces.iter().any(|&f| {
                    self.original
                        .faces
                        .get(f as usize)
                        .is_some_and(|face| face.iter().any(|v| selection.contains(v)))
                }),
                _ => segment
                    .original_vertices
                    .iter()
                    .any(|p| keys.contains(&position_key(p))),
            })
            .map(|segment| segment.id)
            .collect()
    }

    pub fn set_visible(&mut self, id: SegmentId, visible: bool) -> DentalResult<()> {
        self.segment_mut(id)?.visible = visible;
        Ok(())
    }

    /// Mark one segment selected, clearing the rest.
    pub fn select_only(&mut self, id: SegmentId) -> DentalResult<()> {
        self.segment(id)?;
        for segment in self.segments.values_mut() {
            segment.is_selected = segment.id == id;
        }
        Ok(())
    }

    /// World-space triangles of a segment, for export.
    pub fn world_triangles(&self, id: SegmentId) -> DentalResult<Vec<[Point3<f64>; 3]>> {
        let segment = self.segment(id)?;
        let matrix = segment.transform.matrix_world()?;
        Ok(segment
            .mesh
            .triangles()
            .map(|t| {
                [
                    matrix.transform_point(&t.v0),
                    matrix.transform_point(&t.v1),
                    matrix.transform_point(&t.v2),
                ]
            })
            .collect())
    }

    /// Raycast scene of the visible segments, optionally with the scan.
    pub fn scene(&self, include_original: bool) -> DentalResult<(Scene, Vec<(ObjectId, Option<SegmentId>)>)> {
        let mut scene = Scene::new();
        let mut ids = Vec::new();
        if include_original {
            let object = scene.add(self.original.clone(), &self.original_transform)?;
            ids.push((object, None));
        }
        for segment in self.segments.values().filter(|s| s.visible) {
            let object = scene.add(segment.mesh.clone(), &segment.transform)?;
            ids.push((object, Some(segment.id)));
        }
        Ok((scene, ids))
    }

    pub(crate) fn touch(&mut self) {
        self.revision += 1;
        self.refresh_bounds();
    }

    fn refresh_bounds(&mut self) {
        let mut bounds = self
            .original
            .bounds()
            .and_then(|b| Some(b.transformed(self.original_transform.matrix_world().ok()?)));
        for segment in self.segments.values() {
            if let Ok(Some(b)) = segment.world_bounds() {
                bounds = Some(match bounds {
                    Some(acc) => acc.union(&b),
                    None => b,
                });
            }
        }
        self.bounds = bounds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_meshes::grid;

    fn model_with_quad() -> (DentalModel, SegmentId) {
        let mut model = DentalModel::new(grid(3));
        let id = model
            .extract_segment("first", &BTreeSet::from([0, 1, 5, 4]), ToothType::Incisor)
            .expect("quad extracted");
        (model, id)
    }

    #[test]
    fn test_ids_are_sequential_and_stable() {
        let mut model = DentalModel::new(grid(2));
        let a = model.add_segment("a", SegmentGeometry::imported(grid(1)), ToothType::Molar);
        let b = model.add_segment("b", SegmentGeometry::imported(grid(1)), ToothType::Molar);
        model.remove_segment(a).expect("exists");
        let c = model.add_segment("c", SegmentGeometry::imported(grid(1)), ToothType::Molar);
        assert!(a < b && b < c);
        assert_eq!(model.ids(), vec![b, c]);
        assert!(matches!(
            model.remove_segment(a),
            Err(DentalError::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn test_replace_geometry_bumps_versions() {
        let (mut model, id) = model_with_quad();
        let revision = model.revision();
        let version = model.get(id).expect("exists").geometry_version;

        model
            .add_to_segment(id, &BTreeSet::from([2]))
            .expect("grows");
        let segment = model.get(id).expect("exists");
        assert_eq!(segment.geometry_version, version + 1);
        assert!(model.revision() > revision);
        assert_eq!(segment.original_vertices.len(), segment.mesh.vertex_count());
    }

    #[test]
    fn test_failed_removal_keeps_geometry() {
        let (mut model, id) = model_with_quad();
        let before = model.get(id).expect("exists").triangle_count();
        let all: BTreeSet<u32> = (0..16).collect();
        let err = model.remove_from_segment(id, &all).unwrap_err();
        assert!(matches!(err, DentalError::WouldEmptySegment { .. }));
        assert_eq!(model.get(id).expect("exists").triangle_count(), before);
    }

    #[test]
    fn test_extract_empty_selection_errors() {
        let mut model = DentalModel::new(grid(2));
        let err = model
            .extract_segment("none", &BTreeSet::from([0]), ToothType::Molar)
            .unwrap_err();
        assert!(err.code().is_rejected_input());
        assert!(model.is_empty());
    }

    #[test]
    fn test_segments_touching() {
        let (mut model, first) = model_with_quad();
        let far = model
            .extract_segment("second", &BTreeSet::from([10, 11, 15, 14]), ToothType::Molar)
            .expect("far quad");
        assert_eq!(model.segments_touching(&BTreeSet::from([0])), vec![first]);
        assert_eq!(model.segments_touching(&BTreeSet::from([15])), vec![far]);
        assert!(model.segments_touching(&BTreeSet::from([3])).is_empty());

        // Imported copies are matched by position
        let copy = model.add_segment(
            "copy",
            SegmentGeometry::imported(model.get(first).expect("exists").mesh.clone()),
            ToothType::Molar,
        );
        assert_eq!(model.segments_touching(&BTreeSet::from([0])), vec![first, copy]);
    }

    #[test]
    fn test_world_triangles_follow_transform() {
        let (mut model, id) = model_with_quad();
        {
            let segment = model.segment_mut(id).expect("exists");
            segment.transform.translate(Vector3::new(0.0, 0.0, 2.0));
        }
        assert!(matches!(
            model.world_triangles(id),
            Err(DentalError::StaleTransform)
        ));
        model
            .segment_mut(id)
            .expect("exists")
            .transform
            .update_matrix_world();
        let tris = model.world_triangles(id).expect("fresh");
        assert!(tris.iter().flatten().all(|p| (p.z - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_tooth_type_names() {
        for t in [
            ToothType::Incisor,
            ToothType::Canine,
            ToothType::Premolar,
            ToothType::Molar,
            ToothType::Wisdom,
            ToothType::Gum,
        ] {
            assert_eq!(ToothType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ToothType::parse("Gingiva"), Some(ToothType::Gum));
        assert!(ToothType::parse("tusk").is_none());
    }
}
