//! Surface-aware vertex selection from 2D pointer strokes.
//!
//! A stroke runs `Idle -> Active -> (committed | cancelled) -> Idle`. While
//! active, points are appended with a minimum pixel spacing and previews are
//! throttled by wall-clock time. On finish the stroke is resolved against the
//! mesh (lasso polygon or brush samples), filtered by visibility according
//! to the configured [`SelectionScope`], optionally grown with
//! [`expand_selection`], and folded into the engine's active selection.
//!
//! # Example
//!
//! ```
//! use dental_mesh::selection::{SelectionEngine, SelectionMode, SelectionTool, ScreenPoint};
//!
//! let mut engine = SelectionEngine::default();
//! engine.start(SelectionMode::Create, SelectionTool::Lasso, ScreenPoint::new(0.0, 0.0), None);
//! assert!(engine.extend(ScreenPoint::new(50.0, 0.0)));
//! // Too close to the previous point
//! assert!(!engine.extend(ScreenPoint::new(50.5, 0.0)));
//! assert!(engine.is_active());
//! ```

mod brush;
mod expand;
mod lasso;

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use brush::BrushParams;
pub use expand::{ExpansionParams, ExpansionResult, expand_selection};
pub use lasso::point_in_polygon;

use crate::error::{DentalError, DentalResult};
use crate::geometry::{VertexAdjacency, vertex_curvature};
use crate::projector::ScreenProjector;
use crate::scene::{Camera, ObjectId, Raycaster, Viewport};
use crate::segment::DentalModel;
use crate::segment::SegmentId;
use crate::spatial::SpatialIndex;
use crate::transform::Transform;
use crate::types::{Mesh, normal_matrix};
use crate::visibility::{VisibilityParams, VisibilityResolver, VisibilityStrategy};

/// A pointer position in viewport pixels, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &ScreenPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl ScreenRect {
    pub fn from_point(p: ScreenPoint) -> Self {
        Self {
            min_x: p.x,
            min_y: p.y,
            max_x: p.x,
            max_y: p.y,
        }
    }

    /// Bounds of `points`, `None` when empty.
    pub fn from_points(points: &[ScreenPoint]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut rect = Self::from_point(*first);
        for &p in rest {
            rect.include(p);
        }
        Some(rect)
    }

    pub fn include(&mut self, p: ScreenPoint) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }

    pub fn grow(&mut self, margin: f64) {
        self.min_x -= margin;
        self.min_y -= margin;
        self.max_x += margin;
        self.max_y += margin;
    }

    /// Closed overlap test.
    pub fn overlaps(&self, other: &ScreenRect) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn contains(&self, p: ScreenPoint) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

/// How a stroke's result combines with the active selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Start a new segment from the stroke. Unions into the active selection.
    #[default]
    Create,
    /// Union into the active selection.
    Add,
    /// Remove from the active selection.
    Subtract,
    /// Report affected vertices only; the active selection is untouched.
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionTool {
    #[default]
    Lasso,
    Brush,
}

impl SelectionTool {
    /// Fewest stroke points that resolve to anything.
    pub fn min_points(self) -> usize {
        match self {
            SelectionTool::Lasso => 3,
            SelectionTool::Brush => 1,
        }
    }
}

/// Which vertices a stroke may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionScope {
    /// Visible surface only.
    #[default]
    Surface,
    /// Everything under the stroke, through the model.
    Volume,
    /// Visible surface, keeping the largest connected piece.
    Connected,
}

/// One stroke in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionOperation {
    pub mode: SelectionMode,
    pub tool: SelectionTool,
    pub points: Vec<ScreenPoint>,
    pub target_segment: Option<SegmentId>,
}

impl SelectionOperation {
    /// Enough points to resolve.
    pub fn is_resolvable(&self) -> bool {
        self.points.len() >= self.tool.min_points()
    }
}

/// Selection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionParams {
    /// Minimum pixel distance between appended stroke points.
    pub min_spacing: f64,

    /// Minimum time between preview refreshes.
    pub preview_interval_ms: u64,

    pub scope: SelectionScope,
    pub visibility: VisibilityParams,
    pub brush: BrushParams,
    pub expansion: ExpansionParams,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            min_spacing: 2.0,
            preview_interval_ms: 33,
            scope: SelectionScope::Surface,
            visibility: VisibilityParams::default(),
            brush: BrushParams::default(),
            expansion: ExpansionParams::default(),
        }
    }
}

impl SelectionParams {
    /// Select through the model, ignoring occlusion.
    pub fn through() -> Self {
        Self {
            scope: SelectionScope::Volume,
            ..Default::default()
        }
    }

    /// Visible surface, largest connected piece.
    pub fn connected() -> Self {
        Self {
            scope: SelectionScope::Connected,
            ..Default::default()
        }
    }

    /// Visible surface grown over similar curvature.
    pub fn dental_aware() -> Self {
        Self {
            expansion: ExpansionParams::enabled(),
            ..Default::default()
        }
    }

    /// Occlusion tolerance fitted to the model's size.
    pub fn scaled_to(mut self, model: &DentalModel) -> Self {
        if let Some(bounds) = model.bounding_box() {
            self.visibility = self.visibility.with_scale(bounds.diagonal());
        }
        self
    }

    fn effective_visibility(&self) -> VisibilityParams {
        match self.scope {
            SelectionScope::Volume => VisibilityParams::for_strategy(VisibilityStrategy::None),
            SelectionScope::Surface | SelectionScope::Connected => self.visibility.clone(),
        }
    }
}

/// Everything a stroke resolves against.
///
/// The spatial index, adjacency and curvature are optional caches; without a
/// spatial index lasso scans every vertex and brush falls back to screen space.
#[derive(Clone, Copy)]
pub struct SelectionContext<'a> {
    pub mesh: &'a Mesh,
    pub transform: &'a Transform,
    pub camera: &'a Camera,
    pub viewport: Viewport,
    pub spatial: Option<&'a SpatialIndex>,
    pub raycaster: Option<&'a dyn Raycaster>,
    pub adjacency: Option<&'a VertexAdjacency>,
    pub curvature: Option<&'a [f64]>,
    /// Scene id of `mesh`, used to reject brush hits on other objects.
    pub object: Option<ObjectId>,
}

impl<'a> SelectionContext<'a> {
    pub fn new(
        mesh: &'a Mesh,
        transform: &'a Transform,
        camera: &'a Camera,
        viewport: Viewport,
    ) -> Self {
        Self {
            mesh,
            transform,
            camera,
            viewport,
            spatial: None,
            raycaster: None,
            adjacency: None,
            curvature: None,
            object: None,
        }
    }

    pub fn with_spatial(mut self, spatial: &'a SpatialIndex) -> Self {
        self.spatial = Some(spatial);
        self
    }

    pub fn with_raycaster(mut self, raycaster: &'a dyn Raycaster, object: Option<ObjectId>) -> Self {
        self.raycaster = Some(raycaster);
        self.object = object;
        self
    }

    pub fn with_adjacency(mut self, adjacency: &'a VertexAdjacency) -> Self {
        self.adjacency = Some(adjacency);
        self
    }

    pub fn with_curvature(mut self, curvature: &'a [f64]) -> Self {
        self.curvature = Some(curvature);
        self
    }
}

/// Per-resolve state shared by the lasso and brush passes.
pub(crate) struct ResolveEnv<'a> {
    pub(super) mesh: &'a Mesh,
    pub(super) spatial: Option<&'a SpatialIndex>,
    pub(super) raycaster: Option<&'a dyn Raycaster>,
    pub(super) camera: &'a Camera,
    pub(super) object: Option<ObjectId>,
    pub(super) projector: ScreenProjector,
    visibility: VisibilityResolver<'a>,
    normal_matrix: Matrix3<f64>,
    passthrough: bool,
}

impl<'a> ResolveEnv<'a> {
    fn new(ctx: &SelectionContext<'a>, visibility: VisibilityParams) -> DentalResult<Self> {
        if let Some(spatial) = ctx.spatial
            && spatial.len() != ctx.mesh.vertices.len()
        {
            return Err(DentalError::invalid_parameter(
                "spatial",
                format!(
                    "index holds {} points but the mesh has {} vertices; rebuild it after editing",
                    spatial.len(),
                    ctx.mesh.vertices.len()
                ),
            ));
        }
        let projector = ScreenProjector::for_transform(ctx.transform, ctx.camera, ctx.viewport)?;
        let normal_matrix = normal_matrix(projector.model_matrix());
        let visibility = VisibilityResolver::new(ctx.camera, ctx.raycaster, visibility);
        let passthrough = visibility.is_passthrough();
        Ok(Self {
            mesh: ctx.mesh,
            spatial: ctx.spatial,
            raycaster: ctx.raycaster,
            camera: ctx.camera,
            object: ctx.object,
            projector,
            visibility,
            normal_matrix,
            passthrough,
        })
    }

    /// Visibility of a mesh vertex, transformed to world space.
    pub(super) fn vertex_visible(&self, vi: u32) -> bool {
        if self.passthrough {
            return true;
        }
        let Some(vertex) = self.mesh.vertices.get(vi as usize) else {
            return false;
        };
        let world = self.projector.to_world(&vertex.position);
        let normal = vertex
            .normal
            .and_then(|n| (self.normal_matrix * n).try_normalize(1e-12));
        self.visibility.is_visible(&world, normal.as_ref())
    }
}

/// Result of a stroke check: whether the point was kept and whether a preview
/// refresh is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrokeUpdate {
    pub appended: bool,
    pub preview_due: bool,
}

/// What a finished stroke did.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    pub mode: SelectionMode,
    pub tool: SelectionTool,
    pub target_segment: Option<SegmentId>,
    /// Vertices the stroke resolved to.
    pub affected: BTreeSet<u32>,
    /// Active selection size afterwards.
    pub selection_size: usize,
    /// The stroke was long enough to resolve.
    pub resolved: bool,
    /// Expansion hit its vertex cap.
    pub expansion_capped: bool,
}

impl SelectionOutcome {
    fn skipped(op: &SelectionOperation, selection_size: usize) -> Self {
        Self {
            mode: op.mode,
            tool: op.tool,
            target_segment: op.target_segment,
            affected: BTreeSet::new(),
            selection_size,
            resolved: false,
            expansion_capped: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.affected.is_empty()
    }
}

impl fmt::Display for SelectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.resolved {
            return write!(f, "{:?} {:?}: stroke too short, nothing selected", self.mode, self.tool);
        }
        write!(
            f,
            "{:?} {:?}: {} vertices affected, {} selected",
            self.mode,
            self.tool,
            self.affected.len(),
            self.selection_size
        )?;
        if self.expansion_capped {
            write!(f, " (expansion capped)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum EngineState {
    Idle,
    Active {
        operation: SelectionOperation,
        last_preview: Option<Instant>,
    },
}

/// Stroke state machine plus the active vertex selection.
#[derive(Debug, Clone)]
pub struct SelectionEngine {
    params: SelectionParams,
    state: EngineState,
    selection: BTreeSet<u32>,
}

impl Default for SelectionEngine {
    fn default() -> Self {
        Self::new(SelectionParams::default())
    }
}

impl SelectionEngine {
    pub fn new(params: SelectionParams) -> Self {
        Self {
            params,
            state: EngineState::Idle,
            selection: BTreeSet::new(),
        }
    }

    /// Engine whose occlusion tolerance follows the model's scale.
    pub fn for_model(params: SelectionParams, model: &DentalModel) -> Self {
        Self::new(params.scaled_to(model))
    }

    pub fn params(&self) -> &SelectionParams {
        &self.params
    }

    pub fn set_params(&mut self, params: SelectionParams) {
        self.params = params;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, EngineState::Active { .. })
    }

    /// The stroke in progress.
    pub fn operation(&self) -> Option<&SelectionOperation> {
        match &self.state {
            EngineState::Active { operation, .. } => Some(operation),
            EngineState::Idle => None,
        }
    }

    /// The active selection.
    pub fn selection(&self) -> &BTreeSet<u32> {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: BTreeSet<u32>) {
        self.selection = selection;
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Take the active selection, leaving it empty.
    pub fn take_selection(&mut self) -> BTreeSet<u32> {
        std::mem::take(&mut self.selection)
    }

    /// Begin a stroke. A stroke already in progress is discarded.
    pub fn start(
        &mut self,
        mode: SelectionMode,
        tool: SelectionTool,
        first_point: ScreenPoint,
        target_segment: Option<SegmentId>,
    ) {
        if self.is_active() {
            warn!("Selection stroke started while another was active; discarding the old one");
        }
        debug!(?mode, ?tool, "Selection stroke started");
        self.state = EngineState::Active {
            operation: SelectionOperation {
                mode,
                tool,
                points: vec![first_point],
                target_segment,
            },
            last_preview: None,
        };
    }

    /// Append a point if it is far enough from the previous one.
    pub fn extend(&mut self, point: ScreenPoint) -> bool {
        let min_spacing = self.params.min_spacing;
        let EngineState::Active { operation, .. } = &mut self.state else {
            return false;
        };
        let far_enough = operation
            .points
            .last()
            .is_none_or(|last| last.distance(&point) > min_spacing);
        if far_enough && point.x.is_finite() && point.y.is_finite() {
            operation.points.push(point);
            true
        } else {
            false
        }
    }

    /// [`extend`](Self::extend) plus the preview throttle.
    pub fn extend_at(&mut self, point: ScreenPoint, now: Instant) -> StrokeUpdate {
        let appended = self.extend(point);
        let interval = Duration::from_millis(self.params.preview_interval_ms);
        let EngineState::Active { last_preview, .. } = &mut self.state else {
            return StrokeUpdate {
                appended,
                preview_due: false,
            };
        };
        let preview_due = appended
            && last_preview.is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if preview_due {
            *last_preview = Some(now);
        }
        StrokeUpdate {
            appended,
            preview_due,
        }
    }

    /// Resolve the stroke so far without touching the active selection.
    pub fn preview(&self, ctx: &SelectionContext<'_>) -> DentalResult<BTreeSet<u32>> {
        match self.operation() {
            Some(op) if op.is_resolvable() => Ok(self.resolve(op, ctx)?.vertices),
            _ => Ok(BTreeSet::new()),
        }
    }

    /// End the stroke and apply it.
    ///
    /// A stroke below the tool's minimum point count is a no-op. Fails with
    /// `EmptySelection` when no stroke is active.
    pub fn finish(&mut self, ctx: &SelectionContext<'_>) -> DentalResult<SelectionOutcome> {
        let EngineState::Active { operation, .. } =
            std::mem::replace(&mut self.state, EngineState::Idle)
        else {
            return Err(DentalError::empty_selection("no selection stroke in progress"));
        };

        if !operation.is_resolvable() {
            debug!(
                points = operation.points.len(),
                needed = operation.tool.min_points(),
                "Selection stroke too short; ignored"
            );
            return Ok(SelectionOutcome::skipped(&operation, self.selection.len()));
        }

        let resolved = self.resolve(&operation, ctx)?;
        match operation.mode {
            SelectionMode::Create | SelectionMode::Add => {
                self.selection.extend(resolved.vertices.iter().copied());
            }
            SelectionMode::Subtract => {
                self.selection.retain(|v| !resolved.vertices.contains(v));
            }
            SelectionMode::Select => {}
        }

        info!(
            mode = ?operation.mode,
            tool = ?operation.tool,
            affected = resolved.vertices.len(),
            selected = self.selection.len(),
            "Selection stroke applied"
        );

        Ok(SelectionOutcome {
            mode: operation.mode,
            tool: operation.tool,
            target_segment: operation.target_segment,
            affected: resolved.vertices,
            selection_size: self.selection.len(),
            resolved: true,
            expansion_capped: resolved.capped,
        })
    }

    /// Abandon the stroke. Returns whether one was active.
    pub fn cancel(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = EngineState::Idle;
        if was_active {
            debug!("Selection stroke cancelled");
        }
        was_active
    }

    fn resolve(
        &self,
        op: &SelectionOperation,
        ctx: &SelectionContext<'_>,
    ) -> DentalResult<ExpansionResult> {
        if ctx.mesh.is_empty() {
            return Ok(ExpansionResult::default());
        }
        let env = ResolveEnv::new(ctx, self.params.effective_visibility())?;
        let mut vertices = match op.tool {
            SelectionTool::Lasso => lasso::resolve(&env, &op.points),
            SelectionTool::Brush => brush::resolve(&env, &op.points, &self.params.brush),
        };

        let needs_adjacency =
            self.params.scope == SelectionScope::Connected || self.params.expansion.enabled;
        if !needs_adjacency || vertices.is_empty() {
            return Ok(ExpansionResult {
                vertices,
                ..Default::default()
            });
        }

        let built;
        let adjacency = match ctx.adjacency {
            Some(a) => a,
            None => {
                built = VertexAdjacency::build(ctx.mesh);
                &built
            }
        };

        if self.params.scope == SelectionScope::Connected {
            vertices = adjacency
                .components_within(&vertices)
                .into_iter()
                .next()
                .unwrap_or_default();
        }

        if !self.params.expansion.enabled {
            return Ok(ExpansionResult {
                vertices,
                ..Default::default()
            });
        }

        let computed;
        let curvature = match ctx.curvature {
            Some(c) => c,
            None => {
                computed = vertex_curvature(ctx.mesh, adjacency);
                &computed
            }
        };
        Ok(expand_selection(
            ctx.mesh,
            adjacency,
            curvature,
            &vertices,
            &self.params.expansion,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;
    use crate::types::test_meshes::{grid, unit_cube};
    use crate::types::{Mesh, Vertex};
    use nalgebra::{Point3, Vector3};

    const VIEW: f64 = 400.0;

    fn quad_with_outlier() -> Mesh {
        let mut mesh = Mesh::new();
        for &(x, y) in &[(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5), (3.0, 0.0)] {
            mesh.vertices
                .push(Vertex::with_normal(Point3::new(x, y, 0.0), Vector3::z()));
        }
        mesh.faces = vec![[0, 1, 2], [0, 2, 3], [1, 4, 2]];
        mesh
    }

    fn front_camera() -> Camera {
        Camera::perspective(Point3::new(0.0, 0.0, 10.0), Point3::origin(), 1.0)
    }

    /// Pixel square around the projection of the local square `[-h, h]^2` at z = 0.
    fn lasso_around(camera: &Camera, half: f64) -> Vec<ScreenPoint> {
        let projector = ScreenProjector::new(
            nalgebra::Matrix4::identity(),
            camera,
            Viewport::new(VIEW, VIEW),
        );
        [(-half, -half), (half, -half), (half, half), (-half, half)]
            .iter()
            .map(|&(x, y)| {
                let p = projector
                    .project(&Point3::new(x, y, 0.0))
                    .expect("in front of camera");
                ScreenPoint::new(p.x, p.y)
            })
            .collect()
    }

    fn run_stroke(
        engine: &mut SelectionEngine,
        mode: SelectionMode,
        tool: SelectionTool,
        points: &[ScreenPoint],
        ctx: &SelectionContext<'_>,
    ) -> SelectionOutcome {
        engine.start(mode, tool, points[0], None);
        for &p in &points[1..] {
            engine.extend(p);
        }
        engine.finish(ctx).expect("finish")
    }

    #[test]
    fn test_lasso_selects_exactly_enclosed_vertices() {
        let mesh = quad_with_outlier();
        let transform = Transform::identity();
        let camera = front_camera();
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));

        let mut engine = SelectionEngine::default();
        let lasso = lasso_around(&camera, 0.6);
        let outcome = run_stroke(&mut engine, SelectionMode::Create, SelectionTool::Lasso, &lasso, &ctx);

        assert_eq!(outcome.affected, BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(engine.selection().len(), 4);
        assert!(!engine.is_active());
    }

    #[test]
    fn test_short_lasso_is_noop() {
        let mesh = quad_with_outlier();
        let transform = Transform::identity();
        let camera = front_camera();
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));

        let mut engine = SelectionEngine::default();
        engine.set_selection(BTreeSet::from([4]));
        let lasso = lasso_around(&camera, 0.6);
        let outcome =
            run_stroke(&mut engine, SelectionMode::Add, SelectionTool::Lasso, &lasso[..2], &ctx);

        assert!(!outcome.resolved);
        assert!(outcome.is_empty());
        assert_eq!(engine.selection(), &BTreeSet::from([4]));
    }

    #[test]
    fn test_finish_without_stroke_errors() {
        let mesh = quad_with_outlier();
        let transform = Transform::identity();
        let camera = front_camera();
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));
        let mut engine = SelectionEngine::default();
        assert!(engine.finish(&ctx).is_err());
    }

    #[test]
    fn test_subtract_and_select_modes() {
        let mesh = quad_with_outlier();
        let transform = Transform::identity();
        let camera = front_camera();
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));
        let lasso = lasso_around(&camera, 0.6);

        let mut engine = SelectionEngine::default();
        engine.set_selection(BTreeSet::from([0, 1, 4]));

        let select = run_stroke(&mut engine, SelectionMode::Select, SelectionTool::Lasso, &lasso, &ctx);
        assert_eq!(select.affected.len(), 4);
        assert_eq!(engine.selection(), &BTreeSet::from([0, 1, 4]));

        run_stroke(&mut engine, SelectionMode::Subtract, SelectionTool::Lasso, &lasso, &ctx);
        assert_eq!(engine.selection(), &BTreeSet::from([4]));
    }

    #[test]
    fn test_cancel_leaves_selection() {
        let mut engine = SelectionEngine::default();
        engine.set_selection(BTreeSet::from([1, 2]));
        engine.start(SelectionMode::Subtract, SelectionTool::Lasso, ScreenPoint::new(0.0, 0.0), None);
        assert!(engine.cancel());
        assert!(!engine.cancel());
        assert_eq!(engine.selection().len(), 2);
    }

    #[test]
    fn test_preview_throttle() {
        let mut engine = SelectionEngine::default();
        let t0 = Instant::now();
        engine.start(SelectionMode::Create, SelectionTool::Lasso, ScreenPoint::new(0.0, 0.0), None);

        let first = engine.extend_at(ScreenPoint::new(10.0, 0.0), t0);
        assert!(first.appended && first.preview_due);

        let soon = engine.extend_at(ScreenPoint::new(20.0, 0.0), t0 + Duration::from_millis(5));
        assert!(soon.appended && !soon.preview_due);

        let later = engine.extend_at(ScreenPoint::new(30.0, 0.0), t0 + Duration::from_millis(40));
        assert!(later.preview_due);

        let dropped = engine.extend_at(ScreenPoint::new(30.5, 0.0), t0 + Duration::from_millis(200));
        assert!(!dropped.appended && !dropped.preview_due);
    }

    #[test]
    fn test_occluded_vertices_skipped_unless_volume() {
        // Camera looks down -Z at a cube; the bottom face is hidden
        let cube = unit_cube();
        let transform = Transform::identity();
        let camera = Camera::perspective(
            Point3::new(0.5, 0.5, 10.0),
            Point3::new(0.5, 0.5, 0.0),
            1.0,
        );
        let mut scene = Scene::new();
        scene.add(cube.clone(), &transform).expect("fresh transform");

        let projector =
            ScreenProjector::new(nalgebra::Matrix4::identity(), &camera, Viewport::new(VIEW, VIEW));
        let lasso: Vec<ScreenPoint> = [(-0.2, -0.2), (1.2, -0.2), (1.2, 1.2), (-0.2, 1.2)]
            .iter()
            .map(|&(x, y)| {
                let p = projector.project(&Point3::new(x, y, 0.0)).expect("visible");
                ScreenPoint::new(p.x, p.y)
            })
            .collect();

        let ctx = SelectionContext::new(&cube, &transform, &camera, Viewport::new(VIEW, VIEW))
            .with_raycaster(&scene, None);

        let mut surface = SelectionEngine::new(SelectionParams {
            // Vertex normals on a cube corner are diagonal; test occlusion alone
            visibility: VisibilityParams {
                back_face_culling: false,
                ..Default::default()
            },
            ..Default::default()
        });
        let outcome = run_stroke(&mut surface, SelectionMode::Create, SelectionTool::Lasso, &lasso, &ctx);
        assert_eq!(outcome.affected, BTreeSet::from([4, 5, 6, 7]));

        let mut volume = SelectionEngine::new(SelectionParams::through());
        let outcome = run_stroke(&mut volume, SelectionMode::Create, SelectionTool::Lasso, &lasso, &ctx);
        assert_eq!(outcome.affected.len(), 8);
    }

    #[test]
    fn test_connected_scope_keeps_largest_piece() {
        // Two separate grids side by side
        let mut mesh = grid(2);
        let offset = mesh.vertices.len() as u32;
        let mut second = grid(1);
        second.translate(Vector3::new(5.0, 0.0, 0.0));
        mesh.vertices.extend(second.vertices);
        mesh.faces
            .extend(second.faces.iter().map(|f| f.map(|v| v + offset)));
        mesh.translate(Vector3::new(-3.0, -1.0, 0.0));

        let transform = Transform::identity();
        let camera = Camera::perspective(Point3::new(0.0, 0.0, 20.0), Point3::origin(), 1.0);
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));
        let lasso = lasso_around(&camera, 4.0);

        let mut engine = SelectionEngine::new(SelectionParams::connected());
        let outcome = run_stroke(&mut engine, SelectionMode::Create, SelectionTool::Lasso, &lasso, &ctx);
        assert_eq!(outcome.affected, (0..offset).collect());
    }

    #[test]
    fn test_brush_screen_fallback() {
        let mut mesh = grid(4);
        mesh.translate(Vector3::new(-2.0, -2.0, 0.0));
        let transform = Transform::identity();
        let camera = front_camera();
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));

        let mut engine = SelectionEngine::new(SelectionParams {
            brush: BrushParams {
                screen_radius: 5.0,
                ..BrushParams::hard(1.0)
            },
            ..Default::default()
        });
        let center = ScreenPoint::new(VIEW / 2.0, VIEW / 2.0);
        let outcome = run_stroke(&mut engine, SelectionMode::Create, SelectionTool::Brush, &[center], &ctx);
        // Only the center vertex (2, 2) projects within 5 px
        assert_eq!(outcome.affected, BTreeSet::from([12]));
    }

    #[test]
    fn test_brush_surface_hit_uses_world_radius() {
        let mut mesh = grid(4);
        mesh.translate(Vector3::new(-2.0, -2.0, 0.0));
        let transform = Transform::identity();
        let camera = front_camera();
        let spatial = SpatialIndex::build(&mesh, 1.0).expect("valid cell size");
        let mut scene = Scene::new();
        let id = scene.add(mesh.clone(), &transform).expect("fresh");

        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW))
            .with_spatial(&spatial)
            .with_raycaster(&scene, Some(id));

        let mut engine = SelectionEngine::new(SelectionParams {
            brush: BrushParams::hard(1.5),
            ..Default::default()
        });
        // Slightly off-center so the ray misses triangle edges
        let center = ScreenPoint::new(VIEW / 2.0 + 0.01, VIEW / 2.0 + 0.02);
        let outcome = run_stroke(&mut engine, SelectionMode::Create, SelectionTool::Brush, &[center], &ctx);
        // Center vertex and its one-ring lie within 1.5 units, the corners do not
        assert!(outcome.affected.contains(&12));
        assert!(outcome.affected.contains(&7));
        assert!(outcome.affected.contains(&17));
        assert!(!outcome.affected.contains(&0));
    }

    #[test]
    fn test_stale_transform_rejected_on_finish() {
        let mesh = quad_with_outlier();
        let mut transform = Transform::identity();
        transform.translate(Vector3::new(1.0, 0.0, 0.0));
        let camera = front_camera();
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));
        let lasso = lasso_around(&camera, 0.6);

        let mut engine = SelectionEngine::default();
        engine.start(SelectionMode::Create, SelectionTool::Lasso, lasso[0], None);
        for &p in &lasso[1..] {
            engine.extend(p);
        }
        assert!(matches!(engine.finish(&ctx), Err(DentalError::StaleTransform)));
    }

    #[test]
    fn test_for_model_scales_occlusion_tolerance() {
        let mut big = unit_cube();
        for v in &mut big.vertices {
            v.position = Point3::from(v.position.coords * 1000.0);
        }
        let model = DentalModel::new(big);
        let engine = SelectionEngine::for_model(SelectionParams::default(), &model);
        let expected = 1000.0 * 3f64.sqrt() * 1e-4;
        assert!((engine.params().visibility.occlusion_tolerance - expected).abs() < 1e-9);

        let empty = DentalModel::new(Mesh::new());
        let engine = SelectionEngine::for_model(SelectionParams::default(), &empty);
        assert_eq!(
            engine.params().visibility.occlusion_tolerance,
            VisibilityParams::default().occlusion_tolerance
        );
    }

    #[test]
    fn test_mismatched_spatial_index_rejected() {
        let mut mesh = grid(3);
        mesh.translate(Vector3::new(-1.5, -1.5, 0.0));
        let transform = Transform::identity();
        let camera = front_camera();
        let stale = SpatialIndex::build(&grid(9), 1.0).expect("valid cell size");
        let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW))
            .with_spatial(&stale);

        let mut engine = SelectionEngine::default();
        engine.set_selection(BTreeSet::from([0]));
        let lasso = lasso_around(&camera, 2.0);
        engine.start(SelectionMode::Add, SelectionTool::Lasso, lasso[0], None);
        for &p in &lasso[1..] {
            engine.extend(p);
        }
        assert!(matches!(
            engine.finish(&ctx),
            Err(DentalError::InvalidParameter { name: "spatial", .. })
        ));
        assert_eq!(engine.selection(), &BTreeSet::from([0]));
        assert!(!engine.is_active());
    }
}
