//! End-to-end integration tests for dental-mesh.
//!
//! These tests drive the public API the way an editor session does:
//! select on the scan, cut segments, move them, check collisions and plan.

use std::collections::BTreeSet;
use std::time::Duration;

use dental_mesh::backend::{HealthResponse, SegmentationResponse};
use dental_mesh::intersect::SegmentSnapshot;
use dental_mesh::projector::ScreenProjector;
use dental_mesh::{
    Camera, DentalError, DentalModel, IntersectionDetector, IntersectionParams, IntersectionType,
    IntersectionWorker, LocalBackend, Mesh, MovementAxis, MovementController,
    OrthodonticTreatmentPlan, PlanningParams, ScreenPoint, SegmentGeometry, SegmentationBackend,
    SegmentationConfig, SelectionContext, SelectionEngine, SelectionMode, SelectionTool, Severity,
    ToothType, TracingNotifier, Transform, Vertex, Viewport, import_segments,
};
use nalgebra::{Matrix4, Point3, Vector3};

const VIEW: f64 = 400.0;

/// Route library logs through the test harness; `RUST_LOG` picks the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Closed cube from `origin` to `origin + size`, outward winding.
fn create_test_cube(origin: Point3<f64>, size: f64) -> Mesh {
    let mut mesh = Mesh::new();
    for &(x, y, z) in &[
        (0.0, 0.0, 0.0),
        (1.0, 0.0, 0.0),
        (1.0, 1.0, 0.0),
        (0.0, 1.0, 0.0),
        (0.0, 0.0, 1.0),
        (1.0, 0.0, 1.0),
        (1.0, 1.0, 1.0),
        (0.0, 1.0, 1.0),
    ] {
        mesh.vertices.push(Vertex::from_coords(
            origin.x + x * size,
            origin.y + y * size,
            origin.z + z * size,
        ));
    }
    mesh.faces = vec![
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [3, 7, 6],
        [3, 6, 2],
        [0, 4, 7],
        [0, 7, 3],
        [1, 2, 6],
        [1, 6, 5],
    ];
    mesh.compute_vertex_normals();
    mesh
}

/// Tall box standing along +Y.
fn create_tooth() -> Mesh {
    let mut mesh = create_test_cube(Point3::origin(), 1.0);
    for v in &mut mesh.vertices {
        v.position.y *= 8.0;
    }
    mesh.compute_vertex_normals();
    mesh
}

fn two_cube_model(offset: Vector3<f64>) -> DentalModel {
    let mut model = DentalModel::new(Mesh::new());
    let a = create_test_cube(Point3::origin(), 1.0);
    let b = create_test_cube(Point3::origin() + offset, 1.0);
    model.add_segment("a", SegmentGeometry::imported(a), ToothType::Molar);
    model.add_segment("b", SegmentGeometry::imported(b), ToothType::Molar);
    model
}

// =============================================================================
// Selection
// =============================================================================

#[test]
fn test_lasso_square_selects_enclosed_vertices() {
    let mut mesh = Mesh::new();
    for &(x, y) in &[(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5), (3.0, 0.0)] {
        mesh.vertices
            .push(Vertex::with_normal(Point3::new(x, y, 0.0), Vector3::z()));
    }
    mesh.faces = vec![[0, 1, 2], [0, 2, 3], [1, 4, 2]];

    let camera = Camera::perspective(Point3::new(0.0, 0.0, 10.0), Point3::origin(), 1.0);
    let viewport = Viewport::new(VIEW, VIEW);
    let projector = ScreenProjector::new(Matrix4::identity(), &camera, viewport);
    let lasso: Vec<ScreenPoint> = [(-0.6, -0.6), (0.6, -0.6), (0.6, 0.6), (-0.6, 0.6)]
        .iter()
        .map(|&(x, y)| {
            let p = projector
                .project(&Point3::new(x, y, 0.0))
                .expect("in front of camera");
            ScreenPoint::new(p.x, p.y)
        })
        .collect();

    let transform = Transform::identity();
    let ctx = SelectionContext::new(&mesh, &transform, &camera, viewport);
    let mut engine = SelectionEngine::default();
    engine.start(SelectionMode::Create, SelectionTool::Lasso, lasso[0], None);
    for &p in &lasso[1..] {
        engine.extend(p);
    }
    let outcome = engine.finish(&ctx).expect("finish");

    assert_eq!(outcome.affected, BTreeSet::from([0, 1, 2, 3]));
    assert_eq!(outcome.selection_size, 4);
}

#[test]
fn test_finish_without_stroke_is_error() {
    let mesh = create_test_cube(Point3::origin(), 1.0);
    let transform = Transform::identity();
    let camera = Camera::perspective(Point3::new(0.0, 0.0, 10.0), Point3::origin(), 1.0);
    let ctx = SelectionContext::new(&mesh, &transform, &camera, Viewport::new(VIEW, VIEW));

    let err = SelectionEngine::default().finish(&ctx).expect_err("no stroke");
    assert!(matches!(err, DentalError::EmptySelection { .. }));
}

// =============================================================================
// Segment editing
// =============================================================================

#[test]
fn test_extract_grow_and_shrink() {
    let mut model = DentalModel::new(create_test_cube(Point3::origin(), 1.0));
    // Bottom face corners
    let bottom = BTreeSet::from([0, 1, 2, 3]);
    let id = model
        .extract_segment("36", &bottom, ToothType::Molar)
        .expect("extracted");
    // Both bottom triangles plus the four side triangles with two bottom corners
    assert_eq!(model.segment(id).expect("exists").triangle_count(), 6);

    model
        .add_to_segment(id, &BTreeSet::from([4, 5, 6, 7]))
        .expect("grown");
    // Side triangles whose corners were all present already stay out
    assert_eq!(model.segment(id).expect("exists").triangle_count(), 10);

    model
        .remove_from_segment(id, &BTreeSet::from([6]))
        .expect("shrunk");
    assert!(model.segment(id).expect("exists").triangle_count() < 10);
}

#[test]
fn test_removing_everything_is_rejected() {
    let mut model = DentalModel::new(create_test_cube(Point3::origin(), 1.0));
    let all: BTreeSet<u32> = (0..8).collect();
    let id = model
        .extract_segment("11", &all, ToothType::Incisor)
        .expect("extracted");

    let err = model.remove_from_segment(id, &all).expect_err("would empty");
    assert!(matches!(err, DentalError::WouldEmptySegment { .. }));
    assert_eq!(model.segment(id).expect("untouched").triangle_count(), 12);
}

// =============================================================================
// Intersection detection
// =============================================================================

#[test]
fn test_cubes_ten_apart_do_not_intersect() {
    let model = two_cube_model(Vector3::new(10.0, 0.0, 0.0));
    let snapshots = SegmentSnapshot::visible_in(&model).expect("fresh transforms");
    assert!(IntersectionDetector::default().detect_all(&snapshots).is_empty());
}

#[test]
fn test_identical_cubes_collide() {
    let model = two_cube_model(Vector3::zeros());
    let snapshots = SegmentSnapshot::visible_in(&model).expect("fresh transforms");
    let results = IntersectionDetector::default().detect_all(&snapshots);

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].intersection_type, IntersectionType::Collision);
    assert_eq!(results[0].severity, Severity::High);
}

#[test]
fn test_detection_is_repeatable() {
    let model = two_cube_model(Vector3::new(0.4, 0.3, 0.0));
    let snapshots = SegmentSnapshot::visible_in(&model).expect("fresh transforms");
    let detector = IntersectionDetector::default();
    let first = detector.detect_all(&snapshots);
    assert_eq!(first.len(), 1);
    assert_eq!(first, detector.detect_all(&snapshots));
}

#[test]
fn test_stale_transform_rejected() {
    let mut model = two_cube_model(Vector3::new(10.0, 0.0, 0.0));
    let id = model.ids()[0];
    model
        .segment_mut(id)
        .expect("exists")
        .transform
        .set_position(Vector3::new(0.0, 5.0, 0.0));

    let err = SegmentSnapshot::visible_in(&model).expect_err("stale");
    assert!(matches!(err, DentalError::StaleTransform));
}

#[test]
fn test_moving_apart_clears_collision() {
    let mut model = two_cube_model(Vector3::zeros());
    let mut movement = MovementController::default();
    let id = model.ids()[1];
    movement
        .apply_movement(&mut model, id, MovementAxis::Vertical, 5.0, &-Vector3::z())
        .expect("moved");

    let snapshots = SegmentSnapshot::visible_in(&model).expect("fresh transforms");
    assert!(IntersectionDetector::default().detect_all(&snapshots).is_empty());
}

#[test]
fn test_worker_reports_only_latest_generation() {
    init_tracing();
    let worker = IntersectionWorker::spawn(IntersectionParams::default()).expect("spawn");
    let colliding = SegmentSnapshot::visible_in(&two_cube_model(Vector3::zeros())).expect("snap");
    let apart = SegmentSnapshot::visible_in(&two_cube_model(Vector3::new(10.0, 0.0, 0.0)))
        .expect("snap");

    worker.submit(colliding).expect("submit");
    worker.submit(apart).expect("submit");

    let results = worker
        .wait_completed(Duration::from_secs(30))
        .expect("completed");
    assert!(results.is_empty());
}

// =============================================================================
// Movement and planning
// =============================================================================

#[test]
fn test_three_mm_vertical_plan() {
    init_tracing();
    let mut model = DentalModel::new(Mesh::new());
    let id = model.add_segment("11", SegmentGeometry::imported(create_tooth()), ToothType::Incisor);

    let mut movement = MovementController::default();
    movement
        .apply_movement(&mut model, id, MovementAxis::Vertical, 3.0, &-Vector3::z())
        .expect("moved");

    let params = PlanningParams::default();
    let plan = OrthodonticTreatmentPlan::generate(&model, &params);
    let tooth = plan.tooth(id).expect("planned");
    assert_eq!(tooth.movements.len(), 1);
    assert_eq!(tooth.movements[0].axis, MovementAxis::Vertical);

    // ceil(3.0 / 0.2) = 15 exceeds the medium band minimum
    let expected = ((3.0 / params.max_movement_per_step.vertical) - 1e-9).ceil() as u32;
    assert_eq!(tooth.movements[0].recommended_steps, expected.max(params.bands.medium_steps));
    assert_eq!(plan.total_steps(), 15);
    assert_eq!(plan.treatment_steps.len(), 15);
}

#[test]
fn test_movement_distance_tracks_position() {
    let mut model = DentalModel::new(Mesh::new());
    let id = model.add_segment("21", SegmentGeometry::imported(create_tooth()), ToothType::Incisor);
    let mut movement = MovementController::default();
    for (axis, d) in [
        (MovementAxis::Anteroposterior, 1.5),
        (MovementAxis::Transverse, -0.7),
        (MovementAxis::Vertical, 2.0),
    ] {
        movement
            .apply_movement(&mut model, id, axis, d, &-Vector3::z())
            .expect("moved");
        let segment = model.segment(id).expect("exists");
        let expected = (segment.position() - segment.original_position).norm();
        assert!((segment.movement_distance - expected).abs() < 1e-9);
    }

    movement.reset_movement(&mut model, id).expect("reset");
    let segment = model.segment(id).expect("exists");
    assert_eq!(segment.movement_distance, 0.0);
    assert!(segment.movement_history.is_zero());
}

// =============================================================================
// Segmentation backends
// =============================================================================

struct DownBackend;

impl SegmentationBackend for DownBackend {
    fn health(&self) -> dental_mesh::DentalResult<HealthResponse> {
        Err(DentalError::service_unavailable("connection refused"))
    }

    fn segment(
        &self,
        _filename: &str,
        _stl: &[u8],
        _config: &SegmentationConfig,
    ) -> dental_mesh::DentalResult<SegmentationResponse> {
        unreachable!("health check fails first")
    }

    fn download(&self, _session: &str, _filename: &str) -> dental_mesh::DentalResult<Vec<u8>> {
        unreachable!("health check fails first")
    }
}

#[test]
fn test_unavailable_service_is_distinct_from_empty_result() {
    let mut model = DentalModel::new(create_test_cube(Point3::origin(), 1.0));
    let err = import_segments(
        &DownBackend,
        &mut model,
        &SegmentationConfig::default(),
        &TracingNotifier,
    )
    .expect_err("service down");
    assert!(matches!(err, DentalError::ServiceUnavailable { .. }));
    assert!(model.is_empty());
}

#[test]
fn test_local_backend_imports_components() {
    init_tracing();
    let mut scan = Mesh::new();
    for i in 0..4 {
        let cube = create_test_cube(Point3::new(i as f64 * 3.0, 0.0, 0.0), 1.0);
        let offset = scan.vertices.len() as u32;
        scan.vertices.extend(cube.vertices);
        scan.faces
            .extend(cube.faces.iter().map(|f| f.map(|v| v + offset)));
    }

    let mut model = DentalModel::new(scan);
    let config = SegmentationConfig {
        expected_tooth_count: 4,
        min_tooth_size: 12,
        ..Default::default()
    };
    let report = import_segments(&LocalBackend::default(), &mut model, &config, &TracingNotifier)
        .expect("imported");

    assert_eq!(report.imported.len(), 4);
    assert!(report.skipped.is_empty());
    assert_eq!(model.len(), 4);
}
