//! Benchmarks for dental-mesh operations.
//!
//! Run with: cargo bench -p dental-mesh
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p dental-mesh -- --save-baseline main
//! 2. After changes: cargo bench -p dental-mesh -- --baseline main

use std::collections::BTreeSet;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dental_mesh::intersect::SegmentSnapshot;
use dental_mesh::projector::ScreenProjector;
use dental_mesh::{
    Camera, DentalModel, IntersectionDetector, Mesh, ScreenPoint, SegmentGeometry,
    SegmentationConfig, SelectionContext, SelectionEngine, SelectionMode, SelectionTool,
    SpatialIndex, ToothType, Transform, Vertex, Viewport, auto_segment,
};
use nalgebra::{Matrix4, Point3, Vector3};

// =============================================================================
// Test Mesh Generation
// =============================================================================

/// Flat `n x n` grid centred on the origin, facing +Z.
fn create_grid(n: u32) -> Mesh {
    let mut mesh = Mesh::new();
    let half = n as f64 / 2.0;
    for y in 0..=n {
        for x in 0..=n {
            mesh.vertices.push(Vertex::with_normal(
                Point3::new(x as f64 - half, y as f64 - half, 0.0),
                Vector3::z(),
            ));
        }
    }
    let row = n + 1;
    for y in 0..n {
        for x in 0..n {
            let i = y * row + x;
            mesh.faces.push([i, i + 1, i + row + 1]);
            mesh.faces.push([i, i + row + 1, i + row]);
        }
    }
    mesh
}

/// UV sphere of radius `r` around `center`.
fn create_sphere(center: Point3<f64>, r: f64, rings: u32, sectors: u32) -> Mesh {
    let mut mesh = Mesh::new();
    for i in 0..=rings {
        let theta = std::f64::consts::PI * i as f64 / rings as f64;
        for j in 0..sectors {
            let phi = 2.0 * std::f64::consts::PI * j as f64 / sectors as f64;
            let dir = Vector3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            mesh.vertices.push(Vertex::with_normal(center + dir * r, dir));
        }
    }
    for i in 0..rings {
        for j in 0..sectors {
            let a = i * sectors + j;
            let b = i * sectors + (j + 1) % sectors;
            let c = a + sectors;
            let d = b + sectors;
            mesh.faces.push([a, c, b]);
            mesh.faces.push([b, c, d]);
        }
    }
    mesh
}

/// A row of `n` spheres, neighbours overlapping slightly.
fn create_arch(n: usize) -> DentalModel {
    let mut model = DentalModel::new(Mesh::new());
    for i in 0..n {
        let sphere = create_sphere(Point3::new(i as f64 * 1.8, 0.0, 0.0), 1.0, 16, 24);
        model.add_segment(
            format!("tooth_{:02}", i + 1),
            SegmentGeometry::imported(sphere),
            ToothType::Premolar,
        );
    }
    model
}

// =============================================================================
// Selection
// =============================================================================

fn bench_lasso(c: &mut Criterion) {
    let mut group = c.benchmark_group("lasso");
    let camera = Camera::perspective(Point3::new(0.0, 0.0, 60.0), Point3::origin(), 1.0);
    let viewport = Viewport::new(800.0, 800.0);
    let transform = Transform::identity();

    for n in [32u32, 96, 192] {
        let mesh = create_grid(n);
        let spatial = SpatialIndex::build(&mesh, SpatialIndex::suggest_cell_size(&mesh)).unwrap();
        let projector = ScreenProjector::new(Matrix4::identity(), &camera, viewport);
        let lasso: Vec<ScreenPoint> = (0..64)
            .filter_map(|k| {
                let a = 2.0 * std::f64::consts::PI * k as f64 / 64.0;
                let p = projector.project(&Point3::new(8.0 * a.cos(), 8.0 * a.sin(), 0.0))?;
                Some(ScreenPoint::new(p.x, p.y))
            })
            .collect();

        group.throughput(Throughput::Elements(mesh.vertex_count() as u64));
        group.bench_with_input(BenchmarkId::new("grid", n), &mesh, |b, mesh| {
            let ctx =
                SelectionContext::new(mesh, &transform, &camera, viewport).with_spatial(&spatial);
            b.iter(|| {
                let mut engine = SelectionEngine::default();
                engine.start(SelectionMode::Create, SelectionTool::Lasso, lasso[0], None);
                for &p in &lasso[1..] {
                    engine.extend(p);
                }
                black_box(engine.finish(&ctx))
            })
        });
    }

    group.finish();
}

fn bench_spatial(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial");

    for n in [64u32, 256] {
        let mesh = create_grid(n);
        group.bench_with_input(BenchmarkId::new("build", n), &mesh, |b, mesh| {
            b.iter(|| SpatialIndex::build(black_box(mesh), 2.0))
        });
    }

    group.finish();
}

// =============================================================================
// Segment editing
// =============================================================================

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");

    for n in [64u32, 192] {
        let mesh = create_grid(n);
        let half: BTreeSet<u32> = (0..mesh.vertex_count() as u32 / 2).collect();
        group.bench_with_input(BenchmarkId::new("half_grid", n), &mesh, |b, mesh| {
            b.iter(|| {
                let mut model = DentalModel::new(mesh.clone());
                black_box(model.extract_segment("bench", &half, ToothType::Molar))
            })
        });
    }

    group.finish();
}

// =============================================================================
// Intersection detection
// =============================================================================

fn bench_intersection(c: &mut Criterion) {
    let mut group = c.benchmark_group("intersection");
    group.sample_size(20);

    for n in [4usize, 14] {
        let model = create_arch(n);
        let snapshots = SegmentSnapshot::visible_in(&model).unwrap();
        group.bench_with_input(BenchmarkId::new("arch", n), &snapshots, |b, snapshots| {
            let detector = IntersectionDetector::default();
            b.iter(|| detector.detect_all(black_box(snapshots)))
        });
    }

    group.finish();
}

// =============================================================================
// Auto-segmentation
// =============================================================================

fn bench_auto_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("auto_segment");
    group.sample_size(10);

    let mut scan = Mesh::new();
    for i in 0..8 {
        let sphere = create_sphere(Point3::new(i as f64 * 3.0, 0.0, 0.0), 1.0, 16, 24);
        let offset = scan.vertices.len() as u32;
        scan.vertices.extend(sphere.vertices);
        scan.faces
            .extend(sphere.faces.iter().map(|f| f.map(|v| v + offset)));
    }
    let config = SegmentationConfig {
        expected_tooth_count: 8,
        ..Default::default()
    };

    group.bench_function("separated_spheres", |b| {
        b.iter(|| auto_segment(black_box(&scan), &config))
    });

    group.finish();
}

// =============================================================================
// Criterion Setup
// =============================================================================

criterion_group!(
    benches,
    bench_lasso,
    bench_spatial,
    bench_extract,
    bench_intersection,
    bench_auto_segment,
);

criterion_main!(benches);
