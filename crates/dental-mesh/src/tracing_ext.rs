//! Structured logging helpers.
//!
//! The library only emits events; the binary installs a subscriber. Targets:
//!
//! - `dental_mesh::timing`: operation start and duration
//! - `dental_mesh::mesh_state`: mesh dimensions at pipeline boundaries
//! - `dental_mesh::detection`: intersection summaries
//!
//! `RUST_LOG=dental_mesh=debug` shows all of them.

use std::time::Instant;

use tracing::{Span, debug, info, warn};

use crate::intersect::{IntersectionResult, Severity};
use crate::types::Mesh;

/// Logs the duration of a scope when dropped.
///
/// ```
/// use dental_mesh::tracing_ext::OperationTimer;
///
/// let _timer = OperationTimer::new("detect_all");
/// // ... work ...
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl OperationTimer {
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("dental_operation", operation = name);
        debug!(target: "dental_mesh::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Timer with the mesh size attached to its span.
    pub fn for_mesh(name: &'static str, mesh: &Mesh) -> Self {
        let span = tracing::info_span!(
            "dental_operation",
            operation = name,
            faces = mesh.face_count(),
            vertices = mesh.vertex_count()
        );
        debug!(
            target: "dental_mesh::timing",
            operation = name,
            faces = mesh.face_count(),
            vertices = mesh.vertex_count(),
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        info!(
            target: "dental_mesh::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "Operation completed"
        );
    }
}

/// Debug-level mesh dimensions.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let dims = mesh.bounds().map(|b| b.size()).unwrap_or_default();
    debug!(
        target: "dental_mesh::mesh_state",
        context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        indexed = mesh.is_indexed(),
        dimensions = format!("{:.2} x {:.2} x {:.2}", dims.x, dims.y, dims.z),
        "Mesh state"
    );
}

/// One line per detection pass; `warn` when anything is severe.
pub fn log_detection_summary(results: &[IntersectionResult], segments: usize, elapsed_ms: f64) {
    let high = results
        .iter()
        .filter(|r| r.severity == Severity::High)
        .count();
    if high > 0 {
        warn!(
            target: "dental_mesh::detection",
            segments,
            intersections = results.len(),
            high,
            elapsed_ms = format!("{:.2}", elapsed_ms),
            "Severe intersections detected"
        );
    } else {
        info!(
            target: "dental_mesh::detection",
            segments,
            intersections = results.len(),
            elapsed_ms = format!("{:.2}", elapsed_ms),
            "Intersection detection finished"
        );
    }
}
