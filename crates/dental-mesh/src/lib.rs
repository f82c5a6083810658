//! Segmentation, editing and movement planning for dental scan meshes.
//!
//! A scan is loaded as one triangle mesh. Teeth are cut out of it as
//! segments, either by hand with surface-aware lasso and brush strokes or
//! automatically, then moved along per-tooth dental axes. Collisions between
//! segments are detected in the background and the accumulated movement of
//! every tooth becomes a staged aligner plan.
//!
//! # Features
//!
//! - **Selection**: lasso and brush strokes with occlusion culling, curvature
//!   guided growth and a throttled live preview
//! - **Segment editing**: extract, grow and shrink segments against the scan
//! - **Intersection detection**: contact, overlap and collision between
//!   segments, run on a background thread that never reports stale results
//! - **Movement**: anteroposterior, vertical and transverse moves along axes
//!   derived from each tooth's root direction
//! - **Planning**: per-axis step counts and a flattened step sequence
//! - **Auto-segmentation**: component, clustering, voxel and slicing
//!   strategies, in-process or through a segmentation service
//!
//! # Units and Coordinates
//!
//! **Coordinates are millimetres.** Movement limits, intersection depths and
//! voxel sizes are all interpreted in mm. The scan's up direction defaults
//! to +Y and is configurable through [`MovementParams`].
//!
//! # Quick Start
//!
//! ```
//! use std::collections::BTreeSet;
//! use dental_mesh::{
//!     DentalModel, Mesh, MovementAxis, MovementController, OrthodonticTreatmentPlan,
//!     PlanningParams, ToothType, Vertex,
//! };
//! use nalgebra::Vector3;
//!
//! // A tall box standing on the XZ plane
//! let mut scan = Mesh::new();
//! for &(x, y, z) in &[
//!     (0.0, 0.0, 0.0), (1.0, 0.0, 0.0), (1.0, 0.0, 1.0), (0.0, 0.0, 1.0),
//!     (0.0, 8.0, 0.0), (1.0, 8.0, 0.0), (1.0, 8.0, 1.0), (0.0, 8.0, 1.0),
//! ] {
//!     scan.vertices.push(Vertex::from_coords(x, y, z));
//! }
//! scan.faces = vec![[0, 1, 5], [0, 5, 4], [2, 3, 7], [2, 7, 6]];
//!
//! let mut model = DentalModel::new(scan);
//! let all: BTreeSet<u32> = (0..8).collect();
//! let tooth = model.extract_segment("11", &all, ToothType::Incisor).unwrap();
//!
//! let mut movement = MovementController::default();
//! let forward = Vector3::new(0.0, 0.0, -1.0);
//! movement
//!     .apply_movement(&mut model, tooth, MovementAxis::Vertical, 3.0, &forward)
//!     .unwrap();
//!
//! let plan = OrthodonticTreatmentPlan::generate(&model, &PlanningParams::default());
//! // 3 mm at 0.2 mm per aligner
//! assert_eq!(plan.total_steps(), 15);
//! ```
//!
//! # Error Handling
//!
//! Fallible operations return [`DentalResult`]. Every [`DentalError`] carries
//! an [`ErrorCode`] and a [`RecoverySuggestion`] for display.

mod error;
pub mod tracing_ext;
mod types;

pub mod autoseg;
pub mod backend;
pub mod bvh;
pub mod config;
pub mod editor;
pub mod geometry;
pub mod intersect;
pub mod io;
pub mod movement;
pub mod planning;
pub mod progress;
pub mod projector;
pub mod scene;
pub mod segment;
pub mod selection;
pub mod spatial;
pub mod transform;
pub mod visibility;
pub mod worker;

// Re-export core types at crate root
pub use error::{DentalError, DentalLocation, DentalResult, ErrorCode, RecoverySuggestion};
pub use types::{Aabb, BufferLayout, Mesh, Triangle, Vertex, VertexColor, normal_matrix};

pub use autoseg::{
    AutoSegment, AutoSegmentation, SegmentationConfig, SegmentationStage, auto_segment,
};
pub use backend::{
    ImportReport, LocalBackend, Notifier, SegmentationBackend, TracingNotifier, import_segments,
};
pub use config::DentalConfig;
pub use editor::{SegmentEditor, SegmentGeometry};
pub use intersect::{
    IntersectionDetector, IntersectionParams, IntersectionResult, IntersectionType,
    SegmentSnapshot, Severity,
};
pub use io::{MeshFormat, load_mesh, save_ascii_stl, save_stl};
pub use movement::{DentalAxes, MovementAxis, MovementController, MovementParams};
pub use planning::{OrthodonticTreatmentPlan, PlanningParams};
pub use progress::{Progress, ProgressCallback, ProgressTracker};
pub use scene::{Camera, Scene, Viewport};
pub use segment::{DentalModel, MovementHistory, SegmentId, ToothSegment, ToothType};
pub use selection::{
    ScreenPoint, SelectionContext, SelectionEngine, SelectionMode, SelectionOutcome,
    SelectionParams, SelectionScope, SelectionTool,
};
pub use spatial::SpatialIndex;
pub use transform::Transform;
pub use worker::{IntersectionWorker, WorkerEvent};
