//! Contract with the AI segmentation service and the import path.
//!
//! The service takes a scan, returns one mesh file per detected tooth, and
//! serves those files for download. [`SegmentationBackend`] is the
//! transport-agnostic view of it; [`LocalBackend`] implements it in-process
//! with [`auto_segment`](crate::autoseg::auto_segment).
//!
//! [`import_segments`] checks health before anything else. An unreachable or
//! unhealthy service is reported as [`DentalError::ServiceUnavailable`] and is
//! never confused with a segmentation that found nothing.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::autoseg::{SegmentationConfig, auto_segment, classify_tooth_type};
use crate::editor::SegmentGeometry;
use crate::error::{DentalError, DentalResult};
use crate::io::{read_stl_bytes, stl_bytes};
use crate::segment::{DentalModel, SegmentId, ToothType};

/// `GET /health` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub segmentation_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_sessions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            segmentation_available: true,
            active_sessions: None,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            segmentation_available: false,
            active_sessions: None,
            error: Some(error.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxInfo {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

/// One tooth in a `POST /segment` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: u32,
    #[serde(default)]
    pub tooth_number: Option<u32>,
    pub tooth_type: String,
    #[serde(default)]
    pub method: Option<String>,
    pub filename: String,
    pub vertex_count: usize,
    #[serde(default)]
    pub triangle_count: usize,
    pub center: [f64; 3],
    pub volume: f64,
    pub bounding_box: BoundingBoxInfo,
    pub download_url: String,
}

impl SegmentInfo {
    /// Reported type, or one derived from the volume when unrecognized.
    pub fn resolved_tooth_type(&self) -> ToothType {
        ToothType::parse(&self.tooth_type).unwrap_or_else(|| classify_tooth_type(self.volume))
    }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.filename)
    }
}

/// `POST /segment` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    pub session_id: String,
    pub segments_count: usize,
    pub segments: Vec<SegmentInfo>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}

/// The segmentation service, whatever carries the requests.
pub trait SegmentationBackend {
    fn health(&self) -> DentalResult<HealthResponse>;

    /// Segment an STL upload.
    fn segment(
        &self,
        filename: &str,
        stl: &[u8],
        config: &SegmentationConfig,
    ) -> DentalResult<SegmentationResponse>;

    /// Fetch one segment file of a session.
    fn download(&self, session_id: &str, filename: &str) -> DentalResult<Vec<u8>>;

    /// Release a session's files (`DELETE /sessions/{id}`).
    fn cleanup(&self, _session_id: &str) -> DentalResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Receives user-facing messages.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Routes notices to `tracing` under `dental_mesh::notice`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info | NoticeLevel::Success => {
                info!(target: "dental_mesh::notice", ?level, "{}", message)
            }
            NoticeLevel::Warning => warn!(target: "dental_mesh::notice", "{}", message),
            NoticeLevel::Error => error!(target: "dental_mesh::notice", "{}", message),
        }
    }
}

/// Outcome of [`import_segments`].
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub session_id: String,
    pub imported: Vec<SegmentId>,
    /// Files that could not be fetched or decoded, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Imported {} segments from session {}",
            self.imported.len(),
            self.session_id
        )?;
        if !self.skipped.is_empty() {
            write!(f, " ({} skipped)", self.skipped.len())?;
        }
        Ok(())
    }
}

/// Segment the model's scan through `backend` and add one segment per file.
///
/// Existing segments are kept. Individual files that fail to download or
/// decode are skipped and listed in the report.
pub fn import_segments(
    backend: &dyn SegmentationBackend,
    model: &mut DentalModel,
    config: &SegmentationConfig,
    notifier: &dyn Notifier,
) -> DentalResult<ImportReport> {
    let health = backend.health().map_err(|e| match e {
        e @ DentalError::ServiceUnavailable { .. } => e,
        other => DentalError::service_unavailable(other.to_string()),
    });
    let health = match health {
        Ok(h) if h.is_healthy() => h,
        Ok(h) => {
            let details = h.error.unwrap_or_else(|| format!("status {}", h.status));
            notifier.notify(
                NoticeLevel::Error,
                "The segmentation service is unavailable. Segment manually or try again later.",
            );
            return Err(DentalError::service_unavailable(details));
        }
        Err(e) => {
            notifier.notify(
                NoticeLevel::Error,
                "The segmentation service could not be reached.",
            );
            return Err(e);
        }
    };
    debug!(?health, "Segmentation service healthy");

    let upload = stl_bytes(model.original())?;
    notifier.notify(NoticeLevel::Info, "Segmenting scan...");
    let response = backend.segment("scan.stl", &upload, config)?;
    if !response.success {
        return Err(DentalError::backend_rejected(
            response
                .message
                .unwrap_or_else(|| "segmentation was not successful".to_string()),
        ));
    }

    let mut report = ImportReport {
        session_id: response.session_id.clone(),
        ..Default::default()
    };

    for info in &response.segments {
        let mesh = backend
            .download(&response.session_id, &info.filename)
            .and_then(|bytes| read_stl_bytes(&bytes, &info.filename));
        let mesh = match mesh {
            Ok(mesh) => mesh,
            Err(e) => {
                warn!(file = %info.filename, error = %e, "Skipping segment file");
                report.skipped.push((info.filename.clone(), e.to_string()));
                continue;
            }
        };

        let id = model.add_segment(
            info.stem(),
            SegmentGeometry::imported(mesh),
            info.resolved_tooth_type(),
        );
        if let Ok(segment) = model.segment_mut(id) {
            segment.tooth_number = info.tooth_number;
            segment.method = Some(info.method.clone().unwrap_or_else(|| "ai".to_string()));
        }
        report.imported.push(id);
    }

    if let Err(e) = backend.cleanup(&report.session_id) {
        warn!(session = %report.session_id, error = %e, "Session cleanup failed");
    }

    if report.imported.is_empty() {
        notifier.notify(NoticeLevel::Warning, "Segmentation found no teeth.");
    } else {
        notifier.notify(
            NoticeLevel::Success,
            &format!("Imported {} segments.", report.imported.len()),
        );
    }
    info!(
        session = %report.session_id,
        imported = report.imported.len(),
        skipped = report.skipped.len(),
        "Backend import finished"
    );
    Ok(report)
}

/// In-process backend backed by [`auto_segment`].
///
/// Segment files live in memory until their session is cleaned up.
#[derive(Debug, Default)]
pub struct LocalBackend {
    next_session: AtomicU64,
    sessions: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl SegmentationBackend for LocalBackend {
    fn health(&self) -> DentalResult<HealthResponse> {
        Ok(HealthResponse {
            active_sessions: Some(self.session_count() as u64),
            ..HealthResponse::healthy()
        })
    }

    fn segment(
        &self,
        filename: &str,
        stl: &[u8],
        config: &SegmentationConfig,
    ) -> DentalResult<SegmentationResponse> {
        let mesh = read_stl_bytes(stl, filename)?;
        let result = auto_segment(&mesh, config)?;

        let session_id = format!("local-{}", self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        let mut files = HashMap::new();
        let mut segments = Vec::with_capacity(result.segments.len());
        for (i, segment) in result.segments.iter().enumerate() {
            let number = i + 1;
            let filename = segment.file_name(number);
            let mesh = &segment.geometry.mesh;
            let bounds = mesh.bounds().unwrap_or_else(|| {
                crate::types::Aabb::new(nalgebra::Point3::origin(), nalgebra::Point3::origin())
            });
            let center = mesh.centroid().unwrap_or_else(nalgebra::Point3::origin);
            segments.push(SegmentInfo {
                id: i as u32,
                tooth_number: Some(number as u32),
                tooth_type: segment.tooth_type().to_string(),
                method: Some(segment.method.clone()),
                filename: filename.clone(),
                vertex_count: mesh.vertex_count(),
                triangle_count: mesh.face_count(),
                center: center.coords.into(),
                volume: bounds.volume(),
                bounding_box: BoundingBoxInfo {
                    min: bounds.min.coords.into(),
                    max: bounds.max.coords.into(),
                },
                download_url: format!("/download/{}/{}", session_id, filename),
            });
            files.insert(filename, stl_bytes(mesh)?);
        }

        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.clone(), files);

        Ok(SegmentationResponse {
            success: true,
            session_id,
            segments_count: segments.len(),
            message: Some(format!("Successfully segmented {} teeth", segments.len())),
            segments,
        })
    }

    fn download(&self, session_id: &str, filename: &str) -> DentalResult<Vec<u8>> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .get(session_id)
            .and_then(|files| files.get(filename))
            .cloned()
            .ok_or_else(|| {
                DentalError::backend_rejected(format!("{}/{} not found", session_id, filename))
            })
    }

    fn cleanup(&self, session_id: &str) -> DentalResult<()> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
        match removed {
            Some(files) => {
                debug!(session = session_id, files = files.len(), "Session cleaned up");
                Ok(())
            }
            None => Err(DentalError::backend_rejected(format!(
                "session {} not found",
                session_id
            ))),
        }
    }
}
