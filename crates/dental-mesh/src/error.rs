//! Error types for dental mesh operations with rich diagnostics.
//!
//! Every error carries:
//! - A machine-readable error code
//! - Optional location information (segment, vertex, file)
//! - A recovery suggestion
//! - Terminal rendering via miette
//!
//! # Error Codes
//!
//! Codes have the format `DENT-XXXX`:
//! - `DENT-1xxx`: I/O errors (reading, writing, parsing mesh files)
//! - `DENT-2xxx`: Rejected input (empty selections, edits that would empty a segment)
//! - `DENT-3xxx`: Geometry errors (stale transforms, empty meshes)
//! - `DENT-4xxx`: Segmentation service errors
//! - `DENT-5xxx`: Worker and configuration errors
//!
//! Rejected-input errors never leave partial mutations behind: the caller's
//! prior state is intact whenever one of them is returned.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::segment::SegmentId;

/// Result type alias for dental mesh operations.
pub type DentalResult<T> = Result<T, DentalError>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // I/O errors (1xxx)
    /// DENT-1001: Failed to read file
    IoRead = 1001,
    /// DENT-1002: Failed to write file
    IoWrite = 1002,
    /// DENT-1003: Failed to parse file format
    ParseError = 1003,
    /// DENT-1004: Unsupported file format
    UnsupportedFormat = 1004,

    // Rejected input (2xxx)
    /// DENT-2001: Selection contains no vertices
    EmptySelection = 2001,
    /// DENT-2002: Add found no new triangles
    NothingToAdd = 2002,
    /// DENT-2003: Remove matched no triangles
    NothingToRemove = 2003,
    /// DENT-2004: Remove would leave the segment with zero triangles
    WouldEmptySegment = 2004,
    /// DENT-2005: Segment id not present in the model
    SegmentNotFound = 2005,
    /// DENT-2006: Parameter out of range
    InvalidParameter = 2006,

    // Geometry errors (3xxx)
    /// DENT-3001: Mesh has no vertices or faces
    EmptyMesh = 3001,
    /// DENT-3002: World matrix used before being refreshed
    StaleTransform = 3002,
    /// DENT-3003: Face references a vertex that does not exist
    InvalidVertexIndex = 3003,

    // Segmentation service (4xxx)
    /// DENT-4001: Segmentation service unreachable or unhealthy
    ServiceUnavailable = 4001,
    /// DENT-4002: Segmentation service rejected the request
    BackendRejected = 4002,

    // Worker / config (5xxx)
    /// DENT-5001: Background computation failed
    WorkerFailed = 5001,
    /// DENT-5002: Invalid configuration
    Config = 5002,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `DENT-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoRead => "DENT-1001",
            ErrorCode::IoWrite => "DENT-1002",
            ErrorCode::ParseError => "DENT-1003",
            ErrorCode::UnsupportedFormat => "DENT-1004",
            ErrorCode::EmptySelection => "DENT-2001",
            ErrorCode::NothingToAdd => "DENT-2002",
            ErrorCode::NothingToRemove => "DENT-2003",
            ErrorCode::WouldEmptySegment => "DENT-2004",
            ErrorCode::SegmentNotFound => "DENT-2005",
            ErrorCode::InvalidParameter => "DENT-2006",
            ErrorCode::EmptyMesh => "DENT-3001",
            ErrorCode::StaleTransform => "DENT-3002",
            ErrorCode::InvalidVertexIndex => "DENT-3003",
            ErrorCode::ServiceUnavailable => "DENT-4001",
            ErrorCode::BackendRejected => "DENT-4002",
            ErrorCode::WorkerFailed => "DENT-5001",
            ErrorCode::Config => "DENT-5002",
        }
    }

    /// True for errors caused by a rejected user edit or stroke.
    pub fn is_rejected_input(&self) -> bool {
        (*self as u32) / 1000 == 2
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions attached to errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Redo the stroke, usually with a larger region or different mode.
    RetryStroke { hint: String },
    /// Rerun the computation (detection pass, import).
    Retry { operation: String },
    /// Check the source file or service.
    CheckSource { checks: Vec<String> },
    /// Use a different file format.
    UseDifferentFormat { suggested: Vec<String> },
    /// Adjust parameters for the operation.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Call a method before retrying.
    CallFirst { method: String },
    /// No automatic recovery available.
    None,
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::RetryStroke { hint } => write!(f, "Redo the selection: {}", hint),
            RecoverySuggestion::Retry { operation } => write!(f, "Retry the {}", operation),
            RecoverySuggestion::CheckSource { checks } => {
                write!(f, "Check: {}", checks.join(", "))
            }
            RecoverySuggestion::UseDifferentFormat { suggested } => {
                write!(f, "Try using a different format: {}", suggested.join(", "))
            }
            RecoverySuggestion::AdjustParameters { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Try adjusting: {}", params.join(", "))
            }
            RecoverySuggestion::CallFirst { method } => {
                write!(f, "Call `{}` before retrying", method)
            }
            RecoverySuggestion::None => write!(f, "No automatic recovery available"),
        }
    }
}

/// Location information for errors.
#[derive(Debug, Clone)]
pub enum DentalLocation {
    /// Error concerning a specific segment.
    Segment { id: SegmentId },
    /// Error at a specific face.
    Face { index: usize },
    /// Error in a file.
    File { path: PathBuf },
    /// Error at a remote endpoint.
    Endpoint { url: String },
}

impl std::fmt::Display for DentalLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DentalLocation::Segment { id } => write!(f, "segment {}", id),
            DentalLocation::Face { index } => write!(f, "face {}", index),
            DentalLocation::File { path } => write!(f, "{}", path.display()),
            DentalLocation::Endpoint { url } => write!(f, "{}", url),
        }
    }
}

/// Errors that can occur during dental mesh operations.
#[derive(Debug, Error, Diagnostic)]
pub enum DentalError {
    /// Error reading from a file.
    #[error("failed to read mesh from {path}")]
    #[diagnostic(
        code(dental::io::read),
        help("Check that the file exists and is readable")
    )]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing to a file.
    #[error("failed to write mesh to {path}")]
    #[diagnostic(
        code(dental::io::write),
        help("Check that the directory exists and is writable")
    )]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a mesh file.
    #[error("failed to parse mesh from {path}: {details}")]
    #[diagnostic(
        code(dental::parse::error),
        help("The file may be truncated or use an unsupported variant. Re-export it as binary STL.")
    )]
    ParseError { path: PathBuf, details: String },

    /// Unsupported file format.
    #[error("unsupported mesh format: {extension:?}")]
    #[diagnostic(code(dental::format::unsupported), help("Supported formats: STL, OBJ"))]
    UnsupportedFormat { extension: Option<String> },

    /// The selection resolved to no vertices.
    #[error("selection is empty: {details}")]
    #[diagnostic(
        code(dental::edit::empty_selection),
        help("Draw the stroke over visible surface of the active mesh")
    )]
    EmptySelection { details: String },

    /// Adding the selection to a segment found no new triangles.
    #[error("selection adds no new triangles to segment {segment}")]
    #[diagnostic(
        code(dental::edit::nothing_to_add),
        help("The selected area is already part of the segment")
    )]
    NothingToAdd { segment: SegmentId },

    /// Removing the selection from a segment matched no triangles.
    #[error("selection removes no triangles from segment {segment}")]
    #[diagnostic(
        code(dental::edit::nothing_to_remove),
        help("Select vertices that belong to the segment")
    )]
    NothingToRemove { segment: SegmentId },

    /// Removing the selection would leave an empty segment.
    #[error("removing {removed} triangles would leave segment {segment} empty")]
    #[diagnostic(
        code(dental::edit::would_empty),
        help("Delete the segment instead, or keep at least one triangle")
    )]
    WouldEmptySegment { segment: SegmentId, removed: usize },

    /// A segment id is not present in the model.
    #[error("segment {id} not found")]
    #[diagnostic(code(dental::model::not_found))]
    SegmentNotFound { id: SegmentId },

    /// A parameter is out of range.
    #[error("invalid parameter {name}: {details}")]
    #[diagnostic(code(dental::param::invalid))]
    InvalidParameter { name: &'static str, details: String },

    /// Empty mesh (no vertices or faces).
    #[error("mesh is empty: {details}")]
    #[diagnostic(
        code(dental::geometry::empty),
        help("The mesh must have at least one vertex and one face")
    )]
    EmptyMesh { details: String },

    /// A world matrix was read while its transform had pending changes.
    #[error("world matrix is stale; transform changed since the last update")]
    #[diagnostic(
        code(dental::geometry::stale_transform),
        help("Call update_matrix_world() before projecting or raycasting")
    )]
    StaleTransform,

    /// Face references a vertex that does not exist.
    #[error(
        "invalid vertex index: face {face_index} references vertex {vertex_index}, but mesh only has {vertex_count} vertices"
    )]
    #[diagnostic(code(dental::geometry::vertex_index))]
    InvalidVertexIndex {
        face_index: usize,
        vertex_index: u32,
        vertex_count: usize,
    },

    /// The segmentation service is unreachable or reports itself unhealthy.
    #[error("segmentation service unavailable: {details}")]
    #[diagnostic(
        code(dental::service::unavailable),
        help("The segmentation service is down. Try again later or segment manually.")
    )]
    ServiceUnavailable { details: String },

    /// The segmentation service answered but rejected the request.
    #[error("segmentation service rejected the request: {details}")]
    #[diagnostic(code(dental::service::rejected))]
    BackendRejected { details: String },

    /// A background computation failed.
    #[error("background {task} failed: {details}")]
    #[diagnostic(code(dental::worker::failed), help("Rerun the computation"))]
    WorkerFailed { task: String, details: String },

    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {details}")]
    #[diagnostic(code(dental::config::invalid))]
    Config { details: String },
}

impl DentalError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            DentalError::IoRead { .. } => ErrorCode::IoRead,
            DentalError::IoWrite { .. } => ErrorCode::IoWrite,
            DentalError::ParseError { .. } => ErrorCode::ParseError,
            DentalError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            DentalError::EmptySelection { .. } => ErrorCode::EmptySelection,
            DentalError::NothingToAdd { .. } => ErrorCode::NothingToAdd,
            DentalError::NothingToRemove { .. } => ErrorCode::NothingToRemove,
            DentalError::WouldEmptySegment { .. } => ErrorCode::WouldEmptySegment,
            DentalError::SegmentNotFound { .. } => ErrorCode::SegmentNotFound,
            DentalError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            DentalError::EmptyMesh { .. } => ErrorCode::EmptyMesh,
            DentalError::StaleTransform => ErrorCode::StaleTransform,
            DentalError::InvalidVertexIndex { .. } => ErrorCode::InvalidVertexIndex,
            DentalError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            DentalError::BackendRejected { .. } => ErrorCode::BackendRejected,
            DentalError::WorkerFailed { .. } => ErrorCode::WorkerFailed,
            DentalError::Config { .. } => ErrorCode::Config,
        }
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            DentalError::IoRead { .. } => RecoverySuggestion::CheckSource {
                checks: vec!["file exists".into(), "file permissions".into()],
            },
            DentalError::IoWrite { .. } => RecoverySuggestion::CheckSource {
                checks: vec!["directory exists".into(), "write permissions".into()],
            },
            DentalError::ParseError { .. } => RecoverySuggestion::UseDifferentFormat {
                suggested: vec!["binary STL".into()],
            },
            DentalError::UnsupportedFormat { .. } => RecoverySuggestion::UseDifferentFormat {
                suggested: vec!["STL".into(), "OBJ".into()],
            },
            DentalError::EmptySelection { .. } => RecoverySuggestion::RetryStroke {
                hint: "enclose visible vertices".into(),
            },
            DentalError::NothingToAdd { .. } => RecoverySuggestion::RetryStroke {
                hint: "select surface outside the segment".into(),
            },
            DentalError::NothingToRemove { .. } => RecoverySuggestion::RetryStroke {
                hint: "select surface inside the segment".into(),
            },
            DentalError::WouldEmptySegment { .. } => RecoverySuggestion::RetryStroke {
                hint: "select a smaller region, or delete the segment".into(),
            },
            DentalError::SegmentNotFound { .. } => RecoverySuggestion::None,
            DentalError::InvalidParameter { name, .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![((*name).into(), "use a positive finite value".into())],
            },
            DentalError::EmptyMesh { .. } => RecoverySuggestion::CheckSource {
                checks: vec!["mesh has geometry".into(), "correct export settings".into()],
            },
            DentalError::StaleTransform => RecoverySuggestion::CallFirst {
                method: "update_matrix_world".into(),
            },
            DentalError::InvalidVertexIndex { .. } => RecoverySuggestion::CheckSource {
                checks: vec!["face indices".into()],
            },
            DentalError::ServiceUnavailable { .. } => RecoverySuggestion::Retry {
                operation: "segmentation request once the service is healthy".into(),
            },
            DentalError::BackendRejected { .. } => RecoverySuggestion::CheckSource {
                checks: vec!["uploaded scan is a valid STL".into()],
            },
            DentalError::WorkerFailed { task, .. } => RecoverySuggestion::Retry {
                operation: task.clone(),
            },
            DentalError::Config { .. } => RecoverySuggestion::CheckSource {
                checks: vec!["configuration syntax".into(), "field names".into()],
            },
        }
    }

    /// Returns location information if available.
    pub fn location(&self) -> Option<DentalLocation> {
        match self {
            DentalError::IoRead { path, .. }
            | DentalError::IoWrite { path, .. }
            | DentalError::ParseError { path, .. } => {
                Some(DentalLocation::File { path: path.clone() })
            }
            DentalError::NothingToAdd { segment }
            | DentalError::NothingToRemove { segment }
            | DentalError::WouldEmptySegment { segment, .. } => {
                Some(DentalLocation::Segment { id: *segment })
            }
            DentalError::SegmentNotFound { id } => Some(DentalLocation::Segment { id: *id }),
            DentalError::InvalidVertexIndex { face_index, .. } => {
                Some(DentalLocation::Face { index: *face_index })
            }
            _ => None,
        }
    }

    // Constructor helpers

    /// Create an IoRead error.
    pub fn io_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DentalError::IoRead {
            path: path.into(),
            source,
        }
    }

    /// Create an IoWrite error.
    pub fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DentalError::IoWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a ParseError.
    pub fn parse_error(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        DentalError::ParseError {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Create an UnsupportedFormat error.
    pub fn unsupported_format(extension: Option<String>) -> Self {
        DentalError::UnsupportedFormat { extension }
    }

    /// Create an EmptySelection error.
    pub fn empty_selection(details: impl Into<String>) -> Self {
        DentalError::EmptySelection {
            details: details.into(),
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(name: &'static str, details: impl Into<String>) -> Self {
        DentalError::InvalidParameter {
            name,
            details: details.into(),
        }
    }

    /// Create an EmptyMesh error.
    pub fn empty_mesh(details: impl Into<String>) -> Self {
        DentalError::EmptyMesh {
            details: details.into(),
        }
    }

    /// Create a ServiceUnavailable error.
    pub fn service_unavailable(details: impl Into<String>) -> Self {
        DentalError::ServiceUnavailable {
            details: details.into(),
        }
    }

    /// Create a BackendRejected error.
    pub fn backend_rejected(details: impl Into<String>) -> Self {
        DentalError::BackendRejected {
            details: details.into(),
        }
    }

    /// Create a WorkerFailed error.
    pub fn worker_failed(task: impl Into<String>, details: impl Into<String>) -> Self {
        DentalError::WorkerFailed {
            task: task.into(),
            details: details.into(),
        }
    }

    /// Create a Config error.
    pub fn config(details: impl Into<String>) -> Self {
        DentalError::Config {
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = DentalError::WouldEmptySegment {
            segment: SegmentId(3),
            removed: 12,
        };
        assert_eq!(err.code(), ErrorCode::WouldEmptySegment);
        assert_eq!(err.code().as_str(), "DENT-2004");
        assert!(err.code().is_rejected_input());
    }

    #[test]
    fn test_service_unavailable_is_not_rejected_input() {
        let err = DentalError::service_unavailable("connection refused");
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
        assert!(!err.code().is_rejected_input());
        assert!(matches!(
            err.recovery_suggestion(),
            RecoverySuggestion::Retry { .. }
        ));
    }

    #[test]
    fn test_location_info() {
        let err = DentalError::NothingToAdd {
            segment: SegmentId(7),
        };
        match err.location() {
            Some(DentalLocation::Segment { id }) => assert_eq!(id, SegmentId(7)),
            other => panic!("Expected Segment location, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_transform_suggestion() {
        let suggestion = DentalError::StaleTransform.recovery_suggestion();
        assert_eq!(suggestion.to_string(), "Call `update_matrix_world` before retrying");
    }

    #[test]
    fn test_error_display() {
        let err = DentalError::WouldEmptySegment {
            segment: SegmentId(2),
            removed: 40,
        };
        let display = format!("{}", err);
        assert!(display.contains("40 triangles"));
        assert!(display.contains("segment 2"));
    }
}
