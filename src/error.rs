//! Error types for the node toolkit and backend

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;

/// Error kinds that can occur while scanning, parsing or serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    /// Permission denied when accessing a file or directory
    PermissionDenied,
    /// File or directory not found
    NotFound,
    /// I/O error during file operations
    IoError,
    /// Path is malformed or escapes its allowed root
    InvalidPath,
    /// Caller supplied an unusable value
    InvalidInput,
    /// A media container could not be decoded
    Decode,
    /// An external tool (ffmpeg, ffprobe) failed or is missing
    Subprocess,
    /// Settings database operation failed
    Database,
    /// The task was cancelled cooperatively
    Cancelled,
    /// Unknown error
    Unknown,
}

/// Represents an error raised by a node function or a backend handler
#[derive(Debug, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct NodeError {
    /// The kind of error
    pub kind: NodeErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

impl NodeError {
    /// Create a new error
    pub fn new(kind: NodeErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(path: PathBuf) -> Self {
        Self::new(
            NodeErrorKind::PermissionDenied,
            Some(path.clone()),
            format!("Permission denied: {:?}", path),
        )
    }

    /// Create a not found error
    pub fn not_found(path: PathBuf) -> Self {
        Self::new(
            NodeErrorKind::NotFound,
            Some(path.clone()),
            format!("Not found: {:?}", path),
        )
    }

    /// Create an I/O error
    pub fn io_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::IoError, path, message)
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::InvalidPath, Some(path.into()), message)
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::InvalidInput, None, message)
    }

    /// Create a decode error for a media container
    pub fn decode(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Decode, path, message)
    }

    /// Create an external tool error
    pub fn subprocess(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Subprocess, None, message)
    }

    /// Create a database error
    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Database, None, message)
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Self::new(NodeErrorKind::Cancelled, None, "Task cancelled")
    }

    /// Attach a path to an error that has none
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => NodeErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => NodeErrorKind::NotFound,
            _ => NodeErrorKind::IoError,
        };
        Self::new(kind, None, err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(format!("Invalid JSON: {}", err))
    }
}

impl From<image::ImageError> for NodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(e) => e.into(),
            other => Self::decode(None, other.to_string()),
        }
    }
}

impl From<png::DecodingError> for NodeError {
    fn from(err: png::DecodingError) -> Self {
        Self::decode(None, err.to_string())
    }
}

impl From<png::EncodingError> for NodeError {
    fn from(err: png::EncodingError) -> Self {
        Self::io_error(None, err.to_string())
    }
}

impl From<rusqlite::Error> for NodeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::database_error(err.to_string())
    }
}
