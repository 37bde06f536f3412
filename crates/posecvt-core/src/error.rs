//! Error types for the conversion pipeline.
//!
//! Strategy failures are captured by the pipeline and recorded per attempt;
//! only setup errors and `PublishFailure` ever reach the caller as `Err`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for posecvt.
#[derive(Debug, Error)]
pub enum ConvertError {
    // Conversion taxonomy
    #[error("Dependency {library} unavailable: {diagnostic}")]
    DependencyUnavailable { library: String, diagnostic: String },

    #[error("Artifact not found: {name} ({representation})")]
    ArtifactNotFound { name: String, representation: String },

    #[error("Malformed input artifact: {message}")]
    MalformedInputArtifact { message: String },

    #[error("Unsupported operator {operator}: {message}")]
    UnsupportedOperator { operator: String, message: String },

    #[error("{operation} timed out after {timeout:?}")]
    ConversionTimeout { operation: String, timeout: Duration },

    #[error("Failed to publish {path}: {message}")]
    PublishFailure { path: PathBuf, message: String },

    #[error("Artifact {path} is {size_bytes} bytes, below the {threshold_bytes} byte minimum")]
    SuspectArtifact {
        path: PathBuf,
        size_bytes: u64,
        threshold_bytes: u64,
    },

    #[error("Conversion failed: {message}")]
    ConversionFailed { message: String },

    #[error("Conversion cancelled")]
    Cancelled,

    // Store errors
    #[error("Model {name} is locked by another run")]
    StoreBusy { name: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for posecvt operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Serializable discriminant of [`ConvertError`], used in outcome records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DependencyUnavailable,
    ArtifactNotFound,
    MalformedInputArtifact,
    UnsupportedOperator,
    ConversionTimeout,
    PublishFailure,
    SuspectArtifact,
    ConversionFailed,
    Cancelled,
    StoreBusy,
    Io,
    Json,
    Config,
    Validation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::DependencyUnavailable => "DependencyUnavailable",
            ErrorKind::ArtifactNotFound => "ArtifactNotFound",
            ErrorKind::MalformedInputArtifact => "MalformedInputArtifact",
            ErrorKind::UnsupportedOperator => "UnsupportedOperator",
            ErrorKind::ConversionTimeout => "ConversionTimeout",
            ErrorKind::PublishFailure => "PublishFailure",
            ErrorKind::SuspectArtifact => "SuspectArtifact",
            ErrorKind::ConversionFailed => "ConversionFailed",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::StoreBusy => "StoreBusy",
            ErrorKind::Io => "Io",
            ErrorKind::Json => "Json",
            ErrorKind::Config => "Config",
            ErrorKind::Validation => "Validation",
        };
        f.write_str(s)
    }
}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ConvertError {
    /// Create an IO error with an operation description and path context.
    pub fn io(context: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        ConvertError::Io {
            message: format!("{context} ({}): {err}", path.display()),
            path: Some(path),
            source: Some(err),
        }
    }

    /// Serializable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            ConvertError::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            ConvertError::MalformedInputArtifact { .. } => ErrorKind::MalformedInputArtifact,
            ConvertError::UnsupportedOperator { .. } => ErrorKind::UnsupportedOperator,
            ConvertError::ConversionTimeout { .. } => ErrorKind::ConversionTimeout,
            ConvertError::PublishFailure { .. } => ErrorKind::PublishFailure,
            ConvertError::SuspectArtifact { .. } => ErrorKind::SuspectArtifact,
            ConvertError::ConversionFailed { .. } => ErrorKind::ConversionFailed,
            ConvertError::Cancelled => ErrorKind::Cancelled,
            ConvertError::StoreBusy { .. } => ErrorKind::StoreBusy,
            ConvertError::Io { .. } => ErrorKind::Io,
            ConvertError::Json { .. } => ErrorKind::Json,
            ConvertError::Config { .. } => ErrorKind::Config,
            ConvertError::Validation { .. } => ErrorKind::Validation,
        }
    }

    /// Whether the pipeline may try another strategy after this error.
    ///
    /// Publish and lock failures concern the shared asset directory and end
    /// the run regardless of which strategy produced the artifact.
    pub fn allows_fallback(&self) -> bool {
        !matches!(
            self,
            ConvertError::PublishFailure { .. }
                | ConvertError::StoreBusy { .. }
                | ConvertError::Cancelled
        )
    }
}

/// Attach a path to `std::io::Error` results.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| {
            let path = path.into();
            ConvertError::Io {
                message: format!("{}: {}", path.display(), e),
                path: Some(path),
                source: Some(e),
            }
        })
    }
}
