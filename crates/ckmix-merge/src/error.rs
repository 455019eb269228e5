//! Error types for checkpoint merging.

use std::path::PathBuf;

use thiserror::Error;

use crate::MergePhase;

/// Errors that can occur during a merge run.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Invalid merge configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Input checkpoint does not exist.
    #[error("Checkpoint not found: {}", path.display())]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Container header or layout could not be understood.
    #[error("Malformed checkpoint {}: {reason}", path.display())]
    Format {
        /// Offending file (source or destination).
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A tensor's byte length disagrees with its dtype and shape.
    #[error("Inconsistent tensor '{key}': {reason}")]
    Layout {
        /// Tensor name.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Tensor not present in a checkpoint.
    #[error("Tensor not found: {key}")]
    KeyMissing {
        /// Tensor name.
        key: String,
    },

    /// The tensor's element type has no arithmetic defined for merging.
    #[error("Unsupported dtype {dtype:?} for tensor '{key}'")]
    UnsupportedDtype {
        /// Tensor name.
        key: String,
        /// Stored element type.
        dtype: safetensors::Dtype,
    },

    /// Shape mismatch between tensors.
    #[error("Shape mismatch for tensor '{key}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name.
        key: String,
        /// Reference shape.
        expected: Vec<usize>,
        /// Offending shape.
        actual: Vec<usize>,
    },

    /// Filesystem failure tied to a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Compute backend error.
    #[error("Backend error: {0}")]
    Backend(#[from] candle_core::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Header serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The run was cancelled through its abort handle.
    #[error("Merge aborted")]
    Aborted,

    /// A fatal error annotated with the phase that produced it.
    #[error("{phase} failed: {source}")]
    Phase {
        /// Phase the run was in.
        phase: MergePhase,
        /// Underlying error.
        #[source]
        source: Box<MergeError>,
    },
}

impl MergeError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a format error for `path`.
    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Phase the error was raised in, if the orchestrator recorded one.
    pub fn phase(&self) -> Option<MergePhase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Innermost error, with any phase annotation stripped.
    pub fn root(&self) -> &MergeError {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_error_names_phase_and_file() {
        let err = MergeError::Phase {
            phase: MergePhase::Loading,
            source: Box::new(MergeError::NotFound {
                path: PathBuf::from("models/a.safetensors"),
            }),
        };

        let msg = err.to_string();
        assert!(msg.contains("loading"));
        assert!(msg.contains("models/a.safetensors"));
        assert_eq!(err.phase(), Some(MergePhase::Loading));
        assert!(matches!(err.root(), MergeError::NotFound { .. }));
    }

    #[test]
    fn test_unannotated_error_has_no_phase() {
        let err = MergeError::KeyMissing {
            key: "block1.weight".to_string(),
        };
        assert_eq!(err.phase(), None);
        assert!(err.to_string().contains("block1.weight"));
    }
}
