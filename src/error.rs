//! Error types for traj-ldm.
//!
//! Artifact-level failures ([`TrajError::ArtifactNotFound`],
//! [`TrajError::CorruptArtifact`], [`TrajError::ShapeMismatch`]) are fatal:
//! the trainer stops instead of continuing with undefined weights. Key
//! mismatches during partial loads are not errors at all; they come back as
//! a [`KeyMismatch`](crate::checkpoint::KeyMismatch) report.
//!
//! # Example
//!
//! ```rust
//! use traj_ldm::{TrajConfig, TrajError};
//!
//! # fn main() {
//! match TrajConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(TrajError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for traj-ldm operations.
pub type Result<T> = std::result::Result<T, TrajError>;

/// Errors that can occur in traj-ldm.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrajError {
    /// No artifact exists at the given path.
    #[error("checkpoint artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// The artifact exists but cannot be parsed.
    #[error("corrupt checkpoint artifact {}: {reason}", path.display())]
    CorruptArtifact {
        /// Path of the offending artifact.
        path: PathBuf,
        /// What failed to parse.
        reason: String,
    },

    /// A matched parameter has a different shape on each side.
    #[error("shape mismatch for '{key}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Parameter name (unprefixed).
        key: String,
        /// Shape held by the target store.
        expected: Vec<usize>,
        /// Shape found in the source.
        got: Vec<usize>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error that is not an artifact parse failure (e.g. rotation).
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Batch source error.
    #[error("data error: {0}")]
    Data(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of trainer state.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl TrajError {
    /// Build a [`TrajError::CorruptArtifact`].
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the weight state is undefined and the run must stop.
    #[must_use]
    pub fn is_fatal_artifact(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound(_) | Self::CorruptArtifact { .. } | Self::ShapeMismatch { .. }
        )
    }
}

impl From<indicatif::style::TemplateError> for TrajError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        TrajError::Template(err.to_string())
    }
}
