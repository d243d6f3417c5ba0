//! Error types for kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Build file errors
    #[error("Invalid build file at {path:?}: {reason}")]
    InvalidBuildFile { path: PathBuf, reason: String },

    #[error("Unresolvable base image reference `{reference}` for image {image}")]
    UnresolvableReference { image: String, reference: String },

    // Hashing errors
    #[error("No files match copy source `{pattern}` for image {image}")]
    MissingFiles { image: String, pattern: String },

    // Store errors
    #[error("Cache check failed for {reference}: {reason}")]
    CacheCheckFailed { reference: String, reason: String },

    #[error("Build failed for {image}: {reason}")]
    BuildFailed { image: String, reason: String },

    #[error("Cache tag {reference} already points at a different digest; refusing to overwrite")]
    TagConflict { reference: String },

    // Graph errors
    #[error("Ancestor {ancestor} of {image} failed")]
    AncestorFailed {
        image: String,
        ancestor: String,
        #[source]
        source: Box<KilnError>,
    },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// The pipeline stage at which this error occurred, for user-facing
    /// failure reports and exit-code mapping.
    pub fn stage(&self) -> &'static str {
        match self {
            KilnError::InvalidBuildFile { .. } | KilnError::UnresolvableReference { .. } => "parse",
            KilnError::MissingFiles { .. } | KilnError::IoError { .. } => "hash",
            KilnError::CacheCheckFailed { .. } => "cache-check",
            KilnError::BuildFailed { .. } => "build",
            KilnError::TagConflict { .. } => "tag",
            KilnError::AncestorFailed { source, .. } => source.stage(),
            _ => "internal",
        }
    }

    /// The innermost failing image for an ancestor-failure chain, if any.
    pub fn failing_image(&self) -> Option<&str> {
        match self {
            KilnError::AncestorFailed { source, ancestor, .. } => {
                Some(source.failing_image().unwrap_or(ancestor))
            }
            KilnError::UnresolvableReference { image, .. }
            | KilnError::MissingFiles { image, .. }
            | KilnError::BuildFailed { image, .. } => Some(image),
            _ => None,
        }
    }
}
