//! Error Handling Module
//!
//! Defines the error taxonomy of the export pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for model export operations
#[derive(Error, Debug)]
pub enum ExportError {
    /// The checkpoint record does not exist on disk
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(PathBuf),

    /// The checkpoint disagrees with the declared architecture
    #[error("Architecture mismatch: {0}")]
    ArchitectureMismatch(String),

    /// The interchange-to-mobile converter is not compiled in
    #[error("Bridge unavailable: {0}")]
    BridgeUnavailable(String),

    /// Structural failure while exporting or lowering a graph
    #[error("Conversion error: {0}")]
    ConversionError(String),

    /// The produced artifact failed the smoke test
    #[error("Artifact validation failed: {0}")]
    ArtifactValidationFailure(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ExportError {
    /// Short, stable name of the error kind, used in logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::CheckpointNotFound(_) => "CheckpointNotFound",
            ExportError::ArchitectureMismatch(_) => "ArchitectureMismatch",
            ExportError::BridgeUnavailable(_) => "BridgeUnavailable",
            ExportError::ConversionError(_) => "ConversionError",
            ExportError::ArtifactValidationFailure(_) => "ArtifactValidationFailure",
            ExportError::Config(_) => "Config",
            ExportError::Io(_) => "Io",
            ExportError::Serialization(_) => "Serialization",
        }
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ExportError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ExportError::Serialization(err.to_string())
    }
}

/// Convenience Result type for export operations
pub type Result<T> = std::result::Result<T, ExportError>;

/// Extension trait for re-tagging foreign errors with a pipeline error kind
pub trait ResultExt<T> {
    /// Map any error into a conversion error with context
    fn conversion_context(self, msg: &str) -> Result<T>;

    /// Map any error into a validation failure with context
    fn validation_context(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    fn conversion_context(self, msg: &str) -> Result<T> {
        self.map_err(|e| ExportError::ConversionError(format!("{}: {:?}", msg, e)))
    }

    fn validation_context(self, msg: &str) -> Result<T> {
        self.map_err(|e| ExportError::ArtifactValidationFailure(format!("{}: {:?}", msg, e)))
    }
}
