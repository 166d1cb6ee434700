//! Error types for ml-export crate.

use thiserror::Error;

/// Errors that can occur while converting, tracing, saving or loading a model.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Shape-polymorphism descriptor could not be parsed or applied.
    #[error("invalid polymorphic shape '{spec}': {reason}")]
    InvalidPolyShape {
        /// The descriptor text.
        spec: String,
        /// Reason for failure.
        reason: String,
    },

    /// Shapes do not agree.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Two trees do not have the same structure.
    #[error("structure mismatch: {0}")]
    StructureMismatch(String),

    /// Tracing a function failed.
    #[error("tracing failed: {0}")]
    Trace(String),

    /// Executing a graph failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// No traced function accepts the given inputs.
    #[error("no traced function matches inputs {0}")]
    NoMatchingSignature(String),

    /// Named signature is not present.
    #[error("signature not found: {0}")]
    SignatureNotFound(String),

    /// Failed to write the artifact.
    #[error("failed to save model to {path}: {reason}")]
    SaveArtifact {
        /// Destination path.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to read the artifact.
    #[error("failed to load model from {path}: {reason}")]
    LoadArtifact {
        /// Source path.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Variable checkpoint does not start with the expected magic bytes.
    #[error("invalid checkpoint magic: {0:?}")]
    InvalidCheckpointMagic([u8; 4]),

    /// Variable checkpoint has an unsupported version.
    #[error("unsupported checkpoint version: {0}")]
    UnsupportedCheckpointVersion(u32),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExportError {
    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Creates an invalid polymorphic shape error.
    #[must_use]
    pub fn invalid_poly_shape(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPolyShape {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a structure mismatch error.
    #[must_use]
    pub fn structure_mismatch(reason: impl Into<String>) -> Self {
        Self::StructureMismatch(reason.into())
    }

    /// Creates a tracing error.
    #[must_use]
    pub fn trace(reason: impl Into<String>) -> Self {
        Self::Trace(reason.into())
    }

    /// Creates an execution error.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution(reason.into())
    }

    /// Creates a no matching signature error.
    #[must_use]
    pub fn no_matching_signature(inputs: impl Into<String>) -> Self {
        Self::NoMatchingSignature(inputs.into())
    }

    /// Creates a signature not found error.
    #[must_use]
    pub fn signature_not_found(name: impl Into<String>) -> Self {
        Self::SignatureNotFound(name.into())
    }

    /// Creates a save artifact error.
    #[must_use]
    pub fn save_artifact(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SaveArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a load artifact error.
    #[must_use]
    pub fn load_artifact(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Returns `true` for caller-input validation failures.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for ml-export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_invalid_argument() {
        let err = ExportError::invalid_argument("at least one input signature must be given");
        assert!(err.to_string().contains("at least one input signature"));
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn error_invalid_poly_shape() {
        let err = ExportError::invalid_poly_shape("(b, 4", "missing ')'");
        assert!(err.to_string().contains("(b, 4"));
        assert!(err.to_string().contains("missing ')'"));
        assert!(!err.is_invalid_argument());
    }

    #[test]
    fn error_shape_mismatch() {
        let err = ExportError::shape_mismatch("[?, 4]", "[2, 8]");
        assert!(err.to_string().contains("[?, 4]"));
        assert!(err.to_string().contains("[2, 8]"));
    }

    #[test]
    fn error_save_and_load() {
        let err = ExportError::save_artifact("/tmp/model", "disk full");
        assert!(err.to_string().contains("/tmp/model"));
        assert!(err.to_string().contains("disk full"));

        let err = ExportError::load_artifact("/tmp/model", "missing saved_model.json");
        assert!(err.to_string().contains("missing saved_model.json"));
    }

    #[test]
    fn error_checkpoint_header() {
        let err = ExportError::InvalidCheckpointMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ExportError::UnsupportedCheckpointVersion(9);
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: ExportError = io_err.into();
        assert!(matches!(err, ExportError::Io(_)));
    }

    #[test]
    fn error_from_json_error() {
        let json_err = serde_json::from_str::<u32>("not json");
        assert!(json_err.is_err());
        if let Err(e) = json_err {
            let err: ExportError = e.into();
            assert!(matches!(err, ExportError::Serialization(_)));
        }
    }
}
