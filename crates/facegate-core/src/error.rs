use std::time::Duration;
use thiserror::Error;

use crate::deadline::Stage;

/// Failure reported by a vector index implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("collection {0} is not loaded")]
    NotLoaded(String),
    #[error("vector dimension mismatch: collection expects {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index backend: {0}")]
    Backend(String),
}

/// Failure reported by the face detector or the embedding extractor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("extractor returned {got} embeddings for {expected} face regions")]
    CountMismatch { expected: usize, got: usize },
    #[error("inference engine stopped")]
    EngineStopped,
}

/// Failure reported by the user store or the token issuer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
}

/// Coarse classification used by outer layers to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or unusable input (4xx).
    Input,
    /// Rejected by policy (4xx).
    Policy,
    /// Referenced entity does not exist (4xx).
    NotFound,
    /// Collaborator failure or timeout (5xx); callers may retry with backoff.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("multiple faces detected ({count}); submit an image with exactly one face")]
    MultipleFacesDetected { count: usize },
    #[error("face is already enrolled for another user")]
    DuplicateFace,
    #[error("user not found: {0}")]
    UserNotFound(i64),
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(#[from] IndexError),
    #[error("face detector unavailable: {0}")]
    DetectorUnavailable(CapabilityError),
    #[error("embedding extractor unavailable: {0}")]
    ExtractorUnavailable(CapabilityError),
    #[error("user store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },
}

impl FaceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FaceError::InvalidImage(_)
            | FaceError::NoFaceDetected
            | FaceError::MultipleFacesDetected { .. } => ErrorClass::Input,
            FaceError::DuplicateFace => ErrorClass::Policy,
            FaceError::UserNotFound(_) => ErrorClass::NotFound,
            FaceError::IndexUnavailable(_)
            | FaceError::DetectorUnavailable(_)
            | FaceError::ExtractorUnavailable(_)
            | FaceError::StoreUnavailable(_)
            | FaceError::Timeout { .. } => ErrorClass::Infrastructure,
        }
    }

    /// Whether the same request may succeed if retried later.
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }
}
