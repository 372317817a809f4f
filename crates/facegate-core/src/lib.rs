//! facegate-core: face identity matching and embedding lifecycle.
//!
//! Turns a detected face into a vector, searches a similarity index under a
//! distance threshold, and keeps exactly one embedding per user. Detection,
//! embedding extraction, the vector index and the user store are injected
//! through the traits in [`traits`].

pub mod deadline;
pub mod distance;
pub mod enrollment;
pub mod error;
pub mod matcher;
pub mod memory_index;
pub mod pipeline;
pub mod readiness;
pub mod service;
pub mod settings;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;

pub use deadline::{Deadlines, Stage};
pub use distance::{cosine_distance, FlatCollection};
pub use error::{CapabilityError, ErrorClass, FaceError, IndexError, StoreError};
pub use memory_index::MemoryIndex;
pub use readiness::ReadinessGuard;
pub use service::{Collaborators, FaceIdentityService};
pub use settings::CoreSettings;
pub use traits::{AccessToken, AuthCollaborator, EmbeddingExtractor, FaceDetector, UserStore, VectorIndex};
pub use types::{
    BoundingBox, CollectionStatus, Embedding, EmbeddingRef, EnrollOrigin, EnrollOutcome, FaceEmbedding,
    FaceRegion, LoadState, MatchCandidate, UpsertReceipt, Verdict,
};
