//! Collaborator seams consumed by the core.
//!
//! Implementations must be thread-safe; the core calls them from many
//! concurrent tasks and never holds a lock across these calls (the
//! readiness guard's per-collection lock excepted).

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;

use crate::error::{CapabilityError, IndexError, StoreError};
use crate::types::{Embedding, FaceEmbedding, FaceRegion, LoadState, MatchCandidate, UpsertReceipt};

/// Opaque face detection capability.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Detect faces, returning regions in detection order.
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<FaceRegion>, CapabilityError>;
}

/// Opaque "face region → fixed-length vector" capability.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    /// Extract one embedding per region, in the same order as `regions`.
    async fn extract(&self, regions: Vec<FaceRegion>) -> Result<Vec<Embedding>, CapabilityError>;
}

/// Similarity index over named collections with one row per user key.
///
/// Distance convention: every [`MatchCandidate::distance`] is cosine distance
/// `1 - cos(a, b)` in `[0, 2]`, 0 meaning identical. `max_distance` is
/// inclusive: a row matches iff its distance is `<= max_distance`. Each
/// per-query list is sorted by ascending distance, ties broken by ascending
/// user key, and holds at most `limit` entries.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn load_state(&self, collection: &str) -> Result<LoadState, IndexError>;

    /// Request a load and return once the collection is ready.
    async fn load(&self, collection: &str) -> Result<(), IndexError>;

    /// Batched search: one result list per query vector, in query order.
    async fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<Vec<MatchCandidate>>, IndexError>;

    /// Insert or replace the row for `row.user_key` in a single write.
    async fn upsert(&self, collection: &str, row: FaceEmbedding) -> Result<UpsertReceipt, IndexError>;

    /// Delete by key. Returns whether a row existed; a missing key is not an error.
    async fn delete(&self, collection: &str, user_key: i64) -> Result<bool, IndexError>;

    async fn fetch(&self, collection: &str, user_key: i64) -> Result<Option<FaceEmbedding>, IndexError>;

    async fn count(&self, collection: &str) -> Result<usize, IndexError>;
}

/// Persisted user profiles. The core does not own their schema.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn exists(&self, user_key: i64) -> Result<bool, StoreError>;

    /// Store the enrolled image against the user's profile.
    async fn set_profile_image(&self, user_key: i64, image: Vec<u8>) -> Result<(), StoreError>;
}

/// Issues short-lived credentials after a recognized verify.
/// Called by the route layer, never by the matcher.
#[async_trait]
pub trait AuthCollaborator: Send + Sync {
    async fn issue_token(&self, subject: i64) -> Result<AccessToken, StoreError>;
}

/// Bearer credential handed back to a recognized caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub token_type: String,
    /// Expiry as milliseconds since the Unix epoch.
    pub expires_at: i64,
}
