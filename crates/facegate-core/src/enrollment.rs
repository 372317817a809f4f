//! Embedding enrollment: one face in, one embedding per user out.
//!
//! Per-user lifecycle: `NoEmbedding -> Enrolled -> NoEmbedding` on reset, or
//! `Enrolled -> Enrolled` on re-enroll. Every error return from [`enroll`]
//! happens before the index is mutated, so a failed attempt leaves the prior
//! state in place.
//!
//! Concurrent enrolls for the same user race on the upsert; the index's
//! last-write-wins semantics decide which vector survives.
//!
//! [`enroll`]: EnrollmentManager::enroll

use std::sync::Arc;

use crate::deadline::{Deadlines, Stage};
use crate::error::FaceError;
use crate::matcher::query_within;
use crate::pipeline::FacePipeline;
use crate::readiness::ReadinessGuard;
use crate::settings::CoreSettings;
use crate::traits::{UserStore, VectorIndex};
use crate::types::{EmbeddingRef, EnrollOrigin, EnrollOutcome, FaceEmbedding};

pub struct EnrollmentManager {
    pipeline: Arc<FacePipeline>,
    index: Arc<dyn VectorIndex>,
    users: Arc<dyn UserStore>,
    guard: Arc<ReadinessGuard>,
    settings: CoreSettings,
}

impl EnrollmentManager {
    pub fn new(
        pipeline: Arc<FacePipeline>,
        index: Arc<dyn VectorIndex>,
        users: Arc<dyn UserStore>,
        guard: Arc<ReadinessGuard>,
        settings: CoreSettings,
    ) -> Self {
        Self {
            pipeline,
            index,
            users,
            guard,
            settings,
        }
    }

    fn deadlines(&self) -> &Deadlines {
        &self.settings.deadlines
    }

    fn collection(&self) -> &str {
        &self.settings.collection
    }

    /// Replace (or create) the user's single face embedding from an image
    /// containing exactly one face.
    pub async fn enroll(
        &self,
        user_key: i64,
        image_bytes: &[u8],
        origin: EnrollOrigin,
    ) -> Result<EnrollOutcome, FaceError> {
        let image = self.pipeline.decode(image_bytes).await?;

        let users = self.users.clone();
        let exists = self
            .deadlines()
            .run(Stage::UserStore, async move { Ok(users.exists(user_key).await?) })
            .await?;
        if !exists {
            return Err(FaceError::UserNotFound(user_key));
        }

        let regions = self.pipeline.detect(image).await?;
        match regions.len() {
            0 => return Err(FaceError::NoFaceDetected),
            1 => {}
            count => return Err(FaceError::MultipleFacesDetected { count }),
        }

        let vector = self
            .pipeline
            .extract(regions)
            .await?
            .pop()
            .ok_or(FaceError::NoFaceDetected)?;

        if !self.settings.allow_duplicate_faces {
            self.reject_duplicate(user_key, &vector).await?;
        }

        self.guard.ensure_ready(self.collection()).await?;
        let updated_at = chrono::Utc::now().timestamp_millis();
        let row = FaceEmbedding {
            user_key,
            vector,
            updated_at,
        };
        let receipt = self
            .deadlines()
            .run(Stage::IndexMutation, async {
                Ok(self.index.upsert(self.collection(), row).await?)
            })
            .await?;

        tracing::info!(
            collection = self.collection(),
            user_key,
            %origin,
            replaced = receipt.replaced,
            "face embedding enrolled"
        );

        // The embedding is committed; the profile image is a side effect and
        // its failure does not undo the enrollment.
        let users = self.users.clone();
        let image = image_bytes.to_vec();
        let profile_updated = match self
            .deadlines()
            .run(Stage::UserStore, async move {
                Ok(users.set_profile_image(user_key, image).await?)
            })
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(user_key, error = %err, "enrolled face stored, profile image not updated");
                false
            }
        };

        Ok(EnrollOutcome {
            success: true,
            embedding_ref: EmbeddingRef {
                collection: self.collection().to_string(),
                user_key,
                updated_at,
            },
            replaced: receipt.replaced,
            profile_updated,
        })
    }

    /// Fails with `DuplicateFace` when the candidate already matches a
    /// different user within the threshold. The user's own prior embedding is
    /// not a duplicate.
    async fn reject_duplicate(&self, user_key: i64, vector: &[f32]) -> Result<(), FaceError> {
        self.guard.ensure_ready(self.collection()).await?;
        let results = query_within(
            self.index.as_ref(),
            &self.guard,
            self.deadlines(),
            self.collection(),
            &[vector.to_vec()],
            2,
            self.settings.match_threshold,
        )
        .await?;

        let other = results
            .into_iter()
            .flatten()
            .find(|hit| hit.user_key != user_key);
        if let Some(hit) = other {
            tracing::info!(
                user_key,
                matched_user = hit.user_key,
                distance = hit.distance,
                "enrollment rejected: duplicate face"
            );
            return Err(FaceError::DuplicateFace);
        }
        Ok(())
    }

    /// Delete the user's embedding. Idempotent; returns whether one existed.
    pub async fn reset(&self, user_key: i64) -> Result<bool, FaceError> {
        self.guard.ensure_ready(self.collection()).await?;
        let removed = self
            .deadlines()
            .run(Stage::IndexMutation, async {
                Ok(self.index.delete(self.collection(), user_key).await?)
            })
            .await?;
        tracing::info!(collection = self.collection(), user_key, removed, "face reset");
        Ok(removed)
    }

    /// Batch reset. Stops at the first failing key; keys before it stay reset.
    pub async fn reset_many(&self, user_keys: &[i64]) -> Result<usize, FaceError> {
        let mut removed = 0;
        for &user_key in user_keys {
            if self.reset(user_key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn has_face(&self, user_key: i64) -> Result<bool, FaceError> {
        self.guard.ensure_ready(self.collection()).await?;
        let row = self
            .deadlines()
            .run(Stage::IndexQuery, async {
                Ok(self.index.fetch(self.collection(), user_key).await?)
            })
            .await?;
        Ok(row.is_some())
    }
}
