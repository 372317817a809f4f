//! Outward-facing facade over the matcher and the enrollment manager.

use std::sync::Arc;

use crate::deadline::Stage;
use crate::enrollment::EnrollmentManager;
use crate::error::FaceError;
use crate::matcher::IdentityMatcher;
use crate::pipeline::FacePipeline;
use crate::readiness::ReadinessGuard;
use crate::settings::CoreSettings;
use crate::traits::{EmbeddingExtractor, FaceDetector, UserStore, VectorIndex};
use crate::types::{CollectionStatus, EnrollOrigin, EnrollOutcome, Verdict};

/// Process-scoped collaborators, created once at startup.
pub struct Collaborators {
    pub detector: Arc<dyn FaceDetector>,
    pub extractor: Arc<dyn EmbeddingExtractor>,
    pub index: Arc<dyn VectorIndex>,
    pub users: Arc<dyn UserStore>,
}

/// `enroll_self`, `enroll_as_admin` and `reset_face` differ only in who may
/// call them; that is checked by the caller before reaching this type.
pub struct FaceIdentityService {
    matcher: IdentityMatcher,
    enrollment: EnrollmentManager,
    index: Arc<dyn VectorIndex>,
    settings: CoreSettings,
}

impl FaceIdentityService {
    pub fn new(collaborators: Collaborators, settings: CoreSettings) -> Self {
        let Collaborators {
            detector,
            extractor,
            index,
            users,
        } = collaborators;

        let deadlines = settings.deadlines;
        let pipeline = Arc::new(FacePipeline::new(
            detector,
            extractor,
            settings.embedding_dimension,
            deadlines,
        ));
        let guard = Arc::new(ReadinessGuard::new(index.clone(), deadlines));

        let matcher = IdentityMatcher::new(
            pipeline.clone(),
            index.clone(),
            guard.clone(),
            settings.collection.clone(),
            settings.match_threshold,
            deadlines,
        );
        let enrollment = EnrollmentManager::new(pipeline, index.clone(), users, guard, settings.clone());

        Self {
            matcher,
            enrollment,
            index,
            settings,
        }
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub async fn verify(&self, image_bytes: &[u8]) -> Result<Verdict, FaceError> {
        self.matcher.verify(image_bytes).await
    }

    pub async fn enroll_self(&self, user_key: i64, image_bytes: &[u8]) -> Result<EnrollOutcome, FaceError> {
        self.enrollment
            .enroll(user_key, image_bytes, EnrollOrigin::SelfService)
            .await
    }

    pub async fn enroll_as_admin(
        &self,
        user_key: i64,
        image_bytes: &[u8],
    ) -> Result<EnrollOutcome, FaceError> {
        self.enrollment
            .enroll(user_key, image_bytes, EnrollOrigin::Admin)
            .await
    }

    pub async fn reset_face(&self, user_key: i64) -> Result<bool, FaceError> {
        self.enrollment.reset(user_key).await
    }

    pub async fn reset_faces(&self, user_keys: &[i64]) -> Result<usize, FaceError> {
        self.enrollment.reset_many(user_keys).await
    }

    pub async fn has_face(&self, user_key: i64) -> Result<bool, FaceError> {
        self.enrollment.has_face(user_key).await
    }

    /// Load state and row count of the face collection. Does not trigger a load.
    pub async fn status(&self) -> Result<CollectionStatus, FaceError> {
        let collection = self.settings.collection.as_str();
        let deadlines = &self.settings.deadlines;
        let state = deadlines
            .run(Stage::IndexQuery, async { Ok(self.index.load_state(collection).await?) })
            .await?;
        let embeddings = deadlines
            .run(Stage::IndexQuery, async { Ok(self.index.count(collection).await?) })
            .await
            .ok();
        Ok(CollectionStatus {
            collection: collection.to_string(),
            state,
            embeddings,
        })
    }
}
