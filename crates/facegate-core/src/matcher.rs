//! Identity matching: who does this face belong to?

use std::sync::Arc;

use crate::deadline::{Deadlines, Stage};
use crate::error::{FaceError, IndexError};
use crate::pipeline::FacePipeline;
use crate::readiness::ReadinessGuard;
use crate::traits::VectorIndex;
use crate::types::{MatchCandidate, Verdict};

/// Batched threshold query against one collection.
///
/// A collection the index reports as not loaded is handed back to `guard`
/// so the next caller reloads it.
pub(crate) async fn query_within(
    index: &dyn VectorIndex,
    guard: &ReadinessGuard,
    deadlines: &Deadlines,
    collection: &str,
    queries: &[Vec<f32>],
    limit: usize,
    max_distance: f32,
) -> Result<Vec<Vec<MatchCandidate>>, FaceError> {
    let result = deadlines
        .run(Stage::IndexQuery, async {
            Ok(index.search(collection, queries, limit, max_distance).await?)
        })
        .await;
    if let Err(FaceError::IndexUnavailable(IndexError::NotLoaded(_))) = &result {
        guard.invalidate(collection);
    }
    result
}

/// Top entry of the first non-empty result list, with the index of the query
/// (detection order) that produced it. Lists are not merged or re-ranked.
pub fn select_first_hit(results: &[Vec<MatchCandidate>]) -> Option<(usize, MatchCandidate)> {
    results
        .iter()
        .enumerate()
        .find_map(|(face, hits)| hits.first().map(|hit| (face, *hit)))
}

pub struct IdentityMatcher {
    pipeline: Arc<FacePipeline>,
    index: Arc<dyn VectorIndex>,
    guard: Arc<ReadinessGuard>,
    collection: String,
    threshold: f32,
    deadlines: Deadlines,
}

impl IdentityMatcher {
    pub fn new(
        pipeline: Arc<FacePipeline>,
        index: Arc<dyn VectorIndex>,
        guard: Arc<ReadinessGuard>,
        collection: String,
        threshold: f32,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            pipeline,
            index,
            guard,
            collection,
            threshold,
            deadlines,
        }
    }

    /// Match every face in the image against the collection.
    ///
    /// No face and no match are ordinary `recognized = false` verdicts.
    /// Collaborator failures are errors, never a silent non-match.
    pub async fn verify(&self, image_bytes: &[u8]) -> Result<Verdict, FaceError> {
        let image = self.pipeline.decode(image_bytes).await?;
        let regions = self.pipeline.detect(image).await?;
        if regions.is_empty() {
            tracing::debug!("verify: no face detected");
            return Ok(Verdict::no_face());
        }

        let faces = regions.len();
        let vectors = self.pipeline.extract(regions).await?;

        self.guard.ensure_ready(&self.collection).await?;
        let results = query_within(
            self.index.as_ref(),
            &self.guard,
            &self.deadlines,
            &self.collection,
            &vectors,
            1,
            self.threshold,
        )
        .await?;

        match select_first_hit(&results) {
            Some((face, hit)) => {
                tracing::info!(
                    collection = %self.collection,
                    user_key = hit.user_key,
                    distance = hit.distance,
                    face,
                    faces,
                    "verify: face recognized"
                );
                Ok(Verdict::recognized(hit, face, faces))
            }
            None => {
                tracing::debug!(faces, threshold = self.threshold, "verify: no match within threshold");
                Ok(Verdict::not_recognized(faces))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_index::MemoryIndex;
    use crate::testing::{embedding_for, face_png, ColourExtractor, PixelDetector, ProbeIndex, TEST_DIM};
    use crate::types::{FaceEmbedding, LoadState};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn hit(user_key: i64, distance: f32) -> MatchCandidate {
        MatchCandidate { user_key, distance }
    }

    #[test]
    fn test_select_first_non_empty_list() {
        let results = vec![vec![], vec![hit(7, 0.3)], vec![hit(9, 0.01)]];
        // The closer hit on the third face does not win: detection order does.
        assert_eq!(select_first_hit(&results), Some((1, hit(7, 0.3))));
    }

    #[test]
    fn test_select_none_when_all_empty() {
        assert_eq!(select_first_hit(&[vec![], vec![]]), None);
        assert_eq!(select_first_hit(&[]), None);
    }

    struct Fixture {
        index: Arc<ProbeIndex>,
        detector: Arc<PixelDetector>,
        extractor: Arc<ColourExtractor>,
        matcher: IdentityMatcher,
    }

    fn fixture(threshold: f32) -> Fixture {
        let inner = MemoryIndex::new();
        inner.create_collection("faces", TEST_DIM);
        let index = Arc::new(ProbeIndex::new(inner));
        let detector = Arc::new(PixelDetector::default());
        let extractor = Arc::new(ColourExtractor::default());
        let deadlines = Deadlines::default();
        let pipeline = Arc::new(FacePipeline::new(
            detector.clone(),
            extractor.clone(),
            TEST_DIM,
            deadlines,
        ));
        let guard = Arc::new(ReadinessGuard::new(index.clone(), deadlines));
        let matcher = IdentityMatcher::new(
            pipeline,
            index.clone(),
            guard,
            "faces".into(),
            threshold,
            deadlines,
        );
        Fixture { index, detector, extractor, matcher }
    }

    async fn seed(index: &ProbeIndex, user_key: i64, colour: [u8; 3]) {
        index
            .upsert(
                "faces",
                FaceEmbedding { user_key, vector: embedding_for(colour), updated_at: 0 },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_face_is_not_an_error() {
        let f = fixture(0.4);
        let verdict = f.matcher.verify(&face_png(&[])).await.unwrap();
        assert!(!verdict.recognized);
        assert_eq!(verdict.confidence, 0.0);
        assert_eq!(verdict.message, "no face detected");
        // Nothing past detection ran.
        assert_eq!(f.extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.index.load_requests("faces"), 0);
    }

    #[tokio::test]
    async fn test_unknown_face_not_recognized() {
        let f = fixture(0.4);
        seed(&f.index, 1, [1, 0, 0]).await;
        let verdict = f.matcher.verify(&face_png(&[[2, 0, 0]])).await.unwrap();
        assert!(!verdict.recognized);
        assert_eq!(verdict.user_key, None);
        assert_eq!(verdict.faces_detected, 1);
    }

    #[tokio::test]
    async fn test_enrolled_face_recognized_with_confidence() {
        let f = fixture(0.4);
        seed(&f.index, 42, [3, 0, 0]).await;
        let verdict = f.matcher.verify(&face_png(&[[3, 0, 0]])).await.unwrap();
        assert!(verdict.recognized);
        assert_eq!(verdict.user_key, Some(42));
        assert!((verdict.confidence - 1.0).abs() < 1e-5);
        assert_eq!(verdict.matched_face, Some(0));
    }

    #[tokio::test]
    async fn test_near_duplicate_recognized() {
        let f = fixture(0.1);
        seed(&f.index, 42, [3, 0, 0]).await;
        let verdict = f.matcher.verify(&face_png(&[[3, 40, 0]])).await.unwrap();
        assert!(verdict.recognized);
        assert!(verdict.confidence < 1.0);
    }

    #[tokio::test]
    async fn test_multi_face_probe_uses_detection_order() {
        let f = fixture(0.4);
        seed(&f.index, 10, [4, 0, 0]).await;
        seed(&f.index, 20, [5, 0, 0]).await;
        // Unknown face first, then 20, then 10.
        let verdict = f
            .matcher
            .verify(&face_png(&[[6, 0, 0], [5, 0, 0], [4, 0, 0]]))
            .await
            .unwrap();
        assert_eq!(verdict.user_key, Some(20));
        assert_eq!(verdict.matched_face, Some(1));
        assert_eq!(verdict.faces_detected, 3);
    }

    #[tokio::test]
    async fn test_collection_loaded_lazily_once() {
        let f = fixture(0.4);
        for _ in 0..3 {
            f.matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap();
        }
        assert_eq!(f.index.load_requests("faces"), 1);
    }

    #[tokio::test]
    async fn test_index_failure_is_not_a_non_match() {
        let f = fixture(0.4);
        f.index.fail_search.store(true, Ordering::SeqCst);
        let err = f.matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, FaceError::IndexUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_extractor_failure_is_not_a_non_match() {
        let f = fixture(0.4);
        f.extractor.fail.store(true, Ordering::SeqCst);
        let err = f.matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, FaceError::ExtractorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_detector_failure_surfaces() {
        let f = fixture(0.4);
        f.detector.fail.store(true, Ordering::SeqCst);
        let err = f.matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, FaceError::DetectorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_detector_times_out_before_index() {
        let inner = MemoryIndex::new();
        inner.create_collection("faces", TEST_DIM);
        let index = Arc::new(ProbeIndex::new(inner));
        let deadlines = Deadlines {
            detect: Duration::from_millis(20),
            ..Deadlines::default()
        };
        let detector = Arc::new(PixelDetector {
            delay: Some(Duration::from_millis(500)),
            ..PixelDetector::default()
        });
        let pipeline = Arc::new(FacePipeline::new(
            detector,
            Arc::new(ColourExtractor::default()),
            TEST_DIM,
            deadlines,
        ));
        let guard = Arc::new(ReadinessGuard::new(index.clone(), deadlines));
        let matcher = IdentityMatcher::new(pipeline, index.clone(), guard, "faces".into(), 0.4, deadlines);

        let err = matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, FaceError::Timeout { stage: Stage::Detect, .. }), "got {err:?}");
        assert!(err.is_retryable());
        assert_eq!(index.load_requests("faces"), 0);
    }

    #[tokio::test]
    async fn test_released_collection_is_reloaded_after_not_loaded() {
        let index = Arc::new(MemoryIndex::new());
        index.create_collection("faces", TEST_DIM);
        let deadlines = Deadlines::default();
        let pipeline = Arc::new(FacePipeline::new(
            Arc::new(PixelDetector::default()),
            Arc::new(ColourExtractor::default()),
            TEST_DIM,
            deadlines,
        ));
        let guard = Arc::new(ReadinessGuard::new(index.clone(), deadlines));
        let matcher = IdentityMatcher::new(pipeline, index.clone(), guard, "faces".into(), 0.4, deadlines);
        matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap();

        index.release("faces").unwrap();
        let err = matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap_err();
        assert!(matches!(err, FaceError::IndexUnavailable(IndexError::NotLoaded(_))));

        // The failed search cleared the ready flag; this call loads again.
        matcher.verify(&face_png(&[[1, 0, 0]])).await.unwrap();
        assert_eq!(index.load_state("faces").await.unwrap(), LoadState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_image() {
        let f = fixture(0.4);
        let err = f.matcher.verify(&[0xff, 0xd8, 0x00]).await.unwrap_err();
        assert!(matches!(err, FaceError::InvalidImage(_)));
    }
}
