//! Decode → detect → extract, shared by verify and enroll.

use std::sync::Arc;

use image::RgbImage;

use crate::deadline::{Deadlines, Stage};
use crate::error::{CapabilityError, FaceError};
use crate::traits::{EmbeddingExtractor, FaceDetector};
use crate::types::FaceRegion;

pub struct FacePipeline {
    detector: Arc<dyn FaceDetector>,
    extractor: Arc<dyn EmbeddingExtractor>,
    dimension: usize,
    deadlines: Deadlines,
}

impl FacePipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        extractor: Arc<dyn EmbeddingExtractor>,
        dimension: usize,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            detector,
            extractor,
            dimension,
            deadlines,
        }
    }

    /// Decode on the blocking pool; decoding large images is CPU-bound.
    pub async fn decode(&self, bytes: &[u8]) -> Result<Arc<RgbImage>, FaceError> {
        let bytes = bytes.to_vec();
        self.deadlines
            .run(Stage::Decode, async move {
                let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
                    .await
                    .map_err(|e| FaceError::InvalidImage(format!("decoder task failed: {e}")))?;
                let image = decoded.map_err(|e| FaceError::InvalidImage(e.to_string()))?;
                Ok(Arc::new(image.to_rgb8()))
            })
            .await
    }

    pub async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<FaceRegion>, FaceError> {
        self.deadlines
            .run(Stage::Detect, async {
                self.detector
                    .detect(image)
                    .await
                    .map_err(FaceError::DetectorUnavailable)
            })
            .await
    }

    /// One vector per region, in region order, each checked against the
    /// configured dimension.
    pub async fn extract(&self, regions: Vec<FaceRegion>) -> Result<Vec<Vec<f32>>, FaceError> {
        let expected = regions.len();
        let embeddings = self
            .deadlines
            .run(Stage::Extract, async {
                self.extractor
                    .extract(regions)
                    .await
                    .map_err(FaceError::ExtractorUnavailable)
            })
            .await?;

        if embeddings.len() != expected {
            return Err(FaceError::ExtractorUnavailable(CapabilityError::CountMismatch {
                expected,
                got: embeddings.len(),
            }));
        }

        embeddings
            .into_iter()
            .map(|embedding| {
                if embedding.dimension() != self.dimension {
                    return Err(FaceError::ExtractorUnavailable(
                        CapabilityError::DimensionMismatch {
                            expected: self.dimension,
                            got: embedding.dimension(),
                        },
                    ));
                }
                Ok(embedding.values)
            })
            .collect()
    }
}
