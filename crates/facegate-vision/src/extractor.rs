//! ArcFace embedding extraction via ONNX Runtime.

use std::path::Path;

use facegate_core::{Embedding, FaceRegion};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use crate::alignment;
use crate::error::VisionError;
use crate::models::ModelSpec;
use crate::session::{self, Device};

// ArcFace normalises symmetrically, unlike SCRFD.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

pub struct ArcFaceExtractor {
    session: Session,
    spec: &'static ModelSpec,
}

impl ArcFaceExtractor {
    pub fn load(model_path: &Path, spec: &'static ModelSpec, device: Device) -> Result<Self, VisionError> {
        let session = session::open(model_path, device)?;
        Ok(Self { session, spec })
    }

    /// Embed one detected face.
    ///
    /// The crop is aligned on its landmarks when the detector supplied them;
    /// otherwise it is resized to the model input as is.
    pub fn extract(&mut self, region: &FaceRegion) -> Result<Embedding, VisionError> {
        let size = self.spec.input_size;
        let aligned = region
            .crop_landmarks()
            .and_then(|landmarks| alignment::align_face(&region.crop, &landmarks, size))
            .unwrap_or_else(|| {
                tracing::debug!("face crop not aligned, resizing");
                imageops::resize(&region.crop, size, size, FilterType::Triangle)
            });

        let input = preprocess(&aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.spec.embedding_dimension {
            return Err(VisionError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.spec.embedding_dimension,
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(self.spec.version.to_string()),
        })
    }
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let (w, h) = (face.width() as usize, face.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
