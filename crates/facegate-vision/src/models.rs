//! Registry of supported model pairs and their on-disk files.

use std::path::{Path, PathBuf};

use facegate_core::{Embedding, FaceRegion};
use image::RgbImage;

use crate::detector::ScrfdDetector;
use crate::error::VisionError;
use crate::extractor::ArcFaceExtractor;
use crate::session::Device;

/// A detector/extractor pair and the embedding shape it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: &'static str,
    pub detector_file: &'static str,
    pub extractor_file: &'static str,
    /// Recorded in [`Embedding::model_version`].
    pub version: &'static str,
    pub input_size: u32,
    pub embedding_dimension: usize,
}

pub const DEFAULT_MODEL: &str = "arcface-r50";

const REGISTRY: &[ModelSpec] = &[
    ModelSpec {
        name: "arcface-r50",
        detector_file: "det_10g.onnx",
        extractor_file: "w600k_r50.onnx",
        version: "w600k_r50",
        input_size: 112,
        embedding_dimension: 512,
    },
    ModelSpec {
        name: "arcface-mbf",
        detector_file: "det_500m.onnx",
        extractor_file: "w600k_mbf.onnx",
        version: "w600k_mbf",
        input_size: 112,
        embedding_dimension: 512,
    },
];

impl ModelSpec {
    pub fn lookup(name: &str) -> Result<&'static ModelSpec, VisionError> {
        REGISTRY.iter().find(|spec| spec.name == name).ok_or_else(|| {
            let known: Vec<&str> = REGISTRY.iter().map(|spec| spec.name).collect();
            VisionError::UnknownModel(name.to_string(), known.join(", "))
        })
    }

    pub fn detector_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(self.detector_file)
    }

    pub fn extractor_path(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(self.extractor_file)
    }
}

/// Both loaded models. Owned by a single inference thread.
pub struct FaceModels {
    pub spec: &'static ModelSpec,
    detector: ScrfdDetector,
    extractor: ArcFaceExtractor,
}

impl FaceModels {
    pub fn load(model_dir: &Path, name: &str, device: Device) -> Result<Self, VisionError> {
        let spec = ModelSpec::lookup(name)?;
        let detector = ScrfdDetector::load(&spec.detector_path(model_dir), device)?;
        let extractor = ArcFaceExtractor::load(&spec.extractor_path(model_dir), spec, device)?;
        tracing::info!(model = spec.name, %device, dir = %model_dir.display(), "face models ready");
        Ok(Self {
            spec,
            detector,
            extractor,
        })
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, VisionError> {
        self.detector.detect(image)
    }

    /// One embedding per region, in region order.
    pub fn extract(&mut self, regions: &[FaceRegion]) -> Result<Vec<Embedding>, VisionError> {
        regions
            .iter()
            .map(|region| self.extractor.extract(region))
            .collect()
    }
}
