//! facegate-vision: ONNX face detection and embedding extraction.
//!
//! SCRFD finds faces and their five landmarks; ArcFace turns an aligned
//! 112×112 crop into an L2-normalised embedding. Both run through ONNX
//! Runtime on the CPU, or on CUDA when built with the `cuda` feature.

pub mod alignment;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod models;
pub mod session;

pub use detector::ScrfdDetector;
pub use error::VisionError;
pub use extractor::ArcFaceExtractor;
pub use models::{FaceModels, ModelSpec};
pub use session::Device;
