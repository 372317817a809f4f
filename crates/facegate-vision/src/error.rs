use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {} (download from insightface into the model directory)", .0.display())]
    ModelNotFound(PathBuf),
    #[error("unknown model {0:?}, expected one of: {1}")]
    UnknownModel(String, String),
    #[error("invalid device {0:?}, expected cpu, cuda or cuda:<index>")]
    InvalidDevice(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
