//! ONNX Runtime session construction and inference device selection.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ort::session::builder::SessionBuilder;
use ort::session::Session;

use crate::error::VisionError;

const INTRA_THREADS: usize = 2;

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA device by ordinal.
    Cuda(i32),
}

impl FromStr for Device {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim().to_ascii_lowercase();
        match spec.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            _ => spec
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse::<i32>().ok())
                .filter(|ordinal| *ordinal >= 0)
                .map(Device::Cuda)
                .ok_or_else(|| VisionError::InvalidDevice(s.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Open an ONNX model on the requested device.
pub fn open(model_path: &Path, device: Device) -> Result<Session, VisionError> {
    if !model_path.exists() {
        return Err(VisionError::ModelNotFound(model_path.to_path_buf()));
    }

    let builder = Session::builder()?.with_intra_threads(INTRA_THREADS).map_err(ort::Error::from)?;
    let mut builder = select_device(builder, device)?;
    let session = builder.commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        %device,
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

#[cfg(feature = "cuda")]
fn select_device(mut builder: SessionBuilder, device: Device) -> Result<SessionBuilder, VisionError> {
    use ort::ep::{self, ExecutionProvider};

    if let Device::Cuda(ordinal) = device {
        let ep = ep::CUDA::default().with_device_id(ordinal);
        let available = ep
            .is_available()
            .map_err(|e| VisionError::DeviceUnavailable(e.to_string()))?;
        if available {
            ep.register(&mut builder)
                .map_err(|e| VisionError::DeviceUnavailable(e.to_string()))?;
        } else {
            tracing::warn!(%device, "onnx runtime not compiled with cuda, falling back to cpu");
        }
    }
    Ok(builder)
}

#[cfg(not(feature = "cuda"))]
fn select_device(builder: SessionBuilder, device: Device) -> Result<SessionBuilder, VisionError> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda(_) => Err(VisionError::DeviceUnavailable(format!(
            "{device} requested but facegate was built without the cuda feature"
        ))),
    }
}
