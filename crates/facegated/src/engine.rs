//! Dedicated inference thread.
//!
//! ONNX sessions need `&mut` access, so one OS thread owns the models and
//! serves requests in arrival order. Async callers talk to it through a
//! cloneable [`EngineHandle`].

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use facegate_core::{CapabilityError, Embedding, EmbeddingExtractor, FaceDetector, FaceRegion};
use facegate_vision::{FaceModels, VisionError};
use image::RgbImage;
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 4;

/// What the engine thread runs requests against.
pub trait InferenceBackend: Send + 'static {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, VisionError>;
    fn extract(&mut self, regions: &[FaceRegion]) -> Result<Vec<Embedding>, VisionError>;
}

impl InferenceBackend for FaceModels {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, VisionError> {
        FaceModels::detect(self, image)
    }

    fn extract(&mut self, regions: &[FaceRegion]) -> Result<Vec<Embedding>, VisionError> {
        FaceModels::extract(self, regions)
    }
}

enum EngineRequest {
    Detect {
        image: Arc<RgbImage>,
        reply: oneshot::Sender<Result<Vec<FaceRegion>, VisionError>>,
    },
    Extract {
        regions: Vec<FaceRegion>,
        reply: oneshot::Sender<Result<Vec<Embedding>, VisionError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, VisionError>>) -> EngineRequest,
    ) -> Result<T, CapabilityError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| CapabilityError::EngineStopped)?;
        reply_rx
            .await
            .map_err(|_| CapabilityError::EngineStopped)?
            .map_err(|e| CapabilityError::InferenceFailed(e.to_string()))
    }
}

#[async_trait]
impl FaceDetector for EngineHandle {
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<FaceRegion>, CapabilityError> {
        self.request(|reply| EngineRequest::Detect { image, reply }).await
    }
}

#[async_trait]
impl EmbeddingExtractor for EngineHandle {
    async fn extract(&self, regions: Vec<FaceRegion>) -> Result<Vec<Embedding>, CapabilityError> {
        self.request(|reply| EngineRequest::Extract { regions, reply }).await
    }
}

/// Move `backend` onto its own thread and return a handle to it.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_engine<B: InferenceBackend>(mut backend: B) -> Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image, reply } => {
                        // The caller gave up (deadline); skip the work.
                        if reply.is_closed() {
                            continue;
                        }
                        let _ = reply.send(backend.detect(&image));
                    }
                    EngineRequest::Extract { regions, reply } => {
                        if reply.is_closed() {
                            continue;
                        }
                        let _ = reply.send(backend.extract(&regions));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .context("spawning engine thread")?;

    Ok(EngineHandle { tx })
}
