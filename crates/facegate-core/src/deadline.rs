//! Per-stage deadlines for calls into external collaborators.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FaceError;

/// Stage of a verify or enroll call that talks to a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Detect,
    Extract,
    IndexLoad,
    IndexQuery,
    IndexMutation,
    UserStore,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Decode => "image decode",
            Stage::Detect => "face detection",
            Stage::Extract => "embedding extraction",
            Stage::IndexLoad => "collection load",
            Stage::IndexQuery => "index query",
            Stage::IndexMutation => "index mutation",
            Stage::UserStore => "user store call",
        };
        f.write_str(s)
    }
}

/// Time limits applied to each collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub decode: Duration,
    pub detect: Duration,
    pub extract: Duration,
    /// Load-state queries, searches and mutations.
    pub index: Duration,
    /// Collection warm-up; usually much longer than `index`.
    pub load: Duration,
    pub store: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            decode: Duration::from_secs(5),
            detect: Duration::from_secs(5),
            extract: Duration::from_secs(5),
            index: Duration::from_secs(3),
            load: Duration::from_secs(30),
            store: Duration::from_secs(3),
        }
    }
}

impl Deadlines {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Decode => self.decode,
            Stage::Detect => self.detect,
            Stage::Extract => self.extract,
            Stage::IndexQuery | Stage::IndexMutation => self.index,
            Stage::IndexLoad => self.load,
            Stage::UserStore => self.store,
        }
    }

    /// Run `fut` under this stage's limit.
    pub async fn run<T, F>(&self, stage: Stage, fut: F) -> Result<T, FaceError>
    where
        F: Future<Output = Result<T, FaceError>>,
    {
        bounded(stage, self.for_stage(stage), fut).await
    }
}

/// Run `fut`, failing with [`FaceError::Timeout`] once `limit` elapses.
///
/// An elapsed call is dropped, not retried.
pub async fn bounded<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T, FaceError>
where
    F: Future<Output = Result<T, FaceError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%stage, ?limit, "collaborator call timed out");
            Err(FaceError::Timeout { stage, after: limit })
        }
    }
}
