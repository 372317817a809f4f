//! Lazy, exactly-once collection warm-up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::deadline::{Deadlines, Stage};
use crate::error::{FaceError, IndexError};
use crate::traits::VectorIndex;
use crate::types::LoadState;

#[derive(Default)]
struct Gate {
    lock: tokio::sync::Mutex<()>,
    /// Set once this guard has seen the collection ready.
    ready: AtomicBool,
}

/// Makes sure a collection is loaded before it is searched or mutated.
///
/// Holds one async mutex per collection name. The lock is held only while
/// observing the load state and, when needed, waiting for the load to finish;
/// searches and mutations run outside it. Once a collection has been seen
/// ready, later calls return without touching the lock or the index.
pub struct ReadinessGuard {
    index: Arc<dyn VectorIndex>,
    deadlines: Deadlines,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl ReadinessGuard {
    pub fn new(index: Arc<dyn VectorIndex>, deadlines: Deadlines) -> Self {
        Self {
            index,
            deadlines,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate_for(&self, collection: &str) -> Arc<Gate> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.entry(collection.to_string()).or_default().clone()
    }

    /// Idempotent. Concurrent callers for the same name share one load request;
    /// a failed load is reported to the caller that issued it and the next
    /// caller tries again.
    pub async fn ensure_ready(&self, collection: &str) -> Result<(), FaceError> {
        let gate = self.gate_for(collection);
        if gate.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let _held = gate.lock.lock().await;
        if gate.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let state = self
            .deadlines
            .run(Stage::IndexQuery, async {
                Ok(self.index.load_state(collection).await?)
            })
            .await?;
        if state == LoadState::Ready {
            gate.ready.store(true, Ordering::Release);
            return Ok(());
        }

        tracing::info!(collection, %state, "loading collection");
        self.deadlines
            .run(Stage::IndexLoad, async { Ok(self.index.load(collection).await?) })
            .await?;

        let state = self
            .deadlines
            .run(Stage::IndexQuery, async {
                Ok(self.index.load_state(collection).await?)
            })
            .await?;
        if state != LoadState::Ready {
            return Err(FaceError::IndexUnavailable(IndexError::Backend(format!(
                "collection {collection} reported {state} after load"
            ))));
        }

        gate.ready.store(true, Ordering::Release);
        tracing::info!(collection, "collection ready");
        Ok(())
    }

    /// Forget that `collection` was ready, so the next call asks the index again.
    /// Used when the index reports the collection unloaded behind our back.
    pub fn invalidate(&self, collection: &str) {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gate) = gates.get(collection) {
            if gate.ready.swap(false, Ordering::AcqRel) {
                tracing::info!(collection, "collection no longer loaded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_index::MemoryIndex;
    use crate::testing::ProbeIndex;
    use std::time::Duration;

    fn cold_index(latency: Duration) -> Arc<ProbeIndex> {
        let inner = MemoryIndex::new().with_load_latency(latency);
        inner.create_collection("faces", 4);
        inner.create_collection("other", 4);
        Arc::new(ProbeIndex::new(inner))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_issue_one_load() {
        let index = cold_index(Duration::from_millis(50));
        let guard = Arc::new(ReadinessGuard::new(index.clone(), Deadlines::default()));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            let index = index.clone();
            tasks.push(tokio::spawn(async move {
                guard.ensure_ready("faces").await.unwrap();
                // Every caller returns only after readiness.
                index.load_state("faces").await.unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), LoadState::Ready);
        }
        assert_eq!(index.load_requests("faces"), 1);
    }

    #[tokio::test]
    async fn test_ready_collection_is_not_reloaded() {
        let index = cold_index(Duration::ZERO);
        let guard = ReadinessGuard::new(index.clone(), Deadlines::default());
        guard.ensure_ready("faces").await.unwrap();
        guard.ensure_ready("faces").await.unwrap();
        guard.ensure_ready("faces").await.unwrap();
        assert_eq!(index.load_requests("faces"), 1);
    }

    #[tokio::test]
    async fn test_collections_have_independent_state() {
        let index = cold_index(Duration::ZERO);
        let guard = ReadinessGuard::new(index.clone(), Deadlines::default());
        guard.ensure_ready("faces").await.unwrap();
        assert_eq!(index.load_state("other").await.unwrap(), LoadState::Unloaded);
        guard.ensure_ready("other").await.unwrap();
        assert_eq!(index.load_requests("faces"), 1);
        assert_eq!(index.load_requests("other"), 1);
    }

    #[tokio::test]
    async fn test_failed_load_propagates_and_retries() {
        let index = cold_index(Duration::ZERO);
        index.fail_next_loads(1);
        let guard = ReadinessGuard::new(index.clone(), Deadlines::default());

        let err = guard.ensure_ready("faces").await.unwrap_err();
        assert!(matches!(err, FaceError::IndexUnavailable(_)), "got {err:?}");
        assert_eq!(index.load_state("faces").await.unwrap(), LoadState::Unloaded);

        // The lock was released and the collection is still eligible for loading.
        guard.ensure_ready("faces").await.unwrap();
        assert_eq!(index.load_requests("faces"), 2);
        assert_eq!(index.load_state("faces").await.unwrap(), LoadState::Ready);
    }

    #[tokio::test]
    async fn test_load_timeout_releases_lock() {
        let index = cold_index(Duration::from_secs(10));
        let deadlines = Deadlines {
            load: Duration::from_millis(20),
            ..Deadlines::default()
        };
        let guard = ReadinessGuard::new(index.clone(), deadlines);

        let err = guard.ensure_ready("faces").await.unwrap_err();
        assert!(matches!(err, FaceError::Timeout { stage: Stage::IndexLoad, .. }));

        // A second caller is not blocked behind a stuck lock.
        let second = tokio::time::timeout(Duration::from_secs(1), guard.ensure_ready("faces")).await;
        assert!(second.is_ok(), "lock should be free after a timed-out load");
    }

    #[tokio::test]
    async fn test_ready_collection_skips_state_query() {
        let index = cold_index(Duration::ZERO);
        let guard = ReadinessGuard::new(index.clone(), Deadlines::default());
        guard.ensure_ready("faces").await.unwrap();
        let queries = index.state_queries("faces");
        for _ in 0..5 {
            guard.ensure_ready("faces").await.unwrap();
        }
        assert_eq!(index.state_queries("faces"), queries);
    }

    #[tokio::test]
    async fn test_invalidate_reloads_released_collection() {
        let inner = MemoryIndex::new();
        inner.create_collection("faces", 4);
        let inner = Arc::new(inner);
        let guard = ReadinessGuard::new(inner.clone(), Deadlines::default());
        guard.ensure_ready("faces").await.unwrap();

        inner.release("faces").unwrap();
        // Still trusted until told otherwise.
        guard.ensure_ready("faces").await.unwrap();
        assert_eq!(inner.load_state("faces").await.unwrap(), LoadState::Unloaded);

        guard.invalidate("faces");
        guard.ensure_ready("faces").await.unwrap();
        assert_eq!(inner.load_state("faces").await.unwrap(), LoadState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_infrastructure_error() {
        let index = cold_index(Duration::ZERO);
        let guard = ReadinessGuard::new(index, Deadlines::default());
        let err = guard.ensure_ready("missing").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
