//! In-process vector index.
//!
//! Keeps every collection in memory with an explicit load state, so the
//! readiness protocol behaves the same as against an external engine.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::distance::FlatCollection;
use crate::error::IndexError;
use crate::traits::VectorIndex;
use crate::types::{FaceEmbedding, LoadState, MatchCandidate, UpsertReceipt};

struct Slot {
    state: LoadState,
    data: FlatCollection,
}

#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Slot>>,
    /// Simulated warm-up time spent in `load`.
    load_latency: Duration,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_latency(mut self, latency: Duration) -> Self {
        self.load_latency = latency;
        self
    }

    /// Create an empty, unloaded collection. No-op if it already exists.
    pub fn create_collection(&self, name: &str, dimension: usize) {
        let mut map = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string()).or_insert_with(|| Slot {
            state: LoadState::Unloaded,
            data: FlatCollection::new(dimension),
        });
    }

    /// Drop a collection back to the unloaded state, keeping its rows.
    #[cfg(test)]
    pub fn release(&self, name: &str) -> Result<(), IndexError> {
        self.with_slot_mut(name, |slot| {
            slot.state = LoadState::Unloaded;
            Ok(())
        })
    }

    fn with_slot<R>(
        &self,
        name: &str,
        f: impl FnOnce(&Slot) -> Result<R, IndexError>,
    ) -> Result<R, IndexError> {
        let map = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let slot = map
            .get(name)
            .ok_or_else(|| IndexError::CollectionNotFound(name.to_string()))?;
        f(slot)
    }

    fn with_slot_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Slot) -> Result<R, IndexError>,
    ) -> Result<R, IndexError> {
        let mut map = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let slot = map
            .get_mut(name)
            .ok_or_else(|| IndexError::CollectionNotFound(name.to_string()))?;
        f(slot)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn load_state(&self, collection: &str) -> Result<LoadState, IndexError> {
        self.with_slot(collection, |slot| Ok(slot.state))
    }

    async fn load(&self, collection: &str) -> Result<(), IndexError> {
        let already_ready = self.with_slot_mut(collection, |slot| {
            if slot.state == LoadState::Ready {
                return Ok(true);
            }
            slot.state = LoadState::Loading;
            Ok(false)
        })?;
        if already_ready {
            return Ok(());
        }

        if !self.load_latency.is_zero() {
            tokio::time::sleep(self.load_latency).await;
        }

        self.with_slot_mut(collection, |slot| {
            slot.state = LoadState::Ready;
            Ok(())
        })?;
        tracing::debug!(collection, "memory collection ready");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<Vec<MatchCandidate>>, IndexError> {
        self.with_slot(collection, |slot| {
            if slot.state != LoadState::Ready {
                return Err(IndexError::NotLoaded(collection.to_string()));
            }
            slot.data.search(queries, limit, max_distance)
        })
    }

    async fn upsert(&self, collection: &str, row: FaceEmbedding) -> Result<UpsertReceipt, IndexError> {
        self.with_slot_mut(collection, |slot| slot.data.upsert(row))
    }

    async fn delete(&self, collection: &str, user_key: i64) -> Result<bool, IndexError> {
        self.with_slot_mut(collection, |slot| Ok(slot.data.remove(user_key)))
    }

    async fn fetch(&self, collection: &str, user_key: i64) -> Result<Option<FaceEmbedding>, IndexError> {
        self.with_slot(collection, |slot| Ok(slot.data.get(user_key).cloned()))
    }

    async fn count(&self, collection: &str) -> Result<usize, IndexError> {
        self.with_slot(collection, |slot| Ok(slot.data.len()))
    }
}
