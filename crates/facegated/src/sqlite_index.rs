//! SQLite-backed vector index.
//!
//! Rows are the source of truth; `load` warms an in-memory [`FlatCollection`]
//! that serves searches until the process exits. Every write and its cache
//! update run together inside one call on the database thread, so a caller
//! that gives up mid-write cannot leave SQL and the cache disagreeing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use facegate_core::{FaceEmbedding, FlatCollection, IndexError, LoadState, MatchCandidate, UpsertReceipt, VectorIndex};
use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

enum Slot {
    Loading,
    Ready(FlatCollection),
}

/// Absent means unloaded.
type Cache = Arc<RwLock<HashMap<String, Slot>>>;

pub struct SqliteIndex {
    conn: Connection,
    dimension: usize,
    cache: Cache,
    writes: Mutex<()>,
}

fn backend(e: tokio_rusqlite::Error) -> IndexError {
    IndexError::Backend(e.to_string())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, IndexError> {
    if bytes.len() % 4 != 0 {
        return Err(IndexError::Backend(format!("corrupt vector blob of {} bytes", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn set_slot(cache: &RwLock<HashMap<String, Slot>>, collection: &str, slot: Option<Slot>) {
    let mut cache = cache.write().unwrap_or_else(PoisonError::into_inner);
    match slot {
        Some(slot) => cache.insert(collection.to_string(), slot),
        None => cache.remove(collection),
    };
}

/// Apply `f` to the warmed rows, if the collection is ready.
fn if_ready<R>(
    cache: &RwLock<HashMap<String, Slot>>,
    collection: &str,
    f: impl FnOnce(&mut FlatCollection) -> R,
) -> Option<R> {
    let mut cache = cache.write().unwrap_or_else(PoisonError::into_inner);
    match cache.get_mut(collection) {
        Some(Slot::Ready(data)) => Some(f(data)),
        _ => None,
    }
}

fn read_rows(conn: &rusqlite::Connection, collection: &str) -> rusqlite::Result<Vec<(i64, Vec<u8>, i64)>> {
    let mut stmt =
        conn.prepare("SELECT user_key, vector, updated_at FROM face_embeddings WHERE collection = ?1")?;
    let rows = stmt
        .query_map(params![collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn warm(dimension: usize, raw: Vec<(i64, Vec<u8>, i64)>) -> Result<FlatCollection, IndexError> {
    let rows = raw
        .into_iter()
        .map(|(user_key, blob, updated_at)| {
            Ok(FaceEmbedding {
                user_key,
                vector: decode_vector(&blob)?,
                updated_at,
            })
        })
        .collect::<Result<Vec<_>, IndexError>>()?;
    FlatCollection::from_rows(dimension, rows)
}

impl SqliteIndex {
    /// Every collection in this index holds `dimension`-length vectors.
    pub fn new(conn: Connection, dimension: usize) -> Self {
        Self {
            conn,
            dimension,
            cache: Arc::new(RwLock::new(HashMap::new())),
            writes: Mutex::new(()),
        }
    }

    fn check_dimension(&self, got: usize) -> Result<(), IndexError> {
        if got != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn load_state(&self, collection: &str) -> Result<LoadState, IndexError> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        Ok(match cache.get(collection) {
            None => LoadState::Unloaded,
            Some(Slot::Loading) => LoadState::Loading,
            Some(Slot::Ready(_)) => LoadState::Ready,
        })
    }

    async fn load(&self, collection: &str) -> Result<(), IndexError> {
        let _writes = self.writes.lock().await;
        if self.load_state(collection).await? == LoadState::Ready {
            return Ok(());
        }
        set_slot(&self.cache, collection, Some(Slot::Loading));

        let (name, dimension, cache) = (collection.to_string(), self.dimension, self.cache.clone());
        let outcome = self
            .conn
            .call(move |conn| {
                let warmed = match read_rows(conn, &name) {
                    Ok(raw) => warm(dimension, raw),
                    Err(e) => Err(IndexError::Backend(e.to_string())),
                };
                Ok(match warmed {
                    Ok(data) => {
                        let embeddings = data.len();
                        set_slot(&cache, &name, Some(Slot::Ready(data)));
                        Ok(embeddings)
                    }
                    Err(e) => {
                        set_slot(&cache, &name, None);
                        Err(e)
                    }
                })
            })
            .await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(e) => {
                set_slot(&self.cache, collection, None);
                Err(backend(e))
            }
        };
        match result {
            Ok(embeddings) => {
                tracing::info!(collection, embeddings, "collection loaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(collection, error = %e, "collection load failed");
                Err(e)
            }
        }
    }

    async fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<Vec<MatchCandidate>>, IndexError> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        match cache.get(collection) {
            Some(Slot::Ready(data)) => data.search(queries, limit, max_distance),
            _ => Err(IndexError::NotLoaded(collection.to_string())),
        }
    }

    async fn upsert(&self, collection: &str, row: FaceEmbedding) -> Result<UpsertReceipt, IndexError> {
        self.check_dimension(row.vector.len())?;
        let _writes = self.writes.lock().await;

        let (name, user_key, cache) = (collection.to_string(), row.user_key, self.cache.clone());
        let blob = encode_vector(&row.vector);
        let (replaced, cached) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let replaced: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM face_embeddings WHERE collection = ?1 AND user_key = ?2)",
                    params![name, user_key],
                    |r| r.get(0),
                )?;
                tx.execute(
                    "INSERT INTO face_embeddings (collection, user_key, vector, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (collection, user_key)
                     DO UPDATE SET vector = excluded.vector, updated_at = excluded.updated_at",
                    params![name, user_key, blob, row.updated_at],
                )?;
                tx.commit()?;
                let cached = if_ready(&cache, &name, |data| data.upsert(row));
                Ok((replaced, cached))
            })
            .await
            .map_err(backend)?;

        if let Some(cached) = cached {
            cached?;
        }
        tracing::debug!(collection, user_key, replaced, "embedding upserted");
        Ok(UpsertReceipt { replaced })
    }

    async fn delete(&self, collection: &str, user_key: i64) -> Result<bool, IndexError> {
        let _writes = self.writes.lock().await;
        let (name, cache) = (collection.to_string(), self.cache.clone());
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM face_embeddings WHERE collection = ?1 AND user_key = ?2",
                    params![name, user_key],
                )?;
                if_ready(&cache, &name, |data| data.remove(user_key));
                Ok(n > 0)
            })
            .await
            .map_err(backend)?;
        Ok(removed)
    }

    async fn fetch(&self, collection: &str, user_key: i64) -> Result<Option<FaceEmbedding>, IndexError> {
        let name = collection.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT vector, updated_at FROM face_embeddings WHERE collection = ?1 AND user_key = ?2",
                        params![name, user_key],
                        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(backend)?;

        raw.map(|(blob, updated_at)| {
            Ok(FaceEmbedding {
                user_key,
                vector: decode_vector(&blob)?,
                updated_at,
            })
        })
        .transpose()
    }

    async fn count(&self, collection: &str) -> Result<usize, IndexError> {
        let name = collection.to_string();
        let n = self
            .conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM face_embeddings WHERE collection = ?1",
                    params![name],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(backend)?;
        Ok(n as usize)
    }
}
