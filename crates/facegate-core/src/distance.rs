//! Cosine distance and exact (flat) search over one collection.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::IndexError;
use crate::types::{FaceEmbedding, MatchCandidate, UpsertReceipt};

/// Cosine distance `1 - cos(a, b)`, in [0, 2]. Lower = more similar.
///
/// A zero vector has no direction; its distance to anything is 1.0.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    let similarity = if denom > 0.0 { dot / denom } else { 0.0 };
    (1.0 - similarity).clamp(0.0, 2.0)
}

fn by_distance_then_key(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(Ordering::Equal)
        .then(a.user_key.cmp(&b.user_key))
}

/// All rows of one collection held in memory, searched exhaustively.
#[derive(Debug, Clone)]
pub struct FlatCollection {
    dimension: usize,
    rows: HashMap<i64, FaceEmbedding>,
}

impl FlatCollection {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: HashMap::new(),
        }
    }

    pub fn from_rows(
        dimension: usize,
        rows: impl IntoIterator<Item = FaceEmbedding>,
    ) -> Result<Self, IndexError> {
        let mut collection = Self::new(dimension);
        for row in rows {
            collection.upsert(row)?;
        }
        Ok(collection)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, user_key: i64) -> Option<&FaceEmbedding> {
        self.rows.get(&user_key)
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

    pub fn upsert(&mut self, row: FaceEmbedding) -> Result<UpsertReceipt, IndexError> {
        self.check_dimension(row.vector.len())?;
        let replaced = self.rows.insert(row.user_key, row).is_some();
        Ok(UpsertReceipt { replaced })
    }

    pub fn remove(&mut self, user_key: i64) -> bool {
        self.rows.remove(&user_key).is_some()
    }

    /// One list per query: rows with `distance <= max_distance`, closest first,
    /// at most `limit` long.
    pub fn search(
        &self,
        queries: &[Vec<f32>],
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<Vec<MatchCandidate>>, IndexError> {
        queries
            .iter()
            .map(|query| {
                self.check_dimension(query.len())?;
                let mut hits: Vec<MatchCandidate> = self
                    .rows
                    .values()
                    .map(|row| MatchCandidate {
                        user_key: row.user_key,
                        distance: cosine_distance(query, &row.vector),
                    })
                    .filter(|c| c.distance <= max_distance)
                    .collect();
                hits.sort_by(by_distance_then_key);
                hits.truncate(limit);
                Ok(hits)
            })
            .collect()
    }
}
