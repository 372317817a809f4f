//! In-crate fakes for the collaborator traits.
//!
//! Test images encode faces as pixels: every non-black pixel in a PNG is one
//! detected face, and its colour is the face's identity. The red channel picks
//! the embedding direction; the green channel nudges it slightly, so two
//! colours with the same red value are near-duplicates.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::error::{CapabilityError, IndexError, StoreError};
use crate::memory_index::MemoryIndex;
use crate::traits::{EmbeddingExtractor, FaceDetector, UserStore, VectorIndex};
use crate::types::{
    BoundingBox, Embedding, FaceEmbedding, FaceRegion, LoadState, MatchCandidate, UpsertReceipt,
};

pub const TEST_DIM: usize = 8;

/// PNG with one face per colour, left to right.
pub fn face_png(faces: &[[u8; 3]]) -> Vec<u8> {
    let width = faces.len().max(1) as u32;
    let img = RgbImage::from_fn(width, 1, |x, _| {
        faces.get(x as usize).map(|c| Rgb(*c)).unwrap_or(Rgb([0, 0, 0]))
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Embedding the fake extractor produces for a face colour.
pub fn embedding_for(colour: [u8; 3]) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_DIM];
    let r = colour[0] as usize;
    v[r % TEST_DIM] = 1.0;
    v[(r + 1) % TEST_DIM] += colour[1] as f32 / 255.0 * 0.2;
    v
}

#[derive(Default)]
pub struct PixelDetector {
    pub delay: Option<Duration>,
    pub fail: AtomicBool,
}

#[async_trait]
impl FaceDetector for PixelDetector {
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<FaceRegion>, CapabilityError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CapabilityError::InferenceFailed("detector offline".into()));
        }
        let mut regions = Vec::new();
        for (x, _, pixel) in image.enumerate_pixels() {
            if pixel.0 == [0, 0, 0] {
                continue;
            }
            regions.push(FaceRegion {
                bbox: BoundingBox {
                    x: x as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 0.99,
                    landmarks: None,
                },
                crop: RgbImage::from_pixel(1, 1, *pixel),
                origin: (x, 0),
            });
        }
        Ok(regions)
    }
}

#[derive(Default)]
pub struct ColourExtractor {
    pub fail: AtomicBool,
    /// Report this many dimensions instead of [`TEST_DIM`].
    pub wrong_dimension: Option<usize>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingExtractor for ColourExtractor {
    async fn extract(&self, regions: Vec<FaceRegion>) -> Result<Vec<Embedding>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CapabilityError::InferenceFailed("extractor offline".into()));
        }
        Ok(regions
            .iter()
            .map(|region| {
                let colour = region.crop.get_pixel(0, 0).0;
                let mut values = embedding_for(colour);
                if let Some(dim) = self.wrong_dimension {
                    values.resize(dim, 0.0);
                }
                Embedding::new(values)
            })
            .collect())
    }
}

/// Wraps [`MemoryIndex`], counting load requests and injecting failures.
pub struct ProbeIndex {
    inner: MemoryIndex,
    loads: Mutex<HashMap<String, usize>>,
    state_queries: Mutex<HashMap<String, usize>>,
    failing_loads: AtomicUsize,
    pub fail_search: AtomicBool,
    pub fail_upsert: AtomicBool,
    pub upserts: AtomicUsize,
}

impl ProbeIndex {
    pub fn new(inner: MemoryIndex) -> Self {
        Self {
            inner,
            loads: Mutex::new(HashMap::new()),
            state_queries: Mutex::new(HashMap::new()),
            failing_loads: AtomicUsize::new(0),
            fail_search: AtomicBool::new(false),
            fail_upsert: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn load_requests(&self, collection: &str) -> usize {
        self.loads.lock().unwrap().get(collection).copied().unwrap_or(0)
    }

    pub fn state_queries(&self, collection: &str) -> usize {
        self.state_queries.lock().unwrap().get(collection).copied().unwrap_or(0)
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for ProbeIndex {
    async fn load_state(&self, collection: &str) -> Result<LoadState, IndexError> {
        *self.state_queries.lock().unwrap().entry(collection.to_string()).or_default() += 1;
        self.inner.load_state(collection).await
    }

    async fn load(&self, collection: &str) -> Result<(), IndexError> {
        *self.loads.lock().unwrap().entry(collection.to_string()).or_default() += 1;
        let failing = self.failing_loads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_loads.store(failing - 1, Ordering::SeqCst);
            return Err(IndexError::Backend("load rejected".into()));
        }
        self.inner.load(collection).await
    }

    async fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        limit: usize,
        max_distance: f32,
    ) -> Result<Vec<Vec<MatchCandidate>>, IndexError> {
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(IndexError::Backend("search rejected".into()));
        }
        self.inner.search(collection, queries, limit, max_distance).await
    }

    async fn upsert(&self, collection: &str, row: FaceEmbedding) -> Result<UpsertReceipt, IndexError> {
        if self.fail_upsert.load(Ordering::SeqCst) {
            return Err(IndexError::Backend("upsert rejected".into()));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(collection, row).await
    }

    async fn delete(&self, collection: &str, user_key: i64) -> Result<bool, IndexError> {
        self.inner.delete(collection, user_key).await
    }

    async fn fetch(&self, collection: &str, user_key: i64) -> Result<Option<FaceEmbedding>, IndexError> {
        self.inner.fetch(collection, user_key).await
    }

    async fn count(&self, collection: &str) -> Result<usize, IndexError> {
        self.inner.count(collection).await
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    profiles: Mutex<HashMap<i64, Option<Vec<u8>>>>,
    pub fail_profile: AtomicBool,
}

impl MemoryUserStore {
    pub fn with_users(keys: &[i64]) -> Self {
        let store = Self::default();
        {
            let mut profiles = store.profiles.lock().unwrap();
            for key in keys {
                profiles.insert(*key, None);
            }
        }
        store
    }

    pub fn profile_image(&self, user_key: i64) -> Option<Vec<u8>> {
        self.profiles.lock().unwrap().get(&user_key).cloned().flatten()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn exists(&self, user_key: i64) -> Result<bool, StoreError> {
        Ok(self.profiles.lock().unwrap().contains_key(&user_key))
    }

    async fn set_profile_image(&self, user_key: i64, image: Vec<u8>) -> Result<(), StoreError> {
        if self.fail_profile.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.profiles.lock().unwrap().insert(user_key, Some(image));
        Ok(())
    }
}
