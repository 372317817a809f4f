use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in the pixel space of the decoded source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// A detected face cropped out of its source image.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    /// Crop of the source image around `bbox`, including any context margin.
    pub crop: RgbImage,
    /// Top-left corner of `crop` in source image coordinates.
    pub origin: (u32, u32),
}

impl FaceRegion {
    /// Landmarks translated into the coordinate space of `crop`.
    pub fn crop_landmarks(&self) -> Option<[(f32, f32); 5]> {
        let (ox, oy) = (self.origin.0 as f32, self.origin.1 as f32);
        self.bbox
            .landmarks
            .map(|lms| lms.map(|(x, y)| (x - ox, y - oy)))
    }
}

/// Face embedding vector (512-dimensional for the default ArcFace model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// The single stored embedding row for one user in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub user_key: i64,
    pub vector: Vec<f32>,
    /// Milliseconds since the Unix epoch at the moment of mutation.
    pub updated_at: i64,
}

/// One hit of a similarity query. Not persisted.
///
/// `distance` is cosine distance: 0 = identical, 2 = opposite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub user_key: i64,
    pub distance: f32,
}

impl MatchCandidate {
    /// `1 - distance`, clamped to [0, 1].
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// Load state of a named collection inside the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Loading => "loading",
            LoadState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Write outcome reported by the index for an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReceipt {
    /// True when a previous row for the same key was replaced.
    pub replaced: bool,
}

/// Result of a verify call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub recognized: bool,
    pub user_key: Option<i64>,
    pub confidence: f32,
    pub message: String,
    /// Number of faces the detector found in the probe image.
    pub faces_detected: usize,
    /// Detection-order index of the face that produced the hit.
    pub matched_face: Option<usize>,
}

impl Verdict {
    pub(crate) fn no_face() -> Self {
        Self {
            recognized: false,
            user_key: None,
            confidence: 0.0,
            message: "no face detected".into(),
            faces_detected: 0,
            matched_face: None,
        }
    }

    pub(crate) fn not_recognized(faces_detected: usize) -> Self {
        Self {
            recognized: false,
            user_key: None,
            confidence: 0.0,
            message: "face not recognized".into(),
            faces_detected,
            matched_face: None,
        }
    }

    pub(crate) fn recognized(candidate: MatchCandidate, face: usize, faces_detected: usize) -> Self {
        Self {
            recognized: true,
            user_key: Some(candidate.user_key),
            confidence: candidate.confidence(),
            message: format!("face recognized as user {}", candidate.user_key),
            faces_detected,
            matched_face: Some(face),
        }
    }
}

/// Reference to the embedding row written by an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRef {
    pub collection: String,
    pub user_key: i64,
    pub updated_at: i64,
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollOutcome {
    pub success: bool,
    pub embedding_ref: EmbeddingRef,
    /// True when an earlier embedding for the user was overwritten.
    pub replaced: bool,
    /// False when the profile image side effect failed after the embedding committed.
    pub profile_updated: bool,
}

/// Who asked for an enrollment. Authorization happens before the core is reached;
/// the origin is carried for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollOrigin {
    SelfService,
    Admin,
}

impl std::fmt::Display for EnrollOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollOrigin::SelfService => f.write_str("self"),
            EnrollOrigin::Admin => f.write_str("admin"),
        }
    }
}

/// Snapshot of one collection, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub collection: String,
    pub state: LoadState,
    /// Stored rows; `None` when the index cannot count without loading.
    pub embeddings: Option<usize>,
}
