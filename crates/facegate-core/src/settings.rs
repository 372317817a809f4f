use crate::deadline::Deadlines;

pub const DEFAULT_COLLECTION: &str = "face_features";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 512;
/// Maximum cosine distance for a match (cosine similarity >= 0.40).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Settings the core needs from the process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreSettings {
    /// Collection holding one face embedding per user.
    pub collection: String,
    pub embedding_dimension: usize,
    /// Maximum cosine distance, inclusive. Governs both verify and the
    /// duplicate check at enrollment.
    pub match_threshold: f32,
    /// When false, enrolling a face that already matches another user fails.
    pub allow_duplicate_faces: bool,
    pub deadlines: Deadlines,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            allow_duplicate_faces: false,
            deadlines: Deadlines::default(),
        }
    }
}
