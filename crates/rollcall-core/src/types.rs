use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Similarity threshold used when a capture does not supply its own.
pub const DEFAULT_THRESHOLD: f32 = 0.49;

/// Numeric id of a roster membership row.
pub type MemberId = i64;

/// Numeric id of a capture.
pub type CaptureId = i64;

/// Face feature vector produced by the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of elements (the model's dimension D).
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-magnitude
    /// vector is dissimilar (0.0) to everything. Callers must check that both
    /// sides have the same dimension.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// A class or section that identities are enrolled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub code: String,
    pub name: String,
}

/// An enrolled person with one reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Stable key, e.g. an enrollment number.
    pub key: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

/// One roster entry as fed to the matcher.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub member_id: MemberId,
    pub identity: String,
    pub embedding: Embedding,
}

/// One attendance event for a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub id: CaptureId,
    pub group: String,
    pub taken_at: DateTime<Utc>,
    /// Hex SHA-256 of the submitted photo.
    pub photo_digest: String,
    /// Number of vectors the provider returned for the photo.
    pub face_count: usize,
}

/// Presence decision for one roster member within one capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub member_id: MemberId,
    pub identity: String,
    pub present: bool,
}

/// Per-capture counters of human-corrected matcher mistakes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLedger {
    pub false_positive_count: u32,
    pub false_negative_count: u32,
}

/// Per-call options for `create_capture` / `replace_capture`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureOptions {
    /// Overrides the session manager's default threshold for this capture,
    /// e.g. with a value from [`crate::calibrate_threshold`].
    pub threshold: Option<f32>,
}

/// Partial update of an enrolled identity. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    /// Replaces the display name.
    pub display_name: Option<String>,
    /// Re-enrolls from a new photo; the stored embedding is replaced wholesale
    /// and the photo must contain exactly one face.
    pub photo: Option<Vec<u8>>,
}

/// Narrows a presence listing. Both filters may be combined.
#[derive(Debug, Clone, Default)]
pub struct PresenceFilter {
    /// Only the record of the member with this identity key.
    pub identity: Option<String>,
    /// Only the record of this roster member.
    pub member_id: Option<MemberId>,
}
