//! Threshold suggestion from the spread of a reference set.

use crate::error::DimensionError;
use crate::types::Embedding;

/// Suggest a matching threshold for a roster.
///
/// Returns the highest cosine similarity between any two distinct reference
/// vectors, ignoring pairs that are exactly identical (similarity 1.0). A
/// detection must look more like one identity than any two enrolled
/// identities look like each other. Fewer than two vectors yield `0.0`, and
/// the result never drops below `0.0`.
pub fn calibrate_threshold(vectors: &[Embedding]) -> Result<f32, DimensionError> {
    if let Some(first) = vectors.first() {
        if let Some(odd) = vectors.iter().find(|v| v.dim() != first.dim()) {
            return Err(DimensionError {
                expected: first.dim(),
                actual: odd.dim(),
            });
        }
    }

    let mut max_sim = 0.0f32;
    for (i, a) in vectors.iter().enumerate() {
        for b in &vectors[i + 1..] {
            let sim = a.similarity(b);
            if sim > max_sim && sim != 1.0 {
                max_sim = sim;
            }
        }
    }

    tracing::debug!(vectors = vectors.len(), threshold = max_sim, "calibrated threshold");
    Ok(max_sim)
}
