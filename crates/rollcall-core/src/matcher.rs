//! Greedy assignment of detected faces to roster identities.
//!
//! Each detection is paired, in arrival order, with the most similar identity
//! still unassigned. This is O(detections × roster) and not a globally optimal
//! bipartite matching; class sizes keep both sides small.

use crate::error::DimensionError;
use crate::types::Embedding;

/// Presence decision per candidate, in candidate order.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMap<K> {
    entries: Vec<(K, bool)>,
}

impl<K: PartialEq> PresenceMap<K> {
    /// Presence of `key`, or `None` if it was not a candidate.
    pub fn get(&self, key: &K) -> Option<bool> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, present)| *present)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, bool)> {
        self.entries.iter().map(|(k, present)| (k, *present))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of candidates marked present.
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|(_, present)| *present).count()
    }
}

/// Strategy for deciding which roster candidates appear in a set of detections.
pub trait Matcher {
    /// Returns exactly one entry per candidate. Every vector on both sides
    /// must share one dimension.
    fn assign<K: Clone>(
        &self,
        candidates: &[(K, Embedding)],
        detections: &[Embedding],
        threshold: f32,
    ) -> Result<PresenceMap<K>, DimensionError>;
}

/// Cosine similarity matcher with greedy, arrival-order assignment.
///
/// A detection marks its best remaining candidate present only when the
/// similarity is strictly above the threshold and not exactly 1.0; otherwise
/// the detection is dropped. A marked candidate leaves the pool, so no
/// identity is matched twice and no detection marks two identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyMatcher;

impl Matcher for GreedyMatcher {
    fn assign<K: Clone>(
        &self,
        candidates: &[(K, Embedding)],
        detections: &[Embedding],
        threshold: f32,
    ) -> Result<PresenceMap<K>, DimensionError> {
        check_dimensions(candidates, detections)?;

        let mut entries: Vec<(K, bool)> = candidates
            .iter()
            .map(|(key, _)| (key.clone(), false))
            .collect();
        // Candidate indices still available, kept in roster order so ties
        // resolve to the earliest entry.
        let mut pool: Vec<usize> = (0..candidates.len()).collect();

        for (detection_idx, detection) in detections.iter().enumerate() {
            if pool.is_empty() {
                break;
            }

            let mut best_pos = 0;
            let mut best_sim = f32::NEG_INFINITY;
            for (pos, &candidate) in pool.iter().enumerate() {
                let sim = candidates[candidate].1.similarity(detection);
                if sim > best_sim {
                    best_sim = sim;
                    best_pos = pos;
                }
            }

            if best_sim > threshold && best_sim != 1.0 {
                let candidate = pool.remove(best_pos);
                entries[candidate].1 = true;
                tracing::debug!(
                    detection = detection_idx,
                    candidate,
                    similarity = best_sim,
                    "detection matched"
                );
            } else {
                tracing::debug!(
                    detection = detection_idx,
                    similarity = best_sim,
                    threshold,
                    "detection discarded"
                );
            }
        }

        Ok(PresenceMap { entries })
    }
}

fn check_dimensions<K>(
    candidates: &[(K, Embedding)],
    detections: &[Embedding],
) -> Result<(), DimensionError> {
    let mut vectors = candidates
        .iter()
        .map(|(_, embedding)| embedding)
        .chain(detections.iter());

    let Some(first) = vectors.next() else {
        return Ok(());
    };
    let expected = first.dim();

    match vectors.find(|v| v.dim() != expected) {
        Some(v) => Err(DimensionError {
            expected,
            actual: v.dim(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn roster(entries: &[(&'static str, &[f32])]) -> Vec<(&'static str, Embedding)> {
        entries.iter().map(|(k, v)| (*k, emb(v))).collect()
    }

    #[test]
    fn test_close_match_present_far_absent() {
        // A·d = 0.6, B·d = 0.0
        let candidates = roster(&[("A", &[3.0, 4.0]), ("B", &[0.0, 1.0])]);
        let detections = vec![emb(&[1.0, 0.0])];

        let presence = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap();
        assert_eq!(presence.get(&"A"), Some(true));
        assert_eq!(presence.get(&"B"), Some(false));
        assert_eq!(presence.len(), 2);
    }

    #[test]
    fn test_similarity_equal_to_threshold_is_absent() {
        let candidates = roster(&[("A", &[3.0, 4.0])]);
        let detections = vec![emb(&[1.0, 0.0])];

        let at = GreedyMatcher.assign(&candidates, &detections, 0.6).unwrap();
        assert_eq!(at.get(&"A"), Some(false));

        let below = GreedyMatcher.assign(&candidates, &detections, 0.59).unwrap();
        assert_eq!(below.get(&"A"), Some(true));
    }

    #[test]
    fn test_perfect_similarity_never_matches() {
        let candidates = roster(&[("A", &[1.0, 0.0])]);
        let detections = vec![emb(&[2.0, 0.0])];

        let presence = GreedyMatcher.assign(&candidates, &detections, -1.0).unwrap();
        assert_eq!(presence.get(&"A"), Some(false));
    }

    #[test]
    fn test_perfect_best_discards_detection_without_fallback() {
        // The best candidate is rejected for being exactly 1.0; the runner-up
        // is not considered for the same detection.
        let candidates = roster(&[("A", &[1.0, 0.0]), ("B", &[3.0, 4.0])]);
        let detections = vec![emb(&[2.0, 0.0])];

        let presence = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap();
        assert_eq!(presence.get(&"A"), Some(false));
        assert_eq!(presence.get(&"B"), Some(false));
    }

    #[test]
    fn test_empty_detections_all_absent() {
        let candidates = roster(&[("A", &[1.0, 0.0]), ("B", &[0.0, 1.0])]);

        let presence = GreedyMatcher.assign(&candidates, &[], 0.49).unwrap();
        assert_eq!(presence.len(), 2);
        assert_eq!(presence.present_count(), 0);
    }

    #[test]
    fn test_empty_candidates_empty_map() {
        let candidates: Vec<(&str, Embedding)> = Vec::new();
        let presence = GreedyMatcher
            .assign(&candidates, &[emb(&[1.0, 0.0])], 0.49)
            .unwrap();
        assert!(presence.is_empty());
    }

    #[test]
    fn test_identity_matched_at_most_once() {
        let candidates = roster(&[("A", &[3.0, 4.0]), ("B", &[0.0, 1.0])]);
        // Both detections prefer A; the second one only sees B afterwards.
        let detections = vec![emb(&[1.0, 0.0]), emb(&[1.0, 0.0])];

        let presence = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap();
        assert_eq!(presence.get(&"A"), Some(true));
        assert_eq!(presence.get(&"B"), Some(false));
    }

    #[test]
    fn test_tie_resolves_to_earliest_and_marks_one() {
        let candidates = roster(&[("A", &[3.0, 4.0]), ("B", &[3.0, 4.0])]);
        let detections = vec![emb(&[1.0, 0.0])];

        let presence = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap();
        assert_eq!(presence.get(&"A"), Some(true));
        assert_eq!(presence.get(&"B"), Some(false));
        assert_eq!(presence.present_count(), 1);
    }

    #[test]
    fn test_greedy_assignment_is_order_sensitive() {
        let candidates = roster(&[("A", &[1.0, 0.0]), ("B", &[0.0, 1.0])]);
        // Equidistant from A and B.
        let ambiguous = emb(&[1.0, 1.0]);
        // Clearly A.
        let clear = emb(&[1.0, 0.1]);

        let first = GreedyMatcher
            .assign(&candidates, &[ambiguous.clone(), clear.clone()], 0.5)
            .unwrap();
        assert_eq!(first.get(&"A"), Some(true));
        assert_eq!(first.get(&"B"), Some(false));

        let second = GreedyMatcher
            .assign(&candidates, &[clear, ambiguous], 0.5)
            .unwrap();
        assert_eq!(second.get(&"A"), Some(true));
        assert_eq!(second.get(&"B"), Some(true));
    }

    #[test]
    fn test_more_detections_than_candidates() {
        let candidates = roster(&[("A", &[3.0, 4.0])]);
        let detections = vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0]), emb(&[1.0, 1.0])];

        let presence = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence.get(&"A"), Some(true));
    }

    #[test]
    fn test_result_preserves_candidate_order() {
        let candidates = roster(&[("C", &[0.0, 1.0]), ("A", &[1.0, 0.0]), ("B", &[1.0, 1.0])]);
        let presence = GreedyMatcher.assign(&candidates, &[], 0.49).unwrap();
        let keys: Vec<&str> = presence.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_dimension_mismatch_detection() {
        let candidates = roster(&[("A", &[1.0, 0.0])]);
        let detections = vec![emb(&[1.0, 0.0, 0.0])];

        let err = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap_err();
        assert_eq!(err, DimensionError { expected: 2, actual: 3 });
    }

    #[test]
    fn test_dimension_mismatch_reported_even_after_pool_exhausted() {
        let candidates = roster(&[("A", &[3.0, 4.0])]);
        // First detection empties the pool; the malformed one is never compared.
        let detections = vec![emb(&[1.0, 0.0]), emb(&[1.0])];

        let err = GreedyMatcher.assign(&candidates, &detections, 0.49).unwrap_err();
        assert_eq!(err, DimensionError { expected: 2, actual: 1 });
    }

    #[test]
    fn test_dimension_mismatch_between_candidates() {
        let candidates = vec![("A", emb(&[1.0, 0.0])), ("B", emb(&[1.0, 0.0, 0.0]))];
        assert!(GreedyMatcher.assign(&candidates, &[], 0.49).is_err());
    }
}
