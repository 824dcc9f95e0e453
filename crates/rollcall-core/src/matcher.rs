//! Gallery matching.
//!
//! The [`Matcher`] trait is the seam for swapping the linear scan for an
//! approximate nearest-neighbour index once galleries grow past a few
//! thousand entries; callers only ever go through `find_best_match`.

use crate::types::{Embedding, GalleryEntry, MatchResult};

/// Default cosine similarity a probe must reach to count as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a probe embedding against a gallery of registered faces.
pub trait Matcher {
    /// Highest-scoring gallery entry for `probe`, regardless of any threshold.
    ///
    /// Returns the entry index and its similarity, or `None` for an empty gallery.
    fn best_candidate(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Option<(usize, f32)>;

    /// Best match whose similarity reaches `threshold`.
    ///
    /// Degenerate probes (zero-norm, e.g. after an inference failure) never
    /// match, whatever the threshold.
    fn find_best_match(
        &self,
        probe: &Embedding,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Option<MatchResult> {
        if probe.is_degenerate() {
            tracing::debug!("degenerate probe embedding; skipping gallery scan");
            return None;
        }

        let (idx, similarity) = self.best_candidate(probe, gallery)?;
        if similarity >= threshold {
            Some(MatchResult {
                student_id: gallery[idx].student_id.clone(),
                similarity,
                is_confident: similarity >= threshold,
            })
        } else {
            None
        }
    }
}

/// Cosine similarity matcher with a linear gallery scan. O(gallery size).
///
/// A student's score is the score of their best entry. On an exact tie the
/// first entry encountered wins (strictly-greater comparison), so the result
/// depends on gallery order, which callers keep stable (registration order).
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_candidate(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Option<(usize, f32)> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let sim = probe.similarity(&entry.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        best_idx.map(|idx| (idx, best_sim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(student: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            student_id: student.into(),
            embedding: Embedding::new(values.to_vec()),
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_best_match_is_last_entry() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            entry("decoy1", &[0.0, 1.0, 0.0]),
            entry("decoy2", &[0.0, 0.0, 1.0]),
            entry("match", &[1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher
            .find_best_match(&probe, &gallery, DEFAULT_SIMILARITY_THRESHOLD)
            .unwrap();
        assert_eq!(result.student_id, "match");
        assert!(result.is_confident);
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_all_below_threshold_is_none() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            entry("a", &[0.0, 1.0, 0.0]),
            entry("b", &[0.5, 1.0, 0.0]),
        ];
        assert!(CosineMatcher.find_best_match(&probe, &gallery, 0.6).is_none());
    }

    #[test]
    fn test_never_returns_below_threshold() {
        let probe = Embedding::new(vec![1.0, 1.0, 0.0, 0.0]);
        let gallery = vec![
            entry("a", &[1.0, 0.0, 0.0, 0.0]),
            entry("b", &[1.0, 1.0, 1.0, 0.0]),
            entry("c", &[0.0, 0.0, 1.0, 1.0]),
            entry("d", &[-1.0, 1.0, 0.0, 0.0]),
        ];
        for threshold in [0.1, 0.5, 0.7071, 0.8, 0.9, 0.99] {
            if let Some(m) = CosineMatcher.find_best_match(&probe, &gallery, threshold) {
                assert!(m.similarity >= threshold, "{} < {threshold}", m.similarity);
            }
        }
    }

    #[test]
    fn test_tie_first_entry_wins() {
        let v = [0.2, 0.4, 0.9];
        let probe = Embedding::new(v.to_vec());
        let gallery = vec![entry("S1", &v), entry("S2", &v)];

        for _ in 0..10 {
            let result = CosineMatcher.find_best_match(&probe, &gallery, 0.6).unwrap();
            assert_eq!(result.student_id, "S1");
        }
    }

    #[test]
    fn test_multi_shot_student_scores_best_entry() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![
            entry("alice", &[0.0, 1.0]),
            entry("bob", &[0.8, 0.6]),
            entry("alice", &[1.0, 0.05]),
        ];
        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.6).unwrap();
        assert_eq!(result.student_id, "alice");
        assert!(result.similarity > 0.99);
    }

    #[test]
    fn test_degenerate_probe_matches_nothing() {
        let probe = Embedding::zeroed(3);
        let gallery = vec![entry("a", &[1.0, 0.0, 0.0])];
        // Even a permissive threshold must not let a failed inference through.
        assert!(CosineMatcher.find_best_match(&probe, &gallery, -1.0).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(CosineMatcher.best_candidate(&probe, &[]).is_none());
        assert!(CosineMatcher.find_best_match(&probe, &[], 0.6).is_none());
    }

    #[test]
    fn test_mismatched_dimension_entry_scores_zero() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![entry("short", &[1.0]), entry("ok", &[0.9, 0.1])];
        let (idx, _) = CosineMatcher.best_candidate(&probe, &gallery).unwrap();
        assert_eq!(gallery[idx].student_id, "ok");
    }
}
