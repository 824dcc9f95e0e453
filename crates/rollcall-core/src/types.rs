use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Norm below which an embedding is treated as degenerate (failed inference).
pub const DEGENERATE_NORM_EPSILON: f32 = 1e-6;

/// Face embedding vector (128-dimensional for the bundled FaceNet model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// All-zero embedding of the given dimension. Matches nothing.
    pub fn zeroed(dim: usize) -> Self {
        Self::new(vec![0.0; dim])
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean (L2) norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// True for empty, all-zero or near-zero-norm embeddings.
    pub fn is_degenerate(&self) -> bool {
        !(self.norm() >= DEGENERATE_NORM_EPSILON)
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Returns 0.0 when
    /// the dimensions differ or either vector has zero magnitude.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Serialize the values as little-endian f32 bytes (for BLOB storage).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` if the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values))
    }
}

/// One registered face of an enrolled student.
///
/// Multi-shot registration produces several entries per student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub student_id: String,
    pub embedding: Embedding,
    pub registered_at: DateTime<Utc>,
}

/// Best gallery match for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub student_id: String,
    /// Cosine similarity of the best entry for this student [-1, 1].
    pub similarity: f32,
    /// `similarity >= threshold` at the time of matching.
    pub is_confident: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[0.3, -1.2, 4.0, 0.5]);
        assert!((a.similarity(&a) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[0.0, 1.0, 0.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_symmetric() {
        let a = emb(&[0.1, 0.7, -0.2, 0.9]);
        let b = emb(&[-0.4, 0.3, 0.8, 0.05]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(b.similarity(&a), 0.0);
    }

    #[test]
    fn test_cosine_similarity_length_mismatch() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_degenerate_detection() {
        assert!(Embedding::zeroed(128).is_degenerate());
        assert!(emb(&[]).is_degenerate());
        assert!(emb(&[1e-9, 0.0]).is_degenerate());
        assert!(!emb(&[0.6, 0.8]).is_degenerate());
    }

    #[test]
    fn test_le_bytes_rejects_truncated_blob() {
        let bytes = emb(&[1.5, -2.25]).to_le_bytes();
        assert_eq!(bytes.len(), 8);
        assert!(Embedding::from_le_bytes(&bytes[..7]).is_none());
        assert_eq!(Embedding::from_le_bytes(&bytes).unwrap().values, vec![1.5, -2.25]);
    }
}
