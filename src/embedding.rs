/// Face embedding vectors and the math the matchers share.
///
/// Embeddings are unit-normalized fixed-dimension f32 vectors, so cosine
/// similarity reduces to a dot product everywhere in the hot path. The blob
/// wire format (little-endian f32, no header) is an internal contract between
/// the embedding store and the training worker.

use serde::{Deserialize, Serialize};

use crate::errors::FacegateError;

/// Default dimension for the buffalo_l model.
pub const DEFAULT_DIMENSION: usize = 512;

/// A fixed-dimension face embedding. Not necessarily normalized; call
/// [`Embedding::normalized`] before matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding(values)
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn l2_norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Dot product. Equals cosine similarity when both vectors are unit-normalized.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine similarity for vectors of any magnitude.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let denom = self.l2_norm() * other.l2_norm();
        if denom == 0.0 {
            return 0.0;
        }
        self.dot(other) / denom
    }

    /// Return a unit-normalized copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.l2_norm();
        if norm == 0.0 {
            return self.clone();
        }
        Embedding(self.0.iter().map(|v| v / norm).collect())
    }

    /// Element-wise mean of a non-empty set of same-dimension embeddings.
    pub fn mean(embeddings: &[Embedding]) -> Result<Embedding, FacegateError> {
        let first = embeddings.first().ok_or_else(|| {
            FacegateError::validation("embeddings", "Cannot average an empty set")
        })?;
        let dim = first.dimension();
        let mut acc = vec![0.0f32; dim];
        for e in embeddings {
            if e.dimension() != dim {
                return Err(FacegateError::validation(
                    "embeddings",
                    "Dimension mismatch in embedding set",
                ));
            }
            for (a, v) in acc.iter_mut().zip(e.0.iter()) {
                *a += v;
            }
        }
        let n = embeddings.len() as f32;
        Ok(Embedding(acc.into_iter().map(|v| v / n).collect()))
    }

    /// Serialize to the blob wire format: dimension * 4 bytes, little-endian f32.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for v in &self.0 {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Deserialize from the blob wire format. The byte length must be a
    /// multiple of 4.
    pub fn from_bytes(bytes: &[u8]) -> Result<Embedding, FacegateError> {
        if bytes.len() % 4 != 0 {
            return Err(FacegateError::validation(
                "embedding",
                "Embedding blob length is not a multiple of 4",
            ));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Embedding(values))
    }
}

/// Check that every pair in the set clears the similarity threshold.
///
/// Returns the first offending pair of indices, or None when the set is
/// consistent. Sets of fewer than two embeddings are trivially consistent.
pub fn first_inconsistent_pair(
    embeddings: &[Embedding],
    threshold: f32,
) -> Option<(usize, usize)> {
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            if embeddings[i].cosine_similarity(&embeddings[j]) < threshold {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::new(values).normalized()
    }

    #[test]
    fn test_dot_of_unit_vectors_is_cosine() {
        let a = unit(vec![1.0, 0.0, 0.0]);
        let b = unit(vec![1.0, 1.0, 0.0]);
        let dot = a.dot(&b);
        let cos = a.cosine_similarity(&b);
        assert!((dot - cos).abs() < 1e-6);
        assert!((dot - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_has_unit_norm() {
        let e = Embedding::new(vec![3.0, 4.0]);
        assert!((e.normalized().l2_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_normalizes_to_itself() {
        let e = Embedding::new(vec![0.0, 0.0]);
        assert_eq!(e.normalized(), e);
        assert_eq!(e.cosine_similarity(&e), 0.0);
    }

    #[test]
    fn test_mean_of_two() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let m = Embedding::mean(&[a, b]).unwrap();
        assert_eq!(m.as_slice(), &[0.5, 0.5]);
    }

    #[test]
    fn test_mean_rejects_empty_and_mismatched() {
        assert!(Embedding::mean(&[]).is_err());
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0]);
        assert!(Embedding::mean(&[a, b]).is_err());
    }

    #[test]
    fn test_bytes_round_trip_bit_exact() {
        let e = Embedding::new(vec![0.12345, -9.875, f32::MIN_POSITIVE, 1.0e30]);
        let back = Embedding::from_bytes(&e.to_bytes()).unwrap();
        // Bit-exact, not approximate
        for (a, b) in e.as_slice().iter().zip(back.as_slice()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_from_bytes_rejects_ragged_input() {
        assert!(Embedding::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_inconsistent_pair_found() {
        let a = unit(vec![1.0, 0.0, 0.0]);
        let b = unit(vec![0.9, 0.1, 0.0]);
        let c = unit(vec![0.0, 1.0, 0.0]); // orthogonal to a
        assert_eq!(first_inconsistent_pair(&[a.clone(), b.clone()], 0.4), None);
        assert_eq!(first_inconsistent_pair(&[a, b, c], 0.4), Some((0, 2)));
    }

    #[test]
    fn test_single_embedding_is_consistent() {
        let a = unit(vec![1.0, 0.0]);
        assert_eq!(first_inconsistent_pair(&[a], 0.99), None);
    }
}
