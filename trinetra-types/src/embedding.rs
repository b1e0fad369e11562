use serde::{Deserialize, Serialize};

use crate::TypesError;

/// Dimensionality of the face embedding space.
pub const EMBED_DIM: usize = 512;

/// Maximum allowed deviation of an embedding's L2 norm from 1.0.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-5;

/// A 512-dimensional L2-normalized face embedding.
///
/// Construction via [Embedding::new] enforces both the dimension and the
/// unit-norm invariant, so similarity between two embeddings is a plain dot
/// product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, TypesError> {
        if values.len() != EMBED_DIM {
            return Err(TypesError::EmbeddingDimension { got: values.len() });
        }
        let norm = l2_norm(&values);
        if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
            return Err(TypesError::EmbeddingNotUnit { norm });
        }
        Ok(Embedding(values))
    }

    /// Normalize arbitrary raw values into a unit embedding. Fails on the
    /// zero vector or wrong dimension.
    pub fn from_raw(mut values: Vec<f32>) -> Result<Self, TypesError> {
        if values.len() != EMBED_DIM {
            return Err(TypesError::EmbeddingDimension { got: values.len() });
        }
        let norm = l2_norm(&values);
        if norm == 0.0 || !norm.is_finite() {
            return Err(TypesError::EmbeddingNotUnit { norm });
        }
        for v in values.iter_mut() {
            *v /= norm;
        }
        Ok(Embedding(values))
    }

    /// Cosine similarity. Both operands are unit vectors, so this is the dot
    /// product.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// `new = (1 - alpha) * self + alpha * sample`, renormalized.
    pub fn ema_update(&self, sample: &Embedding, alpha: f32) -> Embedding {
        let blended: Vec<f32> = self
            .0
            .iter()
            .zip(sample.0.iter())
            .map(|(old, cur)| (1.0 - alpha) * old + alpha * cur)
            .collect();
        // The blend of two unit vectors is only zero if they are antipodal
        // and alpha is exactly 0.5; fall back to the old value then.
        Embedding::from_raw(blended).unwrap_or_else(|_| self.clone())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Unit vector along axis `i`. Handy for tests and synthetic galleries.
    pub fn unit_in_dim(i: usize) -> Embedding {
        let mut v = vec![0.0f32; EMBED_DIM];
        v[i % EMBED_DIM] = 1.0;
        Embedding(v)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = TypesError;
    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Vec<f32> {
        e.0
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
