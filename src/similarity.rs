//! Feature vectors: storage format and comparison.
//!
//! Vectors are stored as a JSON array of floats, e.g. `[0.12,-0.5,1.0]`.

use serde::{Deserialize, Serialize};

use crate::error::{StageError, StageResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn similarity(&self, other: &FeatureVector) -> StageResult<f32> {
        cosine_similarity(&self.0, &other.0)
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// `(a . b) / (|a| |b|)`, or 0 when either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> StageResult<f32> {
    if a.len() != b.len() {
        return Err(StageError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}
