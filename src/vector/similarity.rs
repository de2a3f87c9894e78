//! Reference similarity metrics.
//!
//! All three accumulate in `f64`. Inputs of different length are the
//! caller's bug; only the common prefix is read.

use serde::{Deserialize, Serialize};

/// Scoring function for vector search. Higher is more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    /// `1 / (1 + euclidean distance)`.
    Euclidean,
    DotProduct,
}

impl SimilarityMetric {
    #[must_use]
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine(a, b),
            Self::Euclidean => euclidean(a, b),
            Self::DotProduct => dot(a, b),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn narrow(x: f64) -> f32 {
    x as f32
}

#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    narrow(a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum())
}

/// Cosine similarity; `0` when either vector has zero norm.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut ab, mut aa, mut bb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    let denom = aa.sqrt() * bb.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    narrow((ab / denom).clamp(-1.0, 1.0))
}

/// Distance mapped into `(0, 1]`; identical vectors score `1`.
#[must_use]
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    let d2: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (f64::from(*x) - f64::from(*y)).powi(2))
        .sum();
    narrow(1.0 / (1.0 + d2.sqrt()))
}
