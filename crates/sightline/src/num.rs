//! Utilities for numerics.

use std::cmp::Ordering;

/// Logits are clipped to this magnitude before exponentiation.
const LOGIT_CLIP: f32 = 100.0;

/// Applies the standard sigmoid/logistic function to the input.
///
/// The input is clamped to `[-100, 100]` first, so that extreme logits map to exactly `0.0` or
/// `1.0` instead of overflowing.
pub fn sigmoid(v: f32) -> f32 {
    let v = v.clamp(-LOGIT_CLIP, LOGIT_CLIP);
    1.0 / (1.0 + (-v).exp())
}

/// An `f32` wrapper that implements [`Ord`] via [`f32::total_cmp`].
#[derive(Debug, Clone, Copy)]
pub struct TotalF32(pub f32);

impl PartialEq for TotalF32 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}
