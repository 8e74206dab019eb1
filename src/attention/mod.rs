//! Attention mechanisms shared by the acoustic models.
pub mod monotonic;
pub mod multihead;

pub use monotonic::{AttentionConfig, IncrementalAligner, MonotonicAttention, WindowRange};
pub use multihead::{MultiheadAttention, MultiheadConfig, ScaledDotProductAttention};
