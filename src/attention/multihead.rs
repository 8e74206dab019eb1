//! Multi-head scaled dot product attention as used by the Transformer style blocks in FastSpeech.
use crate::checkpoint::Checkpoint;
use crate::nn::*;
use ndarray::{Array3, Axis};
use rand::prelude::*;

/// `softmax(q kᵀ / sqrt(d_k) + mask) v`. Inputs are already split into heads, so the leading axis
/// is `heads * batch` with the head index varying slowest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaledDotProductAttention {
    d_key: usize,
    dropout: Dropout,
}

impl ScaledDotProductAttention {
    pub fn new(d_key: usize, dropout: Dropout) -> Self {
        Self { d_key, dropout }
    }

    /// * `mask` - additive `(batch, len_q, len_k)` mask, a batch of one is broadcast
    /// * `query_mask` - multiplicative `(batch, len_q, 1)` mask zeroing padded queries
    ///
    /// Returns the result and the attention weights.
    pub fn forward(
        &self,
        key: &Array3<f32>,
        value: &Array3<f32>,
        query: &Array3<f32>,
        mask: Option<&Array3<f32>>,
        query_mask: Option<&Array3<f32>>,
        mode: Mode,
    ) -> (Array3<f32>, Array3<f32>) {
        let scale = (self.d_key as f32).powf(-0.5);
        let mut attention = batched_matmul_transposed(query, key) * scale;

        if let Some(mask) = mask {
            let batch = mask.dim().0.max(1);
            for (i, mut a) in attention.outer_iter_mut().enumerate() {
                a += &mask.index_axis(Axis(0), i % batch);
            }
        }
        let mut attention = softmax_last(attention);
        if let Some(query_mask) = query_mask {
            let batch = query_mask.dim().0.max(1);
            for (i, mut a) in attention.outer_iter_mut().enumerate() {
                a *= &query_mask.index_axis(Axis(0), i % batch);
            }
        }
        let attention = self.dropout.forward(attention, mode);
        let result = batched_matmul(&attention, value);
        (result, attention)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MultiheadAttention {
    key: Linear,
    value: Linear,
    query: Linear,
    fc: Linear,
    layer_norm: LayerNorm,
    attention: ScaledDotProductAttention,
    dropout: Dropout,
    num_head: usize,
    d_k: usize,
    d_q: usize,
    is_concat: bool,
}

/// Dimensions of a [`MultiheadAttention`] block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MultiheadConfig {
    pub num_hidden: usize,
    pub d_k: usize,
    pub d_q: usize,
    pub num_head: usize,
    pub is_bias: bool,
    pub dropout: f32,
    /// Concatenate the attended result with the query input before the output projection
    pub is_concat: bool,
}

impl MultiheadConfig {
    pub fn new(num_hidden: usize, d_k: usize, d_q: usize, num_head: usize) -> Self {
        Self {
            num_hidden,
            d_k,
            d_q,
            num_head,
            is_bias: false,
            dropout: 0.1,
            is_concat: true,
        }
    }

    fn fc_input(&self) -> usize {
        if self.is_concat {
            self.num_head * self.d_q * 2
        } else {
            self.num_head * self.d_q
        }
    }
}

impl MultiheadAttention {
    /// `prefix` is the parameter path the block is saved under.
    pub fn init(prefix: &str, config: &MultiheadConfig, rng: &mut impl Rng) -> Self {
        let c = config;
        Self {
            key: Linear::init_xavier(c.num_hidden, c.num_head * c.d_k, c.is_bias, rng),
            value: Linear::init_xavier(c.num_hidden, c.num_head * c.d_k, c.is_bias, rng),
            query: Linear::init_xavier(c.num_hidden, c.num_head * c.d_q, c.is_bias, rng),
            fc: Linear::init_xavier(c.fc_input(), c.num_hidden, true, rng),
            layer_norm: LayerNorm::init(c.num_hidden),
            attention: ScaledDotProductAttention::new(
                c.d_k,
                Dropout::new(c.dropout, &join(prefix, "scal_attn")),
            ),
            dropout: Dropout::new(c.dropout, &join(prefix, "dropout")),
            num_head: c.num_head,
            d_k: c.d_k,
            d_q: c.d_q,
            is_concat: c.is_concat,
        }
    }

    pub fn load(store: &ParamStore, config: &MultiheadConfig) -> anyhow::Result<Self> {
        let c = config;
        let prefix = store.prefix();
        Ok(Self {
            key: Linear::load(&store.pp("key"), c.num_hidden, c.num_head * c.d_k, c.is_bias)?,
            value: Linear::load(
                &store.pp("value"),
                c.num_hidden,
                c.num_head * c.d_k,
                c.is_bias,
            )?,
            query: Linear::load(
                &store.pp("query"),
                c.num_hidden,
                c.num_head * c.d_q,
                c.is_bias,
            )?,
            fc: Linear::load(&store.pp("fc"), c.fc_input(), c.num_hidden, true)?,
            layer_norm: LayerNorm::load(&store.pp("layer_norm"), c.num_hidden)?,
            attention: ScaledDotProductAttention::new(
                c.d_k,
                Dropout::new(c.dropout, &join(prefix, "scal_attn")),
            ),
            dropout: Dropout::new(c.dropout, &join(prefix, "dropout")),
            num_head: c.num_head,
            d_k: c.d_k,
            d_q: c.d_q,
            is_concat: c.is_concat,
        })
    }

    /// Dropout applied to the output projection.
    pub fn dropout(&self) -> Dropout {
        self.dropout
    }

    /// * `key`, `value` - `(batch, len_k, num_hidden)`
    /// * `query_input` - `(batch, len_q, num_hidden)`, also the residual
    ///
    /// Returns `(batch, len_q, num_hidden)` and the per head attention weights
    /// `(heads * batch, len_q, len_k)`.
    pub fn forward(
        &self,
        key: &Array3<f32>,
        value: &Array3<f32>,
        query_input: &Array3<f32>,
        mask: Option<&Array3<f32>>,
        query_mask: Option<&Array3<f32>>,
        mode: Mode,
    ) -> anyhow::Result<(Array3<f32>, Array3<f32>)> {
        let batch = query_input.dim().0;
        if key.dim() != value.dim() || key.dim().0 != batch {
            anyhow::bail!(
                "mismatched attention inputs: key {:?} value {:?} query {:?}",
                key.dim(),
                value.dim(),
                query_input.dim()
            );
        }

        let k = split_heads(&self.key.forward(key), self.num_head, self.d_k);
        let v = split_heads(&self.value.forward(value), self.num_head, self.d_k);
        let q = split_heads(&self.query.forward(query_input), self.num_head, self.d_q);

        let (result, attention) = self
            .attention
            .forward(&k, &v, &q, mask, query_mask, mode);
        let mut result = merge_heads(&result, self.num_head, batch);
        if self.is_concat {
            result = ndarray::concatenate(Axis(2), &[result.view(), query_input.view()])?;
        }
        let result = self.dropout.forward(self.fc.forward(&result), mode);
        let result = result + query_input;
        Ok((self.layer_norm.forward(result), attention))
    }
}

impl Parameters for MultiheadAttention {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.key.collect_parameters(&join(prefix, "key"), out);
        self.value.collect_parameters(&join(prefix, "value"), out);
        self.query.collect_parameters(&join(prefix, "query"), out);
        self.fc.collect_parameters(&join(prefix, "fc"), out);
        self.layer_norm
            .collect_parameters(&join(prefix, "layer_norm"), out);
    }
}

/// `(batch, time, heads * d)` to `(heads * batch, time, d)`.
fn split_heads(x: &Array3<f32>, heads: usize, d: usize) -> Array3<f32> {
    let (batch, time, _) = x.dim();
    Array3::from_shape_fn((heads * batch, time, d), |(n, t, i)| {
        let (h, b) = (n / batch, n % batch);
        x[[b, t, h * d + i]]
    })
}

/// Inverse of [`split_heads`].
fn merge_heads(x: &Array3<f32>, heads: usize, batch: usize) -> Array3<f32> {
    let (_, time, d) = x.dim();
    Array3::from_shape_fn((batch, time, heads * d), |(b, t, c)| {
        let (h, i) = (c / d, c % d);
        x[[h * batch + b, t, i]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::masks::{ids_non_pad_mask, key_padding_attention_mask};
    use ndarray::{arr2, Array};

    #[test]
    fn heads_round_trip() {
        let x = Array::from_shape_fn((2, 3, 8), |(b, t, c)| (b * 100 + t * 10 + c) as f32);
        let split = split_heads(&x, 4, 2);
        assert_eq!(split.dim(), (8, 3, 2));
        assert_eq!(split[[5, 1, 0]], x[[1, 1, 4]]);
        assert_eq!(merge_heads(&split, 4, 2), x);
    }

    #[test]
    fn padded_keys_ignored() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = MultiheadConfig::new(8, 4, 4, 2);
        let attention = MultiheadAttention::init("slf_attn", &config, &mut rng);

        let ids = arr2(&[[1, 2, 3, 0], [4, 5, 0, 0]]);
        let x = Array::from_shape_simple_fn((2, 4, 8), || rng.gen_range(-1.0..1.0));
        let mask = key_padding_attention_mask(&ids, 4);
        let query_mask = ids_non_pad_mask(&ids);

        let (out, weights) = attention
            .forward(&x, &x, &x, Some(&mask), Some(&query_mask), Mode::Eval)
            .unwrap();
        assert_eq!(out.dim(), (2, 4, 8));
        assert_eq!(weights.dim(), (4, 4, 4));
        // Head 1, batch item 1 lives at index 3
        for q in 0..2 {
            assert!(weights[[3, q, 2]] < 1e-6);
            assert!(weights[[3, q, 3]] < 1e-6);
            let sum: f32 = weights.slice(ndarray::s![3, q, ..]).sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        // Padded queries carry no attention
        assert_eq!(weights.slice(ndarray::s![3, 2, ..]).sum(), 0.0);
    }
}
