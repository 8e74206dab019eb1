//! Dot product attention from Deep Voice 3, with an optional locality window used at inference
//! to force the alignment to move monotonically through the text.
//!
//! During training the decoder is free to attend anywhere that isn't padding, the model learns a
//! roughly diagonal alignment on its own. Autoregressive inference is less forgiving: one bad step
//! where the attention jumps back a word or skips to the end of the sentence and the rest of the
//! utterance is garbage (repeated words, cut off endings). So when decoding step by step we
//! remember which encoder position got the most weight last time and only allow the next step to
//! look at a small window around it, by default one position behind to three positions ahead.
use crate::checkpoint::Checkpoint;
use crate::nn::*;
use ndarray::{s, Array2, Array3, Axis};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Offsets of the attention window relative to the last attended position. The window is half
/// open, `[last + backward, last + ahead)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WindowRange {
    pub backward: isize,
    pub ahead: isize,
}

impl Default for WindowRange {
    fn default() -> Self {
        Self {
            backward: -1,
            ahead: 3,
        }
    }
}

impl WindowRange {
    /// The window clamped into `[0, encoder_len]`. When the clamped bounds cross the range is
    /// empty and every encoder position gets masked, see [`MonotonicAttention::forward`].
    pub fn clamped(&self, last_attended: usize, encoder_len: usize) -> (usize, usize) {
        let last = last_attended as isize;
        let start = (last + self.backward).max(0) as usize;
        let end = (last + self.ahead).clamp(0, encoder_len as isize) as usize;
        (start, end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttentionConfig {
    /// Size of a single query vector
    pub query_dim: usize,
    /// Size of the key and value vectors
    pub embed_dim: usize,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub window: WindowRange,
    #[serde(default = "default_true")]
    pub key_projection: bool,
    #[serde(default = "default_true")]
    pub value_projection: bool,
}

fn default_true() -> bool {
    true
}

impl AttentionConfig {
    pub fn new(query_dim: usize, embed_dim: usize) -> Self {
        Self {
            query_dim,
            embed_dim,
            dropout: 0.0,
            window: WindowRange::default(),
            key_projection: true,
            value_projection: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MonotonicAttention {
    query_proj: Linear,
    key_proj: Option<Linear>,
    value_proj: Option<Linear>,
    out_proj: Linear,
    dropout: Dropout,
    window: WindowRange,
    query_dim: usize,
    embed_dim: usize,
}

impl MonotonicAttention {
    /// Fresh weights, each projection drawn from `N(0, sqrt(1 / fan_in))`. `prefix` is the
    /// parameter path the layer is saved under.
    pub fn init(prefix: &str, config: &AttentionConfig, rng: &mut impl Rng) -> Self {
        let q = config.query_dim;
        let e = config.embed_dim;
        let embed_std = (1.0 / e as f32).sqrt();
        Self {
            query_proj: Linear::init_normal(q, e, (1.0 / q as f32).sqrt(), true, rng),
            key_proj: config
                .key_projection
                .then(|| Linear::init_normal(e, e, embed_std, true, rng)),
            value_proj: config
                .value_projection
                .then(|| Linear::init_normal(e, e, embed_std, true, rng)),
            out_proj: Linear::init_normal(e, q, embed_std, true, rng),
            dropout: Dropout::new(config.dropout, &join(prefix, "dropout")),
            window: config.window,
            query_dim: q,
            embed_dim: e,
        }
    }

    pub fn load(store: &ParamStore, config: &AttentionConfig) -> anyhow::Result<Self> {
        let q = config.query_dim;
        let e = config.embed_dim;
        let key_proj = if config.key_projection {
            Some(Linear::load(&store.pp("key_proj"), e, e, true)?)
        } else {
            None
        };
        let value_proj = if config.value_projection {
            Some(Linear::load(&store.pp("value_proj"), e, e, true)?)
        } else {
            None
        };
        Ok(Self {
            query_proj: Linear::load(&store.pp("query_proj"), q, e, true)?,
            key_proj,
            value_proj,
            out_proj: Linear::load(&store.pp("out_proj"), e, q, true)?,
            dropout: Dropout::new(config.dropout, &join(store.prefix(), "dropout")),
            window: config.window,
            query_dim: q,
            embed_dim: e,
        })
    }

    pub fn window(&self) -> WindowRange {
        self.window
    }

    /// Computes the contextualised queries and the alignment.
    ///
    /// * `query` - `(batch, decoder_steps, query_dim)`
    /// * `keys`, `values` - `(batch, encoder_steps, embed_dim)`
    /// * `mask` - `(batch, encoder_steps)`, 1.0 on padded encoder positions
    /// * `last_attended` - position that got the most attention on the previous decoder step,
    ///   only pass this when decoding incrementally
    ///
    /// Returns the output `(batch, decoder_steps, query_dim)` and the alignment
    /// `(batch, decoder_steps, encoder_steps)`.
    pub fn forward(
        &self,
        query: &Array3<f32>,
        keys: &Array3<f32>,
        values: &Array3<f32>,
        mask: Option<&Array2<f32>>,
        last_attended: Option<usize>,
        mode: Mode,
    ) -> anyhow::Result<(Array3<f32>, Array3<f32>)> {
        let (batch, _, query_dim) = query.dim();
        let (key_batch, encoder_len, embed_dim) = keys.dim();
        if query_dim != self.query_dim || embed_dim != self.embed_dim {
            anyhow::bail!(
                "attention expects query dim {} and embed dim {}, got {} and {}",
                self.query_dim,
                self.embed_dim,
                query_dim,
                embed_dim
            );
        }
        if key_batch != batch || values.dim() != keys.dim() {
            anyhow::bail!(
                "mismatched attention inputs: query {:?} keys {:?} values {:?}",
                query.dim(),
                keys.dim(),
                values.dim()
            );
        }
        if let Some(mask) = mask {
            if mask.dim() != (batch, encoder_len) {
                anyhow::bail!(
                    "padding mask {:?} doesn't match (batch, encoder_steps) ({}, {})",
                    mask.dim(),
                    batch,
                    encoder_len
                );
            }
        }

        let values = match self.value_proj.as_ref() {
            Some(proj) => proj.forward(values),
            None => values.clone(),
        };
        let keys = match self.key_proj.as_ref() {
            Some(proj) => proj.forward(keys),
            None => keys.clone(),
        };
        let x = self.query_proj.forward(query);
        let mut scores = batched_matmul_transposed(&x, &keys);

        if let Some(mask) = mask {
            for (mut scores, mask) in scores.outer_iter_mut().zip(mask.outer_iter()) {
                let bias = mask.mapv(|m| m * NEG_INF);
                scores += &bias;
            }
        }

        if let Some(last) = last_attended {
            let (start, end) = self.window.clamped(last, encoder_len);
            if start >= end {
                warn!(
                    "Attention window around {} is empty for {} encoder steps",
                    last, encoder_len
                );
            }
            let mut locality = Array2::from_elem((scores.dim().1, encoder_len), NEG_INF);
            if start < end {
                locality.slice_mut(s![.., start..end]).fill(0.0);
            }
            for mut scores in scores.outer_iter_mut() {
                scores += &locality;
            }
        }

        let alignment = softmax_last(scores);
        let attended = self.dropout.forward(alignment.clone(), mode);
        let context = batched_matmul(&attended, &values);

        let n = encoder_len as f32;
        let context = context * (n * (1.0 / n).sqrt());
        let out = (self.out_proj.forward(&context) + query) * 0.5f32.sqrt();
        Ok((out, alignment))
    }
}

impl Parameters for MonotonicAttention {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.query_proj
            .collect_parameters(&join(prefix, "query_proj"), out);
        if let Some(proj) = self.key_proj.as_ref() {
            proj.collect_parameters(&join(prefix, "key_proj"), out);
        }
        if let Some(proj) = self.value_proj.as_ref() {
            proj.collect_parameters(&join(prefix, "value_proj"), out);
        }
        self.out_proj.collect_parameters(&join(prefix, "out_proj"), out);
    }
}

/// Drives a [`MonotonicAttention`] one decoder step at a time, feeding the argmax of each step's
/// alignment into the next step's window. The first step is unconstrained.
#[derive(Debug)]
pub struct IncrementalAligner<'a> {
    attention: &'a MonotonicAttention,
    keys: Array3<f32>,
    values: Array3<f32>,
    mask: Option<Array2<f32>>,
    last_attended: Option<usize>,
    alignments: Vec<Array3<f32>>,
}

impl<'a> IncrementalAligner<'a> {
    pub fn new(
        attention: &'a MonotonicAttention,
        keys: Array3<f32>,
        values: Array3<f32>,
        mask: Option<Array2<f32>>,
    ) -> Self {
        Self {
            attention,
            keys,
            values,
            mask,
            last_attended: None,
            alignments: vec![],
        }
    }

    /// Position the next step's window will be centred on.
    pub fn last_attended(&self) -> Option<usize> {
        self.last_attended
    }

    pub fn steps(&self) -> usize {
        self.alignments.len()
    }

    /// Attend with a single `(batch, 1, query_dim)` decoder step.
    pub fn step(&mut self, query: &Array3<f32>) -> anyhow::Result<Array3<f32>> {
        let (batch, steps, _) = query.dim();
        if batch == 0 || steps != 1 {
            anyhow::bail!(
                "incremental attention takes one step of a non-empty batch, got {:?}",
                query.dim()
            );
        }
        let (out, alignment) = self.attention.forward(
            query,
            &self.keys,
            &self.values,
            self.mask.as_ref(),
            self.last_attended,
            Mode::Eval,
        )?;
        // Only the first item in the batch steers the window, incremental decoding is done one
        // utterance at a time.
        let last_row = alignment.slice(s![0, -1, ..]);
        let argmax = last_row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
                if *v > best.1 {
                    (i, *v)
                } else {
                    best
                }
            })
            .0;
        debug!(
            "Step {} attended {} (was {:?})",
            self.alignments.len(),
            argmax,
            self.last_attended
        );
        self.last_attended = Some(argmax);
        self.alignments.push(alignment);
        Ok(out)
    }

    /// Alignment of every step so far, `(batch, steps, encoder_steps)`.
    pub fn alignment(&self) -> anyhow::Result<Array3<f32>> {
        if self.alignments.is_empty() {
            let (batch, encoder_len, _) = self.keys.dim();
            return Ok(Array3::zeros((batch, 0, encoder_len)));
        }
        let views = self.alignments.iter().map(|a| a.view()).collect::<Vec<_>>();
        Ok(ndarray::concatenate(Axis(1), &views)?)
    }
}
