//! FastSpeech: a non-autoregressive acoustic model. A stack of feed-forward Transformer (FFT)
//! blocks encodes the text, the length regulator stretches the encoding to the number of frames
//! and a second FFT stack decodes it into a mel-spectrogram. A convolutional post-net then
//! predicts a residual to sharpen the spectrogram.
use crate::attention::{MultiheadAttention, MultiheadConfig};
use crate::checkpoint::Checkpoint;
use crate::length_regulator::{
    expanded_lengths, frame_positions, DurationPredictorConfig, LengthRegulator,
};
use crate::nn::masks::{ids_non_pad_mask, key_padding_attention_mask, positions};
use crate::nn::positional::sinusoid_encoding_table;
use crate::nn::*;
use ndarray::{Array2, Array3};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FastSpeechConfig {
    pub vocab_size: usize,
    /// Longest text input the model accepts
    pub max_seq_len: usize,
    pub hidden_size: usize,
    pub encoder_layers: usize,
    pub encoder_heads: usize,
    pub encoder_filter_size: usize,
    pub decoder_layers: usize,
    pub decoder_heads: usize,
    pub decoder_filter_size: usize,
    #[serde(default = "default_fft_kernel")]
    pub fft_kernel_size: usize,
    pub duration_predictor_filter_size: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    pub num_mels: usize,
    #[serde(default = "default_outputs_per_step")]
    pub outputs_per_step: usize,
    #[serde(default = "default_postnet_hidden")]
    pub postnet_hidden: usize,
    #[serde(default = "default_postnet_layers")]
    pub postnet_layers: usize,
}

fn default_fft_kernel() -> usize {
    3
}

fn default_dropout() -> f32 {
    0.1
}

fn default_outputs_per_step() -> usize {
    1
}

fn default_postnet_hidden() -> usize {
    512
}

fn default_postnet_layers() -> usize {
    5
}

impl FastSpeechConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, heads) in [
            ("encoder", self.encoder_heads),
            ("decoder", self.decoder_heads),
        ] {
            if heads == 0 {
                anyhow::bail!("{} needs at least one attention head", name);
            }
            if self.hidden_size % heads != 0 {
                anyhow::bail!(
                    "hidden size {} isn't divisible by {} {} heads",
                    self.hidden_size,
                    heads,
                    name
                );
            }
        }
        if self.fft_kernel_size % 2 == 0 {
            anyhow::bail!("FFT kernel size must be odd, got {}", self.fft_kernel_size);
        }
        if self.postnet_layers < 2 {
            anyhow::bail!("post-net needs at least 2 layers");
        }
        if self.outputs_per_step == 0 || self.num_mels == 0 {
            anyhow::bail!("mel output size must be positive");
        }
        Ok(())
    }

    fn attention(&self, heads: usize) -> MultiheadConfig {
        let d = self.hidden_size / heads;
        MultiheadConfig {
            num_hidden: self.hidden_size,
            d_k: d,
            d_q: d,
            num_head: heads,
            is_bias: true,
            dropout: self.dropout,
            is_concat: false,
        }
    }

    fn duration_predictor(&self) -> DurationPredictorConfig {
        DurationPredictorConfig {
            input_size: self.hidden_size,
            filter_size: self.duration_predictor_filter_size,
            kernel_size: 3,
            dropout: self.dropout,
        }
    }

    fn mel_channels(&self) -> usize {
        self.num_mels * self.outputs_per_step
    }
}

/// Two convolutions with a relu between them, residual and layer norm.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionwiseFeedForward {
    w1: Conv1d,
    w2: Conv1d,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn init(
        prefix: &str,
        hidden: usize,
        filter: usize,
        kernel: usize,
        dropout: f32,
        rng: &mut impl Rng,
    ) -> Self {
        let padding = kernel / 2;
        Self {
            w1: Conv1d::init(
                hidden,
                filter,
                kernel,
                padding,
                1,
                (2.0 / (hidden * kernel) as f32).sqrt(),
                rng,
            ),
            w2: Conv1d::init(
                filter,
                hidden,
                kernel,
                padding,
                1,
                (1.0 / (filter * kernel) as f32).sqrt(),
                rng,
            ),
            layer_norm: LayerNorm::init(hidden),
            dropout: Dropout::new(dropout, &join(prefix, "dropout")),
        }
    }

    pub fn load(
        store: &ParamStore,
        hidden: usize,
        filter: usize,
        kernel: usize,
        dropout: f32,
    ) -> anyhow::Result<Self> {
        let padding = kernel / 2;
        Ok(Self {
            w1: Conv1d::load(&store.pp("w_1"), hidden, filter, kernel, padding, 1)?,
            w2: Conv1d::load(&store.pp("w_2"), filter, hidden, kernel, padding, 1)?,
            layer_norm: LayerNorm::load(&store.pp("layer_norm"), hidden)?,
            dropout: Dropout::new(dropout, &join(store.prefix(), "dropout")),
        })
    }

    pub fn forward(&self, x: &Array3<f32>, mode: Mode) -> Array3<f32> {
        let y = self.w2.forward(&relu(self.w1.forward(x)));
        let y = self.dropout.forward(y, mode) + x;
        self.layer_norm.forward(y)
    }
}

impl Parameters for PositionwiseFeedForward {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.w1.collect_parameters(&join(prefix, "w_1"), out);
        self.w2.collect_parameters(&join(prefix, "w_2"), out);
        self.layer_norm
            .collect_parameters(&join(prefix, "layer_norm"), out);
    }
}

/// Self attention followed by the position-wise feed forward, padded positions zeroed after each.
#[derive(Clone, Debug, PartialEq)]
pub struct FftBlock {
    slf_attn: MultiheadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl FftBlock {
    fn init(
        prefix: &str,
        config: &FastSpeechConfig,
        heads: usize,
        filter: usize,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            slf_attn: MultiheadAttention::init(
                &join(prefix, "slf_attn"),
                &config.attention(heads),
                rng,
            ),
            pos_ffn: PositionwiseFeedForward::init(
                &join(prefix, "pos_ffn"),
                config.hidden_size,
                filter,
                config.fft_kernel_size,
                config.dropout,
                rng,
            ),
        }
    }

    fn load(
        store: &ParamStore,
        config: &FastSpeechConfig,
        heads: usize,
        filter: usize,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            slf_attn: MultiheadAttention::load(&store.pp("slf_attn"), &config.attention(heads))?,
            pos_ffn: PositionwiseFeedForward::load(
                &store.pp("pos_ffn"),
                config.hidden_size,
                filter,
                config.fft_kernel_size,
                config.dropout,
            )?,
        })
    }

    /// * `non_pad_mask` - `(batch, time, 1)`, 1.0 on real positions
    /// * `attn_mask` - additive `(batch, time, time)` mask
    pub fn forward(
        &self,
        x: &Array3<f32>,
        non_pad_mask: &Array3<f32>,
        attn_mask: &Array3<f32>,
        mode: Mode,
    ) -> anyhow::Result<(Array3<f32>, Array3<f32>)> {
        let (out, attention) =
            self.slf_attn
                .forward(x, x, x, Some(attn_mask), Some(non_pad_mask), mode)?;
        let out = out * non_pad_mask;
        let out = self.pos_ffn.forward(&out, mode) * non_pad_mask;
        Ok((out, attention))
    }
}

impl Parameters for FftBlock {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.slf_attn.collect_parameters(&join(prefix, "slf_attn"), out);
        self.pos_ffn.collect_parameters(&join(prefix, "pos_ffn"), out);
    }
}

/// Adds the sinusoid encoding of `positions` to `x`. The table is built to fit so long decoder
/// outputs never run off the end.
fn add_positions(x: Array3<f32>, positions: &Array2<usize>) -> Array3<f32> {
    let max_position = positions.iter().copied().max().unwrap_or(0);
    let table = sinusoid_encoding_table(max_position + 1, x.dim().2, Some(0));
    x + Embedding::new(table).forward(positions)
}

fn run_stack(
    layers: &[FftBlock],
    mut x: Array3<f32>,
    ids_or_positions: &Array2<usize>,
    mode: Mode,
) -> anyhow::Result<(Array3<f32>, Vec<Array3<f32>>)> {
    let non_pad_mask = ids_non_pad_mask(ids_or_positions);
    let attn_mask = key_padding_attention_mask(ids_or_positions, ids_or_positions.dim().1);
    let mut attentions = Vec::with_capacity(layers.len());
    for layer in layers {
        let (out, attention) = layer.forward(&x, &non_pad_mask, &attn_mask, mode)?;
        x = out;
        attentions.push(attention);
    }
    Ok((x, attentions))
}

#[derive(Clone, Debug, PartialEq)]
pub struct Encoder {
    src_word_emb: Embedding,
    layer_stack: Vec<FftBlock>,
}

impl Encoder {
    /// Encodes `(batch, tokens)` ids, returning the hidden states and the self attention of every
    /// layer.
    pub fn forward(
        &self,
        text: &Array2<usize>,
        mode: Mode,
    ) -> anyhow::Result<(Array3<f32>, Vec<Array3<f32>>)> {
        let x = add_positions(self.src_word_emb.forward(text), &positions(text));
        run_stack(&self.layer_stack, x, text, mode)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decoder {
    layer_stack: Vec<FftBlock>,
}

impl Decoder {
    /// `positions` are the 1-based frame positions from the length regulator, 0 on padding.
    pub fn forward(
        &self,
        x: Array3<f32>,
        positions: &Array2<usize>,
        mode: Mode,
    ) -> anyhow::Result<(Array3<f32>, Vec<Array3<f32>>)> {
        let x = add_positions(x, positions);
        run_stack(&self.layer_stack, x, positions, mode)
    }
}

/// Convolutional post-net, batch norm after every convolution and tanh on all but the last.
#[derive(Clone, Debug, PartialEq)]
pub struct PostConvNet {
    convs: Vec<Conv1d>,
    norms: Vec<BatchNorm>,
    dropouts: Vec<Dropout>,
}

impl PostConvNet {
    const KERNEL: usize = 5;

    fn channels(config: &FastSpeechConfig, layer: usize) -> (usize, usize) {
        let mel = config.mel_channels();
        let hidden = config.postnet_hidden;
        let last = config.postnet_layers - 1;
        match layer {
            0 => (mel, hidden),
            l if l == last => (hidden, mel),
            _ => (hidden, hidden),
        }
    }

    fn dropouts(prefix: &str, config: &FastSpeechConfig) -> Vec<Dropout> {
        (0..config.postnet_layers)
            .map(|i| Dropout::new(config.dropout, &join(prefix, &format!("dropout.{}", i))))
            .collect()
    }

    fn init(prefix: &str, config: &FastSpeechConfig, rng: &mut impl Rng) -> Self {
        let mut convs = vec![];
        let mut norms = vec![];
        for layer in 0..config.postnet_layers {
            let (input, output) = Self::channels(config, layer);
            let std = (1.0 / (input * Self::KERNEL) as f32).sqrt();
            convs.push(Conv1d::init(input, output, Self::KERNEL, 2, 1, std, rng));
            norms.push(BatchNorm::init(output));
        }
        Self {
            convs,
            norms,
            dropouts: Self::dropouts(prefix, config),
        }
    }

    fn load(store: &ParamStore, config: &FastSpeechConfig) -> anyhow::Result<Self> {
        let mut convs = vec![];
        let mut norms = vec![];
        for layer in 0..config.postnet_layers {
            let (input, output) = Self::channels(config, layer);
            convs.push(Conv1d::load(
                &store.pp("conv_list").pp(layer),
                input,
                output,
                Self::KERNEL,
                2,
                1,
            )?);
            norms.push(BatchNorm::load(
                &store.pp("batch_norm_list").pp(layer),
                output,
            )?);
        }
        Ok(Self {
            convs,
            norms,
            dropouts: Self::dropouts(store.prefix(), config),
        })
    }

    pub fn forward(&self, x: &Array3<f32>, mode: Mode) -> Array3<f32> {
        let last = self.convs.len() - 1;
        let mut x = x.clone();
        let layers = self.convs.iter().zip(&self.norms).zip(&self.dropouts);
        for (i, ((conv, norm), dropout)) in layers.enumerate() {
            let y = norm.forward(conv.forward(&x), mode);
            let y = if i < last { y.mapv_into(f32::tanh) } else { y };
            x = dropout.forward(y, mode);
        }
        x
    }
}

impl Parameters for PostConvNet {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        for (i, conv) in self.convs.iter().enumerate() {
            conv.collect_parameters(&join(prefix, &format!("conv_list.{}", i)), out);
        }
        for (i, norm) in self.norms.iter().enumerate() {
            norm.collect_parameters(&join(prefix, &format!("batch_norm_list.{}", i)), out);
        }
    }
}

/// Outputs of a teacher forced training step, mels are `(batch, frames, num_mels)`.
#[derive(Clone, Debug)]
pub struct FastSpeechTrainOutput {
    pub mel: Array3<f32>,
    pub mel_postnet: Array3<f32>,
    pub predicted_durations: Array2<f32>,
    pub encoder_attentions: Vec<Array3<f32>>,
    pub decoder_attentions: Vec<Array3<f32>>,
}

#[derive(Clone, Debug)]
pub struct FastSpeechOutput {
    pub mel: Array3<f32>,
    pub mel_postnet: Array3<f32>,
    /// Number of valid frames for every batch item
    pub frame_lengths: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FastSpeech {
    config: FastSpeechConfig,
    encoder: Encoder,
    length_regulator: LengthRegulator,
    decoder: Decoder,
    mel_linear: Linear,
    postnet: PostConvNet,
}

impl FastSpeech {
    pub fn init(config: &FastSpeechConfig, rng: &mut impl Rng) -> anyhow::Result<Self> {
        config.validate()?;
        let c = config;
        let encoder = Encoder {
            src_word_emb: Embedding::init(c.vocab_size, c.hidden_size, 1.0, rng),
            layer_stack: (0..c.encoder_layers)
                .map(|i| {
                    let prefix = format!("encoder.layer_stack.{}", i);
                    FftBlock::init(&prefix, c, c.encoder_heads, c.encoder_filter_size, rng)
                })
                .collect(),
        };
        let length_regulator =
            LengthRegulator::init("length_regulator", &c.duration_predictor(), rng);
        let decoder = Decoder {
            layer_stack: (0..c.decoder_layers)
                .map(|i| {
                    let prefix = format!("decoder.layer_stack.{}", i);
                    FftBlock::init(&prefix, c, c.decoder_heads, c.decoder_filter_size, rng)
                })
                .collect(),
        };
        Ok(Self {
            config: c.clone(),
            encoder,
            length_regulator,
            decoder,
            mel_linear: Linear::init_xavier(c.hidden_size, c.mel_channels(), true, rng),
            postnet: PostConvNet::init("postnet", c, rng),
        })
    }

    pub fn load(store: &ParamStore, config: &FastSpeechConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let c = config;
        let enc = store.pp("encoder");
        let encoder = Encoder {
            src_word_emb: Embedding::load(&enc.pp("src_word_emb"), c.vocab_size, c.hidden_size)?,
            layer_stack: (0..c.encoder_layers)
                .map(|i| {
                    FftBlock::load(
                        &enc.pp("layer_stack").pp(i),
                        c,
                        c.encoder_heads,
                        c.encoder_filter_size,
                    )
                })
                .collect::<anyhow::Result<_>>()?,
        };
        let dec = store.pp("decoder");
        let decoder = Decoder {
            layer_stack: (0..c.decoder_layers)
                .map(|i| {
                    FftBlock::load(
                        &dec.pp("layer_stack").pp(i),
                        c,
                        c.decoder_heads,
                        c.decoder_filter_size,
                    )
                })
                .collect::<anyhow::Result<_>>()?,
        };
        Ok(Self {
            config: c.clone(),
            encoder,
            length_regulator: LengthRegulator::load(
                &store.pp("length_regulator"),
                &c.duration_predictor(),
            )?,
            decoder,
            mel_linear: Linear::load(
                &store.pp("mel_linear"),
                c.hidden_size,
                c.mel_channels(),
                true,
            )?,
            postnet: PostConvNet::load(&store.pp("postnet"), c)?,
        })
    }

    pub fn config(&self) -> &FastSpeechConfig {
        &self.config
    }

    fn check_text(&self, text: &Array2<usize>) -> anyhow::Result<()> {
        let (_, len) = text.dim();
        if len > self.config.max_seq_len {
            anyhow::bail!(
                "input of {} tokens is longer than the maximum of {}",
                len,
                self.config.max_seq_len
            );
        }
        if let Some(id) = text.iter().find(|id| **id >= self.config.vocab_size) {
            anyhow::bail!("token id {} outside vocabulary of {}", id, self.config.vocab_size);
        }
        Ok(())
    }

    /// Decoder states to `(mel, mel_postnet)`, each `(batch, frames * r, num_mels)`.
    fn project(
        &self,
        decoded: &Array3<f32>,
        mode: Mode,
    ) -> anyhow::Result<(Array3<f32>, Array3<f32>)> {
        let mel = self.mel_linear.forward(decoded);
        let mel_postnet = self.postnet.forward(&mel, mode) + &mel;
        Ok((self.unfold(mel)?, self.unfold(mel_postnet)?))
    }

    /// `(batch, steps, num_mels * r)` to `(batch, steps * r, num_mels)`.
    fn unfold(&self, x: Array3<f32>) -> anyhow::Result<Array3<f32>> {
        let (batch, steps, _) = x.dim();
        let r = self.config.outputs_per_step;
        let x = x.as_standard_layout().into_owned();
        Ok(x.into_shape((batch, steps * r, self.config.num_mels))?)
    }

    /// Teacher forced pass with ground truth `durations` `(batch, tokens)`.
    pub fn forward_train(
        &self,
        text: &Array2<usize>,
        durations: &Array2<usize>,
        mode: Mode,
    ) -> anyhow::Result<FastSpeechTrainOutput> {
        self.check_text(text)?;
        let (encoded, encoder_attentions) = self.encoder.forward(text, mode)?;
        let regulated = self
            .length_regulator
            .forward_train(&encoded, durations, mode)?;
        let lengths = expanded_lengths(durations);
        let mel_positions = frame_positions(&lengths, regulated.output.dim().1);
        let (decoded, decoder_attentions) =
            self.decoder
                .forward(regulated.output, &mel_positions, mode)?;
        let (mel, mel_postnet) = self.project(&decoded, mode)?;
        Ok(FastSpeechTrainOutput {
            mel,
            mel_postnet,
            predicted_durations: regulated.predicted_durations,
            encoder_attentions,
            decoder_attentions,
        })
    }

    /// Synthesis pass, `alpha` scales the predicted durations (above 1 is slower speech).
    pub fn infer(&self, text: &Array2<usize>, alpha: f32) -> anyhow::Result<FastSpeechOutput> {
        self.check_text(text)?;
        let (encoded, _) = self.encoder.forward(text, Mode::Eval)?;
        let padding = ids_non_pad_mask(text)
            .index_axis_move(ndarray::Axis(2), 0)
            .mapv(|v| 1.0 - v);
        let regulated = self
            .length_regulator
            .forward_inference(&encoded, alpha, Some(&padding))?;
        let frames = expanded_lengths(&regulated.durations);
        debug!("Decoding {:?} frames", frames);
        if frames.iter().all(|f| *f == 0) {
            anyhow::bail!("predicted durations are all zero, nothing to decode");
        }
        let (decoded, _) = self
            .decoder
            .forward(regulated.output, &regulated.positions, Mode::Eval)?;
        let (mel, mel_postnet) = self.project(&decoded, Mode::Eval)?;
        let r = self.config.outputs_per_step;
        Ok(FastSpeechOutput {
            mel,
            mel_postnet,
            frame_lengths: frames.iter().map(|f| f * r).collect(),
        })
    }
}

impl Parameters for FastSpeech {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        let enc = join(prefix, "encoder");
        self.encoder
            .src_word_emb
            .collect_parameters(&join(&enc, "src_word_emb"), out);
        for (i, layer) in self.encoder.layer_stack.iter().enumerate() {
            layer.collect_parameters(&join(&enc, &format!("layer_stack.{}", i)), out);
        }
        self.length_regulator
            .collect_parameters(&join(prefix, "length_regulator"), out);
        let dec = join(prefix, "decoder");
        for (i, layer) in self.decoder.layer_stack.iter().enumerate() {
            layer.collect_parameters(&join(&dec, &format!("layer_stack.{}", i)), out);
        }
        self.mel_linear
            .collect_parameters(&join(prefix, "mel_linear"), out);
        self.postnet.collect_parameters(&join(prefix, "postnet"), out);
    }
}
