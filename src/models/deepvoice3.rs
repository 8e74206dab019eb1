//! The Deep Voice 3 converter, mapping mel-spectrograms (or decoder states) to linear
//! spectrograms with a stack of gated convolutions, optionally upsampling in time.
//!
//! The layer stack is first described as a list of [`BlockSpec`]s built from the configuration,
//! which is then turned into the layers themselves either with fresh weights or from a checkpoint.
use crate::checkpoint::Checkpoint;
use crate::nn::*;
use ndarray::{s, Array2, Array3, Axis};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A gated convolution layer in the post convolution stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub out_channels: usize,
    pub kernel_size: usize,
    pub dilation: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConverterConfig {
    #[serde(default = "default_speakers")]
    pub n_speakers: usize,
    #[serde(default)]
    pub speaker_dim: usize,
    pub in_channels: usize,
    pub linear_dim: usize,
    #[serde(default = "default_convolutions")]
    pub convolutions: Vec<ConvSpec>,
    /// Must match the downsampling of the decoder, one of 1, 2 or 4
    #[serde(default = "default_upsampling")]
    pub time_upsampling: usize,
    #[serde(default)]
    pub dropout: f32,
}

fn default_speakers() -> usize {
    1
}

fn default_upsampling() -> usize {
    1
}

fn default_convolutions() -> Vec<ConvSpec> {
    vec![
        ConvSpec {
            out_channels: 256,
            kernel_size: 5,
            dilation: 1,
        };
        4
    ]
}

/// Settings of a single [`Conv1dGlu`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GluSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub dilation: usize,
    /// Scales the initialisation variance
    pub std_mul: f32,
}

/// Description of one layer of the converter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BlockSpec {
    /// 1x1 convolution changing the number of channels
    Conv {
        in_channels: usize,
        out_channels: usize,
        activation: Activation,
        std: f32,
    },
    /// Doubles the number of frames
    Transpose { channels: usize, std: f32 },
    Glu(GluSpec),
}

impl ConverterConfig {
    pub fn target_channels(&self) -> anyhow::Result<usize> {
        match self.convolutions.first() {
            Some(c) => Ok(c.out_channels),
            None => anyhow::bail!("converter needs at least one convolution"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.blocks().map(|_| ())
    }

    /// The upsampling blocks for the configured factor followed by the post convolutions.
    pub fn blocks(&self) -> anyhow::Result<Vec<BlockSpec>> {
        let target = self.target_channels()?;
        if let Some(spec) = self
            .convolutions
            .iter()
            .find(|c| c.kernel_size == 0 || c.dilation == 0)
        {
            anyhow::bail!("invalid convolution {:?}", spec);
        }
        let glu = |dilation, std_mul| {
            BlockSpec::Glu(GluSpec {
                in_channels: target,
                out_channels: target,
                kernel_size: 3,
                dilation,
                std_mul,
            })
        };
        let transpose = |std_mul: f32| BlockSpec::Transpose {
            channels: target,
            std: (std_mul / target as f32).sqrt(),
        };
        let mut blocks = match self.time_upsampling {
            4 => vec![
                transpose(1.0),
                glu(1, 1.0),
                glu(3, 4.0),
                transpose(4.0),
                glu(1, 1.0),
                glu(3, 4.0),
            ],
            2 => vec![transpose(1.0), glu(1, 1.0), glu(3, 4.0)],
            1 => vec![glu(3, 4.0)],
            other => anyhow::bail!(
                "upsampling factors other than 1, 2 or 4 are not supported, got {}",
                other
            ),
        };

        let mut std_mul = 4.0;
        let mut in_channels = target;
        for spec in &self.convolutions {
            if in_channels != spec.out_channels {
                blocks.push(BlockSpec::Conv {
                    in_channels,
                    out_channels: spec.out_channels,
                    activation: Activation::Relu,
                    std: (std_mul / in_channels as f32).sqrt(),
                });
                in_channels = spec.out_channels;
                std_mul = 2.0;
            }
            blocks.push(BlockSpec::Glu(GluSpec {
                in_channels,
                out_channels: spec.out_channels,
                kernel_size: spec.kernel_size,
                dilation: spec.dilation,
                std_mul,
            }));
            in_channels = spec.out_channels;
            std_mul = 4.0;
        }
        Ok(blocks)
    }

    fn last_channels(&self) -> usize {
        self.convolutions
            .last()
            .map(|c| c.out_channels)
            .unwrap_or_default()
    }
}

/// Gated linear unit convolution with an optional speaker dependent bias:
/// `sigmoid(gate) * (content + softsign(W s))`, residual when the channels allow it.
#[derive(Clone, Debug, PartialEq)]
pub struct Conv1dGlu {
    conv: Conv1d,
    speaker_proj: Option<Linear>,
    dropout: Dropout,
    residual: bool,
}

impl Conv1dGlu {
    fn padding(spec: &GluSpec) -> usize {
        (spec.kernel_size - 1) * spec.dilation / 2
    }

    pub fn init(
        prefix: &str,
        spec: &GluSpec,
        n_speakers: usize,
        speaker_dim: usize,
        dropout: f32,
        rng: &mut impl Rng,
    ) -> Self {
        let std = (spec.std_mul * (1.0 - dropout) / (spec.kernel_size * spec.in_channels) as f32)
            .sqrt();
        Self {
            conv: Conv1d::init(
                spec.in_channels,
                2 * spec.out_channels,
                spec.kernel_size,
                Self::padding(spec),
                spec.dilation,
                std,
                rng,
            ),
            speaker_proj: (n_speakers > 1)
                .then(|| Linear::init_xavier(speaker_dim, spec.out_channels, true, rng)),
            dropout: Dropout::new(dropout, &join(prefix, "dropout")),
            residual: spec.in_channels == spec.out_channels,
        }
    }

    pub fn load(
        store: &ParamStore,
        spec: &GluSpec,
        n_speakers: usize,
        speaker_dim: usize,
        dropout: f32,
    ) -> anyhow::Result<Self> {
        let speaker_proj = if n_speakers > 1 {
            Some(Linear::load(
                &store.pp("speaker_proj"),
                speaker_dim,
                spec.out_channels,
                true,
            )?)
        } else {
            None
        };
        Ok(Self {
            conv: Conv1d::load(
                &store.pp("conv"),
                spec.in_channels,
                2 * spec.out_channels,
                spec.kernel_size,
                Self::padding(spec),
                spec.dilation,
            )?,
            speaker_proj,
            dropout: Dropout::new(dropout, &join(store.prefix(), "dropout")),
            residual: spec.in_channels == spec.out_channels,
        })
    }

    pub fn forward(
        &self,
        x: &Array3<f32>,
        speaker: Option<&Array2<f32>>,
        mode: Mode,
    ) -> anyhow::Result<Array3<f32>> {
        let y = self.conv.forward(&self.dropout.forward(x.clone(), mode));
        let channels = y.dim().2 / 2;
        let mut content = y.slice(s![.., .., ..channels]).to_owned();
        let gate = y.slice(s![.., .., channels..]).mapv(sigmoid);

        match (self.speaker_proj.as_ref(), speaker) {
            (Some(proj), Some(speaker)) => {
                let bias = proj.forward2(speaker).mapv_into(softsign);
                for (mut c, b) in content.outer_iter_mut().zip(bias.outer_iter()) {
                    c += &b;
                }
            }
            (Some(_), None) => {
                anyhow::bail!("multi-speaker convolution needs a speaker embedding")
            }
            _ => {}
        }

        let out = content * gate;
        if self.residual {
            Ok((out + x) * 0.5f32.sqrt())
        } else {
            Ok(out)
        }
    }
}

impl Parameters for Conv1dGlu {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.conv.collect_parameters(&join(prefix, "conv"), out);
        if let Some(proj) = self.speaker_proj.as_ref() {
            proj.collect_parameters(&join(prefix, "speaker_proj"), out);
        }
    }
}

/// A built converter layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ConverterBlock {
    Conv {
        conv: Conv1d,
        activation: Activation,
    },
    Transpose(ConvTranspose1d),
    Glu(Conv1dGlu),
}

impl ConverterBlock {
    fn init(prefix: &str, spec: &BlockSpec, config: &ConverterConfig, rng: &mut impl Rng) -> Self {
        match *spec {
            BlockSpec::Conv {
                in_channels,
                out_channels,
                activation,
                std,
            } => Self::Conv {
                conv: Conv1d::init(in_channels, out_channels, 1, 0, 1, std, rng),
                activation,
            },
            BlockSpec::Transpose { channels, std } => {
                Self::Transpose(ConvTranspose1d::init(channels, channels, 2, 2, std, rng))
            }
            BlockSpec::Glu(glu) => Self::Glu(Conv1dGlu::init(
                prefix,
                &glu,
                config.n_speakers,
                config.speaker_dim,
                config.dropout,
                rng,
            )),
        }
    }

    fn load(
        store: &ParamStore,
        spec: &BlockSpec,
        config: &ConverterConfig,
    ) -> anyhow::Result<Self> {
        let block = match *spec {
            BlockSpec::Conv {
                in_channels,
                out_channels,
                activation,
                ..
            } => Self::Conv {
                conv: Conv1d::load(store, in_channels, out_channels, 1, 0, 1)?,
                activation,
            },
            BlockSpec::Transpose { channels, .. } => {
                Self::Transpose(ConvTranspose1d::load(store, channels, channels, 2, 2)?)
            }
            BlockSpec::Glu(glu) => Self::Glu(Conv1dGlu::load(
                store,
                &glu,
                config.n_speakers,
                config.speaker_dim,
                config.dropout,
            )?),
        };
        Ok(block)
    }

    fn forward(
        &self,
        x: &Array3<f32>,
        speaker: Option<&Array2<f32>>,
        mode: Mode,
    ) -> anyhow::Result<Array3<f32>> {
        match self {
            Self::Conv { conv, activation } => Ok(activation.apply(conv.forward(x))),
            Self::Transpose(conv) => Ok(conv.forward(x)),
            Self::Glu(glu) => glu.forward(x, speaker, mode),
        }
    }
}

impl Parameters for ConverterBlock {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        match self {
            Self::Conv { conv, .. } => conv.collect_parameters(prefix, out),
            Self::Transpose(conv) => conv.collect_parameters(prefix, out),
            Self::Glu(glu) => glu.collect_parameters(prefix, out),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Converter {
    first_conv_proj: Conv1d,
    blocks: Vec<ConverterBlock>,
    last_conv_proj: Conv1d,
    speaker_dropout: Dropout,
    time_upsampling: usize,
}

impl Converter {
    pub fn init(config: &ConverterConfig, rng: &mut impl Rng) -> anyhow::Result<Self> {
        let specs = config.blocks()?;
        let target = config.target_channels()?;
        let last = config.last_channels();
        let first_std = (1.0 / config.in_channels as f32).sqrt();
        let last_std = (4.0 * (1.0 - config.dropout) / last as f32).sqrt();
        Ok(Self {
            first_conv_proj: Conv1d::init(config.in_channels, target, 1, 0, 1, first_std, rng),
            blocks: specs
                .iter()
                .enumerate()
                .map(|(i, spec)| ConverterBlock::init(&format!("blocks.{}", i), spec, config, rng))
                .collect(),
            last_conv_proj: Conv1d::init(last, config.linear_dim, 1, 0, 1, last_std, rng),
            speaker_dropout: Dropout::new(config.dropout, "speaker_embed"),
            time_upsampling: config.time_upsampling,
        })
    }

    pub fn load(store: &ParamStore, config: &ConverterConfig) -> anyhow::Result<Self> {
        let specs = config.blocks()?;
        let target = config.target_channels()?;
        let blocks = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| ConverterBlock::load(&store.pp("blocks").pp(i), spec, config))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            first_conv_proj: Conv1d::load(
                &store.pp("first_conv_proj"),
                config.in_channels,
                target,
                1,
                0,
                1,
            )?,
            blocks,
            last_conv_proj: Conv1d::load(
                &store.pp("last_conv_proj"),
                config.last_channels(),
                config.linear_dim,
                1,
                0,
                1,
            )?,
            speaker_dropout: Dropout::new(config.dropout, &join(store.prefix(), "speaker_embed")),
            time_upsampling: config.time_upsampling,
        })
    }

    pub fn time_upsampling(&self) -> usize {
        self.time_upsampling
    }

    /// `(batch, frames, in_channels)` to a linear spectrogram
    /// `(batch, frames * time_upsampling, linear_dim)` with values in `(0, 1)`.
    pub fn forward(
        &self,
        x: &Array3<f32>,
        speaker: Option<&Array2<f32>>,
        mode: Mode,
    ) -> anyhow::Result<Array3<f32>> {
        if x.dim().2 != self.first_conv_proj.in_channels() {
            anyhow::bail!(
                "converter expects {} input channels, got {}",
                self.first_conv_proj.in_channels(),
                x.dim().2
            );
        }
        let speaker = speaker.map(|s| self.speaker_dropout.forward(s.clone(), mode));
        if let Some(s) = speaker.as_ref() {
            if s.len_of(Axis(0)) != x.dim().0 {
                anyhow::bail!(
                    "{} speaker embeddings for a batch of {}",
                    s.len_of(Axis(0)),
                    x.dim().0
                );
            }
        }
        let mut x = self.first_conv_proj.forward(x);
        for block in &self.blocks {
            x = block.forward(&x, speaker.as_ref(), mode)?;
        }
        debug!("Converter output {:?}", x.dim());
        Ok(Activation::Sigmoid.apply(self.last_conv_proj.forward(&x)))
    }
}

impl Parameters for Converter {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.first_conv_proj
            .collect_parameters(&join(prefix, "first_conv_proj"), out);
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_parameters(&join(prefix, &format!("blocks.{}", i)), out);
        }
        self.last_conv_proj
            .collect_parameters(&join(prefix, "last_conv_proj"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn config(time_upsampling: usize) -> ConverterConfig {
        ConverterConfig {
            n_speakers: 1,
            speaker_dim: 0,
            in_channels: 6,
            linear_dim: 10,
            convolutions: vec![
                ConvSpec {
                    out_channels: 8,
                    kernel_size: 5,
                    dilation: 1,
                },
                ConvSpec {
                    out_channels: 4,
                    kernel_size: 3,
                    dilation: 2,
                },
            ],
            time_upsampling,
            dropout: 0.0,
        }
    }

    #[test]
    fn upsampling_lengths() {
        let mut rng = StdRng::seed_from_u64(2);
        let x = Array::from_shape_simple_fn((2, 7, 6), || rng.gen_range(-1.0..1.0));
        for factor in [1, 2, 4] {
            let converter = Converter::init(&config(factor), &mut rng).unwrap();
            let y = converter.forward(&x, None, Mode::Eval).unwrap();
            assert_eq!(y.dim(), (2, 7 * factor, 10));
            assert!(y.iter().all(|v| *v > 0.0 && *v < 1.0));
        }
    }

    #[test]
    fn unsupported_factor() {
        let mut rng = StdRng::seed_from_u64(2);
        assert!(Converter::init(&config(3), &mut rng).is_err());
        assert!(config(8).validate().is_err());
    }

    #[test]
    fn channel_change_inserts_projection() {
        let blocks = config(2).blocks().unwrap();
        assert!(matches!(blocks[0], BlockSpec::Transpose { channels: 8, .. }));
        // upsampling (3), glu 8->8, relu conv 8->4, glu 4->4
        assert_eq!(blocks.len(), 6);
        assert!(matches!(
            blocks[4],
            BlockSpec::Conv {
                in_channels: 8,
                out_channels: 4,
                activation: Activation::Relu,
                ..
            }
        ));
    }

    #[test]
    fn speakers_bias_gates() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut c = config(1);
        c.n_speakers = 4;
        c.speaker_dim = 3;
        let converter = Converter::init(&c, &mut rng).unwrap();
        let x = Array::from_shape_simple_fn((2, 5, 6), || rng.gen_range(-1.0..1.0));
        assert!(converter.forward(&x, None, Mode::Eval).is_err());

        let speakers = Array::from_shape_simple_fn((2, 3), || rng.gen_range(-1.0..1.0));
        let y = converter.forward(&x, Some(&speakers), Mode::Eval).unwrap();
        assert_eq!(y.dim(), (2, 5, 10));

        let ckpt = converter.state_dict();
        let loaded = Converter::load(&ParamStore::new(&ckpt), &c).unwrap();
        let z = loaded.forward(&x, Some(&speakers), Mode::Eval).unwrap();
        assert_eq!(y, z);
    }

    #[test]
    fn glu_blocks_have_own_dropout() {
        let mut rng = StdRng::seed_from_u64(3);
        let c = ConverterConfig {
            dropout: 0.5,
            ..config(2)
        };
        let converter = Converter::init(&c, &mut rng).unwrap();
        let dropouts = converter
            .blocks
            .iter()
            .filter_map(|b| match b {
                ConverterBlock::Glu(glu) => Some(glu.dropout),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(dropouts.len() > 2);
        for (i, a) in dropouts.iter().enumerate() {
            for b in &dropouts[i + 1..] {
                assert_ne!(a, b);
            }
        }

        let loaded = Converter::load(&ParamStore::new(&converter.state_dict()), &c).unwrap();
        assert_eq!(loaded, converter);
        let x = Array::from_shape_simple_fn((1, 5, 6), || rng.gen_range(-1.0..1.0));
        let mode = Mode::Train { seed: 4 };
        assert_eq!(
            converter.forward(&x, None, mode).unwrap(),
            loaded.forward(&x, None, mode).unwrap()
        );
    }
}
