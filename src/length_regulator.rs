//! The FastSpeech length regulator. The encoder produces one hidden state per token but the
//! decoder works at the rate of mel frames, so every token state is repeated for as many frames as
//! the phone lasts. While training the durations come from an external aligner, at inference a
//! small convolutional network predicts them and `alpha` lets the caller speed up or slow down
//! the speech.
use crate::checkpoint::Checkpoint;
use crate::nn::*;
use ndarray::{s, Array2, Array3, Axis};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest a single token may last at inference, in frames.
pub const MAX_TOKEN_FRAMES: usize = 4096;

/// Longest utterance the regulator will expand to at inference, in frames.
pub const MAX_FRAMES: usize = 1 << 16;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationPredictorConfig {
    pub input_size: usize,
    pub filter_size: usize,
    #[serde(default = "default_kernel")]
    pub kernel_size: usize,
    #[serde(default)]
    pub dropout: f32,
}

fn default_kernel() -> usize {
    3
}

impl DurationPredictorConfig {
    fn padding(&self) -> usize {
        (self.kernel_size - 1) / 2
    }
}

/// Repeat every token vector `durations[b, i]` times. Batch items are padded with zeros up to the
/// longest expansion, a zero duration drops the token entirely.
pub fn expand(x: &Array3<f32>, durations: &Array2<usize>) -> anyhow::Result<Array3<f32>> {
    let (batch, tokens, channels) = x.dim();
    if durations.dim() != (batch, tokens) {
        anyhow::bail!(
            "durations {:?} don't match encoder output {:?}",
            durations.dim(),
            x.dim()
        );
    }
    let lengths = expanded_lengths(durations);
    let max_len = lengths.iter().copied().max().unwrap_or(0);
    let mut out = Array3::zeros((batch, max_len, channels));

    for ((mut out, x), durations) in out
        .outer_iter_mut()
        .zip(x.outer_iter())
        .zip(durations.outer_iter())
    {
        let mut frame = 0;
        for (token, duration) in x.outer_iter().zip(durations.iter()) {
            for _ in 0..*duration {
                out.row_mut(frame).assign(&token);
                frame += 1;
            }
        }
    }
    Ok(out)
}

/// Number of frames each batch item expands to.
pub fn expanded_lengths(durations: &Array2<usize>) -> Vec<usize> {
    durations.outer_iter().map(|row| row.sum()).collect()
}

/// Rounds predicted durations after scaling by `alpha`, negative results clamp to zero. Fails if a
/// token would last longer than [`MAX_TOKEN_FRAMES`].
pub fn scale_durations(prediction: &Array2<f32>, alpha: f32) -> anyhow::Result<Array2<usize>> {
    if !alpha.is_finite() || alpha <= 0.0 {
        anyhow::bail!("duration scale must be positive and finite, got {}", alpha);
    }
    let scaled = prediction.mapv(|d| (d * alpha).round().max(0.0));
    if let Some(d) = scaled
        .iter()
        .find(|d| !d.is_finite() || **d > MAX_TOKEN_FRAMES as f32)
    {
        anyhow::bail!(
            "scaled duration {} is over the limit of {} frames per token",
            d,
            MAX_TOKEN_FRAMES
        );
    }
    Ok(scaled.mapv(|d| d as usize))
}

/// 1-based decoder positions for every generated frame, 0 on padding.
pub fn frame_positions(lengths: &[usize], max_len: usize) -> Array2<usize> {
    Array2::from_shape_fn((lengths.len(), max_len), |(b, t)| {
        if t < lengths[b] {
            t + 1
        } else {
            0
        }
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct DurationPredictor {
    conv1: Conv1d,
    norm1: LayerNorm,
    conv2: Conv1d,
    norm2: LayerNorm,
    linear: Linear,
    dropout1: Dropout,
    dropout2: Dropout,
}

impl DurationPredictor {
    pub fn init(prefix: &str, config: &DurationPredictorConfig, rng: &mut impl Rng) -> Self {
        let c = config;
        let conv_std = (1.0 / (c.input_size * c.kernel_size) as f32).sqrt();
        Self {
            conv1: Conv1d::init(
                c.input_size,
                c.filter_size,
                c.kernel_size,
                c.padding(),
                1,
                conv_std,
                rng,
            ),
            norm1: LayerNorm::init(c.filter_size),
            conv2: Conv1d::init(
                c.filter_size,
                c.filter_size,
                c.kernel_size,
                c.padding(),
                1,
                conv_std,
                rng,
            ),
            norm2: LayerNorm::init(c.filter_size),
            linear: Linear::init_xavier(c.filter_size, 1, true, rng),
            dropout1: Dropout::new(c.dropout, &join(prefix, "dropout1")),
            dropout2: Dropout::new(c.dropout, &join(prefix, "dropout2")),
        }
    }

    pub fn load(store: &ParamStore, config: &DurationPredictorConfig) -> anyhow::Result<Self> {
        let c = config;
        Ok(Self {
            conv1: Conv1d::load(
                &store.pp("conv1"),
                c.input_size,
                c.filter_size,
                c.kernel_size,
                c.padding(),
                1,
            )?,
            norm1: LayerNorm::load(&store.pp("layer_norm1"), c.filter_size)?,
            conv2: Conv1d::load(
                &store.pp("conv2"),
                c.filter_size,
                c.filter_size,
                c.kernel_size,
                c.padding(),
                1,
            )?,
            norm2: LayerNorm::load(&store.pp("layer_norm2"), c.filter_size)?,
            linear: Linear::load(&store.pp("linear"), c.filter_size, 1, true)?,
            dropout1: Dropout::new(c.dropout, &join(store.prefix(), "dropout1")),
            dropout2: Dropout::new(c.dropout, &join(store.prefix(), "dropout2")),
        })
    }

    /// Predicted duration in frames for every token, `(batch, tokens)`.
    pub fn forward(&self, x: &Array3<f32>, mode: Mode) -> Array2<f32> {
        let x = self.norm1.forward(relu(self.conv1.forward(x)));
        let x = self.dropout1.forward(x, mode);
        let x = self.norm2.forward(relu(self.conv2.forward(&x)));
        let x = self.dropout2.forward(x, mode);
        relu(self.linear.forward(&x)).index_axis_move(Axis(2), 0)
    }
}

impl Parameters for DurationPredictor {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.conv1.collect_parameters(&join(prefix, "conv1"), out);
        self.norm1.collect_parameters(&join(prefix, "layer_norm1"), out);
        self.conv2.collect_parameters(&join(prefix, "conv2"), out);
        self.norm2.collect_parameters(&join(prefix, "layer_norm2"), out);
        self.linear.collect_parameters(&join(prefix, "linear"), out);
    }
}

/// Output of the regulator in training mode.
#[derive(Clone, Debug)]
pub struct TrainingOutput {
    pub output: Array3<f32>,
    pub predicted_durations: Array2<f32>,
}

/// Output of the regulator at inference.
#[derive(Clone, Debug)]
pub struct InferenceOutput {
    pub output: Array3<f32>,
    pub durations: Array2<usize>,
    /// Decoder positions for the positional encoding, `(batch, frames)`
    pub positions: Array2<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LengthRegulator {
    predictor: DurationPredictor,
}

impl LengthRegulator {
    pub fn new(predictor: DurationPredictor) -> Self {
        Self { predictor }
    }

    /// `prefix` is the parameter path of the regulator itself, as with [`LengthRegulator::load`].
    pub fn init(prefix: &str, config: &DurationPredictorConfig, rng: &mut impl Rng) -> Self {
        Self::new(DurationPredictor::init(
            &join(prefix, "duration_predictor"),
            config,
            rng,
        ))
    }

    pub fn load(store: &ParamStore, config: &DurationPredictorConfig) -> anyhow::Result<Self> {
        Ok(Self::new(DurationPredictor::load(
            &store.pp("duration_predictor"),
            config,
        )?))
    }

    /// Expand with the ground truth durations, returning the predictions alongside so the caller
    /// can compute the duration loss.
    pub fn forward_train(
        &self,
        x: &Array3<f32>,
        target: &Array2<usize>,
        mode: Mode,
    ) -> anyhow::Result<TrainingOutput> {
        let predicted_durations = self.predictor.forward(x, mode);
        let output = expand(x, target)?;
        Ok(TrainingOutput {
            output,
            predicted_durations,
        })
    }

    /// Expand with predicted durations scaled by `alpha`. `padding_mask` is `(batch, tokens)`
    /// with 1.0 on padded tokens, these never produce frames.
    pub fn forward_inference(
        &self,
        x: &Array3<f32>,
        alpha: f32,
        padding_mask: Option<&Array2<f32>>,
    ) -> anyhow::Result<InferenceOutput> {
        let mut prediction = self.predictor.forward(x, Mode::Eval);
        if let Some(mask) = padding_mask {
            if mask.dim() != prediction.dim() {
                anyhow::bail!(
                    "padding mask {:?} doesn't match tokens {:?}",
                    mask.dim(),
                    prediction.dim()
                );
            }
            prediction.zip_mut_with(mask, |d, m| {
                if *m > 0.5 {
                    *d = 0.0;
                }
            });
        }
        let durations = scale_durations(&prediction, alpha)?;
        if let Some(longest) = expanded_lengths(&durations).into_iter().max() {
            if longest > MAX_FRAMES {
                anyhow::bail!(
                    "{} frames is over the limit of {}, try a smaller alpha",
                    longest,
                    MAX_FRAMES
                );
            }
        }
        let output = expand(x, &durations)?;
        let lengths = expanded_lengths(&durations);
        debug!("Regulated lengths: {:?}", lengths);
        let positions = frame_positions(&lengths, output.dim().1);
        Ok(InferenceOutput {
            output,
            durations,
            positions,
        })
    }
}

impl Parameters for LengthRegulator {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.predictor
            .collect_parameters(&join(prefix, "duration_predictor"), out);
    }
}

/// Trims an expansion back to the frames of a single batch item.
pub fn item_frames(output: &Array3<f32>, item: usize, length: usize) -> Array2<f32> {
    output.slice(s![item, ..length, ..]).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, arr3, Array};

    #[test]
    fn expand_repeats_in_order() {
        let x = arr3(&[[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]]);
        let durations = arr2(&[[2, 0, 3]]);
        let y = expand(&x, &durations).unwrap();
        assert_eq!(y.dim(), (1, 5, 2));
        let firsts = y.slice(s![0, .., 0]).to_vec();
        assert_eq!(firsts, vec![1.0, 1.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn expand_pads_shorter_items() {
        let x = arr3(&[[[1.0], [2.0]], [[3.0], [4.0]]]);
        let durations = arr2(&[[1, 1], [2, 2]]);
        let y = expand(&x, &durations).unwrap();
        assert_eq!(y.dim(), (2, 4, 1));
        assert_eq!(y.slice(s![0, .., 0]).to_vec(), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(item_frames(&y, 1, 4).column(0).to_vec(), vec![3.0, 3.0, 4.0, 4.0]);
        assert_eq!(expanded_lengths(&durations), vec![2, 4]);
    }

    #[test]
    fn expand_rejects_bad_durations() {
        let x = Array3::<f32>::zeros((1, 3, 2));
        assert!(expand(&x, &arr2(&[[1, 2]])).is_err());
    }

    #[test]
    fn scaling_never_shrinks() {
        let prediction = arr2(&[[0.2, 1.4, 2.6, 0.0, 7.3]]);
        let mut previous = 0;
        for alpha in [0.5, 1.0, 2.0, 4.0] {
            let total = scale_durations(&prediction, alpha).unwrap().sum();
            assert!(total >= previous);
            previous = total;
        }
        assert_eq!(
            scale_durations(&prediction, 1.0).unwrap(),
            arr2(&[[0, 1, 3, 0, 7]])
        );
        assert!(scale_durations(&prediction, 1e30).is_err());
        assert!(scale_durations(&prediction, f32::INFINITY).is_err());
        assert!(scale_durations(&prediction, f32::NAN).is_err());
        assert!(scale_durations(&prediction, -1.0).is_err());
    }

    #[test]
    fn positions_count_from_one() {
        let positions = frame_positions(&[3, 1], 3);
        assert_eq!(positions, arr2(&[[1, 2, 3], [1, 0, 0]]));
    }

    #[test]
    fn inference_length_matches_durations() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = DurationPredictorConfig {
            input_size: 4,
            filter_size: 8,
            kernel_size: 3,
            dropout: 0.1,
        };
        let regulator = LengthRegulator::init("length_regulator", &config, &mut rng);
        let x = Array::from_shape_simple_fn((2, 6, 4), || rng.gen_range(-2.0..2.0));
        let mask = crate::nn::masks::lengths_padding_mask(&[6, 4], 6);

        let out = regulator.forward_inference(&x, 3.0, Some(&mask)).unwrap();
        let lengths = expanded_lengths(&out.durations);
        assert_eq!(out.output.dim().1, lengths.iter().copied().max().unwrap());
        assert_eq!(out.durations[[1, 4]], 0);
        assert_eq!(out.durations[[1, 5]], 0);
        for (b, len) in lengths.iter().enumerate() {
            if *len > 0 {
                assert_eq!(out.positions[[b, len - 1]], *len);
            }
        }

        let slower = regulator.forward_inference(&x, 6.0, Some(&mask)).unwrap();
        assert!(slower.durations.sum() >= out.durations.sum());
        assert!(regulator.forward_inference(&x, 0.0, None).is_err());
    }

    #[test]
    fn huge_alpha_is_an_error() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = DurationPredictorConfig {
            input_size: 4,
            filter_size: 8,
            kernel_size: 3,
            dropout: 0.0,
        };
        let regulator = LengthRegulator::init("length_regulator", &config, &mut rng);
        let x = Array::from_shape_simple_fn((1, 6, 4), || rng.gen_range(-2.0..2.0));
        let prediction = regulator.predictor.forward(&x, Mode::Eval);
        // Only meaningful if something is predicted to last at all
        if prediction.iter().any(|d| *d > 1e-3) {
            assert!(regulator.forward_inference(&x, 1e30, None).is_err());
            assert!(regulator.forward_inference(&x, f32::MAX, None).is_err());
        }
        assert!(regulator.forward_inference(&x, f32::INFINITY, None).is_err());
        assert!(regulator.forward_inference(&x, f32::NAN, None).is_err());
    }

    #[test]
    fn predictor_dropouts_differ() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = DurationPredictorConfig {
            input_size: 4,
            filter_size: 8,
            kernel_size: 3,
            dropout: 0.5,
        };
        let regulator = LengthRegulator::init("length_regulator", &config, &mut rng);
        let predictor = &regulator.predictor;
        let x = Array3::<f32>::ones((1, 8, 8));
        let mode = Mode::Train { seed: 7 };
        assert_ne!(
            predictor.dropout1.forward(x.clone(), mode),
            predictor.dropout2.forward(x, mode)
        );

        let mut ckpt = Checkpoint::new();
        regulator.collect_parameters("length_regulator", &mut ckpt);
        let store = ParamStore::new(&ckpt);
        let loaded = LengthRegulator::load(&store.pp("length_regulator"), &config).unwrap();
        assert_eq!(loaded, regulator);
    }

    #[test]
    fn training_uses_target() {
        let mut rng = StdRng::seed_from_u64(9);
        let config = DurationPredictorConfig {
            input_size: 2,
            filter_size: 4,
            kernel_size: 3,
            dropout: 0.0,
        };
        let regulator = LengthRegulator::init("", &config, &mut rng);
        let x = arr3(&[[[1.0, 0.0], [0.0, 1.0]]]);
        let out = regulator
            .forward_train(&x, &arr2(&[[3, 1]]), Mode::Train { seed: 1 })
            .unwrap();
        assert_eq!(out.output.dim(), (1, 4, 2));
        assert_eq!(out.predicted_durations.dim(), (1, 2));
        assert!(out.predicted_durations.iter().all(|d| *d >= 0.0));
    }
}
