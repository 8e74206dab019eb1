//! Vocoders turn the predicted log-mel spectrogram into a waveform. Griffin-Lim runs anywhere,
//! the neural vocoders need an exported ONNX graph.
use crate::audio::AudioConfig;
use anyhow::Context;
use clap::ValueEnum;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod griffin_lim;
pub mod onnx;

pub use griffin_lim::{GriffinLim, GriffinLimConfig};
pub use onnx::{OnnxVocoder, Preprocess, ZScore};

pub trait Vocoder {
    /// Log-mel `(frames, num_mels)` to mono samples at the configured sample rate.
    fn vocode(&self, mel: &Array2<f32>) -> anyhow::Result<Vec<f32>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VocoderKind {
    #[default]
    #[value(name = "griffinlim")]
    GriffinLim,
    Clarinet,
    #[value(name = "waveflow")]
    WaveFlow,
    Pwg,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VocoderConfig {
    #[serde(default)]
    pub griffin_lim: GriffinLimConfig,
    #[serde(default = "default_sigma")]
    pub waveflow_sigma: f32,
    /// Mean and standard deviation of the Parallel WaveGAN training features
    #[serde(default)]
    pub pwg_stats: Option<PathBuf>,
}

fn default_sigma() -> f32 {
    1.0
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            griffin_lim: GriffinLimConfig::default(),
            waveflow_sigma: default_sigma(),
            pwg_stats: None,
        }
    }
}

/// Builds the requested vocoder. Everything but Griffin-Lim needs a model file.
pub fn load_vocoder(
    kind: VocoderKind,
    model: Option<&Path>,
    audio: &AudioConfig,
    config: &VocoderConfig,
) -> anyhow::Result<Box<dyn Vocoder>> {
    let model_path = || model.with_context(|| format!("{:?} vocoder needs a model file", kind));
    let vocoder: Box<dyn Vocoder> = match kind {
        VocoderKind::GriffinLim => {
            Box::new(GriffinLim::new(audio, config.griffin_lim.clone())?)
        }
        VocoderKind::Clarinet => Box::new(OnnxVocoder::load(model_path()?, Preprocess::Clarinet)?),
        VocoderKind::WaveFlow => Box::new(OnnxVocoder::load(
            model_path()?,
            Preprocess::WaveFlow {
                sigma: config.waveflow_sigma,
            },
        )?),
        VocoderKind::Pwg => {
            let stats = config
                .pwg_stats
                .as_ref()
                .context("Parallel WaveGAN needs `pwg_stats` in the vocoder config")?;
            let normaliser = ZScore::load(stats)?;
            Box::new(OnnxVocoder::load(
                model_path()?,
                Preprocess::ParallelWaveGan(normaliser),
            )?)
        }
    };
    Ok(vocoder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(
            VocoderKind::from_str("griffinlim", false).unwrap(),
            VocoderKind::GriffinLim
        );
        assert_eq!(
            VocoderKind::from_str("waveflow", false).unwrap(),
            VocoderKind::WaveFlow
        );
        assert_eq!(VocoderKind::from_str("pwg", false).unwrap(), VocoderKind::Pwg);
        assert!(VocoderKind::from_str("wavenet", false).is_err());
    }

    #[test]
    fn neural_vocoders_need_models() {
        let audio = AudioConfig::default();
        let config = VocoderConfig::default();
        assert!(load_vocoder(VocoderKind::Clarinet, None, &audio, &config).is_err());
        assert!(load_vocoder(VocoderKind::Pwg, None, &audio, &config).is_err());
        assert!(load_vocoder(VocoderKind::GriffinLim, None, &audio, &config).is_ok());
    }
}
