//! The YAML experiment configuration shared by the binaries. Everything but the model sections
//! has defaults, so a synthesis config can be as small as the FastSpeech hyper-parameters.
use crate::audio::AudioConfig;
use crate::frontend::FrontendConfig;
use crate::models::{ConverterConfig, FastSpeechConfig};
use crate::vocoder::VocoderConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub fastspeech: Option<FastSpeechConfig>,
    #[serde(default)]
    pub converter: Option<ConverterConfig>,
    #[serde(default)]
    pub vocoder: VocoderConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = text
            .parse::<Self>()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        debug!("Loaded config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.audio.validate().context("audio")?;
        if let Some(fastspeech) = &self.fastspeech {
            fastspeech.validate().context("fastspeech")?;
            if fastspeech.num_mels != self.audio.num_mels {
                anyhow::bail!(
                    "fastspeech predicts {} mels but audio is configured for {}",
                    fastspeech.num_mels,
                    self.audio.num_mels
                );
            }
        }
        if let Some(converter) = &self.converter {
            converter.validate().context("converter")?;
            if converter.linear_dim != self.audio.n_fft / 2 + 1 {
                anyhow::bail!(
                    "converter predicts {} bins, n_fft {} gives {}",
                    converter.linear_dim,
                    self.audio.n_fft,
                    self.audio.n_fft / 2 + 1
                );
            }
        }
        if self.vocoder.waveflow_sigma <= 0.0 {
            anyhow::bail!("waveflow sigma must be positive");
        }
        Ok(())
    }

    pub fn fastspeech(&self) -> anyhow::Result<&FastSpeechConfig> {
        self.fastspeech
            .as_ref()
            .context("config has no fastspeech section")
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    /// Parses and validates a YAML document.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
