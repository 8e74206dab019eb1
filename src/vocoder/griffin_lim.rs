//! Griffin-Lim phase reconstruction with the "fast" momentum update. Useful as a vocoder that
//! needs no trained weights, although the output has the characteristic phasey sound.
use super::Vocoder;
use crate::audio::{mel_filterbank, AudioConfig, Stft};
use ndarray::{Array2, Axis, Zip};
use rand::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GriffinLimConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// 0 gives the classic algorithm
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    /// Seed for the initial random phase
    #[serde(default)]
    pub seed: u64,
}

fn default_iterations() -> usize {
    32
}

fn default_momentum() -> f32 {
    0.99
}

impl Default for GriffinLimConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            momentum: default_momentum(),
            seed: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GriffinLim {
    stft: Stft,
    /// `(num_mels, bins)` maps mel energies back onto linear frequency bins
    inverse_basis: Array2<f32>,
    power: f32,
    config: GriffinLimConfig,
}

/// Transpose of the filter bank with each frequency bin normalised so the mel bands covering it
/// sum to one. Bins no band covers stay at zero.
pub fn inverse_mel_basis(filterbank: &Array2<f32>) -> Array2<f32> {
    let mut basis = filterbank.clone();
    for mut column in basis.axis_iter_mut(Axis(1)) {
        let total = column.sum();
        if total > 0.0 {
            column /= total;
        }
    }
    basis
}

fn with_magnitude(magnitude: &Array2<f32>, angles: &Array2<Complex<f32>>) -> Array2<Complex<f32>> {
    Zip::from(magnitude)
        .and(angles)
        .map_collect(|m, a| *a * *m)
}

impl GriffinLim {
    pub fn new(audio: &AudioConfig, config: GriffinLimConfig) -> anyhow::Result<Self> {
        audio.validate()?;
        if !(0.0..1.0).contains(&config.momentum) {
            anyhow::bail!("momentum must be in [0, 1), got {}", config.momentum);
        }
        Ok(Self {
            stft: Stft::from_config(audio)?,
            inverse_basis: inverse_mel_basis(&mel_filterbank(audio)),
            power: audio.power,
            config,
        })
    }

    /// Log-mel `(frames, num_mels)` to a linear magnitude spectrogram `(frames, bins)`.
    pub fn mel_to_linear(&self, mel: &Array2<f32>) -> anyhow::Result<Array2<f32>> {
        if mel.ncols() != self.inverse_basis.nrows() {
            anyhow::bail!(
                "expected {} mel channels, got {}",
                self.inverse_basis.nrows(),
                mel.ncols()
            );
        }
        let linear = mel.mapv(f32::exp).dot(&self.inverse_basis);
        Ok(linear.mapv_into(|x| x.max(1e-10)))
    }

    /// Estimates a signal whose STFT magnitude matches `magnitude`.
    pub fn reconstruct(&self, magnitude: &Array2<f32>) -> anyhow::Result<Vec<f32>> {
        if magnitude.ncols() != self.stft.bins() {
            anyhow::bail!(
                "expected {} frequency bins, got {}",
                self.stft.bins(),
                magnitude.ncols()
            );
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut angles = Array2::from_shape_simple_fn(magnitude.dim(), || {
            Complex::from_polar(1.0, rng.gen_range(0.0..std::f32::consts::TAU))
        });
        let mut rebuilt: Array2<Complex<f32>> = Array2::zeros(magnitude.dim());
        let momentum = self.config.momentum / (1.0 + self.config.momentum);

        for i in 0..self.config.iterations {
            let previous = rebuilt;
            let signal = self
                .stft
                .inverse(&with_magnitude(magnitude, &angles), None)?;
            rebuilt = self.stft.forward(&signal);
            angles = &rebuilt - &previous.mapv(|c| c * momentum);
            angles.mapv_inplace(|c| c / (c.norm() + 1e-16));
            if i % 8 == 0 {
                debug!("Griffin-Lim iteration {}", i);
            }
        }
        self.stft.inverse(&with_magnitude(magnitude, &angles), None)
    }
}

impl Vocoder for GriffinLim {
    fn vocode(&self, mel: &Array2<f32>) -> anyhow::Result<Vec<f32>> {
        info!(
            "Running {} Griffin-Lim iterations on {} frames",
            self.config.iterations,
            mel.nrows()
        );
        let spec = self.mel_to_linear(mel)?.mapv_into(|x| x.powf(self.power));
        self.reconstruct(&spec)
    }
}
