//! Neural vocoders exported to ONNX. Each expects the mel-spectrogram in a slightly different
//! form, the graphs themselves all take a `mel` input and give back an `audio` output.
//!
//! * Clarinet takes a `(1, num_mels, frames)` spectrogram rescaled to decibels in `[0, 1]`.
//! * WaveFlow takes the log-mel as `(1, num_mels, frames)` plus the `sigma` of the flow prior.
//! * Parallel WaveGAN takes a `(frames, num_mels)` log-mel normalised with the training set
//!   statistics.
use super::Vocoder;
use anyhow::Context;
use ndarray::{arr1, Array1, Array2, Axis};
use ndarray_npy::read_npy;
use ort::{inputs, CPUExecutionProvider, GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::{debug, info};

/// Standardises each mel channel with a saved mean and standard deviation.
#[derive(Clone, Debug, PartialEq)]
pub struct ZScore {
    mu: Array1<f32>,
    sigma: Array1<f32>,
}

impl ZScore {
    pub fn new(mu: Array1<f32>, sigma: Array1<f32>) -> anyhow::Result<Self> {
        if mu.len() != sigma.len() {
            anyhow::bail!(
                "mean has {} channels but standard deviation has {}",
                mu.len(),
                sigma.len()
            );
        }
        if sigma.iter().any(|s| *s <= 0.0) {
            anyhow::bail!("standard deviations must be positive");
        }
        Ok(Self { mu, sigma })
    }

    /// Loads a `(2, num_mels)` npy file, the first row holds the means.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let stats: Array2<f32> = read_npy(path)
            .with_context(|| format!("Failed to read statistics {}", path.display()))?;
        if stats.nrows() != 2 {
            anyhow::bail!(
                "{} should have 2 rows (mean, std), found {}",
                path.display(),
                stats.nrows()
            );
        }
        Self::new(stats.row(0).to_owned(), stats.row(1).to_owned())
    }

    pub fn transform(&self, mel: &Array2<f32>) -> anyhow::Result<Array2<f32>> {
        if mel.ncols() != self.mu.len() {
            anyhow::bail!(
                "statistics cover {} channels, mel has {}",
                self.mu.len(),
                mel.ncols()
            );
        }
        Ok((mel - &self.mu) / &self.sigma)
    }
}

/// Log-mel to the normalised decibel scale Clarinet was trained on.
pub fn clarinet_rescale(mel: &Array2<f32>) -> Array2<f32> {
    const MIN_LEVEL: f32 = 1e-5;
    const REF_LEVEL: f32 = 20.0;
    mel.mapv(|x| {
        let db = 20.0 * x.exp().max(MIN_LEVEL).log10() - REF_LEVEL;
        ((db + 100.0) / 100.0).clamp(0.0, 1.0)
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum Preprocess {
    Clarinet,
    WaveFlow { sigma: f32 },
    ParallelWaveGan(ZScore),
}

pub struct OnnxVocoder {
    session: Session,
    preprocess: Preprocess,
}

impl OnnxVocoder {
    pub fn load(path: impl AsRef<Path>, preprocess: Preprocess) -> anyhow::Result<Self> {
        // Safe to call more than once, later calls are no-ops
        ort::init()
            .with_name("parakeet_tts")
            .with_execution_providers(&[CPUExecutionProvider::default().build()])
            .commit()?;

        let path = path.as_ref();
        info!("Loading vocoder from {}", path.display());
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path)
            .with_context(|| format!("converting {} to runnable model", path.display()))?;
        Ok(Self {
            session,
            preprocess,
        })
    }

    pub fn preprocess(&self) -> &Preprocess {
        &self.preprocess
    }
}

impl Vocoder for OnnxVocoder {
    fn vocode(&self, mel: &Array2<f32>) -> anyhow::Result<Vec<f32>> {
        debug!("Vocoding {:?} with {:?}", mel.dim(), self.preprocess);
        let (input, sigma) = match &self.preprocess {
            Preprocess::Clarinet => (
                clarinet_rescale(mel)
                    .reversed_axes()
                    .insert_axis(Axis(0))
                    .into_dyn(),
                None,
            ),
            Preprocess::WaveFlow { sigma } => (
                mel.t().insert_axis(Axis(0)).to_owned().into_dyn(),
                Some(arr1(&[*sigma])),
            ),
            Preprocess::ParallelWaveGan(normaliser) => {
                (normaliser.transform(mel)?.into_dyn(), None)
            }
        };
        // The graphs expect row major inputs
        let input = input.as_standard_layout().into_owned();
        let outputs = match sigma.as_ref() {
            Some(sigma) => self
                .session
                .run(inputs!["mel" => input.view(), "sigma" => sigma.view()]?)?,
            None => self.session.run(inputs!["mel" => input.view()]?)?,
        };
        let audio = outputs["audio"].extract_tensor::<f32>()?;
        let samples = audio.view().iter().copied().collect::<Vec<_>>();
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use ndarray_npy::write_npy;

    #[test]
    fn clarinet_range() {
        let mel = array![[-20.0f32, 0.0, 1.0], [5.0, -3.0, 2.5]];
        let scaled = clarinet_rescale(&mel);
        assert!(scaled.iter().all(|x| (0.0..=1.0).contains(x)));
        // exp(0) = 1 is 0dB, minus the 20dB reference
        assert!((scaled[[0, 1]] - 0.8).abs() < 1e-5);
        // floored at -100dB then shifted by the reference, clipped to 0
        assert_eq!(scaled[[0, 0]], 0.0);
    }

    #[test]
    fn zscore() {
        let normaliser = ZScore::new(array![1.0, -1.0], array![2.0, 0.5]).unwrap();
        let mel = array![[3.0, -1.0], [1.0, 0.0]];
        let out = normaliser.transform(&mel).unwrap();
        assert_eq!(out, array![[1.0, 0.0], [0.0, 2.0]]);
        assert!(normaliser.transform(&Array::zeros((2, 3))).is_err());
        assert!(ZScore::new(array![0.0], array![0.0]).is_err());
    }

    #[test]
    fn zscore_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.npy");
        write_npy(&path, &array![[0.0f32, 1.0, 2.0], [1.0, 1.0, 4.0]]).unwrap();
        let normaliser = ZScore::load(&path).unwrap();
        let out = normaliser.transform(&array![[1.0, 1.0, 6.0]]).unwrap();
        assert_eq!(out, array![[1.0, 0.0, 1.0]]);

        write_npy(&path, &array![[0.0f32, 1.0, 2.0]]).unwrap();
        assert!(ZScore::load(&path).is_err());
    }
}
