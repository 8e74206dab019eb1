//! Audio feature extraction and WAV I/O. The STFT matches the librosa conventions the models were
//! trained with: a periodic Hann window centred in the FFT frame and reflect padding of
//! `n_fft / 2` on each side of the signal. The mel filter bank uses the Slaney mel scale with
//! area normalisation.
use anyhow::Context;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use ndarray::{Array2, Axis};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Floor applied before taking the log of a mel-spectrogram.
pub const LOG_FLOOR: f32 = 1e-5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioConfig {
    #[serde(default = "default_sr")]
    pub sr: u32,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_win_length")]
    pub win_length: usize,
    #[serde(default = "default_num_mels")]
    pub num_mels: usize,
    #[serde(default)]
    pub fmin: f32,
    /// Defaults to the Nyquist frequency
    #[serde(default)]
    pub fmax: Option<f32>,
    /// Exponent applied to the magnitude spectrogram before phase reconstruction
    #[serde(default = "default_power")]
    pub power: f32,
    #[serde(default = "default_outputs_per_step")]
    pub outputs_per_step: usize,
}

fn default_sr() -> u32 {
    22050
}

fn default_n_fft() -> usize {
    2048
}

fn default_hop_length() -> usize {
    275
}

fn default_win_length() -> usize {
    1102
}

fn default_num_mels() -> usize {
    80
}

fn default_power() -> f32 {
    1.2
}

fn default_outputs_per_step() -> usize {
    1
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sr: default_sr(),
            n_fft: default_n_fft(),
            hop_length: default_hop_length(),
            win_length: default_win_length(),
            num_mels: default_num_mels(),
            fmin: 0.0,
            fmax: None,
            power: default_power(),
            outputs_per_step: default_outputs_per_step(),
        }
    }
}

impl AudioConfig {
    pub fn fmax(&self) -> f32 {
        self.fmax.unwrap_or(self.sr as f32 / 2.0)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sr == 0 || self.hop_length == 0 || self.num_mels == 0 {
            anyhow::bail!("sample rate, hop length and number of mels must be positive");
        }
        if self.win_length == 0 || self.win_length > self.n_fft {
            anyhow::bail!(
                "window length {} must be in 1..={} (n_fft)",
                self.win_length,
                self.n_fft
            );
        }
        if self.fmin < 0.0 || self.fmin >= self.fmax() || self.fmax() > self.sr as f32 / 2.0 {
            anyhow::bail!(
                "invalid frequency range {}-{}Hz for sample rate {}",
                self.fmin,
                self.fmax(),
                self.sr
            );
        }
        if self.outputs_per_step == 0 {
            anyhow::bail!("outputs per step must be positive");
        }
        Ok(())
    }
}

/// Periodic Hann window of `win_length` zero padded on both sides to `n_fft`.
pub fn hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0.0; n_fft];
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = (0.5 * (1.0 - phase.cos())) as f32;
    }
    window
}

fn reflect_pad(signal: &[f32], pad: usize) -> Vec<f32> {
    let n = signal.len();
    if n < 2 {
        let mut padded = vec![0.0; pad];
        padded.extend_from_slice(signal);
        padded.resize(n + 2 * pad, 0.0);
        return padded;
    }
    let period = 2 * (n as isize - 1);
    (-(pad as isize)..(n + pad) as isize)
        .map(|i| {
            let mut j = i.rem_euclid(period);
            if j >= n as isize {
                j = period - j;
            }
            signal[j as usize]
        })
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / 6.4f64.ln()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * 6.4f64.ln() / 27.0).exp()
    }
}

/// Slaney mel filter bank, `(num_mels, n_fft / 2 + 1)`.
pub fn mel_filterbank(config: &AudioConfig) -> Array2<f32> {
    let bins = config.n_fft / 2 + 1;
    let sr = config.sr as f64;
    let mel_min = hz_to_mel(config.fmin as f64);
    let mel_max = hz_to_mel(config.fmax() as f64);
    let n_mels = config.num_mels;
    let hz_points = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect::<Vec<_>>();

    let mut filters = Array2::zeros((n_mels, bins));
    for (i, mut filter) in filters.outer_iter_mut().enumerate() {
        let (left, centre, right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
        let norm = 2.0 / (right - left);
        for (bin, weight) in filter.iter_mut().enumerate() {
            let f = sr * bin as f64 / config.n_fft as f64;
            let w = if f < left || f > right {
                0.0
            } else if f <= centre {
                (f - left) / (centre - left)
            } else {
                (right - f) / (right - centre)
            };
            *weight = (norm * w) as f32;
        }
    }
    filters
}

/// Short-time Fourier transform with centred frames.
#[derive(Clone)]
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Stft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stft")
            .field("n_fft", &self.n_fft)
            .field("hop_length", &self.hop_length)
            .finish()
    }
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize, win_length: usize) -> anyhow::Result<Self> {
        if n_fft < 2 || hop_length == 0 || win_length == 0 || win_length > n_fft {
            anyhow::bail!(
                "invalid STFT parameters n_fft={} hop={} win={}",
                n_fft,
                hop_length,
                win_length
            );
        }
        let mut planner = FftPlanner::new();
        Ok(Self {
            n_fft,
            hop_length,
            window: hann_window(win_length, n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        })
    }

    pub fn from_config(config: &AudioConfig) -> anyhow::Result<Self> {
        Self::new(config.n_fft, config.hop_length, config.win_length)
    }

    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for a signal of `len` samples.
    pub fn frames(&self, len: usize) -> usize {
        1 + len / self.hop_length
    }

    /// One sided spectrum, `(frames, n_fft / 2 + 1)`.
    pub fn forward(&self, signal: &[f32]) -> Array2<Complex<f32>> {
        let padded = reflect_pad(signal, self.n_fft / 2);
        if padded.len() < self.n_fft {
            return Array2::zeros((0, self.bins()));
        }
        let frames = (padded.len() - self.n_fft) / self.hop_length + 1;
        let mut spectrum = Array2::zeros((frames, self.bins()));
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];
        for (frame, mut row) in spectrum.outer_iter_mut().enumerate() {
            let start = frame * self.hop_length;
            for (i, b) in buffer.iter_mut().enumerate() {
                *b = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.forward.process(&mut buffer);
            for (out, b) in row.iter_mut().zip(&buffer) {
                *out = *b;
            }
        }
        spectrum
    }

    /// Windowed overlap-add inverse. Without a `length` the output is `hop * (frames - 1)`
    /// samples, the length of the signal that produced the frames rounded down to a hop.
    pub fn inverse(
        &self,
        spectrum: &Array2<Complex<f32>>,
        length: Option<usize>,
    ) -> anyhow::Result<Vec<f32>> {
        if spectrum.ncols() != self.bins() {
            anyhow::bail!(
                "spectrum has {} bins, expected {}",
                spectrum.ncols(),
                self.bins()
            );
        }
        let frames = spectrum.nrows();
        let total = self.n_fft + self.hop_length * frames.saturating_sub(1);
        let mut signal = vec![0.0f32; total];
        let mut norm = vec![0.0f32; total];
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];
        let scale = 1.0 / self.n_fft as f32;

        for (frame, row) in spectrum.outer_iter().enumerate() {
            for (k, b) in buffer.iter_mut().enumerate() {
                *b = if k < self.bins() {
                    row[k]
                } else {
                    row[self.n_fft - k].conj()
                };
            }
            self.inverse.process(&mut buffer);
            let start = frame * self.hop_length;
            for (i, b) in buffer.iter().enumerate() {
                signal[start + i] += b.re * scale * self.window[i];
                norm[start + i] += self.window[i] * self.window[i];
            }
        }
        for (s, n) in signal.iter_mut().zip(&norm) {
            if *n > 1e-8 {
                *s /= n;
            }
        }

        let pad = self.n_fft / 2;
        let end = match length {
            Some(len) => (pad + len).min(total),
            None => total.saturating_sub(pad),
        };
        let mut out = signal[pad.min(end)..end].to_vec();
        if let Some(len) = length {
            out.resize(len, 0.0);
        }
        Ok(out)
    }
}

/// Computes log-mel spectrograms from waveforms.
#[derive(Clone, Debug)]
pub struct MelExtractor {
    stft: Stft,
    filterbank: Array2<f32>,
}

impl MelExtractor {
    pub fn new(config: &AudioConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            stft: Stft::from_config(config)?,
            filterbank: mel_filterbank(config),
        })
    }

    /// Natural log of the mel filtered magnitude spectrum, `(frames, num_mels)`.
    pub fn log_mel(&self, samples: &[f32]) -> Array2<f32> {
        let magnitude = self.stft.forward(samples).mapv(|c| c.norm());
        let mel = magnitude.dot(&self.filterbank.t());
        debug!("Extracted {} mel frames", mel.len_of(Axis(0)));
        mel.mapv_into(|x| x.max(LOG_FLOOR).ln())
    }
}

/// Reads a WAV file as mono `f32` samples in `[-1, 1]`, averaging channels. The file must already
/// be at `sample_rate`.
pub fn read_wav(path: impl AsRef<Path>, sample_rate: u32) -> anyhow::Result<Vec<f32>> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open audio {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate != sample_rate {
        anyhow::bail!(
            "{} is sampled at {}Hz, expected {}Hz",
            path.display(),
            spec.sample_rate,
            sample_rate
        );
    }
    let samples = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 * scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    let channels = spec.channels.max(1) as usize;
    Ok(samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}

pub fn create_wav_writer(
    output: impl AsRef<Path>,
    sample_rate: u32,
) -> anyhow::Result<WavWriter<BufWriter<File>>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let output = output.as_ref();
    WavWriter::create(output, spec)
        .with_context(|| format!("Failed to create {}", output.display()))
}

/// Writes samples as 16-bit mono PCM, clipping anything outside `[-1, 1]`.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> anyhow::Result<()> {
    let mut writer = create_wav_writer(path, sample_rate)?;
    let mut clipped = 0;
    for sample in samples {
        if sample.abs() > 1.0 {
            clipped += 1;
        }
        let sample = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(sample)?;
    }
    if clipped > 0 {
        warn!("Clipped {} of {} samples", clipped, samples.len());
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sr: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn mel_scale_roundtrip() {
        for hz in [0.0, 100.0, 440.0, 1000.0, 4000.0, 11025.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 0.01);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-10);
    }

    #[test]
    fn filterbank_layout() {
        let config = AudioConfig {
            n_fft: 512,
            win_length: 512,
            hop_length: 128,
            num_mels: 40,
            ..Default::default()
        };
        let fb = mel_filterbank(&config);
        assert_eq!(fb.dim(), (40, 257));
        assert!(fb.iter().all(|w| *w >= 0.0));
        for filter in fb.outer_iter() {
            assert!(filter.sum() > 0.0);
        }
    }

    #[test]
    fn reflect_padding() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
        assert_eq!(reflect_pad(&[], 2), vec![0.0; 4]);
    }

    #[test]
    fn stft_inverse_reconstructs() {
        let stft = Stft::new(256, 64, 256).unwrap();
        let signal = sine(440.0, 8000, 2048);
        let spectrum = stft.forward(&signal);
        assert_eq!(spectrum.dim(), (stft.frames(signal.len()), 129));
        let rebuilt = stft.inverse(&spectrum, Some(signal.len())).unwrap();
        assert_eq!(rebuilt.len(), signal.len());
        // Edges only get one window so skip them
        for (a, b) in signal[256..1792].iter().zip(&rebuilt[256..1792]) {
            assert!((a - b).abs() < 1e-3, "{} != {}", a, b);
        }
    }

    #[test]
    fn log_mel_peaks_near_tone() {
        let config = AudioConfig {
            sr: 16000,
            n_fft: 512,
            win_length: 400,
            hop_length: 160,
            num_mels: 40,
            ..Default::default()
        };
        let extractor = MelExtractor::new(&config).unwrap();
        let mel = extractor.log_mel(&sine(1000.0, 16000, 16000));
        assert_eq!(mel.dim(), (101, 40));
        let middle = mel.row(50);
        let peak = middle
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc });
        let fb = mel_filterbank(&config);
        let bin = 1000 * 512 / 16000;
        assert!(fb[[peak.0, bin]] > 0.0);
    }

    #[test]
    fn wav_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let signal = sine(440.0, 16000, 1600);
        write_wav(&path, &signal, 16000).unwrap();
        let read = read_wav(&path, 16000).unwrap();
        assert_eq!(read.len(), signal.len());
        for (a, b) in signal.iter().zip(&read) {
            assert!((a - b).abs() < 1e-3);
        }
        assert!(read_wav(&path, 22050).is_err());
    }

    #[test]
    fn invalid_config() {
        let mut config = AudioConfig::default();
        assert!(config.validate().is_ok());
        config.win_length = 4096;
        assert!(config.validate().is_err());
        let config = AudioConfig {
            fmax: Some(20000.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
