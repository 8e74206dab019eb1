//! Acoustic models: FastSpeech for text to mel-spectrogram and the Deep Voice 3 converter for
//! mel to linear spectrogram.
pub mod deepvoice3;
pub mod fastspeech;

pub use deepvoice3::{Converter, ConverterConfig};
pub use fastspeech::{FastSpeech, FastSpeechConfig, FastSpeechOutput, FastSpeechTrainOutput};
