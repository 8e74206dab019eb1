use parakeet_tts::audio::read_wav;
use parakeet_tts::checkpoint::{checkpoint_path, Checkpoint};
use parakeet_tts::config::Config;
use parakeet_tts::frontend::{EnglishCharacter, Phonetics};
use parakeet_tts::models::FastSpeech;
use parakeet_tts::nn::Parameters;
use parakeet_tts::synthesis::Synthesiser;
use parakeet_tts::vocoder::{load_vocoder, VocoderKind};
use rand::prelude::*;
use std::path::Path;

fn config(vocab_size: usize) -> Config {
    format!(
        r#"
audio:
  sr: 8000
  n_fft: 256
  hop_length: 64
  win_length: 256
  num_mels: 8
frontend:
  kind: english_character
fastspeech:
  vocab_size: {}
  max_seq_len: 32
  hidden_size: 8
  encoder_layers: 1
  encoder_heads: 2
  encoder_filter_size: 16
  decoder_layers: 1
  decoder_heads: 2
  decoder_filter_size: 16
  duration_predictor_filter_size: 8
  dropout: 0.0
  num_mels: 8
  postnet_hidden: 8
  postnet_layers: 2
vocoder:
  griffin_lim:
    iterations: 2
"#,
        vocab_size
    )
    .parse()
    .unwrap()
}

/// Saves a randomly initialised model whose duration predictor always says two frames.
fn save_model(config: &Config, dir: &Path, step: usize) {
    let model = FastSpeech::init(config.fastspeech().unwrap(), &mut StdRng::seed_from_u64(1))
        .unwrap();
    let mut state = model.state_dict();
    let prefix = "length_regulator.duration_predictor.linear";
    let weight = state.get(&format!("{}.weight", prefix)).unwrap().mapv(|_| 0.0);
    let bias = state.get(&format!("{}.bias", prefix)).unwrap().mapv(|_| 2.0);
    state.insert(format!("{}.weight", prefix), weight);
    state.insert(format!("{}.bias", prefix), bias);
    state.save(checkpoint_path(dir, step)).unwrap();
}

#[test]
fn text_to_wav() {
    let vocab_size = EnglishCharacter::new().vocab_size();
    let config = config(vocab_size);
    let dir = tempfile::tempdir().unwrap();
    save_model(&config, dir.path(), 10);
    save_model(&config, dir.path(), 20);
    assert!(!Checkpoint::load(checkpoint_path(dir.path(), 20)).unwrap().is_empty());

    let vocoder = load_vocoder(VocoderKind::GriffinLim, None, &config.audio, &config.vocoder)
        .unwrap();
    let synth = Synthesiser::load(&config, dir.path(), vocoder).unwrap();

    let text = "Hello world. This sentence is long enough that it has to be split up.";
    let tokens: usize = synth
        .frontend()
        .encode_chunked(text, 32)
        .iter()
        .map(|x| x.len())
        .sum();
    let normal = synth.spectrogram(text, 1.0).unwrap();
    assert_eq!(normal.dim(), (2 * tokens, 8));
    let slow = synth.spectrogram(text, 2.0).unwrap();
    assert_eq!(slow.nrows(), 2 * normal.nrows());
    assert!(synth.spectrogram(text, 0.0).is_err());

    let output = dir.path().join("hello.wav");
    synth.synthesise_to_file("Hello world.", 1.0, &output).unwrap();
    let samples = read_wav(&output, 8000).unwrap();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|x| x.abs() <= 1.0));
}

#[test]
fn missing_checkpoint() {
    let config = config(EnglishCharacter::new().vocab_size());
    let dir = tempfile::tempdir().unwrap();
    let vocoder = load_vocoder(VocoderKind::GriffinLim, None, &config.audio, &config.vocoder)
        .unwrap();
    assert!(Synthesiser::load(&config, dir.path(), vocoder).is_err());
}
