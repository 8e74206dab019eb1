use clap::Parser;
use ndarray_npy::write_npy;
use parakeet_tts::config::Config;
use parakeet_tts::synthesis::Synthesiser;
use parakeet_tts::vocoder::{load_vocoder, VocoderKind};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
pub struct Args {
    /// Text to synthesise speech for
    #[clap(long, short)]
    input: String,
    /// YAML experiment config with the model and audio settings
    #[clap(long, short)]
    config: PathBuf,
    /// FastSpeech checkpoint, or a checkpoint directory to use the latest step from
    #[clap(long)]
    checkpoint: PathBuf,
    #[clap(long, value_enum, default_value_t = VocoderKind::GriffinLim)]
    vocoder: VocoderKind,
    /// ONNX graph for the neural vocoders
    #[clap(long)]
    vocoder_model: Option<PathBuf>,
    /// Speech rate, values above 1 lengthen every phone
    #[clap(long, default_value_t = 1.0)]
    alpha: f32,
    /// Location to save the output audio file
    #[clap(short, long, default_value = "output.wav")]
    output: PathBuf,
    /// Saves the generated spectrogram as npy for debugging purposes
    #[clap(long)]
    output_spectrogram: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    parakeet_tts::setup_logging()?;
    let args = Args::parse();
    if args.alpha.is_nan() || args.alpha <= 0.0 {
        anyhow::bail!("alpha must be positive, got {}", args.alpha);
    }

    info!("Loading resources");
    let config = Config::load(&args.config)?;
    let vocoder = load_vocoder(
        args.vocoder,
        args.vocoder_model.as_deref(),
        &config.audio,
        &config.vocoder,
    )?;
    let synthesiser = Synthesiser::load(&config, &args.checkpoint, vocoder)?;

    let mel = synthesiser.spectrogram(&args.input, args.alpha)?;
    if let Some(path) = args.output_spectrogram.as_ref() {
        write_npy(path, &mel)?;
        info!("Saved spectrogram to {}", path.display());
    }
    synthesiser.vocode_to_file(&mel, &args.output)?;
    info!("Synthesis completed, written to {}", args.output.display());
    Ok(())
}
