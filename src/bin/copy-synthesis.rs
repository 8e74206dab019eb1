use clap::Parser;
use parakeet_tts::config::Config;
use parakeet_tts::synthesis::copy_synthesis;
use parakeet_tts::vocoder::{load_vocoder, VocoderKind};
use std::path::PathBuf;
use tracing::info;

/// Vocodes the log-mel spectrograms of recorded speech, to hear a vocoder in isolation from the
/// acoustic model.
#[derive(Parser, Debug)]
pub struct Args {
    #[clap(long, short)]
    config: PathBuf,
    #[clap(long, value_enum, default_value_t = VocoderKind::GriffinLim)]
    vocoder: VocoderKind,
    #[clap(long)]
    vocoder_model: Option<PathBuf>,
    /// Directory of WAV files at the configured sample rate
    #[clap(long)]
    input_dir: PathBuf,
    #[clap(long)]
    output_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    parakeet_tts::setup_logging()?;
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let vocoder = load_vocoder(
        args.vocoder,
        args.vocoder_model.as_deref(),
        &config.audio,
        &config.vocoder,
    )?;
    let n = copy_synthesis(
        &config.audio,
        vocoder.as_ref(),
        &args.input_dir,
        &args.output_dir,
    )?;
    info!("Generated {} files", n);
    Ok(())
}
