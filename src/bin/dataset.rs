use clap::Parser;
use parakeet_tts::config::Config;
use parakeet_tts::frontend::Frontend;
use parakeet_tts::training::*;
use std::path::PathBuf;
use tracing::{error, info};

/// Checks an LJSpeech style dataset and reports how well a front-end covers it.
#[derive(Parser, Debug)]
pub struct Args {
    /// Config whose front-end section is used, character input when missing
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long, default_value = "./data/metadata.csv")]
    metadata: PathBuf,
    #[clap(long, short, default_value = "analysis.json")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    parakeet_tts::setup_logging()?;
    let args = Args::parse();
    let config = match args.config.as_ref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let frontend = Frontend::from_config(&config.frontend)?;

    let dataset = Dataset::load(&args.metadata)?;
    if !dataset.validate() {
        error!("Dataset has errors, see above");
    }

    let mut coverage = CoverageGenerator::new(&frontend);
    coverage.push_dataset(&dataset);
    let report = coverage.generate_report();

    info!("Number of OOV words: {}", report.oov.len());
    info!("Number of diphones: {}", report.diphones.len());
    info!("Number of symbols: {}", report.symbols.len());
    info!("Unused symbols: {:?}", report.unused_symbols);

    let report = serde_json::to_string_pretty(&report)?;
    std::fs::write(&args.output, report)?;
    info!("Written {}", args.output.display());

    Ok(())
}
