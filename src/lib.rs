use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod attention;
pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod frontend;
pub mod length_regulator;
pub mod models;
pub mod nn;
pub mod synthesis;
pub mod text_normaliser;
pub mod training;
pub mod vocoder;

pub use frontend::{Frontend, Phonetics};

pub fn setup_logging() -> anyhow::Result<()> {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("parakeet_tts=info,synthesize=info,copy_synthesis=info,dataset=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
