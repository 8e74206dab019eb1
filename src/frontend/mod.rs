//! Turns text into the id sequences the acoustic models consume. Each language has its own
//! front-end implementing [`Phonetics`], [`Frontend`] picks one based on the configuration.
use crate::text_normaliser::dict_normalise;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

pub mod arpabet;
pub mod chinese;
pub mod cmu_dict;
pub mod english;
pub mod english_character;
pub mod punctuation;
pub mod vocab;

pub use chinese::Chinese;
pub use cmu_dict::CmuDictionary;
pub use english::English;
pub use english_character::EnglishCharacter;
pub use vocab::Vocab;

pub trait Phonetics {
    /// Text to the sequence of symbols (phones, syllables or characters) for the model, wrapped
    /// in start and end symbols.
    fn phoneticize(&self, text: &str) -> Vec<String>;

    /// Symbols to ids.
    fn numericalize(&self, symbols: &[String]) -> Vec<usize>;

    /// Ids back to symbols.
    fn reverse(&self, ids: &[usize]) -> Vec<String>;

    fn vocab_size(&self) -> usize;

    fn encode(&self, text: &str) -> Vec<usize> {
        self.numericalize(&self.phoneticize(text))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum FrontendConfig {
    English {
        /// CMU dict format pronunciation dictionary
        dictionary: PathBuf,
        /// Extra pronunciations merged over the main dictionary
        #[serde(default)]
        custom_dictionary: Option<PathBuf>,
    },
    EnglishCharacter,
    Chinese {
        lexicon: PathBuf,
        #[serde(default)]
        traditional: Option<PathBuf>,
    },
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self::EnglishCharacter
    }
}

#[derive(Clone, Debug)]
pub enum Frontend {
    English(English),
    EnglishCharacter(EnglishCharacter),
    Chinese(Chinese),
}

impl Frontend {
    pub fn from_config(config: &FrontendConfig) -> anyhow::Result<Self> {
        let frontend = match config {
            FrontendConfig::English {
                dictionary,
                custom_dictionary,
            } => {
                let mut dict = CmuDictionary::open(dictionary).with_context(|| {
                    format!("Failed to load dictionary {}", dictionary.display())
                })?;
                if let Some(custom) = custom_dictionary {
                    let custom_dict = CmuDictionary::open(custom).with_context(|| {
                        format!("Failed to load custom dictionary {}", custom.display())
                    })?;
                    dict.merge(custom_dict);
                }
                info!("Loaded dictionary of {} words", dict.len());
                Self::English(English::new(dict))
            }
            FrontendConfig::EnglishCharacter => Self::EnglishCharacter(EnglishCharacter::new()),
            FrontendConfig::Chinese {
                lexicon,
                traditional,
            } => Self::Chinese(Chinese::open(lexicon, traditional.as_ref())?),
        };
        Ok(frontend)
    }

    fn inner(&self) -> &dyn Phonetics {
        match self {
            Self::English(f) => f,
            Self::EnglishCharacter(f) => f,
            Self::Chinese(f) => f,
        }
    }

    pub fn vocab(&self) -> &Vocab {
        match self {
            Self::English(f) => f.vocab(),
            Self::EnglishCharacter(f) => f.vocab(),
            Self::Chinese(f) => f.vocab(),
        }
    }

    /// Whether a word would be spelled out rather than looked up. Only meaningful for the
    /// dictionary based English front-end.
    pub fn is_oov(&self, word: &str) -> bool {
        match self {
            Self::English(f) => f
                .dictionary()
                .get_pronunciations_normalised(&dict_normalise(word))
                .is_none(),
            _ => false,
        }
    }

    /// Encodes text and splits the ids into sequences no longer than `max_len`, breaking at
    /// sentence ends, then pauses, then word boundaries.
    pub fn encode_chunked(&self, text: &str, max_len: usize) -> Vec<Vec<usize>> {
        // One symbol per id so the split lengths are id counts
        let symbols = self.reverse(&self.encode(text));
        punctuation::split_symbols(&symbols, max_len)
            .iter()
            .map(|chunk| self.numericalize(chunk))
            .filter(|ids| !ids.is_empty())
            .collect()
    }
}

impl Phonetics for Frontend {
    fn phoneticize(&self, text: &str) -> Vec<String> {
        self.inner().phoneticize(text)
    }

    fn numericalize(&self, symbols: &[String]) -> Vec<usize> {
        self.inner().numericalize(symbols)
    }

    fn reverse(&self, ids: &[usize]) -> Vec<String> {
        self.inner().reverse(ids)
    }

    fn vocab_size(&self) -> usize {
        self.inner().vocab_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_selects_frontend() {
        let config: FrontendConfig = serde_yaml::from_str("kind: english_character").unwrap();
        let frontend = Frontend::from_config(&config).unwrap();
        assert!(matches!(frontend, Frontend::EnglishCharacter(_)));
        assert_eq!(frontend.vocab_size(), frontend.vocab().len());

        let config: FrontendConfig =
            serde_yaml::from_str("kind: english\ndictionary: /nonexistent/cmudict").unwrap();
        assert!(Frontend::from_config(&config).is_err());

        assert!(serde_yaml::from_str::<FrontendConfig>("kind: klingon").is_err());
    }

    #[test]
    fn chunked_encoding() {
        let frontend = Frontend::EnglishCharacter(EnglishCharacter::new());
        let text = "one two three. four five six. seven eight nine ten eleven twelve.";
        let chunks = frontend.encode_chunked(text, 12);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, frontend.encode(text).len());

        for max in [5, 12, 14, 20, 27, 40] {
            let chunks = frontend.encode_chunked(text, max);
            assert!(chunks.iter().all(|c| c.len() <= max), "max {}", max);
            assert_eq!(chunks.concat(), frontend.encode(text));
        }
    }
}
