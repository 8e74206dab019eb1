//! Vocabulary coverage of a dataset under a front-end: how often each symbol and symbol pair
//! occurs, which words would be spelled out, and how long the encoded sentences get.
use super::lj_speech::Dataset;
use crate::frontend::{Frontend, Phonetics};
use crate::text_normaliser::{dict_normalise, tokenise, Token};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Sentences longer than this are logged, they're likely to need splitting at synthesis time.
const LONG_SENTENCE: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DiphoneStat {
    pub phones: [String; 2],
    pub count: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub diphones: Vec<DiphoneStat>,
    pub symbols: BTreeMap<String, usize>,
    /// Vocabulary symbols that never occur
    pub unused_symbols: Vec<String>,
    /// Out of vocabulary words
    pub oov: BTreeMap<String, usize>,
    /// Encoded length to number of sentences
    pub sentence_lengths: BTreeMap<usize, usize>,
}

pub struct CoverageGenerator<'a> {
    frontend: &'a Frontend,
    diphones: BTreeMap<[String; 2], usize>,
    symbols: BTreeMap<String, usize>,
    oov: BTreeMap<String, usize>,
    sentence_lengths: BTreeMap<usize, usize>,
}

impl<'a> CoverageGenerator<'a> {
    pub fn new(frontend: &'a Frontend) -> Self {
        Self {
            frontend,
            diphones: BTreeMap::new(),
            symbols: BTreeMap::new(),
            oov: BTreeMap::new(),
            sentence_lengths: BTreeMap::new(),
        }
    }

    fn is_special(&self, symbol: &str) -> bool {
        let vocab = self.frontend.vocab();
        symbol == vocab.start_symbol() || symbol == vocab.end_symbol()
    }

    pub fn push_sentence(&mut self, sentence: &str) {
        let ids = self.frontend.encode(sentence);
        *self.sentence_lengths.entry(ids.len()).or_default() += 1;
        if ids.len() > LONG_SENTENCE {
            info!("Very long sentence found: '{}'", sentence);
        }

        let symbols = self
            .frontend
            .reverse(&ids)
            .into_iter()
            .filter(|x| !self.is_special(x) && !x.trim().is_empty())
            .collect::<Vec<_>>();
        for window in symbols.windows(2) {
            *self
                .diphones
                .entry([window[0].clone(), window[1].clone()])
                .or_default() += 1;
        }
        for symbol in symbols {
            *self.symbols.entry(symbol).or_default() += 1;
        }

        for token in tokenise(sentence) {
            if let Token::Word(word) = token {
                if self.frontend.is_oov(&word) {
                    *self.oov.entry(dict_normalise(&word)).or_default() += 1;
                }
            }
        }
    }

    pub fn push_dataset(&mut self, dataset: &Dataset) {
        for entry in &dataset.entries {
            self.push_sentence(entry.transcript());
        }
    }

    pub fn generate_report(&self) -> Coverage {
        let diphones = self
            .diphones
            .iter()
            .map(|(k, v)| DiphoneStat {
                phones: k.clone(),
                count: *v,
            })
            .collect();

        let unused_symbols = self
            .frontend
            .vocab()
            .symbols()
            .filter(|x| !self.is_special(x) && !x.trim().is_empty())
            .filter(|x| !self.symbols.contains_key(*x))
            .filter(|x| self.frontend.vocab().lookup(x) > self.frontend.vocab().unk_id())
            .map(|x| x.to_string())
            .collect();

        Coverage {
            diphones,
            symbols: self.symbols.clone(),
            unused_symbols,
            oov: self.oov.clone(),
            sentence_lengths: self.sentence_lengths.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{CmuDictionary, English, EnglishCharacter};
    use std::io;

    #[test]
    fn character_coverage() {
        let frontend = Frontend::EnglishCharacter(EnglishCharacter::new());
        let mut generator = CoverageGenerator::new(&frontend);
        generator.push_sentence("abba");
        let report = generator.generate_report();
        assert_eq!(report.symbols["a"], 2);
        assert_eq!(report.symbols["b"], 2);
        let bb = report
            .diphones
            .iter()
            .find(|x| x.phones == ["b".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(bb.count, 1);
        assert!(report.unused_symbols.contains(&"z".to_string()));
        assert!(!report.unused_symbols.contains(&"a".to_string()));
        // <s> a b b a </s>
        assert_eq!(report.sentence_lengths[&6], 1);
        assert!(report.oov.is_empty());
    }

    #[test]
    fn dictionary_oov() {
        let dict = "HELLO  HH AH0 L OW1\nWORLD  W ER1 L D\n";
        let dict = CmuDictionary::from_reader(io::Cursor::new(dict)).unwrap();
        let frontend = Frontend::English(English::new(dict));
        let mut generator = CoverageGenerator::new(&frontend);
        generator.push_sentence("Hello world, hello zyx.");
        let report = generator.generate_report();
        assert_eq!(report.oov.len(), 1);
        assert!(report.oov.contains_key("ZYX"));
        assert_eq!(report.symbols["OW1"], 2);
    }
}
