//! Mandarin front-end. Text is converted to simplified characters, segmented against a pinyin
//! lexicon by forward maximum matching and each matched word replaced with its syllables.
use super::punctuation::{punctuations, Language};
use super::{Phonetics, Vocab};
use anyhow::Context;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

#[derive(Clone, Debug)]
pub struct Chinese {
    lexicon: HashMap<String, Vec<String>>,
    traditional: HashMap<String, String>,
    /// Longest lexicon entry in characters
    max_word_len: usize,
    vocab: Vocab,
}

impl Chinese {
    pub fn open(
        lexicon: impl AsRef<Path>,
        traditional: Option<impl AsRef<Path>>,
    ) -> anyhow::Result<Self> {
        let lexicon = lexicon.as_ref();
        let lexicon = load_lexicon(io::BufReader::new(
            fs::File::open(lexicon)
                .with_context(|| format!("Failed to open lexicon {}", lexicon.display()))?,
        ))?;
        let traditional = match traditional {
            Some(path) => {
                let path = path.as_ref();
                load_traditional(io::BufReader::new(fs::File::open(path).with_context(
                    || format!("Failed to open conversion table {}", path.display()),
                )?))?
            }
            None => HashMap::new(),
        };
        Ok(Self::new(lexicon, traditional))
    }

    pub fn new(
        lexicon: HashMap<String, Vec<String>>,
        traditional: HashMap<String, String>,
    ) -> Self {
        let syllables = lexicon
            .values()
            .flat_map(|x| x.iter().cloned())
            .collect::<BTreeSet<String>>();
        let max_word_len = lexicon
            .keys()
            .map(|x| x.graphemes(true).count())
            .max()
            .unwrap_or(1);
        debug!(
            "Lexicon of {} words, {} syllables",
            lexicon.len(),
            syllables.len()
        );
        let vocab = Vocab::new(
            syllables
                .into_iter()
                .chain(punctuations(Language::Chinese).iter().map(|x| x.to_string())),
        );
        Self {
            lexicon,
            traditional,
            max_word_len,
            vocab,
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Character by character traditional to simplified conversion.
    pub fn simplify(&self, text: &str) -> String {
        text.graphemes(true)
            .map(|g| self.traditional.get(g).map(|x| x.as_str()).unwrap_or(g))
            .collect()
    }

    fn segment(&self, text: &str) -> Vec<String> {
        let chars = text
            .graphemes(true)
            .filter(|g| !g.trim().is_empty())
            .collect::<Vec<_>>();
        let mut res = vec![];
        let mut i = 0;
        while i < chars.len() {
            let longest = self.max_word_len.min(chars.len() - i);
            let matched = (1..=longest).rev().find_map(|len| {
                self.lexicon
                    .get(&chars[i..i + len].concat())
                    .map(|syllables| (len, syllables))
            });
            match matched {
                Some((len, syllables)) => {
                    res.extend(syllables.iter().cloned());
                    i += len;
                }
                None => {
                    res.push(chars[i].to_string());
                    i += 1;
                }
            }
        }
        res
    }

    /// Keeps symbols in the vocabulary, anything else is broken into characters and only the
    /// characters the vocabulary knows survive.
    fn filter_symbols(&self, symbols: Vec<String>) -> Vec<String> {
        let mut cleaned = vec![];
        for item in symbols {
            if self.vocab.contains(&item) {
                cleaned.push(item);
                continue;
            }
            let before = cleaned.len();
            for c in item.graphemes(true) {
                if self.vocab.contains(c) {
                    cleaned.push(c.to_string());
                }
            }
            if cleaned.len() == before {
                warn!("Dropping '{}' with no pronunciation", item);
            }
        }
        cleaned
    }
}

impl Phonetics for Chinese {
    fn phoneticize(&self, text: &str) -> Vec<String> {
        let simplified = self.simplify(text);
        let mut symbols = vec![self.vocab.start_symbol().to_string()];
        symbols.extend(self.segment(&simplified));
        symbols.push(self.vocab.end_symbol().to_string());
        self.filter_symbols(symbols)
    }

    fn numericalize(&self, symbols: &[String]) -> Vec<usize> {
        symbols.iter().map(|x| self.vocab.lookup(x)).collect()
    }

    fn reverse(&self, ids: &[usize]) -> Vec<String> {
        ids.iter().map(|i| self.vocab.reverse(*i).to_string()).collect()
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}

/// Reads `word syllable syllable ...` lines, blank lines and `#` comments are skipped.
pub fn load_lexicon(reader: impl BufRead) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut lexicon = HashMap::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let word = parts.next().map(|x| x.to_string());
        let syllables = parts.map(|x| x.to_string()).collect::<Vec<_>>();
        match word {
            Some(word) if !syllables.is_empty() => {
                lexicon.entry(word).or_insert(syllables);
            }
            _ => warn!("Lexicon line {} has no pronunciation: '{}'", i + 1, line),
        }
    }
    Ok(lexicon)
}

/// Reads `traditional simplified` pairs, one per line.
pub fn load_traditional(reader: impl BufRead) -> anyhow::Result<HashMap<String, String>> {
    let mut table = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let (Some(from), Some(to)) = (parts.next(), parts.next()) {
            table.insert(from.to_string(), to.to_string());
        }
    }
    Ok(table)
}
