use super::punctuation::{punctuations, Language};
use super::{Phonetics, Vocab};
use crate::text_normaliser::{tokenise, Token};

const GRAPHEMES: &str = "abcdefghijklmnopqrstuvwxyz";

/// Character input for models trained directly on text. Symbols are normalised lower case words,
/// turned into ids a character at a time.
#[derive(Clone, Debug)]
pub struct EnglishCharacter {
    vocab: Vocab,
}

impl Default for EnglishCharacter {
    fn default() -> Self {
        Self::new()
    }
}

impl EnglishCharacter {
    pub fn new() -> Self {
        let vocab = Vocab::new(
            GRAPHEMES
                .chars()
                .map(|c| c.to_string())
                .chain(punctuations(Language::English).iter().map(|x| x.to_string())),
        );
        Self { vocab }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }
}

impl Phonetics for EnglishCharacter {
    fn phoneticize(&self, text: &str) -> Vec<String> {
        let mut words = vec![self.vocab.start_symbol().to_string()];
        for (i, token) in tokenise(text).iter().enumerate() {
            if i > 0 {
                words.push(" ".to_string());
            }
            match token {
                Token::Word(w) => words.push(w.to_lowercase()),
                Token::Punct(p) => words.push(p.symbol(Language::English).to_string()),
            }
        }
        words.push(self.vocab.end_symbol().to_string());
        words
    }

    /// Whole symbols in the vocabulary map directly, anything else is mapped character by
    /// character with characters outside the vocabulary dropped.
    fn numericalize(&self, symbols: &[String]) -> Vec<usize> {
        let mut ids = vec![];
        for symbol in symbols {
            if self.vocab.contains(symbol) {
                ids.push(self.vocab.lookup(symbol));
                continue;
            }
            for c in symbol.chars() {
                let c = c.encode_utf8(&mut [0; 4]).to_string();
                if self.vocab.contains(&c) {
                    ids.push(self.vocab.lookup(&c));
                }
            }
        }
        ids
    }

    fn reverse(&self, ids: &[usize]) -> Vec<String> {
        ids.iter().map(|i| self.vocab.reverse(*i).to_string()).collect()
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}
