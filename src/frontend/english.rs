use super::arpabet::PhoneticUnit;
use super::cmu_dict::CmuDictionary;
use super::punctuation::{punctuations, Language};
use super::{Phonetics, Vocab};
use crate::text_normaliser::{tokenise, Token};
use tracing::{debug, warn};

/// English grapheme to phoneme conversion through the CMU dictionary. Words the dictionary
/// doesn't know are spelled out letter by letter.
#[derive(Clone, Debug)]
pub struct English {
    dictionary: CmuDictionary,
    vocab: Vocab,
}

impl English {
    pub fn new(dictionary: CmuDictionary) -> Self {
        let vocab = Vocab::new(
            PhoneticUnit::all_symbols()
                .into_iter()
                .chain(punctuations(Language::English).iter().map(|x| x.to_string())),
        );
        Self { dictionary, vocab }
    }

    pub fn dictionary(&self) -> &CmuDictionary {
        &self.dictionary
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn pronounce_word(&self, word: &str) -> Vec<String> {
        match self.dictionary.pronounce(word) {
            Some(p) => p.iter().map(|x| x.to_string()).collect(),
            None => {
                debug!("{} not in dictionary, spelling it out", word);
                self.dictionary
                    .spell(word)
                    .iter()
                    .map(|x| x.to_string())
                    .collect()
            }
        }
    }
}

impl Phonetics for English {
    fn phoneticize(&self, text: &str) -> Vec<String> {
        let mut phones = vec![self.vocab.start_symbol().to_string()];
        for (i, token) in tokenise(text).iter().enumerate() {
            if i > 0 {
                phones.push(" ".to_string());
            }
            match token {
                Token::Word(w) => phones.extend(self.pronounce_word(w)),
                Token::Punct(p) => phones.push(p.symbol(Language::English).to_string()),
            }
        }
        phones.push(self.vocab.end_symbol().to_string());
        phones
    }

    fn numericalize(&self, symbols: &[String]) -> Vec<usize> {
        symbols
            .iter()
            .filter_map(|s| {
                if self.vocab.contains(s) {
                    Some(self.vocab.lookup(s))
                } else {
                    warn!("Dropping symbol '{}' not in the vocabulary", s);
                    None
                }
            })
            .collect()
    }

    fn reverse(&self, ids: &[usize]) -> Vec<String> {
        ids.iter().map(|i| self.vocab.reverse(*i).to_string()).collect()
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn frontend() -> English {
        let dict = "HELLO  HH AH0 L OW1\nWORLD  W ER1 L D\nX  EH1 K S\nY  W AY1\n";
        let dict = CmuDictionary::from_reader(io::BufReader::new(io::Cursor::new(dict))).unwrap();
        English::new(dict)
    }

    #[test]
    fn hello_world() {
        let frontend = frontend();
        let phones = frontend.phoneticize("Hello, world!");
        assert_eq!(
            phones,
            vec![
                "<s>", "HH", "AH0", "L", "OW1", " ", ",", " ", "W", "ER1", "L", "D", " ", "!",
                "</s>"
            ]
        );
        let ids = frontend.numericalize(&phones);
        assert_eq!(ids.len(), phones.len());
        assert_eq!(frontend.reverse(&ids), phones);
        assert_eq!(frontend.encode("Hello, world!"), ids);
    }

    #[test]
    fn out_of_vocabulary_spelled() {
        let frontend = frontend();
        let phones = frontend.phoneticize("xy");
        assert_eq!(phones, vec!["<s>", "EH1", "K", "S", "W", "AY1", "</s>"]);
    }

    #[test]
    fn unknown_symbols_dropped() {
        let frontend = frontend();
        let symbols = vec!["HH".to_string(), "@@".to_string(), "OW1".to_string()];
        let ids = frontend.numericalize(&symbols);
        assert_eq!(frontend.reverse(&ids), vec!["HH", "OW1"]);
        assert_eq!(frontend.vocab_size(), 4 + 15 * 3 + 24 + 7);
    }
}
