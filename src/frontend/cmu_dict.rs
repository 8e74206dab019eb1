//! The CMU pronouncing dictionary, a map from upper case word to one or more ARPABET
//! pronunciations. We don't try to pick between pronunciations of words with the same spelling,
//! that would need the context the word appears in, so the first listed pronunciation is used.
use super::arpabet::*;
use crate::text_normaliser::*;
use std::collections::{btree_map, BTreeMap};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::str::FromStr;
use tracing::{error, warn};

#[derive(Debug, Default, Clone)]
pub struct CmuDictionary {
    dictionary: BTreeMap<String, Vec<Pronunciation>>,
}

impl CmuDictionary {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let reader = io::BufReader::new(file);
        Self::from_reader(reader)
    }

    /// Merge in another dictionary, such as a list of custom pronunciations kept in a separate
    /// file. Pronunciations already present aren't duplicated.
    pub fn merge(&mut self, other: CmuDictionary) {
        for (k, mut v) in other.dictionary.into_iter() {
            let pronunciations = self.dictionary.entry(k).or_default();
            for pronunc in v.drain(..) {
                if !pronunciations.contains(&pronunc) {
                    pronunciations.push(pronunc);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.dictionary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses the dictionary text format, `WORD  PH1 PH2 ...` with `;;;` comment lines. Entries
    /// with phones we can't parse are logged and skipped.
    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut dictionary: BTreeMap<String, Vec<Pronunciation>> = BTreeMap::new();

        'outer: for line in reader.lines() {
            let line = line?;
            if line.starts_with(";;;") {
                continue;
            }
            let mut data = line.splitn(2, "  ");
            let word = match data.next() {
                Some(s) => dict_normalise(s),
                None => continue,
            };
            let phonemes = match data.next() {
                Some(s) => s.split(' '),
                None => continue,
            };
            let mut pronounce = vec![];
            for (i, phone) in phonemes
                .filter(|x| !x.is_empty())
                .map(PhoneticUnit::from_str)
                .enumerate()
            {
                match phone {
                    Ok(s) => pronounce.push(s),
                    Err(e) => {
                        error!("Unable to parse phone {}: {} for word: {}", i, e, word);
                        continue 'outer;
                    }
                }
            }
            dictionary.entry(word).or_default().push(pronounce);
        }
        Ok(Self { dictionary })
    }

    /// Lookup for a word already in dictionary key form.
    pub fn get_pronunciations_normalised(&self, word: &str) -> Option<&Vec<Pronunciation>> {
        self.dictionary.get(word)
    }

    pub fn get_pronunciations(&self, word: &str) -> Option<&Vec<Pronunciation>> {
        self.get_pronunciations_normalised(&normalise_text(word))
    }

    /// The first pronunciation of a word.
    pub fn pronounce(&self, word: &str) -> Option<&Pronunciation> {
        self.get_pronunciations(word).and_then(|x| x.first())
    }

    /// Spells a word out letter by letter using the dictionary's entries for single letters.
    /// Letters the dictionary doesn't know are skipped.
    pub fn spell(&self, word: &str) -> Pronunciation {
        let mut res = vec![];
        for letter in normalise_text(word).chars().filter(|c| c.is_ascii_alphabetic()) {
            match self.pronounce(letter.encode_utf8(&mut [0; 4])) {
                Some(p) => res.extend_from_slice(p),
                None => warn!("No pronunciation for letter {}", letter),
            }
        }
        res
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<Pronunciation>> {
        self.dictionary.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_merge() {
        let cursor = io::Cursor::new("RUSTNATION  R AH1 S T N EY1 SH AH0 N\nRUST  R AH1 S T");

        let mut base = CmuDictionary::from_reader(io::BufReader::new(cursor)).unwrap();

        let cursor = io::Cursor::new(
            "RUSTNATION  R AH1 S T N EY1 SH AH0 N\n\
             RUSTNATION(1)  R AH1 S N EY1 SH AH0 N\n\
             UST  UH1 S T",
        );

        let to_merge = CmuDictionary::from_reader(io::BufReader::new(cursor)).unwrap();

        assert_eq!(base.len(), 2);
        assert_eq!(base.get_pronunciations("RUSTNATION").unwrap().len(), 1);
        assert_eq!(base.get_pronunciations("rust").unwrap().len(), 1);
        assert_eq!(base.get_pronunciations("UST"), None);
        assert_eq!(to_merge.len(), 2);
        assert_eq!(to_merge.get_pronunciations("RUSTNATION").unwrap().len(), 2);

        base.merge(to_merge);
        assert_eq!(base.len(), 3);
        assert_eq!(base.get_pronunciations("RUSTNATION").unwrap().len(), 2);
        assert_eq!(base.get_pronunciations("UST").unwrap().len(), 1);
    }

    #[test]
    fn bad_entries_skipped() {
        let cursor = io::Cursor::new(";;; comment\nGOOD  G UH1 D\nBAD  B XX1 D\n");
        let dict = CmuDictionary::from_reader(io::BufReader::new(cursor)).unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.pronounce("good").unwrap().len(), 3);
    }

    #[test]
    fn spelling() {
        let cursor = io::Cursor::new("A  EY1\nB  B IY1\n");
        let dict = CmuDictionary::from_reader(io::BufReader::new(cursor)).unwrap();
        let spelt = dict.spell("abz");
        let spelt = spelt.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        assert_eq!(spelt, vec!["EY1", "B", "IY1"]);
    }
}
