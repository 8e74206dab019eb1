use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PADDING: &str = "<pad>";
pub const UNKNOWN: &str = "<unk>";
pub const START: &str = "<s>";
pub const END: &str = "</s>";

/// Bidirectional mapping between symbols and ids. The special symbols always come first so
/// padding is id 0 in every vocabulary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocab {
    symbols: Vec<String>,
    stoi: HashMap<String, usize>,
}

impl Vocab {
    /// Builds a vocabulary from the given symbols, duplicates (including repeats of the special
    /// symbols) keep their first id.
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            symbols: vec![],
            stoi: HashMap::new(),
        };
        for special in [PADDING, UNKNOWN, START, END] {
            vocab.push(special.to_string());
        }
        for symbol in symbols {
            vocab.push(symbol.into());
        }
        vocab
    }

    fn push(&mut self, symbol: String) {
        if !self.stoi.contains_key(&symbol) {
            self.stoi.insert(symbol.clone(), self.symbols.len());
            self.symbols.push(symbol);
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.stoi.contains_key(symbol)
    }

    /// Id of the symbol, unknown symbols map to the id of `<unk>`.
    pub fn lookup(&self, symbol: &str) -> usize {
        self.stoi
            .get(symbol)
            .copied()
            .unwrap_or_else(|| self.unk_id())
    }

    /// Symbol for an id, ids past the end come back as `<unk>`.
    pub fn reverse(&self, id: usize) -> &str {
        self.symbols
            .get(id)
            .map(|x| x.as_str())
            .unwrap_or(UNKNOWN)
    }

    pub fn padding_id(&self) -> usize {
        0
    }

    pub fn unk_id(&self) -> usize {
        1
    }

    pub fn start_symbol(&self) -> &str {
        START
    }

    pub fn end_symbol(&self) -> &str {
        END
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(|x| x.as_str())
    }
}

impl From<Vec<String>> for Vocab {
    fn from(symbols: Vec<String>) -> Self {
        Self::new(symbols)
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_come_first() {
        let vocab = Vocab::new(["a", "b", "<pad>", "a"]);
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.lookup(PADDING), 0);
        assert_eq!(vocab.lookup(UNKNOWN), 1);
        assert_eq!(vocab.lookup(START), 2);
        assert_eq!(vocab.lookup(END), 3);
        assert_eq!(vocab.lookup("a"), 4);
        assert_eq!(vocab.lookup("b"), 5);
    }

    #[test]
    fn unknowns() {
        let vocab = Vocab::new(["a"]);
        assert_eq!(vocab.lookup("zzz"), vocab.unk_id());
        assert_eq!(vocab.reverse(4), "a");
        assert_eq!(vocab.reverse(100), UNKNOWN);
        assert!(!vocab.contains("zzz"));
    }

    #[test]
    fn serialises_as_list() {
        let vocab = Vocab::new(["x", "y"]);
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["<pad>","<unk>","<s>","</s>","x","y"]"#);
        let back: Vocab = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vocab);
    }
}
