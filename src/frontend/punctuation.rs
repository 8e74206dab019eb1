//! Punctuation kept as tokens by the front-ends, plus how strongly each mark suggests a break when
//! a long input has to be split.
use std::fmt;
use std::str::FromStr;

/// Language a set of punctuation belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Language {
    English,
    Chinese,
}

const ENGLISH: &[&str] = &[" ", "-", "...", ",", ".", "?", "!"];

const CHINESE: &[&str] = &["、", "，", "；", "：", "。", "？", "！"];

/// The punctuation symbols that make it into a vocabulary.
pub fn punctuations(language: Language) -> &'static [&'static str] {
    match language {
        Language::English => ENGLISH,
        Language::Chinese => CHINESE,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Punctuation {
    FullStop,
    Comma,
    QuestionMark,
    ExclamationMark,
    Dash,
    Ellipsis,
    Colon,
    SemiColon,
    /// The enumeration comma `、`
    ListComma,
}

impl Punctuation {
    pub fn is_sentence_end(&self) -> bool {
        matches!(
            self,
            Self::FullStop | Self::QuestionMark | Self::ExclamationMark
        )
    }

    pub fn is_pause(&self) -> bool {
        self.is_sentence_end()
            || matches!(
                self,
                Self::Comma | Self::SemiColon | Self::Colon | Self::Ellipsis | Self::ListComma
            )
    }

    /// The mark as written in the given language.
    pub fn symbol(&self, language: Language) -> &'static str {
        match (language, self) {
            (Language::English, Self::FullStop) => ".",
            (Language::English, Self::Comma) => ",",
            (Language::English, Self::QuestionMark) => "?",
            (Language::English, Self::ExclamationMark) => "!",
            (Language::English, Self::Dash) => "-",
            (Language::English, Self::Ellipsis) => "...",
            (Language::English, Self::Colon) => ",",
            (Language::English, Self::SemiColon) => ",",
            (Language::English, Self::ListComma) => ",",
            (Language::Chinese, Self::FullStop) => "。",
            (Language::Chinese, Self::Comma) => "，",
            (Language::Chinese, Self::QuestionMark) => "？",
            (Language::Chinese, Self::ExclamationMark) => "！",
            (Language::Chinese, Self::Dash) => "，",
            (Language::Chinese, Self::Ellipsis) => "，",
            (Language::Chinese, Self::Colon) => "：",
            (Language::Chinese, Self::SemiColon) => "；",
            (Language::Chinese, Self::ListComma) => "、",
        }
    }
}

impl fmt::Display for Punctuation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.symbol(Language::English))
    }
}

impl FromStr for Punctuation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let res = match s.trim() {
            "." | "。" => Self::FullStop,
            "," | "，" => Self::Comma,
            "?" | "？" => Self::QuestionMark,
            "!" | "！" => Self::ExclamationMark,
            "-" | "—" => Self::Dash,
            "..." | "…" => Self::Ellipsis,
            ":" | "：" => Self::Colon,
            ";" | "；" => Self::SemiColon,
            "、" => Self::ListComma,
            _ => anyhow::bail!("Invalid punctuation: {}", s),
        };
        Ok(res)
    }
}

/// How good a place a symbol is to split a long input, higher is better and 0 means never.
pub fn split_score(symbol: &str) -> usize {
    if symbol == " " {
        return 1;
    }
    match Punctuation::from_str(symbol) {
        Ok(p) if p.is_sentence_end() => 3,
        Ok(p) if p.is_pause() => 2,
        _ => 0,
    }
}

/// Finds indexes to split a symbol sequence after so no piece is longer than `max_size`. Within
/// each stretch of `max_size` symbols the best split wins: sentence ends, then pauses, then word
/// boundaries, the latest one on a tie so short sentences stay together. A stretch with nowhere to
/// split is cut at the limit.
pub fn find_splits(symbols: &[String], max_size: usize) -> Vec<usize> {
    let max_size = max_size.max(1);
    let mut splits = vec![];
    let mut start = 0;
    while symbols.len() - start > max_size {
        let window = start..start + max_size;
        let best = symbols[window.clone()]
            .iter()
            .zip(window)
            .map(|(x, i)| (split_score(x), i))
            .filter(|(score, _)| *score > 0)
            .max();
        let split = match best {
            Some((_, i)) => i,
            None => start + max_size - 1,
        };
        splits.push(split);
        start = split + 1;
    }
    splits
}

/// Splits the symbols into chunks after each split point, the splitting symbol ends the chunk it
/// closes.
pub fn split_symbols(symbols: &[String], max_size: usize) -> Vec<Vec<String>> {
    let mut chunks = vec![];
    let mut start = 0;
    for split in find_splits(symbols, max_size) {
        chunks.push(symbols[start..=split].to_vec());
        start = split + 1;
    }
    if start < symbols.len() {
        chunks.push(symbols[start..].to_vec());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(text: &str) -> Vec<String> {
        text.chars().map(|c| c.to_string()).collect()
    }

    #[test]
    fn punctuation_parse() {
        assert_eq!(Punctuation::from_str("。").unwrap(), Punctuation::FullStop);
        assert_eq!(Punctuation::from_str("...").unwrap(), Punctuation::Ellipsis);
        assert!(Punctuation::from_str("a").is_err());
        assert_eq!(Punctuation::SemiColon.symbol(Language::Chinese), "；");
        for symbol in punctuations(Language::Chinese) {
            assert!(Punctuation::from_str(symbol).is_ok());
        }
    }

    #[test]
    fn split_on_sentences_first() {
        let units = symbols("a b c d. e f g h. i j k l m n o p");
        let splits = find_splits(&units, 10);

        assert_eq!(splits.len(), 3);
        assert_eq!(units[splits[0]], ".");
        assert_eq!(units[splits[1]], ".");
        assert!(splits[2] > splits[1] && splits[2] < splits[1] + 11);
        assert_eq!(units[splits[2]], " ");
    }

    #[test]
    fn chunks_cover_input() {
        let units = symbols("a b c d. e f g h. i j k l m n o p");
        let chunks = split_symbols(&units, 10);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), units);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        assert_eq!(chunks[0].last().unwrap(), ".");

        let short = symbols("hi.");
        assert_eq!(split_symbols(&short, 10), vec![short]);
    }

    #[test]
    fn chunks_never_exceed_limit() {
        let texts = [
            "ab. cd. ef. gh.",
            "one two three. four five six, seven eight nine; ten eleven twelve.",
            "abcdefghijklmnopqrstuvwxyz",
            "a, b, c, d, e, f, g, h, i, j, k.",
        ];
        for text in texts {
            let units = symbols(text);
            for max in 1..=units.len() + 1 {
                let chunks = split_symbols(&units, max);
                assert_eq!(chunks.concat(), units, "{} at {}", text, max);
                assert!(
                    chunks.iter().all(|c| !c.is_empty() && c.len() <= max),
                    "{} at {}: {:?}",
                    text,
                    max,
                    chunks.iter().map(|c| c.len()).collect::<Vec<_>>()
                );
            }
        }
        let lengths = split_symbols(&symbols("ab. cd. ef. gh."), 6)
            .iter()
            .map(|c| c.len())
            .collect::<Vec<_>>();
        assert_eq!(lengths, vec![3, 4, 4, 4]);
    }
}
