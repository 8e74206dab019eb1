//! Text normalisation shared by the English front-ends. Input is folded to ASCII, numbers are
//! written out as words and the text is split into words and punctuation tokens.
use crate::frontend::punctuation::Punctuation;
use deunicode::deunicode;
use num2words::Num2Words;
use once_cell::sync::OnceCell;
use regex::{Captures, Regex};
use std::str::FromStr;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Punct(Punctuation),
}

/// Dictionary key form of a word with the `(N)` alternative pronunciation markers of CMU dict
/// removed.
pub fn dict_normalise(x: &str) -> String {
    static VERSION_REGEX: OnceCell<Regex> = OnceCell::new();
    let version_regex = VERSION_REGEX.get_or_init(|| Regex::new(r#"\(\d+\)$"#).unwrap());

    normalise_text(&version_regex.replace_all(x, ""))
}

/// Dictionary key form of a word: ASCII, upper case and without punctuation.
pub fn normalise_text(x: &str) -> String {
    let mut s = deunicode(x);
    s.retain(valid_char);
    s.make_ascii_uppercase();

    s
}

fn valid_char(x: char) -> bool {
    !r#"!"£$%^&*()-_=+[{]};:'@#~,<.>/?|\`¬"#.contains(x)
}

fn number_to_words(digits: &str) -> String {
    let words = digits
        .parse::<i64>()
        .ok()
        .and_then(|n| Num2Words::new(n).to_words().ok());
    match words {
        Some(words) => words.replace('-', " ").replace(',', ""),
        None => {
            warn!("Unable to convert {} to words, reading digits", digits);
            digits
                .chars()
                .filter_map(|c| c.to_digit(10))
                .filter_map(|d| Num2Words::new(d as i64).to_words().ok())
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

/// Replaces every run of digits with its English reading. Thousands separators are removed first
/// so `1,000` reads as a single number.
pub fn expand_numbers(x: &str) -> String {
    static SEPARATOR_REGEX: OnceCell<Regex> = OnceCell::new();
    static NUMBER_REGEX: OnceCell<Regex> = OnceCell::new();
    let separator_regex =
        SEPARATOR_REGEX.get_or_init(|| Regex::new(r#"(\d),(\d{3})"#).unwrap());
    let number_regex = NUMBER_REGEX.get_or_init(|| Regex::new(r#"\d+"#).unwrap());

    let x = separator_regex.replace_all(x, "$1$2");
    number_regex
        .replace_all(&x, |caps: &Captures| format!(" {} ", number_to_words(&caps[0])))
        .to_string()
}

/// Splits text into words and punctuation. Apostrophes inside a word are kept, anything else that
/// isn't a letter, digit or known punctuation mark is treated as a word boundary.
pub fn tokenise(x: &str) -> Vec<Token> {
    let text = expand_numbers(&deunicode(x));
    let mut tokens = vec![];
    let mut word = String::new();
    let mut chars = text.chars().peekable();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word)));
        }
    };

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || (c == '\'' && !word.is_empty()) {
            word.push(c);
            continue;
        }
        flush(&mut word, &mut tokens);
        if c == '.' && chars.peek() == Some(&'.') {
            while chars.peek() == Some(&'.') {
                chars.next();
            }
            tokens.push(Token::Punct(Punctuation::Ellipsis));
        } else if let Ok(p) = Punctuation::from_str(c.encode_utf8(&mut [0; 4])) {
            tokens.push(Token::Punct(p));
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_removal() {
        assert_eq!(dict_normalise("BATH(2)"), "BATH");
        assert_eq!(dict_normalise("HELLO!(45)"), "HELLO");
        assert_eq!(normalise_text("(3)d"), "3D");
        assert_eq!(normalise_text("don't"), "DONT");
    }

    #[test]
    fn numbers_become_words() {
        assert_eq!(
            expand_numbers("I have 21 cats").split_whitespace().collect::<Vec<_>>(),
            vec!["I", "have", "twenty", "one", "cats"]
        );
        let thousand = expand_numbers("1,000");
        assert_eq!(thousand.trim(), "one thousand");
    }

    #[test]
    fn tokens() {
        let tokens = tokenise("Hello, world... it's   me!");
        assert_eq!(
            tokens,
            vec![
                Token::Word("Hello".to_string()),
                Token::Punct(Punctuation::Comma),
                Token::Word("world".to_string()),
                Token::Punct(Punctuation::Ellipsis),
                Token::Word("it's".to_string()),
                Token::Word("me".to_string()),
                Token::Punct(Punctuation::ExclamationMark),
            ]
        );
    }

    #[test]
    fn unicode_folded() {
        let tokens = tokenise("Café «au» lait");
        assert_eq!(tokens[0], Token::Word("Cafe".to_string()));
        assert_eq!(tokens.len(), 3);
    }
}
