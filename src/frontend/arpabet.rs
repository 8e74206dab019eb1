//! ARPABET phones as used by the CMU pronouncing dictionary. A phone is written as the 1 or 2
//! letter phone name optionally followed by a stress digit, e.g. `AH0`, `N`, `EY1`.
//!
//! For the sounds themselves see [wikipedia](https://en.wikipedia.org/wiki/ARPABET), the example
//! words below may not match depending on your accent.
use anyhow::Error;
use std::fmt;
use std::str::FromStr;

/// Pronunciation of a single word.
pub type Pronunciation = Vec<PhoneticUnit>;

/// A phone along with the stress it's spoken with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PhoneticUnit {
    pub phone: ArpaPhone,
    /// Only vowels carry stress in the dictionary
    pub stress: Option<Stress>,
}

impl PhoneticUnit {
    /// Every symbol that can appear in a dictionary pronunciation, vowels in all three stresses
    /// and consonants bare. This is the phone part of the English vocabulary.
    pub fn all_symbols() -> Vec<String> {
        let mut res = vec![];
        for phone in ArpaPhone::ALL {
            if phone.is_vowel() {
                for stress in [Stress::None, Stress::Primary, Stress::Secondary] {
                    res.push(
                        PhoneticUnit {
                            phone,
                            stress: Some(stress),
                        }
                        .to_string(),
                    );
                }
            } else {
                res.push(phone.to_string());
            }
        }
        res
    }
}

impl fmt::Display for PhoneticUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.phone)?;
        match self.stress {
            Some(stress) => write!(f, "{}", stress),
            None => Ok(()),
        }
    }
}

impl FromStr for PhoneticUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("no symbols provided");
        }
        if s.len() > 3 || !s.is_ascii() {
            anyhow::bail!("'{}' is too long to be a phone", s);
        }
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(s.len());
        let phone = ArpaPhone::from_str(&s[..split])?;
        let stress = if split == s.len() {
            None
        } else {
            Some(Stress::from_str(&s[split..])?)
        };
        Ok(Self { phone, stress })
    }
}

/// Lexical stress of a vowel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Stress {
    None,
    Primary,
    Secondary,
}

impl fmt::Display for Stress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(f, "0"),
            Self::Primary => write!(f, "1"),
            Self::Secondary => write!(f, "2"),
        }
    }
}

impl FromStr for Stress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Self::None),
            "1" => Ok(Self::Primary),
            "2" => Ok(Self::Secondary),
            _ => Err(Error::msg("invalid stress").context(format!("{} is not a stress marker", s))),
        }
    }
}

/// The 39 phones of 2 letter ARPABET used in CMU dict.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ArpaPhone {
    /// "al" in "balm"
    Aa,
    /// "a" in "bat"
    Ae,
    /// "u" in "butt"
    Ah,
    /// "o" in "story"
    Ao,
    /// "ou" in "bout"
    Aw,
    /// "i" in "bite"
    Ay,
    B,
    /// "ch" in "china"
    Ch,
    D,
    /// "th" in "father"
    Dh,
    /// "e" in "bet"
    Eh,
    /// "ir" in "bird"
    Er,
    /// "ai" in "bait"
    Ey,
    F,
    G,
    Hh,
    /// "i" in "bit"
    Ih,
    /// "ea" in "beat"
    Iy,
    /// "j" in "jive"
    Jh,
    K,
    L,
    M,
    N,
    /// "ng" in "sing"
    Ng,
    /// "oa" in "boat"
    Ow,
    /// "oy" in "boy"
    Oy,
    P,
    R,
    S,
    /// "sh" in "shy"
    Sh,
    T,
    /// "th" in "thigh"
    Th,
    /// "oo" in "book"
    Uh,
    /// "oo" in "boot"
    Uw,
    V,
    W,
    Y,
    Z,
    /// "s" in "pleasure"
    Zh,
}

impl ArpaPhone {
    pub const ALL: [ArpaPhone; 39] = [
        Self::Aa,
        Self::Ae,
        Self::Ah,
        Self::Ao,
        Self::Aw,
        Self::Ay,
        Self::B,
        Self::Ch,
        Self::D,
        Self::Dh,
        Self::Eh,
        Self::Er,
        Self::Ey,
        Self::F,
        Self::G,
        Self::Hh,
        Self::Ih,
        Self::Iy,
        Self::Jh,
        Self::K,
        Self::L,
        Self::M,
        Self::N,
        Self::Ng,
        Self::Ow,
        Self::Oy,
        Self::P,
        Self::R,
        Self::S,
        Self::Sh,
        Self::T,
        Self::Th,
        Self::Uh,
        Self::Uw,
        Self::V,
        Self::W,
        Self::Y,
        Self::Z,
        Self::Zh,
    ];

    pub fn is_vowel(&self) -> bool {
        matches!(
            self,
            Self::Aa
                | Self::Ae
                | Self::Ah
                | Self::Ao
                | Self::Aw
                | Self::Ay
                | Self::Eh
                | Self::Er
                | Self::Ey
                | Self::Ih
                | Self::Iy
                | Self::Ow
                | Self::Oy
                | Self::Uh
                | Self::Uw
        )
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Aa => "AA",
            Self::Ae => "AE",
            Self::Ah => "AH",
            Self::Ao => "AO",
            Self::Aw => "AW",
            Self::Ay => "AY",
            Self::B => "B",
            Self::Ch => "CH",
            Self::D => "D",
            Self::Dh => "DH",
            Self::Eh => "EH",
            Self::Er => "ER",
            Self::Ey => "EY",
            Self::F => "F",
            Self::G => "G",
            Self::Hh => "HH",
            Self::Ih => "IH",
            Self::Iy => "IY",
            Self::Jh => "JH",
            Self::K => "K",
            Self::L => "L",
            Self::M => "M",
            Self::N => "N",
            Self::Ng => "NG",
            Self::Ow => "OW",
            Self::Oy => "OY",
            Self::P => "P",
            Self::R => "R",
            Self::S => "S",
            Self::Sh => "SH",
            Self::T => "T",
            Self::Th => "TH",
            Self::Uh => "UH",
            Self::Uw => "UW",
            Self::V => "V",
            Self::W => "W",
            Self::Y => "Y",
            Self::Z => "Z",
            Self::Zh => "ZH",
        }
    }
}

impl fmt::Display for ArpaPhone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for ArpaPhone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|phone| phone.symbol() == s)
            .copied()
            .ok_or_else(|| {
                Error::msg("invalid phone").context(format!("{} is not a valid ARPABET phone", s))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_phones() {
        let unit = PhoneticUnit::from_str("EY1").unwrap();
        assert_eq!(unit.phone, ArpaPhone::Ey);
        assert_eq!(unit.stress, Some(Stress::Primary));

        let unit = PhoneticUnit::from_str("N").unwrap();
        assert_eq!(unit.phone, ArpaPhone::N);
        assert_eq!(unit.stress, None);

        assert!(PhoneticUnit::from_str("QQ").is_err());
        assert!(PhoneticUnit::from_str("AH7").is_err());
        assert!(PhoneticUnit::from_str("").is_err());
    }

    #[test]
    fn symbols_round_trip() {
        let symbols = PhoneticUnit::all_symbols();
        // 15 vowels in 3 stresses and 24 consonants
        assert_eq!(symbols.len(), 15 * 3 + 24);
        for symbol in &symbols {
            assert_eq!(&PhoneticUnit::from_str(symbol).unwrap().to_string(), symbol);
        }
    }
}
