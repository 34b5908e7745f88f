//! Credential generation and validation.
//!
//! Alphabets omit glyphs that are easy to misread when a credential is
//! copied by hand: `0 O o 1 l I |`.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use hostplane_core::{Error, Result};

pub const MIN_LENGTH: usize = 8;
pub const DEFAULT_LENGTH: usize = 10;

const UPPERCASE: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijkmnpqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"!@#$%^&*-_=+?";

/// A rule a credential failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRule {
    TooShort,
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
}

impl std::fmt::Display for CredentialRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "must be at least {} characters", MIN_LENGTH),
            Self::MissingUppercase => f.write_str("must contain an uppercase letter"),
            Self::MissingLowercase => f.write_str("must contain a lowercase letter"),
            Self::MissingDigit => f.write_str("must contain a digit"),
        }
    }
}

/// Generate a credential of `length` characters with at least one uppercase
/// letter, lowercase letter, digit and symbol.
pub fn generate(length: usize) -> Result<String> {
    if length < MIN_LENGTH {
        return Err(Error::Validation(format!(
            "credential length must be at least {}, got {}",
            MIN_LENGTH, length
        )));
    }

    Ok(compose(length))
}

/// Generate a credential of [`DEFAULT_LENGTH`].
pub fn generate_default() -> String {
    compose(DEFAULT_LENGTH)
}

fn compose(length: usize) -> String {
    let mut rng = OsRng;
    let classes = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS];
    let all: Vec<u8> = classes.concat();

    let mut chars: Vec<u8> = Vec::with_capacity(length);
    for class in classes {
        chars.extend(class.choose(&mut rng));
    }
    while chars.len() < length {
        chars.extend(all.choose(&mut rng));
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Rules `credential` fails, in a stable order. Empty means acceptable.
pub fn validate(credential: &str) -> Vec<CredentialRule> {
    let mut unmet = Vec::new();
    if credential.chars().count() < MIN_LENGTH {
        unmet.push(CredentialRule::TooShort);
    }
    if !credential.chars().any(|c| c.is_ascii_uppercase()) {
        unmet.push(CredentialRule::MissingUppercase);
    }
    if !credential.chars().any(|c| c.is_ascii_lowercase()) {
        unmet.push(CredentialRule::MissingLowercase);
    }
    if !credential.chars().any(|c| c.is_ascii_digit()) {
        unmet.push(CredentialRule::MissingDigit);
    }
    unmet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_class(s: &str, class: &[u8]) -> bool {
        s.bytes().any(|b| class.contains(&b))
    }

    #[test]
    fn test_generate_lengths_and_classes() {
        for len in MIN_LENGTH..=64 {
            for _ in 0..20 {
                let cred = generate(len).unwrap();
                assert_eq!(cred.len(), len);
                assert!(has_class(&cred, UPPERCASE));
                assert!(has_class(&cred, LOWERCASE));
                assert!(has_class(&cred, DIGITS));
                assert!(has_class(&cred, SYMBOLS));
                assert!(validate(&cred).is_empty(), "{:?}", validate(&cred));
            }
        }
    }

    #[test]
    fn test_generate_too_short() {
        assert!(matches!(generate(7), Err(Error::Validation(_))));
        assert!(generate(0).is_err());
    }

    #[test]
    fn test_generate_excludes_confusables() {
        for _ in 0..200 {
            let cred = generate(32).unwrap();
            assert!(!cred.contains(['0', 'O', 'o', '1', 'l', 'I', '|']), "{}", cred);
        }
    }

    #[test]
    fn test_generate_default() {
        let cred = generate_default();
        assert_eq!(cred.len(), DEFAULT_LENGTH);
        assert!(validate(&cred).is_empty());
    }

    #[test]
    fn test_class_positions_vary() {
        // With a fixed prefix pattern the first char would always be uppercase.
        let first_is_upper = (0..200)
            .map(|_| generate(8).unwrap())
            .filter(|c| c.as_bytes()[0].is_ascii_uppercase())
            .count();
        assert!(first_is_upper < 200);
    }

    #[test]
    fn test_validate_reports_each_rule() {
        assert_eq!(
            validate("abc"),
            vec![
                CredentialRule::TooShort,
                CredentialRule::MissingUppercase,
                CredentialRule::MissingDigit,
            ]
        );
        assert_eq!(validate("ABCDEFGH1"), vec![CredentialRule::MissingLowercase]);
        assert!(validate("Abcdefg9").is_empty());
        assert_eq!(validate("").len(), 4);
    }
}
