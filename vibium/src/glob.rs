//! URL glob patterns for network interception.
//!
//! `*` matches within one path segment, `**` matches any run of characters
//! including `/`, `?` matches exactly one character. Everything else matches
//! literally.

use std::fmt;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Lit(char),
    AnyChar,
    Star,
    GlobStar,
}

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    raw: String,
    tokens: Vec<Tok>,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(EngineError::invalid("empty URL pattern"));
        }
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        tokens.push(Tok::GlobStar);
                    } else {
                        tokens.push(Tok::Star);
                    }
                }
                '?' => tokens.push(Tok::AnyChar),
                c => tokens.push(Tok::Lit(c)),
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, url: &str) -> bool {
        let text: Vec<char> = url.chars().collect();
        matches_at(&self.tokens, &text)
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

fn matches_at(pat: &[Tok], text: &[char]) -> bool {
    match pat.first() {
        None => text.is_empty(),
        Some(Tok::Lit(c)) => text.first() == Some(c) && matches_at(&pat[1..], &text[1..]),
        Some(Tok::AnyChar) => !text.is_empty() && matches_at(&pat[1..], &text[1..]),
        Some(Tok::Star) => {
            // zero or more characters within the current path segment
            if matches_at(&pat[1..], text) {
                return true;
            }
            for i in 0..text.len() {
                if text[i] == '/' {
                    break;
                }
                if matches_at(&pat[1..], &text[i + 1..]) {
                    return true;
                }
            }
            false
        }
        Some(Tok::GlobStar) => (0..=text.len()).any(|i| matches_at(&pat[1..], &text[i..])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, url: &str) -> bool {
        UrlPattern::parse(pattern).unwrap().matches(url)
    }

    #[test]
    fn globstar_spans_segments() {
        assert!(matches("**/api/users", "https://example.com/api/users"));
        assert!(matches("**/api/users", "http://localhost:8080/v2/api/users"));
        assert!(!matches("**/api/users", "https://example.com/api/users/7"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        assert!(matches("https://example.com/*/users", "https://example.com/api/users"));
        assert!(!matches(
            "https://example.com/*/users",
            "https://example.com/v2/api/users"
        ));
        assert!(matches("https://example.com/api/*", "https://example.com/api/users"));
        assert!(!matches("https://example.com/api/*", "https://example.com/api/users/7"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        assert!(matches("**/item?", "https://example.com/item7"));
        assert!(!matches("**/item?", "https://example.com/item"));
    }

    #[test]
    fn literal_patterns() {
        assert!(matches("https://example.com/", "https://example.com/"));
        assert!(!matches("https://example.com/", "https://example.org/"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(UrlPattern::parse("").is_err());
    }
}
