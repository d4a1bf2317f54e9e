//! Wildcard byte patterns such as `4C 00 xx 15`.
//!
//! Tokens are hex pairs or `xx` for "any byte". Case and whitespace are
//! ignored.

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Token {
    Byte(u8),
    Any,
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct BytePattern(Vec<Token>);

impl BytePattern {
    /// `None` for empty, odd-length or non-hex input.
    #[must_use]
    pub fn parse(pattern: &str) -> Option<BytePattern> {
        let compact: Vec<u8> = pattern
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .map(|b| b.to_ascii_lowercase())
            .collect();
        if compact.is_empty() || compact.len() % 2 != 0 {
            return None;
        }
        compact
            .chunks_exact(2)
            .map(|pair| match pair {
                b"xx" => Some(Token::Any),
                _ => {
                    let s = std::str::from_utf8(pair).ok()?;
                    u8::from_str_radix(s, 16).ok().map(Token::Byte)
                }
            })
            .collect::<Option<Vec<_>>>()
            .map(BytePattern)
    }

    /// True if the pattern occurs at any offset of `haystack`.
    #[must_use]
    pub fn is_match(&self, haystack: &[u8]) -> bool {
        if self.0.len() > haystack.len() {
            return false;
        }
        haystack.windows(self.0.len()).any(|window| {
            window.iter().zip(&self.0).all(|(byte, token)| match token {
                Token::Any => true,
                Token::Byte(b) => b == byte,
            })
        })
    }
}

/// Parses `pattern` and searches `haystack`; a malformed pattern never
/// matches.
#[must_use]
pub fn matches(haystack: &[u8], pattern: &str) -> bool {
    BytePattern::parse(pattern).is_some_and(|p| p.is_match(haystack))
}
