//! Full-name transformation protocol.
//!
//! A client sends a single message of space-separated tokens:
//!
//! ```text
//! <name> <name> <name> [<word> [<word>]]
//! ```
//!
//! The first three tokens are a three-part proper name. Each name token has
//! its first character lower-cased and its last character upper-cased, the
//! names are emitted in reverse order, and the server signature plus any
//! remaining words follow:
//!
//! ```text
//! Request:  иван петров сидоров привет мир
//! Response: сидороВ петроВ иваН Server written by ... привет мир
//! ```
//!
//! Messages with fewer than three or more than five tokens are rejected and
//! answered with [`INVALID_DATA_REPLY`].
//!
//! The transform is a single pass: feeding a reply back in does not give the
//! reply again.

use std::fmt;

/// Number of leading tokens that make up the full name.
pub const FULL_NAME_SIZE: usize = 3;

/// Smallest accepted token count.
pub const MIN_MESSAGE_TOKENS: usize = 3;

/// Largest accepted token count.
pub const MAX_MESSAGE_TOKENS: usize = 5;

/// Reply sent for messages that fail validation.
pub const INVALID_DATA_REPLY: &str = "invalid data";

/// Signature inserted between the name and the message body.
pub const DEFAULT_SIGNATURE: &str = "Server written by fullname-server authors";

/// Reason a client message was not transformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Token count outside `MIN_MESSAGE_TOKENS..=MAX_MESSAGE_TOKENS`.
    InvalidLength { tokens: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidLength { tokens } => write!(
                f,
                "invalid message length: {} tokens (expected {}..={})",
                tokens, MIN_MESSAGE_TOKENS, MAX_MESSAGE_TOKENS
            ),
        }
    }
}

impl std::error::Error for Rejection {}

/// Stateless message transformer carrying the server signature.
#[derive(Debug, Clone)]
pub struct Transformer {
    signature: String,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNATURE)
    }
}

impl Transformer {
    /// Create a transformer that signs replies with `signature`.
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
        }
    }

    /// Transform a raw client message into the reply text.
    pub fn transform(&self, raw: &[u8]) -> Result<String, Rejection> {
        let text = String::from_utf8_lossy(raw);
        let tokens: Vec<&str> = text.trim().split(' ').collect();

        if tokens.len() < MIN_MESSAGE_TOKENS || tokens.len() > MAX_MESSAGE_TOKENS {
            return Err(Rejection::InvalidLength {
                tokens: tokens.len(),
            });
        }

        let (name, body) = tokens.split_at(FULL_NAME_SIZE);

        let mut parts: Vec<String> = Vec::with_capacity(tokens.len() + 1);
        parts.extend(name.iter().rev().map(|token| recase_name(token)));
        parts.push(self.signature.clone());
        parts.extend(body.iter().map(|token| token.to_string()));

        Ok(parts.join(" "))
    }
}

/// Lower-case the first character and upper-case the last one.
///
/// Interior characters are copied unchanged. A one-character token is
/// upper-cased. Case mappings that expand to several characters keep only
/// the first, so the character count is preserved.
fn recase_name(token: &str) -> String {
    let count = token.chars().count();

    token
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i + 1 == count {
                c.to_uppercase().next().unwrap_or(c)
            } else if i == 0 {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformer() -> Transformer {
        Transformer::new("Server written by X")
    }

    #[test]
    fn test_cyrillic_example() {
        let reply = transformer()
            .transform("иван петров сидоров привет мир".as_bytes())
            .unwrap();
        assert_eq!(reply, "сидороВ петроВ иваН Server written by X привет мир");
    }

    #[test]
    fn test_three_tokens_has_no_body() {
        let reply = transformer().transform(b"Anna Maria Lopez").unwrap();
        assert_eq!(reply, "lopeZ mariA annA Server written by X");
    }

    #[test]
    fn test_four_tokens() {
        let reply = transformer().transform(b"john ronald tolkien hello").unwrap();
        assert_eq!(reply, "tolkieN ronalD johN Server written by X hello");
    }

    #[test]
    fn test_interior_case_preserved() {
        let reply = transformer().transform(b"McDonald O'Neil DeVito").unwrap();
        assert_eq!(reply, "deVitO o'NeiL mcDonalD Server written by X");
    }

    #[test]
    fn test_surrounding_whitespace_trimmed() {
        let reply = transformer().transform(b"  a bc def\r\n").unwrap();
        assert_eq!(reply, "deF bC A Server written by X");
    }

    #[test]
    fn test_single_character_token_is_upper_cased() {
        assert_eq!(recase_name("a"), "A");
        assert_eq!(recase_name("Я"), "Я");
        assert_eq!(recase_name("я"), "Я");
    }

    #[test]
    fn test_two_character_token() {
        assert_eq!(recase_name("AB"), "aB");
        assert_eq!(recase_name("ab"), "aB");
    }

    #[test]
    fn test_empty_token_from_double_space() {
        // "a  b c" splits into ["a", "", "b", "c"]
        let reply = transformer().transform(b"a  b c").unwrap();
        assert_eq!(reply, "B  A Server written by X c");
    }

    #[test]
    fn test_expanding_case_mapping_keeps_length() {
        let token = recase_name("straß");
        assert_eq!(token.chars().count(), 5);
        assert_eq!(token, "straS");
    }

    #[test]
    fn test_combining_and_zero_width_pass_through() {
        let token = recase_name("e\u{301}\u{200b}x");
        assert_eq!(token, "e\u{301}\u{200b}X");
    }

    #[test]
    fn test_invalid_utf8_does_not_fail() {
        let reply = transformer().transform(b"ab\xff cd ef").unwrap();
        assert_eq!(reply, "eF cD ab\u{fffd} Server written by X");
    }

    #[test]
    fn test_too_few_tokens() {
        assert_eq!(
            transformer().transform(b"a b"),
            Err(Rejection::InvalidLength { tokens: 2 })
        );
    }

    #[test]
    fn test_too_many_tokens() {
        assert_eq!(
            transformer().transform(b"a b c d e f"),
            Err(Rejection::InvalidLength { tokens: 6 })
        );
    }

    #[test]
    fn test_empty_message() {
        assert_eq!(
            transformer().transform(b"   "),
            Err(Rejection::InvalidLength { tokens: 1 })
        );
    }

    #[test]
    fn test_reply_token_shape() {
        let inputs = ["a b c", "aa bb cc dd", "x y z w v", "Ёж Юла Щи тут там"];
        for input in inputs {
            let tokens: Vec<&str> = input.split(' ').collect();
            let reply = transformer().transform(input.as_bytes()).unwrap();
            let expected_len = tokens.len() + "Server written by X".split(' ').count();
            assert_eq!(reply.split(' ').count(), expected_len, "input: {input}");
            assert!(reply.ends_with(&tokens[3..].join(" ")));
        }
    }

    #[test]
    fn test_default_signature() {
        let reply = Transformer::default().transform(b"a b c").unwrap();
        assert_eq!(reply, format!("C B A {}", DEFAULT_SIGNATURE));
    }

    #[test]
    fn test_reply_fed_back_is_transformed_again() {
        let t = Transformer::new("S");
        let once = t.transform(b"Ab Cd Ef").unwrap();
        assert_eq!(once, "eF cD aB S");

        // names flip back, the signature becomes part of the body
        let twice = t.transform(once.as_bytes()).unwrap();
        assert_eq!(twice, "aB cD eF S S");
        assert_ne!(twice, once);
    }

    #[test]
    fn test_titlecase_digraph() {
        // U+01C5 lowercases to U+01C6, not to the upper-case U+01C4
        assert_eq!(recase_name("\u{1c5}x"), "\u{1c6}X");
        assert_eq!(recase_name("x\u{1c5}"), "x\u{1c4}");
    }

    #[test]
    fn test_rejection_display() {
        let msg = Rejection::InvalidLength { tokens: 7 }.to_string();
        assert!(msg.contains("7 tokens"));
    }
}
