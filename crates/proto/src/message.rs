//! IRC message parsing and encoding.
use std::fmt;

use thiserror::Error;

use crate::prefix::Prefix;

/// Maximum number of middle parameters allowed by RFC 2812.
const MAX_PARAMS: usize = 15;

/// An error while parsing a single IRC line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The line contained nothing but whitespace.
    #[error("empty message")]
    Empty,
    /// A `:` introduced a prefix but nothing followed it.
    #[error("empty prefix")]
    EmptyPrefix,
    /// The command token was missing or contained invalid characters.
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),
    /// More than [`MAX_PARAMS`] middle parameters.
    #[error("too many parameters")]
    TooManyParams,
}

/// A single parsed IRC message: `[:prefix] COMMAND params* [:trailing]`.
///
/// The trailing parameter, when present, is the last entry of `params`;
/// no distinction is kept after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message origin, if the line carried one.
    pub prefix: Option<Prefix>,
    /// Command name, upper-cased, or a numeric reply as digits.
    pub command: String,
    /// Positional parameters, trailing last.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no prefix.
    pub fn new<S: Into<String>>(command: S, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into().to_ascii_uppercase(),
            params,
        }
    }

    /// Parse one line, with any trailing CR/LF already removed.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut rest = line.trim_start_matches(' ');

        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (raw, tail) = split_word(stripped);
            if raw.is_empty() {
                return Err(ParseError::EmptyPrefix);
            }
            rest = tail;
            Some(Prefix::parse(raw))
        } else {
            None
        };

        let (command, mut rest) = split_word(rest);
        if command.is_empty() || !is_valid_command(command) {
            return Err(ParseError::InvalidCommand(command.to_owned()));
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            if params.len() == MAX_PARAMS {
                return Err(ParseError::TooManyParams);
            }
            let (word, tail) = split_word(rest);
            params.push(word.to_owned());
            rest = tail;
        }

        Ok(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Numeric value of the command, for reply codes like `001` or `353`.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Parameter at `index`, or the empty string.
    pub fn param(&self, index: usize) -> &str {
        self.params.get(index).map(String::as_str).unwrap_or("")
    }

    /// Encode to wire format, without the terminating CR-LF.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        write!(f, "{}", self.command)?;

        let last = self.params.len().checked_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if Some(i) == last && needs_trailing(param) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

/// Whether a final parameter must be sent as a trailing one.
fn needs_trailing(param: &str) -> bool {
    param.is_empty() || param.contains(' ') || param.starts_with(':')
}

fn is_valid_command(command: &str) -> bool {
    command.bytes().all(|b| b.is_ascii_alphabetic())
        || (command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit()))
}

/// Split off the first space-delimited word, eating separating spaces.
fn split_word(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], s[i..].trim_start_matches(' ')),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg() {
        let msg = Message::parse(":alice!u@h PRIVMSG #room :hello world").unwrap();

        assert_eq!(msg.prefix.as_ref().unwrap().nick, "alice");
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#room", "hello world"]);
    }

    #[test]
    fn parse_without_prefix() {
        let msg = Message::parse("PING :irc.example.org").unwrap();

        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.param(0), "irc.example.org");
    }

    #[test]
    fn parse_numeric() {
        let msg = Message::parse(":srv 001 bot :Welcome to IRC").unwrap();

        assert_eq!(msg.numeric(), Some(1));
        assert_eq!(msg.param(0), "bot");
    }

    #[test]
    fn parse_collapses_extra_spaces() {
        let msg = Message::parse("JOIN   #a   #b").unwrap();

        assert_eq!(msg.params, vec!["#a", "#b"]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Message::parse("   "), Err(ParseError::Empty));
        assert_eq!(Message::parse(": PRIVMSG #x :y"), Err(ParseError::EmptyPrefix));
        assert!(matches!(
            Message::parse("0x1 #x"),
            Err(ParseError::InvalidCommand(_))
        ));
    }

    #[test]
    fn encode_trailing_rules() {
        let msg = Message::new("PRIVMSG", vec!["#room".into(), "hello world".into()]);
        assert_eq!(msg.encode(), "PRIVMSG #room :hello world");

        let msg = Message::new("JOIN", vec!["#room".into()]);
        assert_eq!(msg.encode(), "JOIN #room");

        let msg = Message::new("TOPIC", vec!["#room".into(), String::new()]);
        assert_eq!(msg.encode(), "TOPIC #room :");
    }

    #[test]
    fn roundtrip_preserves_meaning() {
        for line in [
            ":alice!u@h PRIVMSG #room :hello world",
            ":srv 353 bot = #room :@op +voiced plain",
            "QUIT :bye now",
            "MODE #room +o alice",
        ] {
            let msg = Message::parse(line).unwrap();
            let again = Message::parse(&msg.encode()).unwrap();
            assert_eq!(msg, again);
        }
    }

    quickcheck::quickcheck! {
        fn encoding_roundtrips_for_word_params(words: Vec<String>) -> quickcheck::TestResult {
            let params: Vec<String> = words
                .into_iter()
                .filter(|w| !w.is_empty() && w.chars().all(|c| c.is_ascii_alphanumeric()))
                .take(MAX_PARAMS)
                .collect();

            let msg = Message::new("PRIVMSG", params);
            quickcheck::TestResult::from_bool(Message::parse(&msg.encode()).as_ref() == Ok(&msg))
        }
    }
}
