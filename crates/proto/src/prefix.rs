//! Message origin (`nick!user@host`) handling.
use std::fmt;

/// Parsed message origin.
///
/// Servers use a bare hostname here; users carry the full
/// `nick!user@host` shape. Either part after the nick may be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    /// Parse a raw prefix, without the leading `:`.
    pub fn parse(raw: &str) -> Self {
        let (front, host) = match raw.split_once('@') {
            Some((front, host)) => (front, Some(host.to_owned())),
            None => (raw, None),
        };
        let (nick, user) = match front.split_once('!') {
            Some((nick, user)) => (nick.to_owned(), Some(user.to_owned())),
            None => (front.to_owned(), None),
        };

        Self { nick, user, host }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nick)?;
        if let Some(user) = &self.user {
            write!(f, "!{}", user)?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{}", host)?;
        }
        Ok(())
    }
}

/// Strip the user/host part off an origin string.
///
/// `alice!u@h` and `alice@h` both yield `alice`; a bare nick is
/// returned unchanged.
pub fn nick_of(origin: &str) -> &str {
    origin
        .split_once('!')
        .map(|(nick, _)| nick)
        .unwrap_or_else(|| origin.split_once('@').map(|(nick, _)| nick).unwrap_or(origin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let prefix = Prefix::parse("alice!ident@example.org");

        assert_eq!(prefix.nick, "alice");
        assert_eq!(prefix.user.as_deref(), Some("ident"));
        assert_eq!(prefix.host.as_deref(), Some("example.org"));
        assert_eq!(prefix.to_string(), "alice!ident@example.org");
    }

    #[test]
    fn parse_server_origin() {
        let prefix = Prefix::parse("irc.example.org");

        assert_eq!(prefix.nick, "irc.example.org");
        assert_eq!(prefix.user, None);
        assert_eq!(prefix.host, None);
    }

    #[test]
    fn nick_of_strips_everything_after_nick() {
        assert_eq!(nick_of("alice!u@h"), "alice");
        assert_eq!(nick_of("alice@h"), "alice");
        assert_eq!(nick_of("alice"), "alice");
    }
}
