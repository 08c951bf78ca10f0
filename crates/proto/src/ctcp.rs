//! CTCP payload detection and quoting.
//!
//! A CTCP request rides inside a PRIVMSG or NOTICE trailing parameter,
//! delimited by 0x01 bytes: `\x01KEYWORD [args]\x01`.

/// Delimiter byte, as a char.
const DELIM: char = '\u{1}';

/// The one CTCP keyword with dedicated event semantics.
pub const ACTION: &str = "ACTION";

/// Extract `(keyword, args)` if the text is a CTCP payload.
///
/// The keyword is upper-cased; `args` is empty when the request has
/// none. A missing closing delimiter is tolerated, as most clients do.
pub fn parse(text: &str) -> Option<(String, &str)> {
    let inner = text.strip_prefix(DELIM)?;
    let inner = inner.strip_suffix(DELIM).unwrap_or(inner);

    let (keyword, args) = match inner.split_once(' ') {
        Some((keyword, args)) => (keyword, args),
        None => (inner, ""),
    };

    if keyword.is_empty() {
        return None;
    }

    Some((keyword.to_ascii_uppercase(), args))
}

/// Quote a keyword and arguments into a CTCP payload.
pub fn quote(keyword: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{}{}{}", DELIM, keyword, DELIM)
    } else {
        format!("{}{} {}{}", DELIM, keyword, args, DELIM)
    }
}
