//! ISUPPORT (005) tokens the engine consumes.
//!
//! Only `PREFIX` and `CHANTYPES` matter here; everything else the
//! server advertises is ignored.

/// Ordered channel-mode → prefix-symbol table, highest rank first.
///
/// Parsed from a `PREFIX=(ov)@+` token. The rank order doubles as the
/// bit position used for per-user mode masks in channel membership
/// maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMap {
    pairs: Vec<(char, char)>,
}

impl Default for PrefixMap {
    fn default() -> Self {
        // The RFC 1459 baseline advertised by virtually every network.
        Self {
            pairs: vec![('o', '@'), ('v', '+')],
        }
    }
}

impl PrefixMap {
    /// Parse the value of a `PREFIX=` token, e.g. `(qaohv)~&@%+`.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('(')?;
        let (modes, symbols) = rest.split_once(')')?;

        if modes.chars().count() != symbols.chars().count() || modes.is_empty() {
            return None;
        }

        Some(Self {
            pairs: modes.chars().zip(symbols.chars()).collect(),
        })
    }

    /// Prefix symbol for a mode letter.
    pub fn symbol(&self, mode: char) -> Option<char> {
        self.pairs.iter().find(|(m, _)| *m == mode).map(|(_, s)| *s)
    }

    /// Mode letter for a prefix symbol.
    pub fn mode(&self, symbol: char) -> Option<char> {
        self.pairs.iter().find(|(_, s)| *s == symbol).map(|(m, _)| *m)
    }

    /// Bit for a mode letter in a membership mask.
    pub fn mask_of(&self, mode: char) -> Option<u32> {
        self.pairs
            .iter()
            .position(|(m, _)| *m == mode)
            .map(|i| 1 << i)
    }

    /// Mask bits for the symbols prefixed to a NAMES entry.
    pub fn mask_of_symbols(&self, nick: &str) -> u32 {
        let mut mask = 0;
        for c in nick.chars() {
            match self.pairs.iter().position(|(_, s)| *s == c) {
                Some(i) => mask |= 1 << i,
                None => break,
            }
        }
        mask
    }

    /// Strip leading prefix symbols off a NAMES entry.
    pub fn strip<'a>(&self, nick: &'a str) -> &'a str {
        nick.trim_start_matches(|c| self.mode(c).is_some())
    }

    /// Render a membership mask back to its symbols, highest rank first.
    pub fn symbols(&self, mask: u32) -> String {
        self.pairs
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, (_, s))| *s)
            .collect()
    }
}

/// The subset of advertised server features the engine tracks.
#[derive(Debug, Clone)]
pub struct Isupport {
    pub prefix: PrefixMap,
    pub chantypes: String,
}

impl Default for Isupport {
    fn default() -> Self {
        Self {
            prefix: PrefixMap::default(),
            chantypes: "#&".to_owned(),
        }
    }
}

impl Isupport {
    /// Fold one 005 reply's parameters in. The first parameter is our
    /// own nick and the last is the `are supported` trailing; both are
    /// skipped along with unknown tokens.
    pub fn apply(&mut self, params: &[String]) {
        for token in params.iter().skip(1) {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "PREFIX" => {
                    if let Some(map) = PrefixMap::parse(value) {
                        self.prefix = map;
                    }
                }
                "CHANTYPES" => {
                    if !value.is_empty() {
                        self.chantypes = value.to_owned();
                    }
                }
                _ => {}
            }
        }
    }

    /// Whether a target names a channel rather than a nick.
    pub fn is_channel(&self, target: &str) -> bool {
        target.chars().next().is_some_and(|c| self.chantypes.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefix_token() {
        let map = PrefixMap::parse("(qaohv)~&@%+").unwrap();

        assert_eq!(map.symbol('o'), Some('@'));
        assert_eq!(map.mode('+'), Some('v'));
        assert_eq!(map.strip("@+alice"), "alice");
        assert_eq!(map.mask_of('q'), Some(1));
    }

    #[test]
    fn parse_rejects_mismatched_token() {
        assert_eq!(PrefixMap::parse("(ov)@"), None);
        assert_eq!(PrefixMap::parse("ov@+"), None);
        assert_eq!(PrefixMap::parse("()"), None);
    }

    #[test]
    fn mask_and_symbols_roundtrip() {
        let map = PrefixMap::default();
        let mask = map.mask_of_symbols("@+bob");

        assert_eq!(mask, 0b11);
        assert_eq!(map.symbols(mask), "@+");
        assert_eq!(map.mask_of_symbols("bob"), 0);
    }

    #[test]
    fn apply_isupport_params() {
        let mut info = Isupport::default();
        let params: Vec<String> = ["bot", "PREFIX=(ov)@+", "CHANTYPES=#", "NICKLEN=31", "are supported"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        info.apply(&params);

        assert!(info.is_channel("#room"));
        assert!(!info.is_channel("&room"));
        assert!(!info.is_channel("alice"));
    }
}
