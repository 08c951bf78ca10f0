//! Numeric replies the engine reacts to.

/// End of registration; the connection is usable.
pub const RPL_WELCOME: u16 = 1;
/// Server feature advertisement (ISUPPORT).
pub const RPL_ISUPPORT: u16 = 5;

/// First WHOIS line: nick, user, host, realname.
pub const RPL_WHOISUSER: u16 = 311;
/// WHOIS server line.
pub const RPL_WHOISSERVER: u16 = 312;
/// WHOIS idle time.
pub const RPL_WHOISIDLE: u16 = 317;
/// WHOIS terminator.
pub const RPL_ENDOFWHOIS: u16 = 318;
/// WHOIS channel list.
pub const RPL_WHOISCHANNELS: u16 = 319;

/// One page of a NAMES listing.
pub const RPL_NAMREPLY: u16 = 353;
/// NAMES terminator.
pub const RPL_ENDOFNAMES: u16 = 366;

/// Requested nickname is taken.
pub const ERR_NICKNAMEINUSE: u16 = 433;
