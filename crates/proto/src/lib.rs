//! IRC wire protocol primitives.
//!
//! Parsing and encoding of single IRC lines, origin prefixes, ISUPPORT
//! tokens and CTCP payloads. This crate knows nothing about connections
//! or dispatch; it turns bytes of one line into structured values and
//! back.

pub mod ctcp;
pub mod isupport;
pub mod message;
pub mod numeric;
pub mod prefix;

pub use isupport::{Isupport, PrefixMap};
pub use message::{Message, ParseError};
pub use prefix::{nick_of, Prefix};
