//! Byte stream to line decoding.

/// Accumulates raw bytes and yields complete lines.
///
/// Lines are LF-terminated; a preceding CR is stripped, so the same
/// decoder serves IRC transports (CR-LF) and control peers (LF).
/// Bytes after the last terminator stay buffered for the next read.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next line. Returns [`None`] when no full
    /// line is buffered.
    pub fn decode_next(&mut self) -> Option<String> {
        let end = self.unparsed.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.unparsed.drain(..=end).collect();

        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        // IRC predates any byte encoding agreement; a lossy conversion
        // keeps the connection alive on bad input.
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_across_reads() {
        let mut decoder = Decoder::new(64);

        decoder.input(b":alice!u@h PRIVMSG #room :he");
        assert_eq!(decoder.decode_next(), None);

        decoder.input(b"llo\r\nPING :x\r\n");
        assert_eq!(
            decoder.decode_next().as_deref(),
            Some(":alice!u@h PRIVMSG #room :hello")
        );
        assert_eq!(decoder.decode_next().as_deref(), Some("PING :x"));
        assert_eq!(decoder.decode_next(), None);
    }

    #[test]
    fn bare_lf_is_accepted() {
        let mut decoder = Decoder::new(64);

        decoder.input(b"SERVER-LIST\n");
        assert_eq!(decoder.decode_next().as_deref(), Some("SERVER-LIST"));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut decoder = Decoder::new(64);

        decoder.input(b"PING :\xff\xfe\r\n");
        assert!(decoder.decode_next().is_some());
    }
}
