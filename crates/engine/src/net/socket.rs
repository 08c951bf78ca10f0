//! Buffered non-blocking stream wrapper.
use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;
use std::os::unix::net::UnixStream;

/// A non-blocking socket with an outbound byte buffer.
///
/// Writes go through [`Socket::push`] and are flushed opportunistically
/// when the underlying descriptor reports writable; unflushed bytes
/// stay at the front of the buffer across partial writes.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    out: VecDeque<u8>,
}

impl<R: Read + Write> Socket<R> {
    pub fn from(raw: R) -> Self {
        Self {
            raw,
            out: VecDeque::new(),
        }
    }

    /// Queue bytes for sending.
    pub fn push(&mut self, bytes: &[u8]) {
        self.out.extend(bytes);
    }

    /// Number of bytes queued and not yet written out.
    pub fn buffered(&self) -> usize {
        self.out.len()
    }

    /// Read into `buf` directly from the underlying stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }

    /// Attempt to write out everything queued.
    ///
    /// On a partial write the remaining bytes are kept; the caller is
    /// expected to re-arm write interest and try again later.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.out.is_empty() {
            let (head, _) = self.out.as_slices();
            match self.raw.write(head) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out.drain(..n);
                }
                Err(err) => return Err(err),
            }
        }
        self.raw.flush()
    }
}

impl Socket<net::TcpStream> {
    /// Shut the connection down, both directions.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }

    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }
}

impl Socket<UnixStream> {
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stream that accepts at most `cap` bytes per write.
    struct Chunked {
        cap: usize,
        written: Vec<u8>,
    }

    impl Read for Chunked {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for Chunked {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.cap);
            if n == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_writes_keep_remainder() {
        let mut sock = Socket::from(Chunked {
            cap: 4,
            written: Vec::new(),
        });

        sock.push(b"PING :token\r\n");
        sock.flush().unwrap();

        assert_eq!(sock.buffered(), 0);
        assert_eq!(sock.raw.written, b"PING :token\r\n");
    }

    #[test]
    fn would_block_preserves_bytes() {
        let mut sock = Socket::from(Chunked {
            cap: 0,
            written: Vec::new(),
        });

        sock.push(b"abc");
        assert_eq!(
            sock.flush().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(sock.buffered(), 3);
    }
}
