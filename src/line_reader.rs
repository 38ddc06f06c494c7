use std::{error, fmt, io};

use bytes::{Buf, Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reported by `LineReader::read_line`, as an `InvalidData` I/O error, for a
/// line over the reader's length limit. The whole line has been consumed by
/// then, so reading can carry on.
#[derive(Debug)]
pub struct LineTooLong;

impl fmt::Display for LineTooLong {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("line too long")
    }
}

impl error::Error for LineTooLong {}

impl LineTooLong {
    /// True if `error` came from a `LineTooLong`.
    pub fn is(error: &io::Error) -> bool {
        error.get_ref().is_some_and(|e| e.is::<LineTooLong>())
    }

    fn into_io() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, LineTooLong)
    }
}

/// Reads CRLF-terminated command lines, and the fixed-length job bodies that
/// follow `put` lines, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but lacks a CRLF.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
    /// Longest line accepted, including its CRLF.
    max_line_len: usize,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Creates a reader that buffers at most `max_line_len` bytes of a line,
    /// CRLF included. Longer lines are skipped and reported as
    /// `LineTooLong`.
    pub fn with_max_line_len(reader: T, max_line_len: usize) -> Self {
        Self {
            max_line_len,
            ..reader.into()
        }
    }

    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    ///
    /// A line over the length limit is never buffered in full: its bytes are
    /// dropped as they arrive, and once its CRLF is seen an error satisfying
    /// `LineTooLong::is` is returned.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // We slice and dice buf here to avoid re-reading all but the last
            // byte of the part of the command we've already seen, keeping
            // O(bytes_read) behaviour.
            // Note also we need to scan from one position earlier than the
            // start of the newest bytes in case we received a \r then \n on the
            // next read.
            // The outer loop ensures pipelined line that arrive in the same
            // read_buf call are handled correctly: we only call read_buf once
            // all pending lines in the internal buffer have been removed.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let end = self.maybe_crlf_from + eoc + 2;

                if self.discarding || end > self.max_line_len {
                    self.buf.advance(end);
                    self.maybe_crlf_from = 0;
                    self.discarding = false;
                    return Err(LineTooLong::into_io());
                }

                // This should be a complete command. Freeze the result to make it
                // read-only.
                let cmd = self.buf.split_to(end).freeze();

                // Drop trailing b"\r\n".
                let cmd = cmd.slice(0..cmd.len() - 2);

                // Zero out the maybe_crlf_from position so we restart scanning for
                // commands from the start of the unread buffer section.
                self.maybe_crlf_from = 0;

                return Ok(Some(cmd));
            } else {
                if self.buf.len() >= self.max_line_len {
                    // No CRLF within the limit. Drop what's buffered, bar a
                    // trailing \r that the next read may complete.
                    let keep = usize::from(self.buf.last() == Some(&b'\r'));
                    self.buf.advance(self.buf.len() - keep);
                    self.maybe_crlf_from = 0;
                    self.discarding = true;
                }

                // Try reading from the reader and accumulating in the buffer;
                // if we receive any bytes, re-scan for a CRLF, otherwise
                // assume the connection is dead/closed.
                let n_bytes_read =
                    match self.reader.read_buf(&mut self.buf).await {
                        Ok(n) => n,
                        Err(e) => {
                            self.pending_error = Some(e);
                            0
                        },
                    };

                // Slightly convoluted, but all this does is set maybe_crlf_from
                // to the byte before the first byte returned in the read_buf
                // call (and 0 if buf is empty).
                self.maybe_crlf_from =
                    self.buf.len().checked_sub(n_bytes_read + 1).unwrap_or(0);

                // If we didn't read any bytes this time around, assume we've
                // reached an end-of-stream condition. Return any pending error:
                // we wouldn't be able to parse out another line, given we just
                // read 0 bytes.
                if n_bytes_read == 0 {
                    return match self.pending_error.take() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    /// Reads exactly `len` bytes, such as a job body and its trailing CRLF,
    /// taking buffered bytes first. Returns None if the stream ends before
    /// `len` bytes arrive.
    ///
    /// Like `read_line`, this is cancel-safe: bytes read before cancellation
    /// stay in the internal buffer.
    pub async fn read_chunk(
        &mut self,
        len: usize,
    ) -> io::Result<Option<Bytes>> {
        while self.buf.len() < len {
            if let Some(e) = self.pending_error.take() {
                return Err(e);
            }

            self.buf.reserve(len - self.buf.len());
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }

        // Anything left over starts a fresh line.
        self.maybe_crlf_from = 0;

        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Reads whatever input is available into the internal buffer, without
    /// consuming any line. Returns the number of bytes read, zero meaning the
    /// stream has ended. Cancel-safe, as `read_line`.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.reader.read_buf(&mut self.buf).await
    }

    /// Number of bytes read in but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
            max_line_len: usize::MAX,
            discarding: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn test() {
        // When properly read, each nth line should read b"test:{n}".
        let tests: &[&[u8]] = &[
            // Simple reassembly
            b"test:",
            b"1\r\n",
            // Split LF
            b"test:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"test:",
            b"3",
            b"\r",
            b"\n",
            // Pipelined commands
            // Simple
            b"test:4\r\ntest:5\r\n",
            // Split LF
            b"test:6\r",
            b"\ntest:7\r\n",
            // Split CRLF
            b"test:8",
            b"\r\ntest:9\r\n",
        ];

        // Set the buffer large enough that our tests will never overflow it.
        // We can ensure correct fragmentation of reads by explicitly yielding
        // between each.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in tests {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        for n in 1..=9 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_over_long_lines_are_skipped() {
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            // Far more than the limit before any CRLF, split across writes,
            // with the CRLF itself split too.
            for _ in 0..256 {
                client.write_all(&[b'a'; 1024]).await.unwrap();
            }
            client.write_all(b"\r").await.unwrap();
            client.write_all(b"\nok\r\n").await.unwrap();
            // Too long, but arriving complete in one piece.
            client.write_all(b"0123456789\r\nlast\r\n").await.unwrap();
        });

        let mut lr = LineReader::with_max_line_len(server, 8);

        let error = lr.read_line().await.unwrap_err();
        assert!(LineTooLong::is(&error));
        assert!(lr.buffered() < 4096);
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "ok");

        let error = lr.read_line().await.unwrap_err();
        assert!(LineTooLong::is(&error));
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "last");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_keeps_lines() {
        let (mut client, server) = io::duplex(4096);
        let mut lr: LineReader<_> = server.into();

        client.write_all(b"peek").await.unwrap();
        assert_eq!(lr.fill().await.unwrap(), 4);
        client.write_all(b"-ready\r\n").await.unwrap();
        drop(client);

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "peek-ready");
        assert_eq!(lr.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_chunk_between_lines() {
        // A put line, a body containing a CRLF of its own, then another line,
        // split awkwardly across writes.
        let tests: &[&[u8]] = &[
            b"put 0 0 1 7\r\nab",
            b"c\r\nde\r",
            b"\nquit\r\n",
        ];

        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in tests {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "put 0 0 1 7");
        assert_eq!(
            lr.read_chunk(9).await.unwrap().unwrap(),
            "abc\r\nde\r\n"
        );
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "quit");
        assert!(lr.read_chunk(1).await.unwrap().is_none());
    }
}
