//! Splits a byte stream into envelope frames.
//!
//! The wire protocol is line framed: a fixed termination byte
//! sequence ends each envelope. The scanner must survive both
//! halves of TCP's indifference to message boundaries: a single
//! envelope split across several reads, and several envelopes
//! coalesced into one read.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::hub::error::*;

/// The sequence of bytes that signifies the end of an envelope.
pub const TERMINATION: &[u8] = b"\n";

// max no. of bytes read from the socket in one syscall
const BUFSIZ_RECV: usize = 16384;

/// Incremental scanner extracting terminator delimited frames
/// from a stream of byte chunks.
pub struct Framer {
    buf: Vec<u8>,
    // offset of the first byte not yet searched for a terminator;
    // avoids rescanning committed bytes when a terminator straddles
    // two network packets
    searched: usize,
}

impl Framer {
    /// Creates a new, empty `Framer`.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            searched: 0,
        }
    }

    /// Appends a freshly read chunk to the internal buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extracts the next complete frame, without its terminator.
    ///
    /// Returns `None` while the buffered bytes do not contain a
    /// full terminator sequence; feeding more data may unblock it.
    /// Re-enter this method after a frame is returned, since one
    /// chunk may have carried multiple frames.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < self.searched + TERMINATION.len() {
            return None;
        }

        let index = self.buf[self.searched..]
            .windows(TERMINATION.len())
            .position(|w| w == TERMINATION)
            .map(|i| i + self.searched);

        let index = match index {
            Some(i) => i,
            None => {
                // no terminator yet; remember how far we searched, keeping
                // enough of a tail around for a terminator that straddles
                // the next chunk
                self.searched = self.buf.len().saturating_sub(TERMINATION.len() - 1);
                return None;
            }
        };

        let frame = self.buf[..index].to_vec();
        self.buf.drain(..index + TERMINATION.len());
        self.searched = 0;
        Some(frame)
    }

    /// Number of buffered bytes not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads frames off an async byte stream.
pub struct FramedRead<R> {
    reader: R,
    framer: Framer,
}

impl<R: AsyncRead + Unpin> FramedRead<R> {
    /// Wraps the read half of a transport.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            framer: Framer::new(),
        }
    }

    /// Yields the next non-empty frame, or `None` on a clean
    /// end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0; BUFSIZ_RECV];
        loop {
            while let Some(frame) = self.framer.next_frame() {
                if !frame.is_empty() {
                    return Ok(Some(frame));
                }
            }
            let n = self
                .reader
                .read(&mut chunk[..])
                .await
                .wrapped(ErrorKind::TransportLost)?;
            if n == 0 {
                // remote closed; a partial frame left in the buffer
                // is dropped on the floor
                return Ok(None);
            }
            self.framer.feed(&chunk[..n]);
        }
    }
}

/// Writes a single frame, appending the terminator, and flushes.
///
/// Fails without writing if the payload contains the terminator
/// sequence, which would desynchronize the peer's scanner.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let poisoned = payload
        .windows(TERMINATION.len())
        .any(|w| w == TERMINATION);
    if poisoned {
        return Err("Payload contains the termination sequence")
            .wrapped(ErrorKind::CommunicationFraming);
    }
    writer
        .write_all(payload)
        .await
        .wrapped(ErrorKind::TransportLost)?;
    writer
        .write_all(TERMINATION)
        .await
        .wrapped(ErrorKind::TransportLost)?;
    writer.flush().await.wrapped(ErrorKind::TransportLost)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Framer, TERMINATION};

    #[test]
    fn test_split_frame() {
        let mut framer = Framer::new();
        framer.feed(b"{\"service\":");
        assert_eq!(framer.next_frame(), None);
        framer.feed(b"\"Echo\"}");
        assert_eq!(framer.next_frame(), None);
        framer.feed(TERMINATION);
        assert_eq!(
            framer.next_frame(),
            Some(b"{\"service\":\"Echo\"}".to_vec())
        );
        assert_eq!(framer.next_frame(), None);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_coalesced_frames() {
        let mut framer = Framer::new();
        framer.feed(b"{\"a\":1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(framer.next_frame(), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(framer.next_frame(), Some(b"{\"b\":2}".to_vec()));
        assert_eq!(framer.next_frame(), None);
        framer.feed(b":3}\n");
        assert_eq!(framer.next_frame(), Some(b"{\"c\":3}".to_vec()));
    }

    #[test]
    fn test_empty_frames_are_produced() {
        // blank lines frame as empty chunks; the reader skips them
        let mut framer = Framer::new();
        framer.feed(b"\n\n{\"a\":1}\n");
        assert_eq!(framer.next_frame(), Some(Vec::new()));
        assert_eq!(framer.next_frame(), Some(Vec::new()));
        assert_eq!(framer.next_frame(), Some(b"{\"a\":1}".to_vec()));
    }

    #[test]
    fn test_search_offset_does_not_rescan() {
        let mut framer = Framer::new();
        let chunk = vec![b'x'; 4096];
        framer.feed(&chunk);
        assert_eq!(framer.next_frame(), None);
        framer.feed(&chunk);
        assert_eq!(framer.next_frame(), None);
        framer.feed(TERMINATION);
        let frame = framer.next_frame().unwrap();
        assert_eq!(frame.len(), 8192);
        assert!(frame.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn test_terminator_on_packet_boundary() {
        // the terminator byte lands exactly at the start of
        // the second packet
        let mut framer = Framer::new();
        framer.feed(b"{\"a\":1}");
        assert_eq!(framer.next_frame(), None);
        framer.feed(b"\n{\"b\":2}\n");
        assert_eq!(framer.next_frame(), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(framer.next_frame(), Some(b"{\"b\":2}".to_vec()));
    }
}
