//! Stream transfer: one dedicated byte channel per blob, terminated by channel close.

use crate::identity::PeerId;

/// Name of the channel that carries compressed frames.
pub const IMAGE_STREAM_NAME: &str = "imageStream";

/// Read buffer size for inbound streams.
pub const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("no connected peer {0}")]
    NoSuchPeer(PeerId),
    #[error("no connected peer to stream to")]
    NoConnectedPeer,
    #[error("stream open failed: {0}")]
    StreamOpenFailed(String),
    #[error("stream interrupted: {0}")]
    Interrupted(String),
    #[error("stream exceeds {0} bytes")]
    TooLarge(u64),
}

/// Where an outbound stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub peer: PeerId,
    pub name: String,
}

/// Accumulates one inbound stream. Owned by the reader of that channel alone.
#[derive(Debug)]
pub struct StreamAssembler {
    buf: Vec<u8>,
    max_len: u64,
}

impl StreamAssembler {
    pub fn new(max_len: u64) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append one read. Fails (and drops the partial data) past the size limit.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if (self.buf.len() + bytes.len()) as u64 > self.max_len {
            self.buf = Vec::new();
            return Err(StreamError::TooLarge(self.max_len));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// End of stream: hand out the blob and reset for the next transfer.
    /// An empty stream yields `None`.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let blob = std::mem::take(&mut self.buf);
        if blob.is_empty() {
            None
        } else {
            Some(blob)
        }
    }

    /// Channel closed abnormally: discard the partial blob.
    pub fn abort(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf = Vec::new();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> StreamAssembler {
        StreamAssembler::new(1 << 20)
    }

    #[test]
    fn reads_reassemble_and_reset() {
        let blob: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut s = assembler();
        for piece in blob.chunks(READ_BUFFER_SIZE) {
            s.push(piece).unwrap();
        }
        assert_eq!(s.finish(), Some(blob));
        assert!(s.is_empty());
        s.push(b"next").unwrap();
        assert_eq!(s.finish(), Some(b"next".to_vec()));
    }

    #[test]
    fn empty_stream_delivers_nothing() {
        let mut s = assembler();
        assert_eq!(s.finish(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn abort_discards_partial() {
        let mut s = assembler();
        s.push(&[1, 2, 3]).unwrap();
        assert_eq!(s.abort(), 3);
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn limit_enforced() {
        let mut s = StreamAssembler::new(4);
        s.push(&[0; 3]).unwrap();
        assert_eq!(s.push(&[0; 2]), Err(StreamError::TooLarge(4)));
        assert!(s.is_empty());
    }
}
