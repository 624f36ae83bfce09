//! Chunked transfer: split a blob into fixed-size reliable messages, reassemble per source peer.
//!
//! Every chunk carries `[TAG_CHUNK][transfer_id: 16][total_len: u64 LE]` ahead of its payload.
//! Chunks carry no sequence number; per-peer in-order delivery is assumed. The receiver
//! completes a transfer once it holds `total_len` bytes.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::identity::PeerId;

/// Default chunk payload size in bytes. The last chunk may be shorter.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Leading tag byte of a chunk message.
pub const TAG_CHUNK: u8 = 0x02;

pub const CHUNK_HEADER_LEN: usize = 1 + 16 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub transfer_id: [u8; 16],
    pub total_len: u64,
}

impl ChunkHeader {
    fn write(&self, out: &mut Vec<u8>) {
        out.push(TAG_CHUNK);
        out.extend_from_slice(&self.transfer_id);
        out.extend_from_slice(&self.total_len.to_le_bytes());
    }
}

/// Split `blob` into chunk messages ready for `send_message`. An empty blob still yields one
/// header-only message so the receiver can complete it.
pub fn split_into_chunks(transfer_id: [u8; 16], blob: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let header = ChunkHeader {
        transfer_id,
        total_len: blob.len() as u64,
    };
    let frame = |piece: &[u8]| {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + piece.len());
        header.write(&mut out);
        out.extend_from_slice(piece);
        out
    };
    if blob.is_empty() {
        return vec![frame(&[])];
    }
    blob.chunks(size).map(frame).collect()
}

/// Parse a tagged chunk message. `None` if the tag or header is missing.
pub fn parse_chunk(bytes: &[u8]) -> Option<(ChunkHeader, &[u8])> {
    if bytes.len() < CHUNK_HEADER_LEN || bytes[0] != TAG_CHUNK {
        return None;
    }
    let mut transfer_id = [0u8; 16];
    transfer_id.copy_from_slice(&bytes[1..17]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[17..25]);
    let header = ChunkHeader {
        transfer_id,
        total_len: u64::from_le_bytes(len),
    };
    Some((header, &bytes[CHUNK_HEADER_LEN..]))
}

/// A payload the dispatcher could not read as control text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawChunk<'a> {
    /// Carries a chunk header; can complete.
    Framed {
        header: ChunkHeader,
        payload: &'a [u8],
    },
    /// Untagged bytes from an older peer. Accumulated, but nothing marks the end.
    Untagged(&'a [u8]),
}

impl<'a> RawChunk<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        match parse_chunk(bytes) {
            Some((header, payload)) => RawChunk::Framed { header, payload },
            None => RawChunk::Untagged(bytes),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkProgress {
    InProgress { received: u64, total: u64 },
    Complete(Vec<u8>),
    /// Untagged bytes buffered with no way to know when they end.
    Unterminated { buffered: usize },
    Rejected(ChunkRejected),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkRejected {
    #[error("transfer of {0} bytes exceeds the blob limit")]
    TooLarge(u64),
    #[error("chunk overruns the announced transfer length")]
    Overflow,
}

struct Assembly {
    transfer_id: [u8; 16],
    total_len: u64,
    buf: Vec<u8>,
}

/// Per-source reassembly buffers. Buffers are never shared across peers.
pub struct ChunkReceiver {
    transfers: HashMap<PeerId, Assembly>,
    legacy: HashMap<PeerId, Vec<u8>>,
    max_blob_len: u64,
}

impl ChunkReceiver {
    pub fn new(max_blob_len: u64) -> Self {
        Self {
            transfers: HashMap::new(),
            legacy: HashMap::new(),
            max_blob_len,
        }
    }

    /// Append one chunk from `peer`.
    pub fn accept(&mut self, peer: PeerId, chunk: RawChunk<'_>) -> ChunkProgress {
        match chunk {
            RawChunk::Framed { header, payload } => self.accept_framed(peer, header, payload),
            RawChunk::Untagged(bytes) => self.accept_untagged(peer, bytes),
        }
    }

    fn accept_framed(
        &mut self,
        peer: PeerId,
        header: ChunkHeader,
        payload: &[u8],
    ) -> ChunkProgress {
        if header.total_len > self.max_blob_len {
            self.transfers.remove(&peer);
            return ChunkProgress::Rejected(ChunkRejected::TooLarge(header.total_len));
        }
        if self.legacy.remove(&peer).is_some() {
            debug!(%peer, "dropping untagged chunk data, tagged transfer started");
        }
        let restart = match self.transfers.get(&peer) {
            Some(a) => a.transfer_id != header.transfer_id,
            None => true,
        };
        if restart {
            if let Some(old) = self.transfers.remove(&peer) {
                warn!(
                    %peer,
                    received = old.buf.len(),
                    total = old.total_len,
                    "new transfer replaced an incomplete one"
                );
            }
            self.transfers.insert(
                peer,
                Assembly {
                    transfer_id: header.transfer_id,
                    total_len: header.total_len,
                    buf: Vec::with_capacity(header.total_len as usize),
                },
            );
        }
        let Some(assembly) = self.transfers.get_mut(&peer) else {
            return ChunkProgress::Rejected(ChunkRejected::Overflow);
        };
        if assembly.buf.len() as u64 + payload.len() as u64 > assembly.total_len {
            self.transfers.remove(&peer);
            return ChunkProgress::Rejected(ChunkRejected::Overflow);
        }
        assembly.buf.extend_from_slice(payload);
        let received = assembly.buf.len() as u64;
        if received == assembly.total_len {
            let done = self.transfers.remove(&peer).map(|a| a.buf).unwrap_or_default();
            return ChunkProgress::Complete(done);
        }
        ChunkProgress::InProgress {
            received,
            total: assembly.total_len,
        }
    }

    fn accept_untagged(&mut self, peer: PeerId, bytes: &[u8]) -> ChunkProgress {
        let buf = self.legacy.entry(peer).or_default();
        if (buf.len() + bytes.len()) as u64 > self.max_blob_len {
            let total = (buf.len() + bytes.len()) as u64;
            self.legacy.remove(&peer);
            return ChunkProgress::Rejected(ChunkRejected::TooLarge(total));
        }
        buf.extend_from_slice(bytes);
        ChunkProgress::Unterminated {
            buffered: buf.len(),
        }
    }

    /// Drop everything buffered from `peer` (disconnect or lost).
    pub fn discard(&mut self, peer: &PeerId) {
        self.transfers.remove(peer);
        self.legacy.remove(peer);
    }

    pub fn buffered(&self, peer: &PeerId) -> usize {
        self.transfers.get(peer).map(|a| a.buf.len()).unwrap_or(0)
            + self.legacy.get(peer).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    const LIMIT: u64 = 1 << 20;

    fn random_blob(len: usize) -> Vec<u8> {
        let mut blob = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut blob);
        blob
    }

    fn feed(rx: &mut ChunkReceiver, peer: PeerId, frames: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut done = None;
        for f in frames {
            if let ChunkProgress::Complete(b) = rx.accept(peer, RawChunk::from_bytes(f)) {
                done = Some(b);
            }
        }
        done
    }

    #[test]
    fn split_sizes() {
        let frames = split_into_chunks([1u8; 16], &random_blob(20_000), DEFAULT_CHUNK_SIZE);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), CHUNK_HEADER_LEN + 8192);
        assert_eq!(frames[2].len(), CHUNK_HEADER_LEN + 20_000 - 2 * 8192);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let frames = split_into_chunks([1u8; 16], &random_blob(DEFAULT_CHUNK_SIZE * 2), 0);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn reassembles_in_arrival_order() {
        let blob = random_blob(30_001);
        let frames = split_into_chunks([7u8; 16], &blob, DEFAULT_CHUNK_SIZE);
        let mut rx = ChunkReceiver::new(LIMIT);
        let peer = PeerId::random();
        assert_eq!(feed(&mut rx, peer, &frames), Some(blob));
        assert_eq!(rx.buffered(&peer), 0);
    }

    #[test]
    fn exact_multiple_completes_on_last_chunk() {
        let blob = random_blob(DEFAULT_CHUNK_SIZE * 2);
        let frames = split_into_chunks([3u8; 16], &blob, DEFAULT_CHUNK_SIZE);
        let mut rx = ChunkReceiver::new(LIMIT);
        let peer = PeerId::random();
        assert!(matches!(
            rx.accept(peer, RawChunk::from_bytes(&frames[0])),
            ChunkProgress::InProgress {
                received: 8192,
                total: 16384
            }
        ));
        assert_eq!(
            rx.accept(peer, RawChunk::from_bytes(&frames[1])),
            ChunkProgress::Complete(blob)
        );
    }

    #[test]
    fn empty_blob_completes_immediately() {
        let frames = split_into_chunks([0u8; 16], &[], DEFAULT_CHUNK_SIZE);
        assert_eq!(frames.len(), 1);
        let mut rx = ChunkReceiver::new(LIMIT);
        assert_eq!(
            rx.accept(PeerId::random(), RawChunk::from_bytes(&frames[0])),
            ChunkProgress::Complete(Vec::new())
        );
    }

    #[test]
    fn buffers_are_per_peer() {
        let a_blob = random_blob(10_000);
        let b_blob = random_blob(12_000);
        let a = split_into_chunks([1u8; 16], &a_blob, DEFAULT_CHUNK_SIZE);
        let b = split_into_chunks([1u8; 16], &b_blob, DEFAULT_CHUNK_SIZE);
        let (pa, pb) = (PeerId::random(), PeerId::random());
        let mut rx = ChunkReceiver::new(LIMIT);
        rx.accept(pa, RawChunk::from_bytes(&a[0]));
        rx.accept(pb, RawChunk::from_bytes(&b[0]));
        assert_eq!(
            rx.accept(pa, RawChunk::from_bytes(&a[1])),
            ChunkProgress::Complete(a_blob)
        );
        assert_eq!(
            rx.accept(pb, RawChunk::from_bytes(&b[1])),
            ChunkProgress::Complete(b_blob)
        );
    }

    #[test]
    fn new_transfer_replaces_partial() {
        let first = split_into_chunks([1u8; 16], &random_blob(20_000), DEFAULT_CHUNK_SIZE);
        let second_blob = random_blob(100);
        let second = split_into_chunks([2u8; 16], &second_blob, DEFAULT_CHUNK_SIZE);
        let peer = PeerId::random();
        let mut rx = ChunkReceiver::new(LIMIT);
        rx.accept(peer, RawChunk::from_bytes(&first[0]));
        assert_eq!(
            rx.accept(peer, RawChunk::from_bytes(&second[0])),
            ChunkProgress::Complete(second_blob)
        );
    }

    #[test]
    fn oversized_transfer_rejected() {
        let frames = split_into_chunks([1u8; 16], &random_blob(2048), 1024);
        let mut rx = ChunkReceiver::new(1000);
        assert_eq!(
            rx.accept(PeerId::random(), RawChunk::from_bytes(&frames[0])),
            ChunkProgress::Rejected(ChunkRejected::TooLarge(2048))
        );
    }

    #[test]
    fn untagged_bytes_accumulate_until_discarded() {
        let peer = PeerId::random();
        let mut rx = ChunkReceiver::new(LIMIT);
        assert_eq!(
            rx.accept(peer, RawChunk::Untagged(&[0xff, 0xd8, 0xff])),
            ChunkProgress::Unterminated { buffered: 3 }
        );
        assert_eq!(
            rx.accept(peer, RawChunk::Untagged(&[0xe0])),
            ChunkProgress::Unterminated { buffered: 4 }
        );
        rx.discard(&peer);
        assert_eq!(rx.buffered(&peer), 0);
    }
}
