//! Framing: length-prefix (4 bytes LE) + payload.
//!
//! Handshake frames carry a bincode `Message`; session frames carry the raw
//! application payload unchanged.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    frame_payload(&payload)
}

/// Wrap raw payload bytes in a length-prefixed frame.
pub fn frame_payload(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let (payload, consumed) = split_frame(bytes)?;
    Ok((decode_payload(payload)?, consumed))
}

/// Decode a message from a frame payload already read off a socket.
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameDecodeError> {
    bincode::deserialize(payload).map_err(FrameDecodeError::Decode)
}

/// Split one raw frame off the front of `bytes`: (payload, bytes consumed).
pub fn split_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Validate a length header read off a socket.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::protocol::PROTOCOL_VERSION;

    fn sample_beacon() -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service: "camio-peer".into(),
            peer_id: PeerId::random(),
            display_name: "kitchen-ipad".into(),
            listen_port: 45681,
        }
    }

    #[test]
    fn beacon_survives_framing() {
        let msg = sample_beacon();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_beacon()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn raw_frames_back_to_back() {
        let mut buf = frame_payload(b"first").unwrap();
        buf.extend(frame_payload(&[0xff, 0x00, 0x02]).unwrap());
        let (a, n1) = split_frame(&buf).unwrap();
        assert_eq!(a, b"first");
        let (b, n2) = split_frame(&buf[n1..]).unwrap();
        assert_eq!(b, &[0xff, 0x00, 0x02]);
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
    }
}
