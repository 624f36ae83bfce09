//! Camio control protocol: discovery beacons and session/stream handshakes.
//!
//! Application payloads (control text, image chunks) are not `Message`s; they travel as
//! raw length-prefixed frames once a session is up (see `dispatch` and `chunk`).

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current protocol version. Carried in beacons and invitations.
pub const PROTOCOL_VERSION: u8 = 1;

/// Handshake and discovery messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence under a service namespace.
    Beacon {
        protocol_version: u8,
        service: String,
        peer_id: PeerId,
        display_name: String,
        listen_port: u16,
    },
    /// Discovery: graceful leave, so browsers report `lost` without waiting for the timeout.
    Bye {
        service: String,
        peer_id: PeerId,
    },
    /// First frame on a session connection. `listen_port` lets the invitee open streams back.
    Invite {
        protocol_version: u8,
        peer_id: PeerId,
        display_name: String,
        listen_port: u16,
    },
    /// Invitation accepted; the connection now carries reliable messages.
    Accept {
        peer_id: PeerId,
    },
    /// Invitation rejected; the connection is closed after this frame.
    Decline {
        peer_id: PeerId,
    },
    /// First frame on a stream connection; raw bytes follow until close.
    StreamOpen {
        peer_id: PeerId,
        name: String,
    },
}
