//! Camio peer session core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod calibration;
pub mod chunk;
pub mod collaborator;
pub mod discovery;
pub mod dispatch;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod wire;

pub use calibration::{CalibrationPoints, FrameSize, Point, Viewport};
pub use collaborator::{CodecError, FrameSource, ImageCodec, InvalidImageBlob, Renderer};
pub use discovery::{DiscoveryEvent, PeerBrowser};
pub use identity::{PeerId, PeerIdentity, SERVICE_TYPE};
pub use peer::{ConnectionState, PeerRecord, StateError};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use session::{
    Action, InvitationDecision, InvitePolicy, SendError, SendFailed, SessionConfig, SessionCore,
    TransferKind,
};
pub use stream::{StreamAssembler, StreamError, StreamTarget, IMAGE_STREAM_NAME};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
