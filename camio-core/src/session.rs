//! Host-driven session coordinator: SessionCore receives events from the host, returns actions.
//!
//! The core owns every piece of shared state (peer table, calibration points, chunk buffers,
//! the image-request flag). The host serializes calls into it and performs the I/O the
//! returned `Action`s describe.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::calibration::CalibrationPoints;
use crate::chunk::{self, ChunkProgress, ChunkReceiver, DEFAULT_CHUNK_SIZE};
use crate::dispatch::{self, Inbound};
use crate::identity::{PeerId, PeerIdentity};
use crate::peer::{ConnectionState, PeerTable, StateError, Transition};
use crate::stream::{StreamError, StreamTarget, IMAGE_STREAM_NAME};
use crate::wire::MAX_FRAME_LEN;

/// Default bound on waiting for an invitation to be answered.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default largest blob accepted by either transfer mechanism.
pub const DEFAULT_MAX_BLOB_LEN: u64 = MAX_FRAME_LEN as u64;

/// What to do with inbound invitations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvitePolicy {
    #[default]
    AcceptAll,
    /// Hold the invitation until the host resolves it.
    Prompt,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub invite_policy: InvitePolicy,
    /// Invite every discovered peer (only the side with the smaller id sends it).
    pub auto_invite: bool,
    pub invite_timeout: Duration,
    pub chunk_size: usize,
    pub max_blob_len: u64,
    /// Prefix outbound control text with its tag byte.
    pub tagged_text: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invite_policy: InvitePolicy::AcceptAll,
            auto_invite: true,
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_blob_len: DEFAULT_MAX_BLOB_LEN,
            tagged_text: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Chunked,
    Stream,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a session connection and send an invitation.
    Invite(PeerId),
    /// Tear down whatever link exists to the peer.
    Disconnect(PeerId),
    /// Send one reliable message. Messages to the same peer must go out in order.
    SendMessage(PeerId, Vec<u8>),
    StateChanged {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The next captured frame should be sent (see `take_image_request`).
    ImageRequested(PeerId),
    /// The calibration point set was replaced; redraw.
    CalibrationUpdated(PeerId),
    ImageReceived {
        from: PeerId,
        blob: Vec<u8>,
        via: TransferKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationDecision {
    Accept,
    Decline,
    /// Waiting on `resolve_invitation`.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no such connected peer")]
    NoSuchPeer,
    #[error("connection closed")]
    ChannelClosed,
}

/// Per-peer send failure. Never aborts sends to other peers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("send to {peer} failed: {cause}")]
pub struct SendFailed {
    pub peer: PeerId,
    pub cause: SendError,
}

/// One inbound payload, consumed synchronously by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct InboundMessage<'a> {
    pub source: PeerId,
    pub payload: &'a [u8],
    /// Logical arrival counter.
    pub received_at: u64,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct SessionCore {
    identity: PeerIdentity,
    config: SessionConfig,
    peers: PeerTable,
    chunks: ChunkReceiver,
    calibration: CalibrationPoints,
    pending_invitations: HashSet<PeerId>,
    image_requested: bool,
    clock: u64,
}

impl SessionCore {
    pub fn new(identity: PeerIdentity, config: SessionConfig) -> Self {
        let chunks = ChunkReceiver::new(config.max_blob_len);
        Self {
            identity,
            config,
            peers: PeerTable::new(),
            chunks,
            calibration: CalibrationPoints::new(),
            pending_invitations: HashSet::new(),
            image_requested: false,
            clock: 0,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn calibration(&self) -> &CalibrationPoints {
        &self.calibration
    }

    /// Local edits (tap capture) go through here.
    pub fn calibration_mut(&mut self) -> &mut CalibrationPoints {
        &mut self.calibration
    }

    /// Discovery found a peer. May return an `Invite` when auto-invite is on.
    pub fn on_peer_found(&mut self, peer: &PeerIdentity) -> Vec<Action> {
        let is_new = self.peers.upsert(peer.id, &peer.display_name);
        if is_new {
            info!(peer = %peer.id, name = %peer.display_name, "peer found");
        }
        if is_new && self.config.auto_invite && self.identity.id < peer.id {
            return self.invite(peer.id).unwrap_or_default();
        }
        Vec::new()
    }

    /// Discovery lost a peer. The record goes away; any live link must be torn down.
    pub fn on_peer_lost(&mut self, peer: PeerId) -> Vec<Action> {
        self.chunks.discard(&peer);
        self.pending_invitations.remove(&peer);
        match self.peers.remove(&peer) {
            Some(record) => {
                info!(%peer, name = %record.display_name, "peer lost");
                if record.state == ConnectionState::NotConnected {
                    Vec::new()
                } else {
                    vec![Action::Disconnect(peer)]
                }
            }
            None => Vec::new(),
        }
    }

    /// Ask the host to invite a known, unconnected peer.
    pub fn invite(&mut self, peer: PeerId) -> Result<Vec<Action>, StateError> {
        let state = self.peers.state(&peer).ok_or(StateError::UnknownPeer(peer))?;
        if state != ConnectionState::NotConnected {
            return Err(StateError::InvalidTransition {
                from: state,
                to: ConnectionState::Connecting,
            });
        }
        self.peers.mark_outbound_invite(&peer, true);
        debug!(%peer, "inviting peer");
        Ok(vec![Action::Invite(peer)])
    }

    /// An invitation arrived. Crossed invitations resolve in favour of the smaller id.
    pub fn on_invitation(&mut self, from: &PeerIdentity) -> InvitationDecision {
        self.peers.upsert(from.id, &from.display_name);
        let (state, outbound) = match self.peers.get(&from.id) {
            Some(r) => (r.state, r.outbound_invite),
            None => return InvitationDecision::Decline,
        };
        let decision = match state {
            ConnectionState::Connected => InvitationDecision::Decline,
            ConnectionState::Connecting if outbound => {
                if self.identity.id < from.id {
                    InvitationDecision::Decline
                } else {
                    self.peers.mark_outbound_invite(&from.id, false);
                    InvitationDecision::Accept
                }
            }
            ConnectionState::Connecting => InvitationDecision::Decline,
            // Our invite may not have reached the transport yet.
            ConnectionState::NotConnected if outbound && self.identity.id < from.id => {
                InvitationDecision::Decline
            }
            ConnectionState::NotConnected => match self.config.invite_policy {
                InvitePolicy::AcceptAll => {
                    self.peers.mark_outbound_invite(&from.id, false);
                    InvitationDecision::Accept
                }
                InvitePolicy::Prompt => {
                    self.pending_invitations.insert(from.id);
                    InvitationDecision::Pending
                }
            },
        };
        info!(peer = %from.id, name = %from.display_name, ?decision, "invitation received");
        decision
    }

    /// Resolve a held invitation. `None` if nothing was pending for the peer.
    pub fn resolve_invitation(&mut self, peer: PeerId, accept: bool) -> Option<InvitationDecision> {
        if !self.pending_invitations.remove(&peer) {
            return None;
        }
        Some(if accept {
            InvitationDecision::Accept
        } else {
            InvitationDecision::Decline
        })
    }

    pub fn pending_invitations(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.pending_invitations.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Sole writer of peer connection state. Duplicate deliveries are no-ops.
    pub fn on_connection_state_changed(
        &mut self,
        peer: PeerId,
        state: ConnectionState,
        now: Instant,
    ) -> Result<Vec<Action>, StateError> {
        match self.peers.apply(&peer, state, now)? {
            Transition::Unchanged => Ok(Vec::new()),
            Transition::Changed { from, to } => {
                info!(%peer, %from, %to, "connection state changed");
                if to == ConnectionState::NotConnected {
                    self.chunks.discard(&peer);
                    self.pending_invitations.remove(&peer);
                }
                Ok(vec![Action::StateChanged { peer, from, to }])
            }
        }
    }

    /// Send to each peer independently. Peers that are not connected fail with `NoSuchPeer`;
    /// the rest still get the message.
    pub fn send_message(&self, bytes: &[u8], to: &[PeerId]) -> (Vec<Action>, Vec<SendFailed>) {
        let (ok, failed) = self.split_reachable(to);
        let actions = ok
            .into_iter()
            .map(|peer| Action::SendMessage(peer, bytes.to_vec()))
            .collect();
        (actions, failed)
    }

    /// Send to every connected peer.
    pub fn broadcast(&self, bytes: &[u8]) -> Vec<Action> {
        self.send_message(bytes, &self.peers.connected()).0
    }

    /// Split `blob` into chunk messages and send them in order to each reachable peer.
    pub fn send_chunked(&self, blob: &[u8], to: &[PeerId]) -> (Vec<Action>, Vec<SendFailed>) {
        let (ok, failed) = self.split_reachable(to);
        if ok.is_empty() {
            return (Vec::new(), failed);
        }
        let transfer_id: [u8; 16] = uuid::Uuid::new_v4().into_bytes();
        let frames = chunk::split_into_chunks(transfer_id, blob, self.config.chunk_size);
        debug!(bytes = blob.len(), chunks = frames.len(), peers = ok.len(), "chunked send");
        let mut actions = Vec::with_capacity(frames.len() * ok.len());
        for frame in &frames {
            for peer in &ok {
                actions.push(Action::SendMessage(*peer, frame.clone()));
            }
        }
        (actions, failed)
    }

    /// "Image, Please" to every connected peer.
    pub fn request_image(&self) -> Vec<Action> {
        self.broadcast(&dispatch::image_request_message(self.config.tagged_text))
    }

    /// Current calibration point set to every connected peer.
    pub fn send_calibration(&self) -> Vec<Action> {
        self.broadcast(&dispatch::calibration_message(
            &self.calibration,
            self.config.tagged_text,
        ))
    }

    /// Target for a streamed image: the first connected peer only.
    pub fn plan_stream_send(&self) -> Result<StreamTarget, StreamError> {
        let peer = *self
            .peers
            .connected()
            .first()
            .ok_or(StreamError::NoConnectedPeer)?;
        self.stream_target(peer, IMAGE_STREAM_NAME)
    }

    /// Precondition for opening an outbound stream to a specific peer.
    pub fn stream_target(&self, peer: PeerId, name: &str) -> Result<StreamTarget, StreamError> {
        if self.peers.state(&peer) != Some(ConnectionState::Connected) {
            return Err(StreamError::NoSuchPeer(peer));
        }
        Ok(StreamTarget {
            peer,
            name: name.to_string(),
        })
    }

    /// Whether an inbound stream should be read at all.
    pub fn accepts_stream(&self, peer: PeerId, name: &str) -> bool {
        name == IMAGE_STREAM_NAME && self.peers.state(&peer) == Some(ConnectionState::Connected)
    }

    /// A reliable message arrived. Must be called in arrival order per peer.
    pub fn on_message_received(&mut self, peer: PeerId, bytes: &[u8]) -> Vec<Action> {
        if self.peers.state(&peer) != Some(ConnectionState::Connected) {
            warn!(%peer, len = bytes.len(), "message from unconnected peer dropped");
            return Vec::new();
        }
        self.clock = self.clock.saturating_add(1);
        self.dispatch(InboundMessage {
            source: peer,
            payload: bytes,
            received_at: self.clock,
        })
    }

    fn dispatch(&mut self, msg: InboundMessage<'_>) -> Vec<Action> {
        trace!(
            peer = %msg.source,
            len = msg.payload.len(),
            at = msg.received_at,
            "inbound message"
        );
        match dispatch::classify(msg.payload) {
            Inbound::ImageRequest => {
                self.image_requested = true;
                vec![Action::ImageRequested(msg.source)]
            }
            Inbound::CalibrationData(data) => {
                debug!(
                    peer = %msg.source,
                    points = data.points.len(),
                    skipped = data.skipped,
                    "calibration data"
                );
                self.calibration.replace(data.points, data.frame);
                vec![Action::CalibrationUpdated(msg.source)]
            }
            Inbound::UnknownControl(text) => {
                warn!(
                    peer = %msg.source,
                    text = %String::from_utf8_lossy(text),
                    "unknown control message dropped"
                );
                Vec::new()
            }
            Inbound::RawChunk(raw) => match self.chunks.accept(msg.source, raw) {
                ChunkProgress::Complete(blob) => {
                    debug!(peer = %msg.source, bytes = blob.len(), "chunked transfer complete");
                    vec![Action::ImageReceived {
                        from: msg.source,
                        blob,
                        via: TransferKind::Chunked,
                    }]
                }
                ChunkProgress::InProgress { received, total } => {
                    trace!(peer = %msg.source, received, total, "chunk");
                    Vec::new()
                }
                ChunkProgress::Unterminated { buffered } => {
                    debug!(peer = %msg.source, buffered, "untagged chunk data buffered");
                    Vec::new()
                }
                ChunkProgress::Rejected(reason) => {
                    warn!(peer = %msg.source, %reason, "chunked transfer dropped");
                    Vec::new()
                }
            },
        }
    }

    /// An inbound stream reached end-of-stream. `None` means it carried no bytes.
    pub fn on_stream_finished(&mut self, peer: PeerId, blob: Option<Vec<u8>>) -> Vec<Action> {
        match blob {
            Some(blob) => {
                debug!(%peer, bytes = blob.len(), "stream transfer complete");
                vec![Action::ImageReceived {
                    from: peer,
                    blob,
                    via: TransferKind::Stream,
                }]
            }
            None => {
                debug!(%peer, "empty stream, nothing delivered");
                Vec::new()
            }
        }
    }

    /// Consume the one-shot flag armed by an image request.
    pub fn take_image_request(&mut self) -> bool {
        std::mem::take(&mut self.image_requested)
    }

    /// Periodic tick: revert invitations that were not answered in time.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for peer in self
            .peers
            .expired_invitations(now, self.config.invite_timeout)
        {
            warn!(%peer, "invitation timed out");
            if let Ok(changed) =
                self.on_connection_state_changed(peer, ConnectionState::NotConnected, now)
            {
                actions.extend(changed);
                actions.push(Action::Disconnect(peer));
            }
        }
        actions
    }

    /// Connection status line for the UI.
    pub fn status_line(&self) -> String {
        let names: Vec<&str> = self
            .peers
            .connected()
            .iter()
            .filter_map(|id| self.peers.get(id).map(|r| r.display_name.as_str()))
            .collect();
        if names.is_empty() {
            "Not connected".to_string()
        } else {
            format!("Connected to: {:?}", names)
        }
    }

    fn split_reachable(&self, to: &[PeerId]) -> (Vec<PeerId>, Vec<SendFailed>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for &peer in to {
            if self.peers.state(&peer) == Some(ConnectionState::Connected) {
                ok.push(peer);
            } else {
                failed.push(SendFailed {
                    peer,
                    cause: SendError::NoSuchPeer,
                });
            }
        }
        (ok, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Point;
    use crate::chunk::split_into_chunks;
    use crate::stream::StreamAssembler;
    use ConnectionState::*;

    fn core_with(config: SessionConfig) -> SessionCore {
        SessionCore::new(PeerIdentity::new(PeerId::random(), "local"), config)
    }

    fn core() -> SessionCore {
        core_with(SessionConfig {
            auto_invite: false,
            ..SessionConfig::default()
        })
    }

    fn connect(core: &mut SessionCore, name: &str) -> PeerId {
        let peer = PeerIdentity::new(PeerId::random(), name);
        core.on_peer_found(&peer);
        let now = Instant::now();
        core.on_connection_state_changed(peer.id, Connecting, now)
            .unwrap();
        core.on_connection_state_changed(peer.id, Connected, now)
            .unwrap();
        peer.id
    }

    fn states(actions: &[Action]) -> Vec<ConnectionState> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn found_invite_accept_sequence() {
        let mut core = core_with(SessionConfig::default());
        // Remote id above ours so the local side sends the invitation.
        let remote = PeerIdentity::new(PeerId::from_bytes([0xff; 16]), "ipad");
        let local = core.identity().id;
        assert!(local < remote.id);

        let actions = core.on_peer_found(&remote);
        assert_eq!(actions, vec![Action::Invite(remote.id)]);
        let mut observed = vec![core.peers().state(&remote.id).unwrap()];

        let now = Instant::now();
        for s in [Connecting, Connected, Connected] {
            observed.extend(states(
                &core.on_connection_state_changed(remote.id, s, now).unwrap(),
            ));
        }
        assert_eq!(observed, vec![NotConnected, Connecting, Connected]);
    }

    #[test]
    fn larger_id_does_not_auto_invite() {
        let mut core = core_with(SessionConfig::default());
        let remote = PeerIdentity::new(PeerId::from_bytes([0; 16]), "tv");
        assert!(core.on_peer_found(&remote).is_empty());
    }

    #[test]
    fn partial_send_failure() {
        let mut core = core();
        let a = connect(&mut core, "a");
        let b = PeerIdentity::new(PeerId::random(), "b");
        core.on_peer_found(&b);

        let (actions, failed) = core.send_message(b"hi", &[a, b.id]);
        assert_eq!(actions, vec![Action::SendMessage(a, b"hi".to_vec())]);
        assert_eq!(
            failed,
            vec![SendFailed {
                peer: b.id,
                cause: SendError::NoSuchPeer
            }]
        );
    }

    #[test]
    fn image_request_arms_one_shot_flag() {
        let mut core = core();
        let a = connect(&mut core, "a");
        let actions = core.on_message_received(a, b"Image, Please");
        assert_eq!(actions, vec![Action::ImageRequested(a)]);
        assert!(core.take_image_request());
        assert!(!core.take_image_request());
    }

    #[test]
    fn calibration_replaces_points() {
        let mut core = core();
        let a = connect(&mut core, "a");
        core.calibration_mut().push(Point::new(99.0, 99.0));
        let actions = core.on_message_received(a, b"Landmark Data:\n10.0 20.0\n30.5 40.25\n");
        assert_eq!(actions, vec![Action::CalibrationUpdated(a)]);
        assert_eq!(
            core.calibration().points(),
            &[Point::new(10.0, 20.0), Point::new(30.5, 40.25)]
        );
    }

    #[test]
    fn unknown_control_text_is_dropped() {
        let mut core = core();
        let peer = connect(&mut core, "ipad");
        let actions = core.on_message_received(peer, &dispatch::text_message("hello", true));
        assert!(actions.is_empty());
        assert_eq!(core.chunks.buffered(&peer), 0);
    }

    #[test]
    fn chunked_send_then_receive() {
        let mut sender = core();
        let mut receiver = core();
        let to = connect(&mut sender, "rx");
        let from = connect(&mut receiver, "tx");
        let blob: Vec<u8> = (0..20_000u32).map(|i| (i * 7) as u8).collect();

        let (actions, failed) = sender.send_chunked(&blob, &[to]);
        assert!(failed.is_empty());
        assert_eq!(actions.len(), 3);
        let mut delivered = Vec::new();
        for action in actions {
            if let Action::SendMessage(_, bytes) = action {
                delivered.extend(receiver.on_message_received(from, &bytes));
            }
        }
        assert_eq!(
            delivered,
            vec![Action::ImageReceived {
                from,
                blob,
                via: TransferKind::Chunked
            }]
        );
    }

    #[test]
    fn chunked_fan_out_is_frame_major() {
        let mut core = core();
        let a = connect(&mut core, "a");
        let b = connect(&mut core, "b");
        let (actions, _) = core.send_chunked(&[0u8; 10_000], &[a, b]);
        let order: Vec<PeerId> = actions
            .iter()
            .filter_map(|x| match x {
                Action::SendMessage(p, _) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![a, b, a, b]);
    }

    #[test]
    fn disconnect_discards_partial_chunks() {
        let mut core = core();
        let a = connect(&mut core, "a");
        let frames = split_into_chunks([9u8; 16], &[1u8; 20_000], DEFAULT_CHUNK_SIZE);
        core.on_message_received(a, &frames[0]);
        let now = Instant::now();
        core.on_connection_state_changed(a, NotConnected, now)
            .unwrap();
        core.on_connection_state_changed(a, Connecting, now).unwrap();
        core.on_connection_state_changed(a, Connected, now).unwrap();
        // The tail of the old transfer alone must not complete anything.
        assert!(core.on_message_received(a, &frames[1]).is_empty());
        assert!(core.on_message_received(a, &frames[2]).is_empty());
    }

    #[test]
    fn stream_round_trip_and_empty_stream() {
        let mut core = core();
        let a = connect(&mut core, "a");
        assert_eq!(core.plan_stream_send().unwrap().peer, a);
        assert!(core.accepts_stream(a, IMAGE_STREAM_NAME));

        let blob = vec![0xabu8; 9000];
        let mut rx = StreamAssembler::new(DEFAULT_MAX_BLOB_LEN);
        for piece in blob.chunks(crate::stream::READ_BUFFER_SIZE) {
            rx.push(piece).unwrap();
        }
        assert_eq!(
            core.on_stream_finished(a, rx.finish()),
            vec![Action::ImageReceived {
                from: a,
                blob,
                via: TransferKind::Stream
            }]
        );
        assert!(rx.is_empty());
        assert!(core.on_stream_finished(a, rx.finish()).is_empty());
    }

    #[test]
    fn stream_needs_connected_peer() {
        let core = core();
        assert_eq!(core.plan_stream_send(), Err(StreamError::NoConnectedPeer));
        let stranger = PeerId::random();
        assert_eq!(
            core.stream_target(stranger, IMAGE_STREAM_NAME),
            Err(StreamError::NoSuchPeer(stranger))
        );
    }

    #[test]
    fn prompt_policy_holds_invitation() {
        let mut core = core_with(SessionConfig {
            invite_policy: InvitePolicy::Prompt,
            auto_invite: false,
            ..SessionConfig::default()
        });
        let remote = PeerIdentity::new(PeerId::random(), "phone");
        assert_eq!(core.on_invitation(&remote), InvitationDecision::Pending);
        assert_eq!(core.pending_invitations(), vec![remote.id]);
        assert_eq!(
            core.resolve_invitation(remote.id, true),
            Some(InvitationDecision::Accept)
        );
        assert_eq!(core.resolve_invitation(remote.id, true), None);
    }

    #[test]
    fn crossed_invitations_favour_smaller_id() {
        let mut core = core();
        let local = core.identity().id;
        let bigger = PeerIdentity::new(PeerId::from_bytes([0xff; 16]), "big");
        core.on_peer_found(&bigger);
        core.invite(bigger.id).unwrap();
        core.on_connection_state_changed(bigger.id, Connecting, Instant::now())
            .unwrap();
        assert!(local < bigger.id);
        assert_eq!(core.on_invitation(&bigger), InvitationDecision::Decline);

        let mut core = self::core();
        let smaller = PeerIdentity::new(PeerId::from_bytes([0; 16]), "small");
        core.on_peer_found(&smaller);
        core.invite(smaller.id).unwrap();
        core.on_connection_state_changed(smaller.id, Connecting, Instant::now())
            .unwrap();
        assert_eq!(core.on_invitation(&smaller), InvitationDecision::Accept);
    }

    #[test]
    fn invitation_crossing_our_unsent_invite() {
        let local = PeerIdentity::new(PeerId::from_bytes([0x10; 16]), "local");
        let mut core = SessionCore::new(
            local,
            SessionConfig {
                auto_invite: false,
                ..SessionConfig::default()
            },
        );
        let bigger = PeerIdentity::new(PeerId::from_bytes([0xff; 16]), "big");
        core.on_peer_found(&bigger);
        core.invite(bigger.id).unwrap();
        assert_eq!(core.on_invitation(&bigger), InvitationDecision::Decline);

        let smaller = PeerIdentity::new(PeerId::from_bytes([0x01; 16]), "small");
        core.on_peer_found(&smaller);
        core.invite(smaller.id).unwrap();
        assert_eq!(core.on_invitation(&smaller), InvitationDecision::Accept);
        assert!(!core.peers().get(&smaller.id).unwrap().outbound_invite);
    }

    #[test]
    fn connected_peer_declines_second_invitation() {
        let mut core = core();
        let a = connect(&mut core, "a");
        let again = PeerIdentity::new(a, "a");
        assert_eq!(core.on_invitation(&again), InvitationDecision::Decline);
    }

    #[test]
    fn invitation_timeout_reverts_to_not_connected() {
        let mut core = core();
        let peer = PeerIdentity::new(PeerId::random(), "slow");
        core.on_peer_found(&peer);
        let start = Instant::now();
        core.on_connection_state_changed(peer.id, Connecting, start)
            .unwrap();
        assert!(core.tick(start + Duration::from_secs(5)).is_empty());
        let actions = core.tick(start + DEFAULT_INVITE_TIMEOUT);
        assert!(actions.contains(&Action::Disconnect(peer.id)));
        assert_eq!(core.peers().state(&peer.id), Some(NotConnected));
    }

    #[test]
    fn lost_connected_peer_is_disconnected() {
        let mut core = core();
        let a = connect(&mut core, "a");
        assert_eq!(core.on_peer_lost(a), vec![Action::Disconnect(a)]);
        assert!(core.peers().get(&a).is_none());
        assert!(core.on_message_received(a, b"Image, Please").is_empty());
    }

    #[test]
    fn status_line_lists_connected_names() {
        let mut core = core();
        assert_eq!(core.status_line(), "Not connected");
        connect(&mut core, "ipad");
        assert_eq!(core.status_line(), "Connected to: [\"ipad\"]");
    }
}
