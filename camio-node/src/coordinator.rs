//! Single owner of the session core. Discovery, transport, camera, timer and operator input
//! all arrive here as events; the core's actions are carried out against the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use camio_core::collaborator::decode_blob;
use camio_core::session::InvitationDecision;
use camio_core::{
    Action, ConnectionState, DiscoveryEvent, ImageCodec, PeerId, Renderer, SendError, SendFailed,
    SessionCore, StreamError, TransferKind, IMAGE_STREAM_NAME,
};
use image::DynamicImage;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::commands::{Command, HELP};
use crate::media::{ImageStore, JpegCodec, LogRenderer};
use crate::transport::{Admission, PeerLink, Transport, TransportEvent};

#[derive(Debug)]
pub enum Event {
    Discovery(DiscoveryEvent),
    Transport(TransportEvent),
    Command(Command),
    Frame(DynamicImage),
    /// A compressed image ready to go out.
    Encoded { blob: Vec<u8>, via: TransferKind },
    /// A received image, decoded and stored.
    Decoded { from: PeerId, image: DynamicImage },
    Tick,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaSettings {
    pub transfer: TransferKind,
    pub stream_quality: f32,
    pub chunk_quality: f32,
}

impl MediaSettings {
    fn quality(&self, via: TransferKind) -> f32 {
        match via {
            TransferKind::Stream => self.stream_quality,
            TransferKind::Chunked => self.chunk_quality,
        }
    }
}

/// Connection attempt currently owning a peer. Events from other attempts are stale.
struct Link {
    attempt: u64,
    cancel: CancellationToken,
    tx: Option<PeerLink>,
}

pub struct Coordinator {
    core: SessionCore,
    transport: Transport,
    events: mpsc::UnboundedSender<Event>,
    media: MediaSettings,
    store: ImageStore,
    renderer: LogRenderer,
    addrs: HashMap<PeerId, SocketAddr>,
    links: HashMap<PeerId, Link>,
    pending: HashMap<PeerId, oneshot::Sender<Option<Admission>>>,
    next_attempt: u64,
    latest_frame: Option<DynamicImage>,
    received: u64,
    status: String,
}

impl Coordinator {
    pub fn new(
        core: SessionCore,
        transport: Transport,
        events: mpsc::UnboundedSender<Event>,
        media: MediaSettings,
        store: ImageStore,
    ) -> Self {
        let status = core.status_line();
        Self {
            core,
            transport,
            events,
            media,
            store,
            renderer: LogRenderer::default(),
            addrs: HashMap::new(),
            links: HashMap::new(),
            pending: HashMap::new(),
            next_attempt: 0,
            latest_frame: None,
            received: 0,
            status,
        }
    }

    /// Process events until `shutdown` fires, then close every session.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Event>,
        shutdown: CancellationToken,
    ) {
        info!("{}", self.status);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = inbox.recv() => match ev {
                    Some(ev) => self.handle(ev),
                    None => break,
                },
            }
        }
        for (_, link) in self.links.drain() {
            link.cancel.cancel();
        }
        self.pending.clear();
    }

    pub fn handle(&mut self, ev: Event) {
        match ev {
            Event::Discovery(DiscoveryEvent::Found { peer, addr }) => {
                self.addrs.insert(peer.id, addr);
                let actions = self.core.on_peer_found(&peer);
                self.perform(actions);
            }
            Event::Discovery(DiscoveryEvent::Lost { peer }) => {
                self.addrs.remove(&peer);
                self.pending.remove(&peer);
                let actions = self.core.on_peer_lost(peer);
                self.perform(actions);
            }
            Event::Transport(ev) => self.on_transport(ev),
            Event::Command(cmd) => self.on_command(cmd),
            Event::Frame(frame) => {
                if self.core.take_image_request() {
                    self.encode_and_send(frame.clone());
                }
                self.latest_frame = Some(frame);
            }
            Event::Encoded { blob, via } => self.send_image(blob, via),
            Event::Decoded { from, image } => {
                self.renderer.show_image(from, &image);
                self.renderer.redraw(self.core.calibration());
            }
            Event::Tick => {
                let actions = self.core.tick(Instant::now());
                self.perform(actions);
                self.drop_abandoned_invitations();
            }
        }
        self.report_status();
    }

    fn on_transport(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::StateChanged {
                peer,
                attempt,
                state,
                link,
            } => {
                if !self.is_current(peer, attempt) {
                    trace!(%peer, attempt, %state, "stale connection event");
                    return;
                }
                if let (ConnectionState::Connected, Some(l)) = (state, self.links.get_mut(&peer)) {
                    l.tx = link;
                }
                match self
                    .core
                    .on_connection_state_changed(peer, state, Instant::now())
                {
                    Ok(actions) => self.perform(actions),
                    Err(e) => {
                        warn!(%peer, error = %e, "connection state rejected");
                        self.drop_link(peer);
                    }
                }
                if state == ConnectionState::NotConnected {
                    self.links.remove(&peer);
                }
            }
            TransportEvent::Invitation {
                from,
                addr,
                respond,
            } => {
                self.addrs.entry(from.id).or_insert(addr);
                match self.core.on_invitation(&from) {
                    InvitationDecision::Accept => self.admit(from.id, respond),
                    InvitationDecision::Decline => {
                        let _ = respond.send(None);
                    }
                    InvitationDecision::Pending => {
                        info!(
                            peer = %from.id,
                            name = %from.display_name,
                            "invitation waiting: `accept {0}` or `decline {0}`",
                            from.display_name
                        );
                        self.pending.insert(from.id, respond);
                    }
                }
            }
            TransportEvent::Message {
                peer,
                attempt,
                bytes,
            } => {
                if !self.is_current(peer, attempt) {
                    trace!(%peer, attempt, "message from stale session dropped");
                    return;
                }
                let actions = self.core.on_message_received(peer, &bytes);
                self.perform(actions);
            }
            TransportEvent::StreamOpened {
                peer,
                name,
                respond,
            } => {
                let token = if self.core.accepts_stream(peer, &name) {
                    self.links.get(&peer).map(|l| l.cancel.child_token())
                } else {
                    debug!(%peer, %name, "refusing stream");
                    None
                };
                let _ = respond.send(token);
            }
            TransportEvent::StreamFinished { peer, name, blob } => {
                if self.core.peers().state(&peer) != Some(ConnectionState::Connected) {
                    debug!(%peer, %name, "stream from disconnected peer dropped");
                    return;
                }
                let actions = self.core.on_stream_finished(peer, blob);
                self.perform(actions);
            }
            TransportEvent::StreamAborted {
                peer,
                name,
                dropped,
                reason,
            } => {
                warn!(%peer, %name, dropped, %reason, "stream aborted, partial data discarded");
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Peers => {
                if self.core.peers().is_empty() {
                    info!("no peers known");
                }
                for r in self.core.peers().iter() {
                    info!(
                        peer = %r.id,
                        name = %r.display_name,
                        state = %r.state,
                        addr = ?self.addrs.get(&r.id),
                        "peer"
                    );
                }
                for id in self.core.pending_invitations() {
                    info!(peer = %id, "invitation pending");
                }
            }
            Command::Status => info!("{}", self.core.status_line()),
            Command::Invite(name) => {
                let Some(peer) = self.resolve_peer(&name) else {
                    warn!(%name, "no such peer");
                    return;
                };
                match self.core.invite(peer) {
                    Ok(actions) => self.perform(actions),
                    Err(e) => warn!(%peer, error = %e, "cannot invite"),
                }
            }
            Command::Accept(name) => self.answer_invitation(&name, true),
            Command::Decline(name) => self.answer_invitation(&name, false),
            Command::RequestImage => {
                let actions = self.core.request_image();
                if actions.is_empty() {
                    info!("no connected peer to ask for an image");
                }
                self.perform(actions);
            }
            Command::SendImage(None) => match self.latest_frame.clone() {
                Some(frame) => self.encode_and_send(frame),
                None => warn!("no frame captured yet"),
            },
            Command::SendImage(Some(path)) => self.encode_file_and_send(path),
            Command::SendCalibration => {
                let actions = self.core.send_calibration();
                self.perform(actions);
            }
            Command::AddPoint(p) => {
                self.core.calibration_mut().push(p);
                self.renderer.redraw(self.core.calibration());
            }
            Command::Tap(tap) => {
                match self.renderer.map_tap(self.core.calibration(), tap) {
                    Some((at, frame)) => {
                        let points = self.core.calibration_mut();
                        if points.frame().is_none() {
                            points.set_frame(Some(frame));
                        }
                        points.push(at);
                        debug!(x = at.x, y = at.y, "point captured");
                    }
                    None => warn!(x = tap.x, y = tap.y, "tap outside the displayed image"),
                }
                self.renderer.redraw(self.core.calibration());
            }
            Command::ClearPoints => {
                self.core.calibration_mut().clear();
                self.renderer.redraw(self.core.calibration());
            }
            Command::Redraw => self.renderer.redraw(self.core.calibration()),
            Command::Help => info!("{HELP}"),
            Command::Quit => {}
        }
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Invite(peer) => self.start_invite(peer),
                Action::Disconnect(peer) => self.drop_link(peer),
                Action::SendMessage(peer, bytes) => {
                    if let Err(e) = self.send_to(peer, bytes) {
                        warn!(error = %e, "message not sent");
                    }
                }
                Action::StateChanged { peer, from, to } => {
                    trace!(%peer, %from, %to, "state change applied");
                }
                Action::ImageRequested(peer) => {
                    info!(%peer, "image requested; sending next frame");
                }
                Action::CalibrationUpdated(peer) => {
                    debug!(%peer, points = self.core.calibration().len(), "calibration updated");
                    self.renderer.redraw(self.core.calibration());
                }
                Action::ImageReceived { from, blob, via } => self.receive_image(from, blob, via),
            }
        }
    }

    fn is_current(&self, peer: PeerId, attempt: u64) -> bool {
        self.links.get(&peer).map(|l| l.attempt) == Some(attempt)
    }

    /// Claim `peer` for a new attempt, cancelling whatever attempt held it.
    fn new_link(&mut self, peer: PeerId) -> (u64, CancellationToken) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let cancel = CancellationToken::new();
        let link = Link {
            attempt,
            cancel: cancel.clone(),
            tx: None,
        };
        if let Some(old) = self.links.insert(peer, link) {
            old.cancel.cancel();
        }
        (attempt, cancel)
    }

    fn drop_link(&mut self, peer: PeerId) {
        if let Some(link) = self.links.remove(&peer) {
            debug!(%peer, attempt = link.attempt, "closing link");
            link.cancel.cancel();
        }
    }

    fn start_invite(&mut self, peer: PeerId) {
        let Some(addr) = self.addrs.get(&peer).copied() else {
            warn!(%peer, "no address for peer, cannot invite");
            return;
        };
        let (attempt, cancel) = self.new_link(peer);
        self.transport.connect(peer, addr, attempt, cancel);
    }

    fn admit(&mut self, peer: PeerId, respond: oneshot::Sender<Option<Admission>>) {
        let (attempt, cancel) = self.new_link(peer);
        if respond.send(Some(Admission { attempt, cancel })).is_err() {
            debug!(%peer, "inviter went away before the answer");
            self.links.remove(&peer);
        }
    }

    fn answer_invitation(&mut self, name: &str, accept: bool) {
        let Some(peer) = self.resolve_peer(name) else {
            warn!(%name, "no such peer");
            return;
        };
        match self.core.resolve_invitation(peer, accept) {
            Some(InvitationDecision::Accept) => match self.pending.remove(&peer) {
                Some(respond) => self.admit(peer, respond),
                None => warn!(%peer, "invitation already withdrawn"),
            },
            Some(_) => {
                if let Some(respond) = self.pending.remove(&peer) {
                    let _ = respond.send(None);
                }
            }
            None => warn!(%peer, "no pending invitation"),
        }
    }

    /// Held invitations whose inviter stopped waiting.
    fn drop_abandoned_invitations(&mut self) {
        let gone: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, r)| r.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for peer in gone {
            self.pending.remove(&peer);
            self.core.resolve_invitation(peer, false);
            info!(%peer, "invitation withdrawn");
        }
    }

    fn resolve_peer(&self, name: &str) -> Option<PeerId> {
        let peers = self.core.peers();
        peers
            .find_by_name(name)
            .or_else(|| peers.iter().find(|r| r.id.to_string() == name).map(|r| r.id))
    }

    fn send_to(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), SendFailed> {
        let tx = self
            .links
            .get(&peer)
            .and_then(|l| l.tx.as_ref())
            .ok_or(SendFailed {
                peer,
                cause: SendError::NoSuchPeer,
            })?;
        tx.send(bytes).map_err(|_| SendFailed {
            peer,
            cause: SendError::ChannelClosed,
        })
    }

    fn encode_and_send(&self, frame: DynamicImage) {
        let via = self.media.transfer;
        let quality = self.media.quality(via);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || match JpegCodec.encode(&frame, quality) {
            Ok(blob) => {
                let _ = events.send(Event::Encoded { blob, via });
            }
            Err(e) => warn!(error = %e, "cannot encode frame"),
        });
    }

    fn encode_file_and_send(&self, path: PathBuf) {
        let via = self.media.transfer;
        let quality = self.media.quality(via);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let image = match image::open(&path) {
                Ok(img) => img,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open image");
                    return;
                }
            };
            match JpegCodec.encode(&image, quality) {
                Ok(blob) => {
                    let _ = events.send(Event::Encoded { blob, via });
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot encode image"),
            }
        });
    }

    fn send_image(&mut self, blob: Vec<u8>, via: TransferKind) {
        match via {
            TransferKind::Chunked => {
                let targets = self.core.peers().connected();
                if targets.is_empty() {
                    info!("no connected peer, image not sent");
                    return;
                }
                let (actions, failed) = self.core.send_chunked(&blob, &targets);
                for f in failed {
                    warn!(error = %f, "chunked send skipped peer");
                }
                self.perform(actions);
            }
            TransferKind::Stream => {
                let result = self
                    .core
                    .plan_stream_send()
                    .and_then(|target| self.stream_image(target.peer, blob));
                if let Err(e) = result {
                    info!(error = %e, "image not sent");
                }
            }
        }
    }

    /// Stream `blob` to `peer` over its own channel. The peer must be connected now and
    /// stay connected while the bytes go out.
    fn stream_image(&self, peer: PeerId, blob: Vec<u8>) -> Result<(), StreamError> {
        let target = self.core.stream_target(peer, IMAGE_STREAM_NAME)?;
        let session = self
            .links
            .get(&peer)
            .filter(|l| l.tx.is_some() && !l.cancel.is_cancelled())
            .map(|l| l.cancel.child_token())
            .ok_or(StreamError::NoSuchPeer(peer))?;
        let addr = self
            .addrs
            .get(&peer)
            .copied()
            .ok_or_else(|| StreamError::StreamOpenFailed(format!("no address for {peer}")))?;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut out = match transport.open_stream(&target, addr, session).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(%peer, error = %e, "image stream failed");
                    return;
                }
            };
            let sent = match out.write(&blob).await {
                Ok(()) => out.close().await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => debug!(%peer, bytes = blob.len(), "image streamed"),
                Err(e) => warn!(%peer, error = %e, "image stream interrupted"),
            }
        });
        Ok(())
    }

    fn receive_image(&mut self, from: PeerId, blob: Vec<u8>, via: TransferKind) {
        self.received += 1;
        let seq = self.received;
        let store = self.store.clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let image = match decode_blob(&JpegCodec, from, &blob) {
                Ok(img) => img,
                Err(e) => {
                    warn!(error = %e, "dropping received blob");
                    return;
                }
            };
            match store.save(from, seq, &blob) {
                Ok(path) => info!(
                    peer = %from,
                    ?via,
                    bytes = blob.len(),
                    path = %path.display(),
                    "image received"
                ),
                Err(e) => warn!(peer = %from, error = %e, "cannot store received image"),
            }
            let _ = events.send(Event::Decoded { from, image });
        });
    }

    fn report_status(&mut self) {
        let line = self.core.status_line();
        if line != self.status {
            info!("{line}");
            self.status = line;
        }
    }
}
