//! Session transport: TCP listener, invite/accept handshake, per-peer framed links and
//! one-shot image streams.
//!
//! A session connection starts with `Invite` and is answered with `Accept` or `Decline`;
//! after that both sides exchange raw length-prefixed frames. A stream connection starts
//! with `StreamOpen` and then carries raw bytes until the sender closes it.

use std::net::SocketAddr;
use std::time::Duration;

use camio_core::stream::READ_BUFFER_SIZE;
use camio_core::wire::{decode_payload, frame_len, frame_payload, FrameDecodeError, LEN_SIZE};
use camio_core::{
    encode_frame, ConnectionState, FrameEncodeError, Message, PeerId, PeerIdentity,
    StreamAssembler, StreamError, StreamTarget, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Bound on reading the first frame of an inbound connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered, reliable send side of one peer session.
pub type PeerLink = mpsc::UnboundedSender<Vec<u8>>;

/// An accepted invitation: the attempt the new session belongs to and its cancel token.
#[derive(Debug, Clone)]
pub struct Admission {
    pub attempt: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Connection progress for one attempt. `link` is set on `Connected`.
    StateChanged {
        peer: PeerId,
        attempt: u64,
        state: ConnectionState,
        link: Option<PeerLink>,
    },
    /// Someone invited us. Answer `Some` to accept; dropping `respond` declines.
    Invitation {
        from: PeerIdentity,
        addr: SocketAddr,
        respond: oneshot::Sender<Option<Admission>>,
    },
    Message {
        peer: PeerId,
        attempt: u64,
        bytes: Vec<u8>,
    },
    /// A peer opened a stream. Answer with the session's token to read it.
    StreamOpened {
        peer: PeerId,
        name: String,
        respond: oneshot::Sender<Option<CancellationToken>>,
    },
    /// Clean end of stream. `None` when nothing was sent.
    StreamFinished {
        peer: PeerId,
        name: String,
        blob: Option<Vec<u8>>,
    },
    StreamAborted {
        peer: PeerId,
        name: String,
        dropped: usize,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("invitation declined")]
    Declined,
    #[error("timed out")]
    TimedOut,
    #[error("unexpected handshake message")]
    UnexpectedMessage,
    #[error("answer came from a different peer")]
    WrongPeer,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub invite_timeout: Duration,
    pub max_blob_len: u64,
}

/// Cloneable handle; every spawned connection task owns one.
#[derive(Clone)]
pub struct Transport {
    identity: PeerIdentity,
    listen_port: u16,
    events: mpsc::UnboundedSender<TransportEvent>,
    settings: TransportSettings,
}

impl Transport {
    /// Bind the session listener on all interfaces. Port 0 picks a free port.
    pub async fn listen(port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", port)).await
    }

    pub fn new(
        identity: PeerIdentity,
        listen_port: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            identity,
            listen_port,
            events,
            settings,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Accept connections until the listener fails.
    pub fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.handle_incoming(stream, remote).await {
                                debug!(%remote, error = %e, "incoming connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "session listener failed");
                        break;
                    }
                }
            }
        })
    }

    /// Invite `peer` at `addr`. Reports `Connecting`, then `Connected` or `NotConnected`.
    pub fn connect(
        &self,
        peer: PeerId,
        addr: SocketAddr,
        attempt: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_outbound(peer, addr, attempt, cancel).await })
    }

    /// Open the stream named by `target`. `session` is the token of the peer's live session;
    /// once it is cancelled the peer no longer counts as connected.
    pub async fn open_stream(
        &self,
        target: &StreamTarget,
        addr: SocketAddr,
        session: CancellationToken,
    ) -> Result<OutboundStream, StreamError> {
        let peer = target.peer;
        if session.is_cancelled() {
            return Err(StreamError::NoSuchPeer(peer));
        }
        let opened = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let open = encode_frame(&Message::StreamOpen {
                peer_id: self.identity.id,
                name: target.name.clone(),
            })?;
            stream.write_all(&open).await?;
            Ok::<_, TransportError>(stream)
        };
        let opened = tokio::select! {
            _ = session.cancelled() => return Err(StreamError::NoSuchPeer(peer)),
            res = opened => res,
        };
        match opened {
            Ok(stream) => {
                debug!(%peer, %addr, name = %target.name, "stream opened");
                Ok(OutboundStream {
                    peer,
                    stream,
                    session,
                })
            }
            Err(e) => Err(StreamError::StreamOpenFailed(e.to_string())),
        }
    }

    fn emit(&self, ev: TransportEvent) {
        if self.events.send(ev).is_err() {
            trace!("transport event dropped; coordinator gone");
        }
    }

    fn emit_state(&self, peer: PeerId, attempt: u64, state: ConnectionState) {
        self.emit(TransportEvent::StateChanged {
            peer,
            attempt,
            state,
            link: None,
        });
    }

    async fn run_outbound(
        self,
        peer: PeerId,
        addr: SocketAddr,
        attempt: u64,
        cancel: CancellationToken,
    ) {
        self.emit_state(peer, attempt, ConnectionState::Connecting);
        let invited = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            res = tokio::time::timeout(self.settings.invite_timeout, self.invite(peer, addr)) => {
                res.unwrap_or(Err(TransportError::TimedOut))
            }
        };
        match invited {
            Ok(stream) => self.run_session(stream, peer, attempt, cancel).await,
            Err(e) => {
                info!(%peer, %addr, error = %e, "invitation failed");
                self.emit_state(peer, attempt, ConnectionState::NotConnected);
            }
        }
    }

    async fn invite(&self, peer: PeerId, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let invite = encode_frame(&Message::Invite {
            protocol_version: PROTOCOL_VERSION,
            peer_id: self.identity.id,
            display_name: self.identity.display_name.clone(),
            listen_port: self.listen_port,
        })?;
        stream.write_all(&invite).await?;
        match decode_payload(&read_frame(&mut stream).await?)? {
            Message::Accept { peer_id } if peer_id == peer => Ok(stream),
            Message::Accept { .. } => Err(TransportError::WrongPeer),
            Message::Decline { .. } => Err(TransportError::Declined),
            _ => Err(TransportError::UnexpectedMessage),
        }
    }

    async fn handle_incoming(
        self,
        mut stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<(), TransportError> {
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::TimedOut)??;
        match decode_payload(&first)? {
            Message::Invite {
                protocol_version,
                peer_id,
                display_name,
                listen_port,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        %remote,
                        protocol_version,
                        "invitation with unsupported protocol version"
                    );
                    return self.decline(&mut stream).await;
                }
                let from = PeerIdentity::new(peer_id, display_name);
                self.answer_invitation(stream, from, SocketAddr::new(remote.ip(), listen_port))
                    .await
            }
            Message::StreamOpen { peer_id, name } => {
                stream.set_nodelay(true)?;
                self.receive_stream(stream, peer_id, name).await;
                Ok(())
            }
            _ => Err(TransportError::UnexpectedMessage),
        }
    }

    async fn answer_invitation(
        &self,
        mut stream: TcpStream,
        from: PeerIdentity,
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        let peer = from.id;
        let (tx, rx) = oneshot::channel();
        self.emit(TransportEvent::Invitation {
            from,
            addr,
            respond: tx,
        });
        let admission = match tokio::time::timeout(self.settings.invite_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => None,
            Err(_) => {
                info!(%peer, "invitation not answered in time");
                None
            }
        };
        let Some(Admission { attempt, cancel }) = admission else {
            return self.decline(&mut stream).await;
        };
        self.emit_state(peer, attempt, ConnectionState::Connecting);
        let accept = encode_frame(&Message::Accept {
            peer_id: self.identity.id,
        })?;
        if let Err(e) = stream.write_all(&accept).await {
            self.emit_state(peer, attempt, ConnectionState::NotConnected);
            return Err(e.into());
        }
        stream.set_nodelay(true)?;
        self.run_session(stream, peer, attempt, cancel).await;
        Ok(())
    }

    async fn decline(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        let frame = encode_frame(&Message::Decline {
            peer_id: self.identity.id,
        })?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Pump one established session until either side closes it or `cancel` fires.
    async fn run_session(
        &self,
        stream: TcpStream,
        peer: PeerId,
        attempt: u64,
        cancel: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (mut reader, mut writer) = stream.into_split();
        self.emit(TransportEvent::StateChanged {
            peer,
            attempt,
            state: ConnectionState::Connected,
            link: Some(tx),
        });
        let writer_cancel = cancel.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let frame = match frame_payload(&payload) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(
                            %peer,
                            len = payload.len(),
                            error = %e,
                            "dropping unsendable message"
                        );
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(%peer, error = %e, "session write failed");
                    writer_cancel.cancel();
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                res = read_frame(&mut reader) => match res {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(%peer, error = %e, "session closed");
                        break;
                    }
                },
            };
            if self
                .events
                .send(TransportEvent::Message {
                    peer,
                    attempt,
                    bytes: payload,
                })
                .is_err()
            {
                break;
            }
        }
        writer_task.abort();
        cancel.cancel();
        self.emit_state(peer, attempt, ConnectionState::NotConnected);
    }

    async fn receive_stream(&self, mut stream: TcpStream, peer: PeerId, name: String) {
        let (tx, rx) = oneshot::channel();
        self.emit(TransportEvent::StreamOpened {
            peer,
            name: name.clone(),
            respond: tx,
        });
        let cancel = match rx.await {
            Ok(Some(c)) => c,
            _ => {
                debug!(%peer, %name, "stream refused");
                return;
            }
        };
        let mut assembler = StreamAssembler::new(self.settings.max_blob_len);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let outcome: Result<(), String> = loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break Err("session closed".to_string()),
                res = stream.read(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => break Err(e.to_string()),
                },
            };
            if n == 0 {
                break Ok(());
            }
            if let Err(e) = assembler.push(&buf[..n]) {
                break Err(e.to_string());
            }
        };
        match outcome {
            Ok(()) => {
                let blob = assembler.finish();
                self.emit(TransportEvent::StreamFinished { peer, name, blob });
            }
            Err(reason) => {
                let dropped = assembler.abort();
                self.emit(TransportEvent::StreamAborted {
                    peer,
                    name,
                    dropped,
                    reason,
                });
            }
        }
    }
}

/// Write side of an open stream.
pub struct OutboundStream {
    peer: PeerId,
    stream: TcpStream,
    session: CancellationToken,
}

impl OutboundStream {
    /// Fails with `NoSuchPeer` once the peer's session has gone.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if self.session.is_cancelled() {
            return Err(StreamError::NoSuchPeer(self.peer));
        }
        tokio::select! {
            _ = self.session.cancelled() => Err(StreamError::NoSuchPeer(self.peer)),
            res = self.stream.write_all(bytes) => {
                res.map_err(|e| StreamError::Interrupted(e.to_string()))
            }
        }
    }

    /// End of stream for the receiver. Dropping without closing after a cancelled session
    /// leaves the receiver to discard what it got.
    pub async fn close(mut self) -> Result<(), StreamError> {
        if self.session.is_cancelled() {
            return Err(StreamError::NoSuchPeer(self.peer));
        }
        self.stream
            .shutdown()
            .await
            .map_err(|e| StreamError::Interrupted(e.to_string()))
    }
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}
