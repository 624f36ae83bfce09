//! LAN discovery: UDP multicast beacons under a service type, browsed into found/lost events.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camio_core::discovery::{beacon, DEFAULT_PEER_TIMEOUT};
use camio_core::wire::{decode_frame, encode_frame, FrameEncodeError};
use camio_core::{DiscoveryEvent, Message, PeerBrowser, PeerIdentity};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const EXPIRE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("cannot encode beacon: {0}")]
    Encode(#[from] FrameEncodeError),
}

/// Advertiser and browser sharing one multicast socket.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    identity: PeerIdentity,
    service: String,
    dest: SocketAddr,
    transport_port: u16,
    advertise_task: Option<JoinHandle<()>>,
    browse_task: Option<JoinHandle<()>>,
    browse_stop: Option<oneshot::Sender<()>>,
}

impl Discovery {
    /// Join the multicast group on `discovery_port`. Fails when the network is unavailable.
    pub fn bind(
        identity: PeerIdentity,
        service: &str,
        discovery_port: u16,
        transport_port: u16,
    ) -> Result<Self, DiscoveryError> {
        let socket = make_multicast_socket(discovery_port)?;
        Ok(Self {
            socket: Arc::new(socket),
            identity,
            service: service.to_string(),
            dest: SocketAddr::from((MULTICAST_GROUP, discovery_port)),
            transport_port,
            advertise_task: None,
            browse_task: None,
            browse_stop: None,
        })
    }

    /// Start beaconing. Calling again restarts the beacon loop.
    pub fn start_advertising(&mut self) -> Result<(), DiscoveryError> {
        let frame = encode_frame(&beacon(&self.identity, &self.service, self.transport_port))?;
        let socket = self.socket.clone();
        let dest = self.dest;
        if let Some(old) = self.advertise_task.take() {
            old.abort();
        }
        self.advertise_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BEACON_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&frame, dest).await {
                    warn!(error = %e, "beacon send failed");
                }
            }
        }));
        debug!(service = %self.service, port = self.transport_port, "advertising");
        Ok(())
    }

    /// Begin browsing. Each call starts a fresh browse with empty peer knowledge; the
    /// previous event sequence ends with `Lost` for every peer it had reported.
    pub fn browse(&mut self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stop) = self.browse_stop.take() {
            let _ = stop.send(());
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let browser =
            PeerBrowser::new(self.identity.id, self.service.clone(), DEFAULT_PEER_TIMEOUT);
        let socket = self.socket.clone();
        self.browse_task = Some(tokio::spawn(browse_loop(socket, browser, tx, stop_rx)));
        self.browse_stop = Some(stop_tx);
        rx
    }

    /// Tell browsers we are leaving, then stop both loops.
    pub async fn shutdown(mut self) {
        if let Some(t) = self.advertise_task.take() {
            t.abort();
        }
        if let Some(t) = self.browse_task.take() {
            t.abort();
        }
        let bye = Message::Bye {
            service: self.service.clone(),
            peer_id: self.identity.id,
        };
        match encode_frame(&bye) {
            Ok(frame) => {
                if let Err(e) = self.socket.send_to(&frame, self.dest).await {
                    debug!(error = %e, "bye send failed");
                }
            }
            Err(e) => debug!(error = %e, "cannot encode bye"),
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(t) = self.advertise_task.take() {
            t.abort();
        }
        if let Some(t) = self.browse_task.take() {
            t.abort();
        }
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn browse_loop(
    socket: Arc<UdpSocket>,
    mut browser: PeerBrowser,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; 65536];
    let mut expiry = tokio::time::interval(EXPIRE_INTERVAL);
    loop {
        let emitted: Vec<DiscoveryEvent> = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, from)) => match decode_frame(&buf[..n]) {
                    Ok((msg, _)) => browser
                        .on_message(&msg, from, Instant::now())
                        .into_iter()
                        .collect(),
                    Err(e) => {
                        trace!(%from, error = %e, "ignoring datagram");
                        Vec::new()
                    }
                },
                Err(e) => {
                    warn!(error = %e, "discovery receive failed; browse stopped");
                    return;
                }
            },
            _ = expiry.tick() => browser.expire(Instant::now()),
            _ = &mut stop => {
                for ev in browser.reset() {
                    let _ = events.send(ev);
                }
                return;
            }
        };
        for ev in emitted {
            if events.send(ev).is_err() {
                return;
            }
        }
    }
}
