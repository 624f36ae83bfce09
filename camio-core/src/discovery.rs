//! Browse bookkeeping: turns a stream of beacons into found/lost events.
//!
//! The host owns the sockets; it feeds beacons in and polls `expire` periodically.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::identity::{PeerId, PeerIdentity};
use crate::protocol::{Message, PROTOCOL_VERSION};

/// A peer is lost if nothing is heard from it for this long.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found {
        peer: PeerIdentity,
        addr: SocketAddr,
    },
    Lost {
        peer: PeerId,
    },
}

struct Seen {
    addr: SocketAddr,
    last_seen: Instant,
}

pub struct PeerBrowser {
    local: PeerId,
    service: String,
    timeout: Duration,
    peers: HashMap<PeerId, Seen>,
}

impl PeerBrowser {
    pub fn new(local: PeerId, service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            local,
            service: service.into(),
            timeout,
            peers: HashMap::new(),
        }
    }

    /// Feed a discovery message received from `from`. Returns `Found` the first time a peer is
    /// heard (or when its address changes), `Lost` on a matching `Bye`.
    pub fn on_message(
        &mut self,
        msg: &Message,
        from: SocketAddr,
        now: Instant,
    ) -> Option<DiscoveryEvent> {
        match msg {
            Message::Beacon {
                protocol_version,
                service,
                peer_id,
                display_name,
                listen_port,
            } => {
                if *protocol_version != PROTOCOL_VERSION
                    || *service != self.service
                    || *peer_id == self.local
                {
                    return None;
                }
                let addr = SocketAddr::new(from.ip(), *listen_port);
                let announce = match self.peers.get_mut(peer_id) {
                    Some(seen) => {
                        seen.last_seen = now;
                        let moved = seen.addr != addr;
                        seen.addr = addr;
                        moved
                    }
                    None => {
                        self.peers.insert(
                            *peer_id,
                            Seen {
                                addr,
                                last_seen: now,
                            },
                        );
                        true
                    }
                };
                announce.then(|| DiscoveryEvent::Found {
                    peer: PeerIdentity::new(*peer_id, display_name.clone()),
                    addr,
                })
            }
            Message::Bye { service, peer_id } => {
                if *service != self.service {
                    return None;
                }
                self.peers
                    .remove(peer_id)
                    .map(|_| DiscoveryEvent::Lost { peer: *peer_id })
            }
            _ => None,
        }
    }

    /// Drop peers not heard from within the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<DiscoveryEvent> {
        let timeout = self.timeout;
        let gone: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.peers.remove(id);
        }
        gone.into_iter()
            .map(|peer| DiscoveryEvent::Lost { peer })
            .collect()
    }

    /// Forget everything, e.g. when browsing restarts. Returns `Lost` for each known peer.
    pub fn reset(&mut self) -> Vec<DiscoveryEvent> {
        self.peers
            .drain()
            .map(|(peer, _)| DiscoveryEvent::Lost { peer })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Beacon advertising `identity` under `service`.
pub fn beacon(identity: &PeerIdentity, service: &str, listen_port: u16) -> Message {
    Message::Beacon {
        protocol_version: PROTOCOL_VERSION,
        service: service.to_string(),
        peer_id: identity.id,
        display_name: identity.display_name.clone(),
        listen_port,
    }
}
