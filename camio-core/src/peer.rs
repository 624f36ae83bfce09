//! Peer records and the per-peer connection state machine.
//!
//! NotConnected -> Connecting -> Connected -> NotConnected, plus Connecting -> NotConnected on
//! rejection or timeout. Every other change is rejected.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    fn allows(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, NotConnected)
                | (Connected, NotConnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: String,
    pub state: ConnectionState,
    /// Set while Connecting; used to expire invitations.
    connecting_since: Option<Instant>,
    /// We sent the invitation (as opposed to receiving it).
    pub outbound_invite: bool,
}

impl PeerRecord {
    fn new(id: PeerId, display_name: String) -> Self {
        Self {
            id,
            display_name,
            state: ConnectionState::NotConnected,
            connecting_since: None,
            outbound_invite: false,
        }
    }
}

/// Outcome of applying a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Duplicate delivery of the current state.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// All known peers, keyed by id: at most one record per id.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: HashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for a newly seen peer. Existing records keep their state; the name is refreshed.
    /// Returns true if the record is new.
    pub fn upsert(&mut self, id: PeerId, display_name: &str) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                if record.display_name != display_name {
                    record.display_name = display_name.to_string();
                }
                false
            }
            None => {
                self.records
                    .insert(id, PeerRecord::new(id, display_name.to_string()));
                true
            }
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.records.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.records.get(id)
    }

    pub fn state(&self, id: &PeerId) -> Option<ConnectionState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn mark_outbound_invite(&mut self, id: &PeerId, outbound: bool) {
        if let Some(record) = self.records.get_mut(id) {
            record.outbound_invite = outbound;
        }
    }

    /// Apply a connection state change. Idempotent for duplicates; rejects skipped states.
    pub fn apply(
        &mut self,
        id: &PeerId,
        next: ConnectionState,
        now: Instant,
    ) -> Result<Transition, StateError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or(StateError::UnknownPeer(*id))?;
        let from = record.state;
        if from == next {
            return Ok(Transition::Unchanged);
        }
        if !from.allows(next) {
            return Err(StateError::InvalidTransition { from, to: next });
        }
        record.state = next;
        record.connecting_since = match next {
            ConnectionState::Connecting => Some(now),
            _ => None,
        };
        if next != ConnectionState::Connecting {
            record.outbound_invite = false;
        }
        Ok(Transition::Changed { from, to: next })
    }

    /// Peers stuck in Connecting for at least `timeout`.
    pub fn expired_invitations(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.records
            .values()
            .filter(|r| {
                r.connecting_since
                    .map(|t| now.saturating_duration_since(t) >= timeout)
                    .unwrap_or(false)
            })
            .map(|r| r.id)
            .collect()
    }

    /// Connected peers, sorted by id so "first connected peer" is deterministic.
    pub fn connected(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .records
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn find_by_name(&self, name: &str) -> Option<PeerId> {
        self.records
            .values()
            .find(|r| r.display_name == name)
            .map(|r| r.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn table_with_peer() -> (PeerTable, PeerId) {
        let mut t = PeerTable::new();
        let id = PeerId::random();
        assert!(t.upsert(id, "studio-mac"));
        (t, id)
    }

    #[test]
    fn upsert_keeps_one_record_per_id() {
        let (mut t, id) = table_with_peer();
        t.apply(&id, Connecting, Instant::now()).unwrap();
        assert!(!t.upsert(id, "studio-mac (2)"));
        assert_eq!(t.len(), 1);
        let r = t.get(&id).unwrap();
        assert_eq!(r.display_name, "studio-mac (2)");
        assert_eq!(r.state, Connecting);
    }

    #[test]
    fn full_lifecycle() {
        let (mut t, id) = table_with_peer();
        let now = Instant::now();
        assert_eq!(
            t.apply(&id, Connecting, now).unwrap(),
            Transition::Changed {
                from: NotConnected,
                to: Connecting
            }
        );
        t.apply(&id, Connected, now).unwrap();
        assert_eq!(t.connected(), vec![id]);
        t.apply(&id, NotConnected, now).unwrap();
        assert!(t.connected().is_empty());
    }

    #[test]
    fn cannot_skip_connecting() {
        let (mut t, id) = table_with_peer();
        let err = t.apply(&id, Connected, Instant::now()).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: NotConnected,
                to: Connected
            }
        );
        assert_eq!(t.state(&id), Some(NotConnected));
    }

    #[test]
    fn duplicate_state_is_idempotent() {
        let (mut t, id) = table_with_peer();
        let now = Instant::now();
        t.apply(&id, Connecting, now).unwrap();
        t.apply(&id, Connected, now).unwrap();
        assert_eq!(t.apply(&id, Connected, now).unwrap(), Transition::Unchanged);
        assert_eq!(t.state(&id), Some(Connected));
    }

    #[test]
    fn connected_cannot_fall_back_to_connecting() {
        let (mut t, id) = table_with_peer();
        let now = Instant::now();
        t.apply(&id, Connecting, now).unwrap();
        t.apply(&id, Connected, now).unwrap();
        assert!(t.apply(&id, Connecting, now).is_err());
    }

    #[test]
    fn unknown_peer_rejected() {
        let mut t = PeerTable::new();
        let id = PeerId::random();
        assert_eq!(
            t.apply(&id, Connecting, Instant::now()),
            Err(StateError::UnknownPeer(id))
        );
    }

    #[test]
    fn invitation_expiry() {
        let (mut t, id) = table_with_peer();
        let start = Instant::now();
        t.apply(&id, Connecting, start).unwrap();
        let timeout = Duration::from_secs(30);
        assert!(t
            .expired_invitations(start + Duration::from_secs(10), timeout)
            .is_empty());
        assert_eq!(
            t.expired_invitations(start + Duration::from_secs(31), timeout),
            vec![id]
        );
        t.apply(&id, Connected, start).unwrap();
        assert!(t
            .expired_invitations(start + Duration::from_secs(60), timeout)
            .is_empty());
    }
}
