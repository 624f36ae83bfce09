//! Peer identity: stable opaque id plus the display name advertised on the network.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Service namespace advertised and browsed by default.
pub const SERVICE_TYPE: &str = "camio-peer";

/// Stable peer identifier (16 bytes). Ordered so two peers can agree on who invites whom.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Fresh random id. Stable for the lifetime of the process.
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    /// Deterministic id from a seed (e.g. a persisted install token or host name),
    /// so the same device advertises the same id across restarts.
    pub fn derive(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"camio-peer-id-v1");
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    /// Short hex form (first 4 bytes); enough to tell peers apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// What the local endpoint advertises: id and human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    /// Identity whose id is derived from the display name and a device seed.
    pub fn from_seed(display_name: impl Into<String>, seed: &[u8]) -> Self {
        Self::new(PeerId::derive(seed), display_name)
    }
}
