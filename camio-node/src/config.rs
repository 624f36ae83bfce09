//! Load config from file and environment, then apply command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use camio_core::chunk::DEFAULT_CHUNK_SIZE;
use camio_core::session::{SessionConfig, DEFAULT_MAX_BLOB_LEN};
use camio_core::{InvitePolicy, TransferKind, SERVICE_TYPE};
use serde::Deserialize;
use tracing::{debug, warn};

/// How captured images go out when a peer asks for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageTransfer {
    /// One byte stream to the first connected peer.
    #[default]
    Stream,
    /// Chunk messages to every connected peer.
    Chunked,
}

impl From<ImageTransfer> for TransferKind {
    fn from(t: ImageTransfer) -> Self {
        match t {
            ImageTransfer::Stream => TransferKind::Stream,
            ImageTransfer::Chunked => TransferKind::Chunked,
        }
    }
}

/// Node configuration. File: ~/.config/camio/config.toml or /etc/camio/config.toml.
/// Env overrides: CAMIO_NAME, CAMIO_DISCOVERY_PORT, CAMIO_TRANSPORT_PORT, CAMIO_INVITE_POLICY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other peers (default: host name).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery namespace; only peers advertising the same value are seen.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Seed for a stable peer id. Without it the id is derived from host, name and port.
    #[serde(default)]
    pub id_seed: Option<String>,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default)]
    pub invite_policy: InvitePolicy,
    #[serde(default = "default_true")]
    pub auto_invite: bool,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    #[serde(default)]
    pub image_transfer: ImageTransfer,
    /// JPEG quality for streamed images, 0.0..=1.0.
    #[serde(default = "default_stream_quality")]
    pub stream_quality: f32,
    /// JPEG quality for chunked images, 0.0..=1.0.
    #[serde(default = "default_chunk_quality")]
    pub chunk_quality: f32,
    /// Image file served as the camera. A synthetic pattern is used when unset.
    #[serde(default)]
    pub frame_path: Option<PathBuf>,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Where received images are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Send control text without its tag byte, for peers that only understand marker strings.
    #[serde(default)]
    pub legacy_text: bool,
}

fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "camio".to_string())
}
fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_true() -> bool {
    true
}
fn default_invite_timeout_secs() -> u64 {
    30
}
fn default_stream_quality() -> f32 {
    0.25
}
fn default_chunk_quality() -> f32 {
    0.8
}
fn default_frame_interval_ms() -> u64 {
    200
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("received")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            service_type: default_service_type(),
            id_seed: None,
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            invite_policy: InvitePolicy::default(),
            auto_invite: true,
            invite_timeout_secs: default_invite_timeout_secs(),
            image_transfer: ImageTransfer::default(),
            stream_quality: default_stream_quality(),
            chunk_quality: default_chunk_quality(),
            frame_path: None,
            frame_interval_ms: default_frame_interval_ms(),
            output_dir: default_output_dir(),
            legacy_text: false,
        }
    }
}

/// Values given on the command line; `None` leaves the loaded value alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub display_name: Option<String>,
    pub discovery_port: Option<u16>,
    pub transport_port: Option<u16>,
    pub invite_policy: Option<InvitePolicy>,
    pub frame_path: Option<PathBuf>,
}

impl Config {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    /// Seed for the local peer id.
    pub fn id_seed(&self) -> String {
        match &self.id_seed {
            Some(seed) => seed.clone(),
            None => format!(
                "{}/{}/{}",
                default_display_name(),
                self.display_name,
                self.transport_port
            ),
        }
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            invite_policy: self.invite_policy,
            auto_invite: self.auto_invite,
            invite_timeout: self.invite_timeout(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_blob_len: DEFAULT_MAX_BLOB_LEN,
            tagged_text: !self.legacy_text,
        }
    }

    pub fn apply_overrides(&mut self, o: Overrides) {
        if let Some(name) = o.display_name {
            self.display_name = name;
        }
        if let Some(p) = o.discovery_port {
            self.discovery_port = p;
        }
        if let Some(p) = o.transport_port {
            self.transport_port = p;
        }
        if let Some(policy) = o.invite_policy {
            self.invite_policy = policy;
        }
        if let Some(path) = o.frame_path {
            self.frame_path = Some(path);
        }
    }
}

/// Load config: merge default, then config file (explicit path or the first one present),
/// then env vars.
pub fn load(path: Option<&Path>) -> Config {
    let mut c = match path {
        Some(p) => read_file(p).unwrap_or_default(),
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(name) = var("CAMIO_NAME").filter(|s| !s.trim().is_empty()) {
        c.display_name = name;
    }
    if let Some(p) = var("CAMIO_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("CAMIO_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(s) = var("CAMIO_INVITE_POLICY") {
        match parse_invite_policy(&s) {
            Some(policy) => c.invite_policy = policy,
            None => warn!(value = %s, "ignoring unknown CAMIO_INVITE_POLICY"),
        }
    }
}

pub fn parse_invite_policy(s: &str) -> Option<InvitePolicy> {
    match s.trim() {
        "accept-all" => Some(InvitePolicy::AcceptAll),
        "prompt" => Some(InvitePolicy::Prompt),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/camio/config.toml"));
    }
    out.push(PathBuf::from("/etc/camio/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    read_file(&path)
}

fn read_file(path: &Path) -> Option<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => {
            debug!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}
