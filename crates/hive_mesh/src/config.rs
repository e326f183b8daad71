//! Mesh configuration for a node.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MeshError;

/// Configuration for one mesh node.
///
/// Missing fields fall back to [`MeshConfig::default`], so a config file only
/// needs to list what differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Human-readable name announced to every reachable node.
    pub node_name: Option<String>,

    /// Address the WebSocket server listens on.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Candidate peers for the single outbound connection, tried in order.
    pub peers: Vec<PeerUrl>,

    /// Shared secret inbound sessions must present in the `net-secret` header.
    pub secret: Option<String>,

    /// Accepted `Origin` header values. Empty accepts every origin.
    pub allowed_origins: Vec<String>,

    /// Failed attempts against one peer URL before moving to the next.
    pub max_connection_attempts: u32,

    /// Delay between outbound connection attempts.
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Deadline for every correlated request (probes, bridge calls).
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            peers: Vec::new(),
            secret: None,
            allowed_origins: Vec::new(),
            max_connection_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl MeshConfig {
    /// Check whether an upgrade request with this `Origin` header is allowed.
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|a| a == o))
    }

    /// Hex SHA-256 of the effective configuration.
    ///
    /// Used to namespace bridge traffic so independently configured meshes
    /// sharing one process tree never read each other's messages.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, failing on missing or corrupt files.
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Unusable mesh config, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Peer URLs
// ---------------------------------------------------------------------------

/// A peer address, optionally prefixed with the peer's shared secret
/// (`secret@ws://host:port/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerUrl {
    pub secret: Option<String>,
    pub url: String,
}

impl PeerUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            secret: None,
            url: url.into(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// The URL with a `ws://` scheme added when none was given.
    pub fn ws_url(&self) -> String {
        if self.url.starts_with("ws://") || self.url.starts_with("wss://") {
            self.url.clone()
        } else {
            format!("ws://{}", self.url)
        }
    }
}

impl FromStr for PeerUrl {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MeshError::Config("empty peer url".into()));
        }
        // An '@' after the scheme separator belongs to the URL itself.
        match s.split_once('@') {
            Some((secret, url)) if !secret.contains("://") => {
                if url.is_empty() {
                    return Err(MeshError::Config(format!("peer url '{s}' has no address")));
                }
                Ok(Self {
                    secret: (!secret.is_empty()).then(|| secret.to_string()),
                    url: url.to_string(),
                })
            }
            _ => Ok(Self::new(s)),
        }
    }
}

impl TryFrom<String> for PeerUrl {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerUrl> for String {
    fn from(peer: PeerUrl) -> Self {
        peer.to_string()
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secret {
            Some(secret) => write!(f, "{secret}@{}", self.url),
            None => write!(f, "{}", self.url),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(dur.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.max_connection_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert!(config.peers.is_empty());
        assert!(config.node_name.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: MeshConfig = serde_json::from_str(
            r#"{"node_name": "Server1", "peers": ["secret-2@ws://127.0.0.1:3001/"]}"#,
        )
        .unwrap();
        assert_eq!(config.node_name.as_deref(), Some("Server1"));
        assert_eq!(config.peers[0].secret.as_deref(), Some("secret-2"));
        assert_eq!(config.peers[0].url, "ws://127.0.0.1:3001/");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_peer_url_parsing() {
        let plain: PeerUrl = "ws://127.0.0.1:3000/".parse().unwrap();
        assert!(plain.secret.is_none());
        assert_eq!(plain.url, "ws://127.0.0.1:3000/");

        let secret: PeerUrl = "s3cr3t@127.0.0.1:3000".parse().unwrap();
        assert_eq!(secret.secret.as_deref(), Some("s3cr3t"));
        assert_eq!(secret.ws_url(), "ws://127.0.0.1:3000");

        // userinfo inside the URL is not a mesh secret
        let userinfo: PeerUrl = "ws://user@host:1/".parse().unwrap();
        assert!(userinfo.secret.is_none());

        assert!("".parse::<PeerUrl>().is_err());
        assert!("secret@".parse::<PeerUrl>().is_err());
    }

    #[test]
    fn test_peer_url_display_matches_input() {
        let peer: PeerUrl = "abc@ws://h:1/".parse().unwrap();
        assert_eq!(peer.to_string(), "abc@ws://h:1/");
    }

    #[test]
    fn test_origin_policy() {
        let mut config = MeshConfig::default();
        assert!(config.allows_origin(None));
        assert!(config.allows_origin(Some("http://anything")));

        config.allowed_origins = vec!["http://good".into()];
        assert!(config.allows_origin(Some("http://good")));
        assert!(!config.allows_origin(Some("http://evil")));
        assert!(!config.allows_origin(None));
    }

    #[test]
    fn test_fingerprint_tracks_configuration() {
        let a = MeshConfig::default();
        let mut b = MeshConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        b.node_name = Some("other".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");

        let mut original = MeshConfig::default();
        original.node_name = Some("worker-1".into());
        original.peers = vec![PeerUrl::new("ws://10.0.0.2:8080").with_secret("k")];
        original.reconnect_delay = Duration::from_millis(250);
        original.save_to_file(&path).unwrap();

        let loaded = MeshConfig::load_or_default(&path);
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::load_or_default(&dir.path().join("missing.json"));
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn test_config_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(MeshConfig::load(&path), Err(MeshError::Config(_))));
        assert_eq!(MeshConfig::load_or_default(&path), MeshConfig::default());
    }
}
