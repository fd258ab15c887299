//! # Node Configuration
//!
//! Every recognized option with its default. The CLI deserializes this
//! from a JSON file; any omitted field takes the default, and `validate()`
//! rejects impossible combinations before the node starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default public STUN servers, tried in order.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    /// TCP/UDP listen port (0 = pick any)
    pub port: u16,
    /// Watched content directory; files matching `*.dig` directly inside it
    pub dig_directory: PathBuf,
    /// Bootstrap list for the gossip substrate (multiaddrs)
    pub gossip_peers: Vec<String>,
    /// Gossip scoping key; announcement and signaling channels live under it
    pub namespace: String,
    /// Announcement period in milliseconds
    pub sync_interval_ms: u64,
    /// Download-queue parallelism
    pub max_concurrent_downloads: usize,
    /// STUN servers, `stun:host:port` URIs
    pub stun_servers: Vec<String>,
    /// Transport toggles
    pub enable_tcp: bool,
    pub enable_udp: bool,
    pub enable_webrtc: bool,
    pub enable_relay: bool,
    pub enable_upnp: bool,
    pub enable_natpmp: bool,
    /// UPnP / NAT-PMP mapping TTL in seconds
    pub port_mapping_lifetime_s: u32,
    /// Ceiling for any single request/response turn, milliseconds
    pub request_timeout_ms: u64,
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Pipelining depth per connection
    pub max_outstanding_requests: usize,

    // ------------------------------------------------------------------
    // Tuning knobs with spec defaults; rarely changed.
    // ------------------------------------------------------------------
    /// A peer record is live while `now - last_seen` is under this
    pub peer_liveness_window_ms: u64,
    /// Announcements older than this are dropped on receipt
    pub max_announcement_age_ms: u64,
    /// Choke re-ranking period
    pub choke_update_interval_ms: u64,
    /// Concurrent unchoked downloaders on the serving side
    pub max_unchoked_peers: usize,
    /// Chunks granted per peer in super-seed mode before re-choking
    pub super_seed_chunk_allowance: u64,
    /// Success-registry entries older than this are pruned
    pub registry_max_age_days: u32,
    /// Accept RFC1918 addresses in signaling (LAN deployments)
    pub allow_private_addresses: bool,
    /// Accept loopback addresses in signaling (tests, single-host setups)
    pub allow_loopback_addresses: bool,
    /// Full directory rescan period, reconciling watcher gaps
    pub rescan_interval_ms: u64,
    /// Per-chunk retry budget before the transfer fails
    pub max_chunk_retries: u32,
    /// Integrity strikes within the window that blacklist a peer
    pub strike_threshold: u32,
    /// Strike-counting window in milliseconds
    pub strike_window_ms: u64,
    /// Hole-punch retry budget
    pub punch_max_retries: u32,
    /// Per-attempt connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Override for the success-registry directory (None = OS data dir)
    pub registry_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 0,
            dig_directory: PathBuf::from("."),
            gossip_peers: vec![],
            namespace: "dignode".to_string(),
            sync_interval_ms: 30_000,
            max_concurrent_downloads: 5,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            enable_tcp: true,
            enable_udp: true,
            enable_webrtc: true,
            enable_relay: true,
            enable_upnp: true,
            enable_natpmp: true,
            port_mapping_lifetime_s: 3600,
            request_timeout_ms: 30_000,
            chunk_size: 64 * 1024,
            max_outstanding_requests: 5,
            peer_liveness_window_ms: 5 * 60 * 1000,
            max_announcement_age_ms: 60_000,
            choke_update_interval_ms: 10_000,
            max_unchoked_peers: 4,
            super_seed_chunk_allowance: 4,
            registry_max_age_days: 45,
            allow_private_addresses: false,
            allow_loopback_addresses: false,
            rescan_interval_ms: 5 * 60 * 1000,
            max_chunk_retries: 3,
            strike_threshold: 3,
            strike_window_ms: 10 * 60 * 1000,
            punch_max_retries: 3,
            connect_timeout_ms: 30_000,
            registry_dir: None,
        }
    }
}

impl NodeConfig {
    /// Check the configuration before start; a bad config fails start.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunkSize must be > 0".into()));
        }
        if self.max_outstanding_requests == 0 {
            return Err(Error::InvalidConfig(
                "maxOutstandingRequests must be > 0".into(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(Error::InvalidConfig(
                "maxConcurrentDownloads must be > 0".into(),
            ));
        }
        if self.max_unchoked_peers == 0 {
            return Err(Error::InvalidConfig("maxUnchokedPeers must be > 0".into()));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidConfig("syncInterval must be > 0".into()));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(Error::InvalidConfig(
                "namespace must be non-empty and contain no '/'".into(),
            ));
        }
        if !(self.enable_tcp
            || self.enable_udp
            || self.enable_webrtc
            || self.enable_relay)
        {
            return Err(Error::InvalidConfig(
                "at least one transport must be enabled".into(),
            ));
        }
        for uri in &self.stun_servers {
            if uri.strip_prefix("stun:").map_or(true, |rest| {
                rest.rsplit_once(':')
                    .map_or(true, |(h, p)| h.is_empty() || p.parse::<u16>().is_err())
            }) {
                return Err(Error::InvalidConfig(format!(
                    "stun server {uri:?} is not a stun:host:port URI"
                )));
            }
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn choke_update_interval(&self) -> Duration {
        Duration::from_millis(self.choke_update_interval_ms)
    }

    pub fn peer_liveness_window(&self) -> Duration {
        Duration::from_millis(self.peer_liveness_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    /// `stun:host:port` URIs reduced to `host:port` socket strings.
    pub fn stun_addrs(&self) -> Vec<String> {
        self.stun_servers
            .iter()
            .filter_map(|uri| uri.strip_prefix("stun:"))
            .map(|s| s.to_string())
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.max_outstanding_requests, 5);
        assert_eq!(config.max_unchoked_peers, 4);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = NodeConfig { chunk_size: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_namespace_with_slash_rejected() {
        let config = NodeConfig { namespace: "a/b".into(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_all_transports_disabled_rejected() {
        let config = NodeConfig {
            enable_tcp: false,
            enable_udp: false,
            enable_webrtc: false,
            enable_relay: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_stun_uri_rejected() {
        let config = NodeConfig {
            stun_servers: vec!["stun.example.com:3478".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            stun_servers: vec!["stun:stun.example.com:notaport".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stun_addrs_strip_scheme() {
        let config = NodeConfig {
            stun_servers: vec!["stun:stun.example.com:3478".into()],
            ..Default::default()
        };
        assert_eq!(config.stun_addrs(), vec!["stun.example.com:3478".to_string()]);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"port": 4533, "namespace": "testnet"}"#).unwrap();
        assert_eq!(config.port, 4533);
        assert_eq!(config.namespace, "testnet");
        assert_eq!(config.max_concurrent_downloads, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_camel_case_field_names() {
        let json = serde_json::to_string(&NodeConfig::default()).unwrap();
        assert!(json.contains("\"digDirectory\""));
        assert!(json.contains("\"maxConcurrentDownloads\""));
        assert!(json.contains("\"enableWebrtc\""));
    }
}
