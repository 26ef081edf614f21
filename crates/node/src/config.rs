use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use peerback_protocol::CHUNK_SIZE;

/// Multicast groups a peer joins. Discovery is out of band; every peer of a
/// group is started with the same three addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAddrs {
    pub control: SocketAddr,
    pub backup: SocketAddr,
    pub restore: SocketAddr,
    /// Local interface used to join the groups.
    pub interface: Ipv4Addr,
}

impl Default for ChannelAddrs {
    fn default() -> Self {
        Self {
            control: SocketAddr::from(([224, 0, 0, 200], 8001)),
            backup: SocketAddr::from(([224, 0, 0, 201], 8002)),
            restore: SocketAddr::from(([224, 0, 0, 202], 8003)),
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Protocol timings and limits. Every field has a default so a JSON file only
/// needs the values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub storage_path: PathBuf,
    pub chunk_size: usize,
    /// Storage cap in KB (1 KB = 1,000 bytes). `None` means unlimited.
    pub max_kb: Option<u64>,

    pub backup_base_timeout_ms: u64,
    pub backup_max_attempts: u32,
    pub backup_workers: usize,

    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,

    pub restore_window: u32,
    pub getchunk_interval_ms: u64,
    pub restore_window_timeout_ms: u64,
    pub restore_rounds: u32,
    pub restore_timeout_per_chunk_ms: u64,

    pub retrieve_base_timeout_ms: u64,
    pub retrieve_timeout_per_chunk_ms: u64,
    pub retrieve_estimated_chunks: u32,

    pub delete_repeats: u32,
    pub delete_interval_ms: u64,
    pub delete_base_timeout_ms: u64,
    pub delete_max_attempts: u32,

    pub reclaim_pacing_ms: u64,
    pub persist_interval_ms: u64,
    pub channel_workers: usize,
    pub tcp_max_clients: usize,
    pub tcp_connect_timeout_ms: u64,
    /// Address advertised in enhanced GETCHUNK callbacks. Without one an
    /// enhanced restore collects its chunks from the multicast channel.
    pub advertise_ip: Option<IpAddr>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./peer-data"),
            chunk_size: CHUNK_SIZE,
            max_kb: None,
            backup_base_timeout_ms: 1_000,
            backup_max_attempts: 5,
            backup_workers: 5,
            jitter_min_ms: 0,
            jitter_max_ms: 400,
            restore_window: 5,
            getchunk_interval_ms: 10,
            restore_window_timeout_ms: 3_000,
            restore_rounds: 3,
            restore_timeout_per_chunk_ms: 2_000,
            retrieve_base_timeout_ms: 1_000,
            retrieve_timeout_per_chunk_ms: 10,
            retrieve_estimated_chunks: 100,
            delete_repeats: 3,
            delete_interval_ms: 500,
            delete_base_timeout_ms: 1_000,
            delete_max_attempts: 4,
            reclaim_pacing_ms: 50,
            persist_interval_ms: 5_000,
            channel_workers: 16,
            tcp_max_clients: 5,
            tcp_connect_timeout_ms: 2_000,
            advertise_ip: None,
        }
    }
}

impl PeerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read peer config {}", path.display()))?;
        let cfg: PeerConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse peer config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn backup_timeout(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backup_base_timeout_ms.saturating_mul(1 << attempt.min(16)))
    }

    pub fn delete_timeout(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delete_base_timeout_ms.saturating_mul(1 << attempt.min(16)))
    }

    pub fn restore_timeout(&self, chunk_count: u32) -> Duration {
        Duration::from_millis(
            self.restore_window_timeout_ms
                .saturating_add(self.restore_timeout_per_chunk_ms.saturating_mul(u64::from(chunk_count))),
        )
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(
            self.retrieve_base_timeout_ms.saturating_add(
                self.retrieve_timeout_per_chunk_ms
                    .saturating_mul(u64::from(self.retrieve_estimated_chunks)),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: PeerConfig = serde_json::from_str(r#"{"backup_max_attempts": 3}"#).unwrap();
        assert_eq!(cfg.backup_max_attempts, 3);
        assert_eq!(cfg.chunk_size, CHUNK_SIZE);
        assert_eq!(cfg.jitter_max_ms, 400);
        assert_eq!(cfg.advertise_ip, None);
    }

    #[test]
    fn advertise_ip_parses_from_json() {
        let cfg: PeerConfig = serde_json::from_str(r#"{"advertise_ip": "10.0.0.7"}"#).unwrap();
        assert_eq!(cfg.advertise_ip, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))));
    }

    #[test]
    fn backup_timeout_doubles_per_attempt() {
        let cfg = PeerConfig::default();
        assert_eq!(cfg.backup_timeout(0), Duration::from_secs(1));
        assert_eq!(cfg.backup_timeout(3), Duration::from_secs(8));
    }
}
