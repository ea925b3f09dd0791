//! Port configuration
//!
//! Timeouts, frame geometry, pool sizes and the recovery bounds of the
//! abort and reconnect sequences. All fields have defaults so a partial
//! TOML file, or none at all, yields a usable configuration.

use common::PortError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Control transfer timeout in milliseconds
    pub control_timeout_ms: u64,
    /// Bulk-IN transfer timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Bulk-OUT transfer timeout in milliseconds
    pub write_timeout_ms: u64,
    /// Interrupt message channel timeout in milliseconds
    pub message_in_timeout_ms: u64,

    /// Upper bound on a single native event wait in milliseconds
    pub event_wait_ms: u64,

    /// Capacity of a single read frame in bytes
    pub read_frame_size: usize,
    /// Capacity of a single write frame in bytes
    pub write_frame_size: usize,
    /// Number of frames in the read pool
    pub read_pool_size: usize,
    /// Number of frames in the write pool
    pub write_pool_size: usize,
    /// Number of frames in the control pool
    pub control_pool_size: usize,
    /// Number of frames in the message channel pool
    pub message_in_pool_size: usize,

    /// Maximum INITIATE/CHECK attempts per abort sequence
    pub abort_max_retry: u32,
    /// Delay between abort attempts in milliseconds
    pub abort_retry_delay_ms: u64,
    /// Maximum bulk-IN transfers when draining the device FIFO
    pub flush_max_transfers: u32,

    /// Maximum reconnect attempts after a disconnect
    pub reconnect_max_retry: u32,
    /// Delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            message_in_timeout_ms: 30_000,
            event_wait_ms: 100,
            read_frame_size: 4096,
            write_frame_size: 4096,
            read_pool_size: 8,
            write_pool_size: 8,
            control_pool_size: 4,
            message_in_pool_size: 4,
            abort_max_retry: 5,
            abort_retry_delay_ms: 100,
            flush_max_transfers: 100,
            reconnect_max_retry: 5,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl PortConfig {
    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PortError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PortError::Setup(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            PortError::Setup(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn message_in_timeout(&self) -> Duration {
        Duration::from_millis(self.message_in_timeout_ms)
    }

    pub fn event_wait(&self) -> Duration {
        Duration::from_millis(self.event_wait_ms)
    }

    pub fn abort_retry_delay(&self) -> Duration {
        Duration::from_millis(self.abort_retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PortConfig::default();
        assert_eq!(config.abort_max_retry, 5);
        assert_eq!(config.flush_max_transfers, 100);
        assert_eq!(config.control_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = PortConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: PortConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.read_frame_size, config.read_frame_size);
        assert_eq!(parsed.reconnect_max_retry, config.reconnect_max_retry);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "read_timeout_ms = 2000").unwrap();
        writeln!(file, "abort_max_retry = 3").unwrap();

        let config = PortConfig::from_file(file.path()).unwrap();
        assert_eq!(config.read_timeout(), Duration::from_secs(2));
        assert_eq!(config.abort_max_retry, 3);
        assert_eq!(config.write_timeout_ms, PortConfig::default().write_timeout_ms);
    }

    #[test]
    fn test_missing_file_is_setup_error() {
        assert!(matches!(
            PortConfig::from_file("/nonexistent/usbtmc.toml"),
            Err(PortError::Setup(_))
        ));
    }
}
