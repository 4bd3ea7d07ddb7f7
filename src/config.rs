//! Mount configuration.
//!
//! Typed options consumed by the I/O engine. Parsing command lines or
//! config files down to this struct is the frontend's business; we only
//! define the shape, the serde mapping and the defaults.

use std::time::Duration;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::limits::database::LimitsMap;
use crate::read::ReadTimeouts;
use crate::write::WriteConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Subfolder of the filesystem to mount.
    pub subfolder: String,
    pub password: Option<String>,

    pub io_retries: u32,
    pub chunkserver_connect_timeout_ms: u64,
    pub chunkserver_wave_timeout_ms: u64,
    pub chunkserver_total_read_timeout_ms: u64,
    /// TTL of pooled chunkserver connections.
    pub connection_pool_ttl_s: u64,

    pub write_window_size: usize,

    /// 0 disables readahead.
    pub readahead_timeout_ms: u32,
    pub readahead_window_limit: u32,

    pub direntry_cache_timeout_ms: u64,
    pub direntry_cache_size: usize,
    pub attr_cache_timeout_ms: u64,
    pub acl_cache_size: usize,
    pub symlink_cache_timeout_s: u64,

    /// Local I/O limits; empty means no local limiting.
    pub io_limits: LimitsMap,
    pub io_limits_subsystem: String,
    pub io_limits_accumulate_ms: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            subfolder: "/".to_string(),
            password: None,
            io_retries: 30,
            chunkserver_connect_timeout_ms: 1000,
            chunkserver_wave_timeout_ms: 500,
            chunkserver_total_read_timeout_ms: 30_000,
            connection_pool_ttl_s: 3,
            write_window_size: 32,
            readahead_timeout_ms: 2000,
            readahead_window_limit: 1 << 22,
            direntry_cache_timeout_ms: 100,
            direntry_cache_size: 100_000,
            attr_cache_timeout_ms: 1000,
            acl_cache_size: 1000,
            symlink_cache_timeout_s: 3600,
            io_limits: LimitsMap::new(),
            io_limits_subsystem: String::new(),
            io_limits_accumulate_ms: 200,
        }
    }
}

impl MountConfig {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let config: MountConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.write_window_size == 0 {
            bail!("write window size must be positive");
        }
        if self.chunkserver_total_read_timeout_ms < self.chunkserver_wave_timeout_ms {
            bail!("total read timeout shorter than a single wave");
        }
        if self.direntry_cache_size == 0 {
            bail!("direntry cache size must be positive");
        }
        Ok(())
    }

    pub fn read_timeouts(&self) -> ReadTimeouts {
        ReadTimeouts {
            connect: Duration::from_millis(self.chunkserver_connect_timeout_ms),
            wave: Duration::from_millis(self.chunkserver_wave_timeout_ms),
            total: Duration::from_millis(self.chunkserver_total_read_timeout_ms),
        }
    }

    pub fn write_config(&self) -> WriteConfig {
        WriteConfig {
            window_size: self.write_window_size,
            io_retries: self.io_retries,
            connect_timeout: Duration::from_millis(self.chunkserver_connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MountConfig::default().validate().unwrap();
    }

    #[test]
    fn json_roundtrip_with_overrides() {
        let config =
            MountConfig::from_json(r#"{"io_retries": 5, "write_window_size": 8}"#).unwrap();
        assert_eq!(config.io_retries, 5);
        assert_eq!(config.write_window_size, 8);
        // untouched fields keep their defaults
        assert_eq!(config.direntry_cache_timeout_ms, 100);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(MountConfig::from_json(r#"{"write_window_size": 0}"#).is_err());
        assert!(MountConfig::from_json(
            r#"{"chunkserver_total_read_timeout_ms": 1, "chunkserver_wave_timeout_ms": 10}"#
        )
        .is_err());
    }
}
