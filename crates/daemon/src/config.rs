use codec_common::{MAX_FRAME_SIZE, MessageHeaderTrait};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the daemon listens on.
    pub listen_addr: String,
    /// Absolute data root for chunk directories.
    pub root_path: String,
    /// This daemon's id in `[0, host_count)`.
    pub host_id: u32,
    /// Cluster size, fixed for the lifetime of a mount.
    pub host_count: u32,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
    #[serde(default = "default_bulk_timeout_ms")]
    pub bulk_timeout_ms: u64,
    #[serde(default)]
    pub enable_chunkstats: bool,
}

fn default_chunk_size() -> u64 {
    512 * 1024
}
fn default_io_workers() -> usize {
    8
}
fn default_bulk_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    /// Startup sanity. A daemon with a broken configuration must refuse to
    /// start rather than corrupt placement.
    pub fn validate(&self) -> Result<(), String> {
        let max_chunk_size =
            (MAX_FRAME_SIZE - chunk_codec::MessageHeader::SIZE) as u64;
        if !Path::new(&self.root_path).is_absolute() {
            return Err(format!("root_path '{}' is not absolute", self.root_path));
        }
        if self.chunk_size == 0 || self.chunk_size > max_chunk_size {
            return Err(format!(
                "chunk_size {} outside (0, {max_chunk_size}]",
                self.chunk_size
            ));
        }
        if self.host_count == 0 {
            return Err("host_count must be non-zero".to_string());
        }
        if self.host_id >= self.host_count {
            return Err(format!(
                "host_id {} outside cluster of size {}",
                self.host_id, self.host_count
            ));
        }
        if self.io_workers == 0 {
            return Err("io_workers must be non-zero".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8990".to_string(),
            root_path: "/tmp/scratchfs-data".to_string(),
            host_id: 0,
            host_count: 1,
            chunk_size: default_chunk_size(),
            io_workers: default_io_workers(),
            bulk_timeout_ms: default_bulk_timeout_ms(),
            enable_chunkstats: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut config = Config::default();
        config.host_count = 4;
        config.host_id = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.root_path = "relative".to_string();
        assert!(config.validate().is_err());
    }
}
