//! Runtime configuration.
//!
//! Loaded from an optional YAML file with `TASKMESH__`-prefixed environment
//! overrides on top; every field has a default so an empty config is valid.

use std::time::Duration;

use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

fn default_dedicated() -> u32 {
    2
}

fn default_overlapped() -> u32 {
    2
}

fn default_idle_us() -> u64 {
    200
}

fn default_poll_ms() -> u64 {
    1
}

fn default_queue_depth() -> usize {
    1024
}

fn default_lanes_per_container() -> u32 {
    4
}

fn default_max_batch() -> usize {
    64
}

fn default_flush_poll_ms() -> u64 {
    5
}

/// Worker pool sizing and pacing.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Continuously polling workers serving low-latency lanes.
    #[serde(default = "default_dedicated")]
    pub dedicated: u32,
    /// Paced workers serving high-latency lanes.
    #[serde(default = "default_overlapped")]
    pub overlapped: u32,
    /// Idle sleep of overlapped workers, in microseconds.
    #[serde(default = "default_idle_us")]
    pub idle_us: u64,
    /// Re-poll interval of parked long-running tasks, in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dedicated: default_dedicated(),
            overlapped: default_overlapped(),
            idle_us: default_idle_us(),
            poll_ms: default_poll_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_us)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

/// Lane sizing per container.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Bounded depth of each lane.
    #[serde(default = "default_queue_depth")]
    pub depth: usize,
    /// Lanes per latency class per container.
    #[serde(default = "default_lanes_per_container")]
    pub lanes_per_container: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: default_queue_depth(),
            lanes_per_container: default_lanes_per_container(),
        }
    }
}

/// Replication batching and flush pacing.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Max archive entries shipped to one node per send.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Pause between flush sweeps, in milliseconds.
    #[serde(default = "default_flush_poll_ms")]
    pub flush_poll_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            flush_poll_ms: default_flush_poll_ms(),
        }
    }
}

impl RemoteConfig {
    pub fn flush_poll(&self) -> Duration {
        Duration::from_millis(self.flush_poll_ms)
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl RuntimeConfig {
    /// Load from an optional YAML file plus `TASKMESH__` env overrides.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder
            .add_source(Environment::with_prefix("TASKMESH").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = RuntimeConfig::default();
        assert_eq!(config.workers.dedicated, 2);
        assert_eq!(config.workers.overlapped, 2);
        assert_eq!(config.queue.depth, 1024);
        assert_eq!(config.queue.lanes_per_container, 4);
        assert_eq!(config.remote.max_batch, 64);
    }

    #[test]
    fn test_duration_helpers() {
        let config = RuntimeConfig::default();
        assert_eq!(config.workers.idle_sleep(), Duration::from_micros(200));
        assert_eq!(config.workers.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.remote.flush_poll(), Duration::from_millis(5));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = RuntimeConfig::load(None).unwrap();
        assert_eq!(config.workers.dedicated, 2);
        assert_eq!(config.queue.depth, 1024);
    }
}
