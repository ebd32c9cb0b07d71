//! Runtime configuration for the worker pool and TCP connection manager.
//!
//! This module intentionally stops at the programmatic struct: parsing a
//! config file from disk or a CLI flag is the job of the embedding server
//! façade, not the CORE.

mod parsers;

pub use parsers::ConfigFormat;

use serde::{Deserialize, Serialize};

const DEFAULT_ENTRIES: u32 = 32768;
const DEFAULT_TICK_MS: u64 = 10;
const DEFAULT_READ_BUFFER: usize = 8 * 1024;

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_entries() -> u32 {
    DEFAULT_ENTRIES
}

fn default_cpu_affinity() -> bool {
    false
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER
}

/// Configuration for the worker pool and its `monoio` runtimes.
///
/// One [`RuntimeConfig`] is consumed by `Server::new` to spawn and pin
/// worker threads; it carries no knowledge of how it was produced
/// (hand-built, deserialized from JSON/TOML, or defaulted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of workers to spawn; each becomes one OS thread.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    /// io_uring/epoll submission queue entries per worker.
    #[serde(default = "default_entries")]
    pub entries: u32,

    /// Pin worker threads to CPU cores round-robin.
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,

    /// How often the `Server`'s background ticker calls `Worker::update()`
    /// on every worker.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Default read-buffer capacity handed to new connections.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            cpu_affinity: default_cpu_affinity(),
            tick_interval_ms: default_tick_interval_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from a string in the given format. Loading the string
    /// off disk or off the command line is left to the caller.
    pub fn from_str(format: ConfigFormat, raw: &str) -> crate::AnyResult<Self> {
        parsers::parse(format, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.worker_threads >= 1);
        assert_eq!(cfg.tick_interval_ms, DEFAULT_TICK_MS);
        assert!(!cfg.cpu_affinity);
    }

    #[test]
    fn json_roundtrip() {
        let cfg = RuntimeConfig {
            worker_threads: 4,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed = RuntimeConfig::from_str(ConfigFormat::Json, &json).unwrap();
        assert_eq!(parsed.worker_threads, 4);
    }

    #[test]
    fn toml_with_defaults() {
        let parsed = RuntimeConfig::from_str(ConfigFormat::Toml, "worker_threads = 2\n").unwrap();
        assert_eq!(parsed.worker_threads, 2);
        assert_eq!(parsed.tick_interval_ms, DEFAULT_TICK_MS);
    }
}
