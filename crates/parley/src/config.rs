//! Application configuration.
//!
//! Loaded by the CLI from `config.toml` in the XDG config dir, overlaid with
//! `PARLEY__SECTION__KEY` environment variables. Every section defaults, so a
//! missing file or a partial one is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8480,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `parley.db` in the data dir.
    pub path: Option<String>,
}

/// Timing and sizing knobs for broadcast, streaming and client sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum interval between persisted flushes of a streamed message.
    pub stream_flush_interval_ms: u64,
    /// Attempts per flush before the stream is failed.
    pub flush_retry_attempts: u32,
    /// Base delay between flush retries, multiplied by the attempt number.
    pub flush_retry_backoff_ms: u64,
    /// Per-connection outbound queue depth. A full queue drops the connection.
    pub connection_buffer: usize,
    pub ping_interval_secs: u64,
    /// Client-side quiet period before a reconciliation fetch.
    pub debounce_window_ms: u64,
    /// Upper bound on how long a pending reconciliation can be deferred.
    pub debounce_max_wait_ms: Option<u64>,
    pub subscribe_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_flush_interval_ms: 200,
            flush_retry_attempts: 3,
            flush_retry_backoff_ms: 50,
            connection_buffer: 64,
            ping_interval_secs: 30,
            debounce_window_ms: 300,
            debounce_max_wait_ms: Some(1000),
            subscribe_timeout_ms: 5000,
            reconnect_backoff_ms: 500,
            reconnect_backoff_max_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn stream_flush_interval(&self) -> Duration {
        Duration::from_millis(self.stream_flush_interval_ms)
    }

    pub fn flush_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.flush_retry_backoff_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn debounce_max_wait(&self) -> Option<Duration> {
        self.debounce_max_wait_ms.map(Duration::from_millis)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}
