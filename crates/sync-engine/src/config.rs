//! Tunables for every engine component. Defaults come from the scheduler
//! constants in `huddle_core::sync`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use huddle_core::sync::{
    BackoffPolicy, OUTBOX_BATCH_SIZE, OUTBOX_MAX_CONCURRENCY, OUTBOX_SEND_TIMEOUT_SECS,
    RECONCILE_FETCH_TIMEOUT_SECS, RECONCILE_MAX_SKIP_AGE_SECS, RECONCILE_PAGE_SIZE,
    SESSION_TOKEN_TIMEOUT_SECS, STREAM_CONNECT_TIMEOUT_SECS, STREAM_HEARTBEAT_INTERVAL_SECS,
    STREAM_RECONNECT_COOLDOWN_MS, STREAM_STALE_AFTER_SECS, STREAM_WRITE_TIMEOUT_SECS,
    SYNC_INTERVAL_JITTER_SECS, SYNC_PERIODIC_INTERVAL_SECS, TOMBSTONE_CANCEL_WINDOW_SECS,
    TOMBSTONE_RETENTION_SECS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
    pub backoff: BackoffPolicy,
    pub send_timeout_ms: u64,
    pub max_concurrency: usize,
    pub batch_size: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            send_timeout_ms: OUTBOX_SEND_TIMEOUT_SECS * 1_000,
            max_concurrency: OUTBOX_MAX_CONCURRENCY,
            batch_size: OUTBOX_BATCH_SIZE,
        }
    }
}

impl OutboxConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Reconnect backoff. `ceiling` is unused here; see `max_reconnect_attempts`.
    pub backoff: BackoffPolicy,
    pub cooldown_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_after_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Give up and stay disconnected after this many consecutive failures.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cooldown_ms: STREAM_RECONNECT_COOLDOWN_MS,
            heartbeat_interval_ms: STREAM_HEARTBEAT_INTERVAL_SECS * 1_000,
            stale_after_ms: STREAM_STALE_AFTER_SECS * 1_000,
            connect_timeout_ms: STREAM_CONNECT_TIMEOUT_SECS * 1_000,
            write_timeout_ms: STREAM_WRITE_TIMEOUT_SECS * 1_000,
            max_reconnect_attempts: None,
        }
    }
}

impl StreamConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    pub page_size: i64,
    pub fetch_timeout_ms: u64,
    pub max_skip_age_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            page_size: RECONCILE_PAGE_SIZE,
            fetch_timeout_ms: RECONCILE_FETCH_TIMEOUT_SECS * 1_000,
            max_skip_age_ms: RECONCILE_MAX_SKIP_AGE_SECS * 1_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TombstoneConfig {
    pub cancel_window_ms: u64,
    pub retention_ms: u64,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            cancel_window_ms: TOMBSTONE_CANCEL_WINDOW_SECS * 1_000,
            retention_ms: TOMBSTONE_RETENTION_SECS * 1_000,
        }
    }
}

impl TombstoneConfig {
    pub fn cancel_window(&self) -> Duration {
        Duration::from_millis(self.cancel_window_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncEngineConfig {
    pub outbox: OutboxConfig,
    pub stream: StreamConfig,
    pub reconciler: ReconcilerConfig,
    pub tombstones: TombstoneConfig,
    pub token_timeout_ms: u64,
    pub periodic_interval_ms: u64,
    pub periodic_jitter_ms: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxConfig::default(),
            stream: StreamConfig::default(),
            reconciler: ReconcilerConfig::default(),
            tombstones: TombstoneConfig::default(),
            token_timeout_ms: SESSION_TOKEN_TIMEOUT_SECS * 1_000,
            periodic_interval_ms: SYNC_PERIODIC_INTERVAL_SECS * 1_000,
            periodic_jitter_ms: SYNC_INTERVAL_JITTER_SECS * 1_000,
        }
    }
}

impl SyncEngineConfig {
    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config: SyncEngineConfig = serde_json::from_str(
            r#"{ "outbox": { "maxConcurrency": 2 }, "tombstones": { "cancelWindowMs": 250 } }"#,
        )
        .expect("parse");

        assert_eq!(config.outbox.max_concurrency, 2);
        assert_eq!(config.outbox.batch_size, OUTBOX_BATCH_SIZE);
        assert_eq!(config.outbox.backoff, BackoffPolicy::default());
        assert_eq!(config.tombstones.cancel_window(), Duration::from_millis(250));
        assert_eq!(
            config.tombstones.retention(),
            Duration::from_secs(TOMBSTONE_RETENTION_SECS)
        );
        assert_eq!(config.token_timeout(), Duration::from_secs(SESSION_TOKEN_TIMEOUT_SECS));
    }
}
