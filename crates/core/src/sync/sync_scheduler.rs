//! Scheduler constants and the clock used by time-driven sync work.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Periodic sync cadence in seconds.
pub const SYNC_PERIODIC_INTERVAL_SECS: u64 = 45;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Timeout for a single outbox send.
pub const OUTBOX_SEND_TIMEOUT_SECS: u64 = 10;

/// Outbox entries claimed per drain pass.
pub const OUTBOX_BATCH_SIZE: i64 = 50;

/// Concurrent outbox sends per drain pass.
pub const OUTBOX_MAX_CONCURRENCY: usize = 4;

/// Expected server heartbeat cadence on the change stream.
pub const STREAM_HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// Silence after which a "connected" stream is considered dead.
pub const STREAM_STALE_AFTER_SECS: u64 = 60;

/// Minimum gap between two connect attempts.
pub const STREAM_RECONNECT_COOLDOWN_MS: u64 = 2_000;

/// Bound on token acquisition and on opening the stream.
pub const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Bound on one frame written to an open stream (subscribe, heartbeat, close).
pub const STREAM_WRITE_TIMEOUT_SECS: u64 = 5;

/// Rows requested per delta page.
pub const RECONCILE_PAGE_SIZE: i64 = 200;

/// Bound on one delta fetch.
pub const RECONCILE_FETCH_TIMEOUT_SECS: u64 = 15;

/// A matching checksum only skips the network if the cursor is younger than this.
pub const RECONCILE_MAX_SKIP_AGE_SECS: u64 = 60 * 15;

/// Undo window before a local delete becomes permanent.
pub const TOMBSTONE_CANCEL_WINDOW_SECS: u64 = 5;

/// How long a tombstone blocks re-insertion.
pub const TOMBSTONE_RETENTION_SECS: u64 = 60 * 60 * 48;

/// Bound on session token acquisition.
pub const SESSION_TOKEN_TIMEOUT_SECS: u64 = 8;

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
