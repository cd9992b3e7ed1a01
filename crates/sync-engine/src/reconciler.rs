//! Delta reconciliation against the backend.
//!
//! Each collection keeps a cursor (`last_sync_timestamp`) and the checksum
//! of its local keys at the end of the last complete run. The cursor only
//! moves past rows that were applied or deliberately skipped.

use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use huddle_core::errors::{Error, Result};
use huddle_core::messaging::MessagingRepositoryTrait;
use huddle_core::sync::{
    order_parent_first, with_timeout, ApplyOutcome, ApplyReport, Clock, Collection,
    RemoteBackend, SessionProvider, SyncCursor, SyncCursorRepositoryTrait, SyncRow,
    SYNC_COLLECTIONS,
};

use crate::config::ReconcilerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Skip the network when local content matches the last recorded
    /// checksum and the cursor is recent.
    ChecksumGated,
    Force,
}

impl ReconcileMode {
    fn merge(self, other: ReconcileMode) -> ReconcileMode {
        if self == ReconcileMode::Force || other == ReconcileMode::Force {
            ReconcileMode::Force
        } else {
            ReconcileMode::ChecksumGated
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub collection: Collection,
    pub skipped: bool,
    pub fetched: usize,
    pub applied: usize,
    pub stale: usize,
    pub orphaned: usize,
    pub tombstoned: usize,
    pub cursor: SyncCursor,
    /// False when a row failed and the run stopped early.
    pub complete: bool,
}

impl ReconcileOutcome {
    fn start(cursor: SyncCursor) -> Self {
        Self {
            collection: cursor.collection,
            skipped: false,
            fetched: 0,
            applied: 0,
            stale: 0,
            orphaned: 0,
            tombstoned: 0,
            cursor,
            complete: true,
        }
    }

    fn count(&mut self, report: &ApplyReport) {
        self.applied += report.applied_count();
        self.stale += report.count(|o| matches!(o, ApplyOutcome::Stale));
        self.orphaned += report.count(|o| matches!(o, ApplyOutcome::Orphaned { .. }));
        self.tombstoned += report.count(|o| matches!(o, ApplyOutcome::Tombstoned));
    }
}

/// Cursor after applying one page.
///
/// With a failure, the cursor stops just below the oldest row that was not
/// processed. Otherwise it moves to the newest row, minus one while more
/// pages follow so rows sharing that timestamp are fetched again. A full
/// page that only holds rows at `previous + 1` leaves the cursor where it
/// was.
fn next_cursor(previous: i64, rows: &[SyncRow], report: &ApplyReport, has_more: bool) -> i64 {
    if report.failure.is_some() {
        let processed = report.results.len().min(rows.len());
        let oldest_unprocessed = rows[processed..]
            .iter()
            .map(SyncRow::updated_at)
            .min();
        return match oldest_unprocessed {
            Some(oldest) => previous.max(oldest - 1),
            None => previous,
        };
    }

    let newest = rows.iter().map(SyncRow::updated_at).max().unwrap_or(previous);
    if has_more {
        previous.max(newest - 1)
    } else {
        previous.max(newest)
    }
}

pub struct Reconciler {
    messaging: Arc<dyn MessagingRepositoryTrait>,
    cursors: Arc<dyn SyncCursorRepositoryTrait>,
    backend: Arc<dyn RemoteBackend>,
    session: Arc<dyn SessionProvider>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    token_timeout: std::time::Duration,
    run_lock: Mutex<()>,
    requested: StdMutex<Option<ReconcileMode>>,
}

impl Reconciler {
    pub fn new(
        messaging: Arc<dyn MessagingRepositoryTrait>,
        cursors: Arc<dyn SyncCursorRepositoryTrait>,
        backend: Arc<dyn RemoteBackend>,
        session: Arc<dyn SessionProvider>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
        token_timeout: std::time::Duration,
    ) -> Self {
        Self {
            messaging,
            cursors,
            backend,
            session,
            clock,
            config,
            token_timeout,
            run_lock: Mutex::new(()),
            requested: StdMutex::new(None),
        }
    }

    /// Reconciles one collection from its stored cursor.
    pub async fn reconcile_collection(
        &self,
        collection: Collection,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome> {
        let cursor = self.cursors.get_cursor(collection)?;
        self.reconcile(cursor, mode).await
    }

    /// Pulls everything newer than `cursor` and returns the advanced cursor.
    pub async fn reconcile(&self, cursor: SyncCursor, mode: ReconcileMode) -> Result<ReconcileOutcome> {
        let collection = cursor.collection;
        let now = self.clock.now_millis();

        if mode == ReconcileMode::ChecksumGated && cursor.checksum.is_some() {
            let local = self.messaging.collection_checksum(collection)?;
            let age = now - cursor.updated_at;
            if cursor.checksum.as_deref() == Some(local.as_str())
                && age <= self.config.max_skip_age_ms as i64
            {
                debug!("[Reconcile] {} unchanged, skipping fetch", collection);
                let mut outcome = ReconcileOutcome::start(cursor);
                outcome.skipped = true;
                return Ok(outcome);
            }
        }

        let token = self.session.get_valid_token(self.token_timeout).await?;
        let page_size = self.config.page_size.max(1);
        let mut outcome = ReconcileOutcome::start(cursor.clone());
        let mut since = cursor.last_sync_timestamp;
        let mut limit = page_size;

        loop {
            let page = with_timeout(
                self.config.fetch_timeout(),
                self.backend.fetch_since(&token, collection, since, limit),
            )
            .await?;
            if page.rows.is_empty() {
                break;
            }

            let rows = order_parent_first(page.rows);
            outcome.fetched += rows.len();
            let report = self.messaging.apply_remote_rows(rows.clone()).await?;
            outcome.count(&report);

            let advanced = next_cursor(since, &rows, &report, page.has_more);
            if advanced != since {
                self.cursors
                    .save_cursor(SyncCursor {
                        collection,
                        last_sync_timestamp: advanced,
                        checksum: None,
                        updated_at: now,
                    })
                    .await?;
            }

            if let Some(failure) = &report.failure {
                warn!(
                    "[Reconcile] {} stopped at {}: {}",
                    collection, failure.entity_id, failure.error
                );
                outcome.complete = false;
                outcome.cursor = SyncCursor {
                    collection,
                    last_sync_timestamp: advanced,
                    checksum: None,
                    updated_at: now,
                };
                return Ok(outcome);
            }

            if !page.has_more {
                since = advanced;
                break;
            }
            if advanced == since {
                if (rows.len() as i64) < limit {
                    warn!(
                        "[Reconcile] {} server capped the page at {} rows, all at {}",
                        collection,
                        rows.len(),
                        since + 1
                    );
                    outcome.complete = false;
                    outcome.cursor = SyncCursor {
                        collection,
                        last_sync_timestamp: since,
                        checksum: None,
                        updated_at: now,
                    };
                    return Ok(outcome);
                }
                // Every row of a full page shares one timestamp; widen the
                // page until it reaches past it.
                limit = limit.saturating_mul(2);
                debug!(
                    "[Reconcile] {} page pinned at {}, widening to {}",
                    collection,
                    since + 1,
                    limit
                );
                continue;
            }
            since = advanced;
            limit = page_size;
        }

        let checksum = self.messaging.collection_checksum(collection)?;
        let cursor = SyncCursor {
            collection,
            last_sync_timestamp: since,
            checksum: Some(checksum),
            updated_at: now,
        };
        self.cursors.save_cursor(cursor.clone()).await?;
        outcome.cursor = cursor;

        if outcome.fetched > 0 {
            info!(
                "[Reconcile] {}: fetched={} applied={} stale={} orphaned={} tombstoned={} cursor={}",
                collection,
                outcome.fetched,
                outcome.applied,
                outcome.stale,
                outcome.orphaned,
                outcome.tombstoned,
                since
            );
        }
        Ok(outcome)
    }

    /// Reconciles every collection parent-first. A call made while a run is
    /// in progress is folded into one more run; `Force` wins over
    /// `ChecksumGated`.
    pub async fn reconcile_all(&self, mode: ReconcileMode) -> Result<Vec<ReconcileOutcome>> {
        self.request(mode)?;
        let mut outcomes = Vec::new();

        loop {
            let Ok(_guard) = self.run_lock.try_lock() else {
                debug!("[Reconcile] Run in progress; request coalesced");
                return Ok(outcomes);
            };
            while let Some(mode) = self.take_request()? {
                outcomes = self.run_collections(mode).await?;
            }
            drop(_guard);
            if self.peek_request()?.is_none() {
                break;
            }
        }
        Ok(outcomes)
    }

    async fn run_collections(&self, mode: ReconcileMode) -> Result<Vec<ReconcileOutcome>> {
        let mut outcomes = Vec::with_capacity(SYNC_COLLECTIONS.len());
        for collection in SYNC_COLLECTIONS {
            let outcome = self
                .reconcile_collection(collection, mode)
                .await
                .map_err(|err| {
                    warn!("[Reconcile] {} failed: {}", collection, err);
                    err
                })?;
            let complete = outcome.complete;
            outcomes.push(outcome);
            if !complete {
                break;
            }
        }
        Ok(outcomes)
    }

    fn request(&self, mode: ReconcileMode) -> Result<()> {
        let mut requested = self.requested_slot()?;
        *requested = Some(match *requested {
            Some(existing) => existing.merge(mode),
            None => mode,
        });
        Ok(())
    }

    fn take_request(&self) -> Result<Option<ReconcileMode>> {
        Ok(self.requested_slot()?.take())
    }

    fn peek_request(&self) -> Result<Option<ReconcileMode>> {
        Ok(*self.requested_slot()?)
    }

    fn requested_slot(&self) -> Result<std::sync::MutexGuard<'_, Option<ReconcileMode>>> {
        self.requested
            .lock()
            .map_err(|_| Error::Internal("reconcile request slot poisoned".to_string()))
    }
}
