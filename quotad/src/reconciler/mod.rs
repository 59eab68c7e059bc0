//! Quota reconciliation: fetch candidates, decide per profile, apply the writes.
//!
//! ```text
//! reconcile(now)
//!   ├─ fetch_candidates()            // one store read; failure aborts the run
//!   ├─ plan(records, now)            // pure: decide() per record
//!   └─ apply(planned)                // one write per record, failures isolated
//!        ├─ Disable   → store.disable_auto_scraper(id)
//!        └─ Increment → store.record_increment(id, counters)
//! ```
//!
//! Nothing here retries. A failed fetch is picked up by the next scheduled run; a failed
//! write leaves the profile a candidate, so it is re-evaluated next run as well.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use tracing::Instrument;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::metrics::{RECORDS_TOTAL, RUN_DURATION_SECONDS, RUNS_TOTAL};
use crate::store::{QuotaStore, StoreError};
use crate::types::{UserId, UserQuotaRecord};

pub mod decision;

pub use decision::{Decision, decide};

/// A decision paired with the snapshot it was made from.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub record: UserQuotaRecord,
    pub decision: Decision,
}

/// Which write a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Disable,
    Increment,
}

/// A per-profile write that the store did not accept.
#[derive(Debug)]
pub struct WriteFailure {
    pub id: UserId,
    pub email: Option<String>,
    pub action: WriteAction,
    pub error: StoreError,
}

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct RunResult {
    pub disabled: usize,
    pub incremented: usize,
    pub failures: Vec<WriteFailure>,
}

impl RunResult {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Number of profiles visited by the run.
    pub fn total(&self) -> usize {
        self.disabled + self.incremented + self.failed()
    }

    pub fn failed_ids(&self) -> Vec<&UserId> {
        self.failures.iter().map(|f| &f.id).collect()
    }
}

enum RecordOutcome {
    Disabled,
    Incremented,
    Failed(WriteFailure),
}

/// Decide the write for every candidate.
pub fn plan(records: Vec<UserQuotaRecord>, now: DateTime<Utc>) -> Vec<PlannedWrite> {
    records
        .into_iter()
        .map(|record| {
            let decision = decide(&record, now);
            PlannedWrite { record, decision }
        })
        .collect()
}

/// Runs reconciliation against an injected store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn QuotaStore>,
    apply_concurrency: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            apply_concurrency: 1,
        }
    }

    /// Issue up to `concurrency` writes at once during `apply` (minimum 1).
    pub fn with_apply_concurrency(mut self, concurrency: usize) -> Self {
        self.apply_concurrency = concurrency.max(1);
        self
    }

    /// One full run: fetch, decide and apply, in a span carrying a fresh run id.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("reconcile", %run_id);

        async move {
            let started = Instant::now();
            tracing::info!(%now, "Starting quota reconciliation run");

            let records = match self.fetch_candidates().await {
                Ok(records) => records,
                Err(e) => {
                    counter!(RUNS_TOTAL, "outcome" => "fetch_failed").increment(1);
                    tracing::error!(error = %e, "Quota reconciliation run aborted");
                    return Err(e);
                }
            };

            if records.is_empty() {
                tracing::info!("No active users with auto-scraper enabled");
            } else {
                tracing::info!(count = records.len(), "Found active users");
            }

            let result = self.apply(plan(records, now)).await;

            let elapsed = started.elapsed();
            histogram!(RUN_DURATION_SECONDS).record(elapsed.as_secs_f64());
            counter!(RUNS_TOTAL, "outcome" => "completed").increment(1);
            tracing::info!(
                disabled = result.disabled,
                incremented = result.incremented,
                failed = result.failed(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Quota reconciliation run completed"
            );

            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Read every profile with the auto-scraper enabled.
    pub async fn fetch_candidates(&self) -> Result<Vec<UserQuotaRecord>> {
        self.store.fetch_candidates().await.map_err(Error::Fetch)
    }

    /// Issue one write per planned decision. A failed write is recorded against its profile
    /// and never stops the others.
    pub async fn apply(&self, planned: Vec<PlannedWrite>) -> RunResult {
        let outcomes: Vec<RecordOutcome> = stream::iter(planned)
            .map(|p| self.apply_one(p))
            .buffer_unordered(self.apply_concurrency)
            .collect()
            .await;

        let mut result = RunResult::default();
        for outcome in outcomes {
            match outcome {
                RecordOutcome::Disabled => result.disabled += 1,
                RecordOutcome::Incremented => result.incremented += 1,
                RecordOutcome::Failed(failure) => result.failures.push(failure),
            }
        }
        result
    }

    async fn apply_one(&self, planned: PlannedWrite) -> RecordOutcome {
        let PlannedWrite { record, decision } = planned;
        let daily_limit = record.subscription_tier.daily_limit();

        let (action, written) = match &decision {
            Decision::Disable { today_count, .. } => {
                tracing::info!(
                    user_id = %record.id,
                    user = record.label(),
                    today_count,
                    daily_limit,
                    "User hit daily limit, disabling auto-scraper"
                );
                (WriteAction::Disable, self.store.disable_auto_scraper(&record.id).await)
            }
            Decision::Increment(increment) => (
                WriteAction::Increment,
                self.store.record_increment(&record.id, increment).await,
            ),
        };

        match (written, decision) {
            (Ok(()), Decision::Disable { .. }) => {
                counter!(RECORDS_TOTAL, "outcome" => "disabled").increment(1);
                tracing::info!(user_id = %record.id, user = record.label(), "Disabled auto-scraper");
                RecordOutcome::Disabled
            }
            (Ok(()), Decision::Increment(increment)) => {
                counter!(RECORDS_TOTAL, "outcome" => "incremented").increment(1);
                tracing::info!(
                    user_id = %record.id,
                    user = record.label(),
                    today = increment.today_applications_count,
                    daily_limit,
                    total = increment.application_count,
                    "Incremented application counters"
                );
                RecordOutcome::Incremented
            }
            (Err(error), _) => {
                counter!(RECORDS_TOTAL, "outcome" => "failed").increment(1);
                tracing::warn!(
                    user_id = %record.id,
                    user = record.label(),
                    action = ?action,
                    error = %error,
                    "Failed to update profile"
                );
                RecordOutcome::Failed(WriteFailure {
                    id: record.id,
                    email: record.email,
                    action,
                    error,
                })
            }
        }
    }
}
