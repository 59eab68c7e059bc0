//! Periodic trigger for reconciliation runs.
//!
//! Ticks every `schedule.interval`, by default on wall-clock multiples of it (a 3 minute
//! interval fires at :00, :03, :06, ...). Each tick spawns a run onto a [`JoinSet`] so a
//! slow store never delays the ticker itself. Whether a tick may start a run while another
//! is still in flight is decided by [`OverlapPolicy`]. Ticks missed while the process was
//! stalled are skipped rather than replayed.
//!
//! On shutdown no new runs are started and the in-flight ones are awaited. A run interrupted
//! part-way would leave some profiles written and others not, which the next run handles
//! anyway, but waiting keeps the log and metrics for that run complete.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{OverlapPolicy, ScheduleConfig};
use crate::metrics::RUNS_SKIPPED_TOTAL;
use crate::reconciler::Reconciler;

/// Time from `now` until the next wall-clock multiple of `period` since the Unix epoch.
///
/// Returns zero when `now` sits exactly on a boundary.
pub fn until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis();
    if period_ms == 0 {
        return Duration::ZERO;
    }

    let now_ms = now.timestamp_millis().max(0) as u128;
    match now_ms % period_ms {
        0 => Duration::ZERO,
        rem => Duration::from_millis((period_ms - rem) as u64),
    }
}

pub struct ReconcileScheduler {
    reconciler: Arc<Reconciler>,
    config: ScheduleConfig,
    active_runs: Arc<AtomicUsize>,
}

impl ReconcileScheduler {
    pub fn new(reconciler: Arc<Reconciler>, config: ScheduleConfig) -> Self {
        Self {
            reconciler,
            config,
            active_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of runs currently executing.
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    /// Tick until `shutdown` is cancelled, then wait for in-flight runs.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.config.interval;
        let first_tick = if self.config.align_to_wall_clock {
            until_next_boundary(Utc::now(), period)
        } else {
            period
        };

        let mut ticker = tokio::time::interval_at(Instant::now() + first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = %humantime::format_duration(period),
            first_run_in = %humantime::format_duration(first_tick),
            overlap = ?self.config.overlap,
            "Quota reconciliation scheduler started"
        );

        let mut runs = JoinSet::new();
        if self.config.run_on_startup {
            self.trigger(&mut runs);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping quota reconciliation scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    self.trigger(&mut runs);
                }
            }

            while let Some(joined) = runs.try_join_next() {
                log_finished(joined);
            }
        }

        if !runs.is_empty() {
            info!(in_flight = runs.len(), "Waiting for in-flight reconciliation runs to finish");
        }
        while let Some(joined) = runs.join_next().await {
            log_finished(joined);
        }

        info!("Quota reconciliation scheduler stopped");
    }

    /// Start a run for the current tick unless the overlap policy forbids it.
    fn trigger(&self, runs: &mut JoinSet<()>) {
        match self.config.overlap {
            OverlapPolicy::Skip => {
                if self
                    .active_runs
                    .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    warn!("Previous reconciliation run still in progress, skipping this tick");
                    counter!(RUNS_SKIPPED_TOTAL).increment(1);
                    return;
                }
            }
            OverlapPolicy::Allow => {
                self.active_runs.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reconciler = self.reconciler.clone();
        let active_runs = self.active_runs.clone();
        runs.spawn(async move {
            // Released even if the run panics.
            let _active = scopeguard::guard(active_runs, |active| {
                active.fetch_sub(1, Ordering::SeqCst);
            });

            if let Err(e) = reconciler.reconcile(Utc::now()).await {
                debug!(error = %e, "Run ended early, next tick will retry");
            }
        });
    }
}

fn log_finished(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Reconciliation run panicked");
        } else {
            warn!(error = %e, "Reconciliation run was cancelled");
        }
    }
}
