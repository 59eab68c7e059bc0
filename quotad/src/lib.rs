//! # quotad: daily application quota enforcement
//!
//! `quotad` is a background worker that keeps per-user auto-scraper usage within the daily
//! allowance of each user's subscription tier. It has no API of its own; all state lives in
//! the `profiles` table of a Supabase project, reached through its PostgREST endpoint with
//! the service role key.
//!
//! ## What It Does
//!
//! Every three minutes (configurable) the worker runs one reconciliation pass:
//!
//! 1. Fetch every profile with `auto_scraper_enabled = true`, projecting only the quota
//!    columns.
//! 2. For each profile, roll the daily counter over if the last counted application was on an
//!    earlier UTC calendar day, then compare it with the tier's daily limit (free 5, pro 25,
//!    premium 50, unknown tiers count as free).
//! 3. At or over the limit, turn the auto-scraper off. Otherwise count one more application:
//!    bump today's and the lifetime counter and stamp `last_application_date`.
//!
//! A failed write is logged and reported in the run's [`RunResult`]; the rest of the batch
//! still goes through. A failed fetch aborts the run before any write. Neither is retried
//! inside the run, the next tick picks the same profiles up again.
//!
//! ## Architecture
//!
//! - [`store`]: the [`QuotaStore`] trait with a PostgREST implementation and an in-memory one
//!   used by tests.
//! - [`reconciler`]: the pure per-profile [`decide`] function and the [`Reconciler`] that
//!   fetches, plans and applies a run.
//! - [`scheduler`]: the interval loop, overlap handling and graceful shutdown.
//! - [`config`], [`telemetry`], [`metrics`]: figment configuration, `tracing` setup with
//!   optional OTLP export, and an optional Prometheus exporter.
//!
//! ```no_run
//! use quotad::{Application, Config};
//!
//! # async fn example(config: Config) -> anyhow::Result<()> {
//! let shutdown = async {
//!     tokio::signal::ctrl_c().await.ok();
//! };
//! Application::new(config)?.serve(shutdown).await
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, info};

pub mod config;
pub mod errors;
pub mod metrics;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;

pub use config::Config;
pub use errors::{Error, Result};
pub use reconciler::{Decision, Reconciler, RunResult, decide};
pub use scheduler::ReconcileScheduler;
pub use store::{InMemoryStore, PostgrestStore, QuotaStore, StoreError};
pub use types::{QuotaIncrement, SubscriptionTier, UserId, UserQuotaRecord};

/// Install the aws-lc-rs rustls provider as the process default.
///
/// reqwest is built without a bundled provider, so this must happen before the first client
/// is created. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// The worker: a store-backed [`Reconciler`] and the scheduler that drives it.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] builds the store client and, if enabled, the metrics
///    exporter. Nothing is fetched yet.
/// 2. **Run**: [`Application::serve`] ticks until the shutdown future resolves, or
///    [`Application::run_once`] performs a single pass.
/// 3. **Shutdown**: the scheduler stops ticking, in-flight runs finish, spans are flushed.
pub struct Application {
    config: Config,
    reconciler: Arc<Reconciler>,
}

impl Application {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting quotad with configuration: {:#?}", config);

        let store = store::PostgrestStore::from_config(&config.store)?;
        info!(table_url = %store.table_url(), "Using PostgREST profile store");

        Self::with_store(config, Arc::new(store))
    }

    /// Build against an arbitrary store.
    pub fn with_store(config: Config, store: Arc<dyn QuotaStore>) -> anyhow::Result<Self> {
        if config.metrics.enabled {
            metrics::install_exporter(&config.metrics)?;
            info!(listen = %config.metrics.listen, "Prometheus metrics exporter started");
        }

        let reconciler = Reconciler::new(store).with_apply_concurrency(config.reconciler.apply_concurrency);

        Ok(Self {
            config,
            reconciler: Arc::new(reconciler),
        })
    }

    /// Perform a single reconciliation pass now.
    pub async fn run_once(&self) -> Result<RunResult> {
        self.reconciler.reconcile(chrono::Utc::now()).await
    }

    /// Run the scheduler until `shutdown` resolves, then wait for in-flight runs.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let scheduler = ReconcileScheduler::new(self.reconciler.clone(), self.config.schedule.clone());
        let handle = tokio::spawn(scheduler.run(shutdown_token.clone()));

        shutdown.await;
        shutdown_token.cancel();

        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
