//! Worker configuration.
//!
//! Configuration is loaded from an optional YAML file with environment variable overrides.
//! The file path defaults to `config.yaml` and can be set with `-f` or `QUOTAD_CONFIG`.
//!
//! ## Loading Priority
//!
//! Later sources override earlier ones:
//!
//! 1. **YAML config file** - base configuration (a missing file is fine)
//! 2. **Environment variables** - variables prefixed with `QUOTAD_`, `__` for nesting
//! 3. **`SUPABASE_URL` / `SUPABASE_SERVICE_ROLE_KEY`** - override `store.url` and
//!    `store.service_role_key`
//!
//! ```bash
//! SUPABASE_URL="https://abc.supabase.co"
//! SUPABASE_SERVICE_ROLE_KEY="..."
//! QUOTAD_SCHEDULE__INTERVAL=5m
//! QUOTAD_SCHEDULE__OVERLAP=allow
//! QUOTAD_RECONCILER__APPLY_CONCURRENCY=4
//! ```
//!
//! The store endpoint and key have no defaults. [`Config::load`] fails with
//! [`Error::StartupConfig`] when either is missing, so the scheduler never starts without
//! credentials.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use url::Url;

use crate::errors::Error;

/// CLI args - config file plus run modes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "QUOTAD_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the scheduler.
    #[arg(long)]
    pub validate: bool,

    /// Run a single reconciliation immediately and exit.
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Row store holding the profiles table
    pub store: StoreConfig,
    /// When reconciliation runs
    pub schedule: ScheduleConfig,
    /// How a run applies its writes
    pub reconciler: ReconcilerConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
    /// Enable OpenTelemetry OTLP span export
    pub enable_otel_export: bool,
}

/// PostgREST endpoint and credentials.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub url: Option<Url>,
    /// Service role key, sent as both `apikey` and bearer token
    #[serde(skip_serializing)]
    pub service_role_key: Option<String>,
    /// Table holding the quota columns
    pub table: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_role_key: None,
            table: "profiles".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("service_role_key", &self.service_role_key.as_ref().map(|_| "<redacted>"))
            .field("table", &self.table)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What to do when a tick fires while the previous run is still going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Skip the tick
    #[default]
    Skip,
    /// Start another run alongside the one in flight
    Allow,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Time between runs (default: 3m)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Overlap handling (default: skip)
    pub overlap: OverlapPolicy,
    /// Fire on wall-clock multiples of `interval`, like a `*/3 * * * *` cron entry
    pub align_to_wall_clock: bool,
    /// Run once immediately at startup instead of waiting for the first tick
    pub run_on_startup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3 * 60),
            overlap: OverlapPolicy::Skip,
            align_to_wall_clock: true,
            run_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Maximum concurrent profile writes per run (default: 1, sequential)
    pub apply_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { apply_concurrency: 1 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics (default: false)
    pub enabled: bool,
    /// Listen address for the exporter
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let Some(url) = &self.store.url else {
            return Err(Error::startup_config(
                "store.url is not configured. Set SUPABASE_URL or QUOTAD_STORE__URL.",
            ));
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::startup_config(format!(
                "store.url must be an http(s) URL, got scheme '{}'",
                url.scheme()
            )));
        }

        if self
            .store
            .service_role_key
            .as_deref()
            .is_none_or(|key| key.trim().is_empty())
        {
            return Err(Error::startup_config(
                "store.service_role_key is not configured. Set SUPABASE_SERVICE_ROLE_KEY or QUOTAD_STORE__SERVICE_ROLE_KEY.",
            ));
        }

        if self.store.table.trim().is_empty() {
            return Err(Error::startup_config("store.table must not be empty"));
        }

        if self.store.timeout.is_zero() {
            return Err(Error::startup_config("store.timeout must be greater than 0"));
        }

        if self.schedule.interval.is_zero() {
            return Err(Error::startup_config("schedule.interval must be greater than 0"));
        }

        if self.reconciler.apply_concurrency == 0 {
            return Err(Error::startup_config("reconciler.apply_concurrency must be at least 1"));
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // QUOTAD_CONFIG names the file itself and is read by clap
            .merge(Env::prefixed("QUOTAD_").ignore(&["CONFIG"]).split("__"))
            .merge(Env::raw().only(&["SUPABASE_URL"]).map(|_| "store.url".into()))
            .merge(
                Env::raw()
                    .only(&["SUPABASE_SERVICE_ROLE_KEY"])
                    .map(|_| "store.service_role_key".into()),
            )
    }
}
