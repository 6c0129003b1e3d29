//! Configuration from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `WATCH_NAMESPACE` | all namespaces |
//! | `WORKERS` | 2 |
//! | `MAX_RETRIES` | 15 |
//! | `BACKOFF_BASE_MS` | 5 |
//! | `BACKOFF_MAX_SECS` | 1000 |
//! | `MASTER_URL` | from kubeconfig |
//! | `EVENT_BUFFER` | 1000 |
//! | `METRICS_ADDR` | `0.0.0.0:8080` |
//!
//! The kubeconfig itself is discovered the usual way (`KUBECONFIG`,
//! `~/.kube/config`, or the in-cluster service account).

use crate::error::ControllerError;
use reconcile_runtime::QueueConfig;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_EVENT_BUFFER: usize = 1000;
const DEFAULT_METRICS_PORT: u16 = 8080;

/// Controller settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace to watch, `None` for all
    pub namespace: Option<String>,
    /// Workers per kind
    pub workers: usize,
    /// Retry policy shared by both queues
    pub queue: QueueConfig,
    /// API server address overriding the kubeconfig
    pub master_url: Option<String>,
    /// Events buffered before new ones are dropped
    pub event_buffer: usize,
    /// Listen address of the probe/metrics server
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = QueueConfig::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let workers: usize = parse(&lookup, "WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKERS must be at least 1".to_string(),
            ));
        }
        let base_ms: u64 = parse(
            &lookup,
            "BACKOFF_BASE_MS",
            u64::try_from(defaults.backoff_base.as_millis()).unwrap_or(u64::MAX),
        )?;
        let max_secs: u64 = parse(&lookup, "BACKOFF_MAX_SECS", defaults.backoff_max.as_secs())?;
        if base_ms == 0 || Duration::from_millis(base_ms) > Duration::from_secs(max_secs) {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_BASE_MS ({base_ms}) must be positive and not above BACKOFF_MAX_SECS ({max_secs})"
            )));
        }

        Ok(Self {
            namespace: non_empty("WATCH_NAMESPACE"),
            workers,
            queue: QueueConfig {
                backoff_base: Duration::from_millis(base_ms),
                backoff_max: Duration::from_secs(max_secs),
                max_retries: parse(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            },
            master_url: non_empty("MASTER_URL"),
            event_buffer: parse(&lookup, "EVENT_BUFFER", DEFAULT_EVENT_BUFFER)?,
            metrics_addr: parse(
                &lookup,
                "METRICS_ADDR",
                SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            )?,
        })
    }

    /// Logs the effective settings.
    pub fn log(&self) {
        info!("Configuration:");
        info!(
            "  Namespace: {}",
            self.namespace.as_deref().unwrap_or("all namespaces")
        );
        info!("  Workers: {}", self.workers);
        info!(
            "  Retries: {} (backoff {:?} .. {:?})",
            self.queue.max_retries, self.queue.backoff_base, self.queue.backoff_max
        );
        if let Some(url) = &self.master_url {
            info!("  Master URL: {}", url);
        }
        info!("  Metrics address: {}", self.metrics_addr);
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{key}={raw:?}: {e}"))
        }),
        _ => Ok(default),
    }
}
