//! Ledger configuration: defaults overridable from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::clock::WarningThreshold;
use crate::types::Regulation;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_TSA_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DASHBOARD_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub sweep_interval: Duration,
    pub tsa_timeout: Duration,
    /// Tag applied to events whose type is not in the regulation table.
    pub fallback_regulation: Regulation,
    /// Local alert cache used while the primary store is down. `None`
    /// disables degraded mode.
    pub alert_cache_path: Option<PathBuf>,
    pub warning_thresholds: Vec<WarningThreshold>,
    pub dashboard_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            tsa_timeout: Duration::from_millis(DEFAULT_TSA_TIMEOUT_MS),
            fallback_regulation: Regulation::Gdpr,
            alert_cache_path: None,
            warning_thresholds: WarningThreshold::defaults(),
            dashboard_capacity: DEFAULT_DASHBOARD_CAPACITY,
        }
    }
}

impl LedgerConfig {
    /// Defaults with `EVIDENCE_*` overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides read through `lookup`, keyed by variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let fallback_regulation = match read_string(&lookup, "EVIDENCE_FALLBACK_REGULATION") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!("ignoring EVIDENCE_FALLBACK_REGULATION: {e}");
                defaults.fallback_regulation
            }),
            None => defaults.fallback_regulation,
        };
        Self {
            sweep_interval: Duration::from_secs(
                read_u64(&lookup, "EVIDENCE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)
                    .max(1),
            ),
            tsa_timeout: Duration::from_millis(read_u64(
                &lookup,
                "EVIDENCE_TSA_TIMEOUT_MS",
                DEFAULT_TSA_TIMEOUT_MS,
            )),
            fallback_regulation,
            alert_cache_path: read_string(&lookup, "EVIDENCE_ALERT_CACHE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            warning_thresholds: defaults.warning_thresholds,
            dashboard_capacity: read_usize(
                &lookup,
                "EVIDENCE_DASHBOARD_CAPACITY",
                DEFAULT_DASHBOARD_CAPACITY,
            )
            .max(1),
        }
    }
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str, default_value: u64) -> u64 {
    lookup(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default_value: usize,
) -> usize {
    lookup(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).map(|v| v.trim().to_string())
}
