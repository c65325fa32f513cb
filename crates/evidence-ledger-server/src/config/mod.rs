//! Configuration loading and resolution.

use std::path::PathBuf;
use std::time::Duration;

use evidence_ledger::LedgerConfig;

/// Resolve the degraded-mode alert cache path.
///
/// `--alert-cache` wins, then `EVIDENCE_ALERT_CACHE`, then
/// `~/.evidence-ledger/alerts.jsonl`. `off` disables the cache.
pub fn resolve_alert_cache_path(explicit: Option<&str>) -> Option<PathBuf> {
    let chosen = match explicit {
        Some(path) => path.to_string(),
        None => match std::env::var("EVIDENCE_ALERT_CACHE") {
            Ok(env_path) if !env_path.trim().is_empty() => env_path.trim().to_string(),
            _ => return Some(default_alert_cache_path()),
        },
    };
    if chosen.eq_ignore_ascii_case("off") {
        return None;
    }
    Some(PathBuf::from(chosen))
}

fn default_alert_cache_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(format!("{home}/.evidence-ledger/alerts.jsonl"))
}

/// Environment-derived ledger config with CLI overrides applied.
pub fn ledger_config(alert_cache: Option<&str>, sweep_secs: Option<u64>) -> LedgerConfig {
    let mut config = LedgerConfig::from_env();
    config.alert_cache_path = resolve_alert_cache_path(alert_cache);
    if let Some(secs) = sweep_secs {
        config.sweep_interval = Duration::from_secs(secs.max(1));
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        assert_eq!(
            resolve_alert_cache_path(Some("/var/lib/ledger/alerts.jsonl")),
            Some(PathBuf::from("/var/lib/ledger/alerts.jsonl"))
        );
    }

    #[test]
    fn test_off_disables_cache() {
        assert_eq!(resolve_alert_cache_path(Some("OFF")), None);
    }

    #[test]
    fn test_sweep_override() {
        let cfg = ledger_config(Some("off"), Some(0));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
        assert!(cfg.alert_cache_path.is_none());
    }
}
