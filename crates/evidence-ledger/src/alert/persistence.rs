//! Alert persistence with an explicit Online/Degraded mode.
//!
//! Online writes go to the primary [`AlertStore`]. The first `Unavailable`
//! error switches the mode to Degraded (logged once) and alert writes go to
//! the local [`AlertCache`] instead, stamped `storage: LOCAL_CACHE`. Only
//! [`AlertPersistence::try_recover`] switches back.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::alert_cache::AlertCache;
use crate::error::{LedgerError, LedgerResult};
use crate::store::{AlertStore, StoreError};
use crate::types::{Alert, AlertStatus, AlertStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceMode {
    Online,
    Degraded,
}

impl PersistenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
        }
    }
}

pub struct AlertPersistence {
    primary: Arc<dyn AlertStore>,
    cache: Option<AlertCache>,
    mode: RwLock<PersistenceMode>,
    /// Serializes read-compare-append on cached alerts.
    cache_lock: Mutex<()>,
}

impl AlertPersistence {
    pub fn new(primary: Arc<dyn AlertStore>, cache: Option<AlertCache>) -> Self {
        Self {
            primary,
            cache,
            mode: RwLock::new(PersistenceMode::Online),
            cache_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> PersistenceMode {
        *self.mode.read()
    }

    fn degrade(&self, reason: &str) {
        let mut mode = self.mode.write();
        if *mode == PersistenceMode::Online {
            *mode = PersistenceMode::Degraded;
            let target = self
                .cache
                .as_ref()
                .map(|c| c.path().display().to_string())
                .unwrap_or_else(|| "<no cache configured>".to_string());
            tracing::warn!(
                "alert persistence ONLINE -> DEGRADED ({reason}); writing to local cache {target}"
            );
        }
    }

    /// Check the primary store and return to Online if it answers.
    pub fn try_recover(&self) -> PersistenceMode {
        if self.mode() == PersistenceMode::Online {
            return PersistenceMode::Online;
        }
        match self.primary.list_alerts() {
            Ok(_) => {
                *self.mode.write() = PersistenceMode::Online;
                tracing::info!("alert persistence DEGRADED -> ONLINE");
                PersistenceMode::Online
            }
            Err(e) => {
                tracing::debug!("primary alert store still unavailable: {e}");
                PersistenceMode::Degraded
            }
        }
    }

    fn cache(&self) -> LedgerResult<&AlertCache> {
        self.cache.as_ref().ok_or_else(|| {
            LedgerError::Store(StoreError::Unavailable(
                "primary alert store unavailable and no local cache configured".to_string(),
            ))
        })
    }

    fn insert_cached(&self, mut alert: Alert) -> LedgerResult<Alert> {
        alert.storage = AlertStorage::LocalCache;
        let cache = self.cache()?;
        let _guard = self.cache_lock.lock();
        cache.append(&alert)?;
        Ok(alert)
    }

    /// Persist a new alert. Returns it with `storage` set to where it landed.
    pub fn insert(&self, mut alert: Alert) -> LedgerResult<Alert> {
        if self.mode() == PersistenceMode::Degraded {
            return self.insert_cached(alert);
        }
        alert.storage = AlertStorage::Primary;
        match self.primary.insert_alert(alert.clone()) {
            Ok(()) => Ok(alert),
            Err(StoreError::Unavailable(reason)) => {
                self.degrade(&reason);
                self.insert_cached(alert)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, alert_id: &str) -> LedgerResult<Option<Alert>> {
        if self.mode() == PersistenceMode::Online {
            match self.primary.get_alert(alert_id) {
                Ok(Some(alert)) => return Ok(Some(alert)),
                Ok(None) => {}
                Err(StoreError::Unavailable(reason)) => self.degrade(&reason),
                Err(e) => return Err(e.into()),
            }
        }
        match &self.cache {
            Some(cache) => cache.get(alert_id),
            None => Ok(None),
        }
    }

    /// Replace an alert if its stored status is still `expected`.
    pub fn update(&self, alert: Alert, expected: AlertStatus) -> LedgerResult<()> {
        match alert.storage {
            AlertStorage::LocalCache => {
                let cache = self.cache()?;
                let _guard = self.cache_lock.lock();
                let current = cache
                    .get(&alert.alert_id)?
                    .ok_or_else(|| LedgerError::not_found("alert", alert.alert_id.clone()))?;
                if current.status != expected {
                    return Err(LedgerError::ConcurrencyLoss {
                        entity: "alert",
                        id: alert.alert_id,
                        expected: expected.as_str().to_string(),
                        actual: current.status.as_str().to_string(),
                    });
                }
                cache.append(&alert)
            }
            AlertStorage::Primary => match self.primary.update_alert(alert, expected) {
                Ok(()) => Ok(()),
                Err(StoreError::Unavailable(reason)) => {
                    self.degrade(&reason);
                    Err(StoreError::Unavailable(reason).into())
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Primary alerts followed by cache-only alerts.
    pub fn list(&self) -> LedgerResult<Vec<Alert>> {
        let mut alerts = match self.primary.list_alerts() {
            Ok(a) => a,
            Err(StoreError::Unavailable(reason)) => {
                self.degrade(&reason);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(cache) = &self.cache {
            let seen: HashSet<String> = alerts.iter().map(|a| a.alert_id.clone()).collect();
            alerts.extend(
                cache
                    .load()?
                    .into_iter()
                    .filter(|a| !seen.contains(&a.alert_id)),
            );
        }
        Ok(alerts)
    }
}
