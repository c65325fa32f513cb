//! Timestamp Authority Client.
//!
//! Timestamping is best-effort enrichment: a failed or timed-out request
//! writes nothing and never affects the durability of the event it was for.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{LedgerError, LedgerResult, TsaError};
use crate::hash_chain::hash_bytes;
use crate::store::EvidenceStore;
use crate::types::{ContentHash, TimestampSubject, TsaTimestamp};

/// What an authority returns for one hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsaAssertion {
    pub token: String,
    pub time: DateTime<Utc>,
}

/// A trusted timestamping authority.
#[async_trait]
pub trait TimestampAuthority: Send + Sync {
    fn provider(&self) -> &str;

    async fn timestamp(&self, hash: &ContentHash) -> Result<TsaAssertion, TsaError>;

    /// Provider-specific check of a stored assertion. Authorities that cannot
    /// re-check offline accept any non-empty token.
    fn check(&self, stamp: &TsaTimestamp) -> bool {
        !stamp.tsa_response.is_empty()
    }
}

/// Development authority: the token is SHA-256 over hash, time, and provider.
pub struct LocalTimestampAuthority {
    provider: String,
}

impl LocalTimestampAuthority {
    pub const PROVIDER: &'static str = "local-dev-tsa";

    pub fn new() -> Self {
        Self {
            provider: Self::PROVIDER.to_string(),
        }
    }

    fn token_for(&self, hash: &ContentHash, time: DateTime<Utc>) -> String {
        let input = format!(
            "{}|{}|{}",
            hash,
            time.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.provider
        );
        hash_bytes(input.as_bytes()).0
    }
}

impl Default for LocalTimestampAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimestampAuthority for LocalTimestampAuthority {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn timestamp(&self, hash: &ContentHash) -> Result<TsaAssertion, TsaError> {
        if !hash.is_well_formed() {
            return Err(TsaError::Malformed(format!("not a sha-256 hex digest: {hash}")));
        }
        let time = Utc::now();
        Ok(TsaAssertion {
            token: self.token_for(hash, time),
            time,
        })
    }

    fn check(&self, stamp: &TsaTimestamp) -> bool {
        stamp.tsa_response == self.token_for(&stamp.hash_timestamped, stamp.tsa_time)
    }
}

pub struct TimestampClient {
    store: Arc<dyn EvidenceStore>,
    authority: Arc<dyn TimestampAuthority>,
    timeout: Duration,
}

impl TimestampClient {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        authority: Arc<dyn TimestampAuthority>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            authority,
            timeout,
        }
    }

    pub fn provider(&self) -> &str {
        self.authority.provider()
    }

    pub async fn timestamp_event(
        &self,
        event_id: &str,
        hash: &ContentHash,
    ) -> LedgerResult<TsaTimestamp> {
        self.stamp(TimestampSubject::Event(event_id.to_string()), hash)
            .await
    }

    pub async fn timestamp_anchor(
        &self,
        anchor_id: &str,
        merkle_root: &ContentHash,
    ) -> LedgerResult<TsaTimestamp> {
        self.stamp(TimestampSubject::Anchor(anchor_id.to_string()), merkle_root)
            .await
    }

    async fn stamp(
        &self,
        subject: TimestampSubject,
        hash: &ContentHash,
    ) -> LedgerResult<TsaTimestamp> {
        let assertion = tokio::time::timeout(self.timeout, self.authority.timestamp(hash))
            .await
            .map_err(|_| TsaError::Timeout(self.timeout.as_millis() as u64))??;

        let stamp = TsaTimestamp {
            timestamp_id: uuid::Uuid::new_v4().to_string(),
            subject,
            tsa_response: assertion.token,
            tsa_time: assertion.time,
            tsa_provider: self.authority.provider().to_string(),
            hash_timestamped: hash.clone(),
        };
        self.store.insert_timestamp(stamp.clone())?;
        tracing::info!(
            "timestamped {} via {} ({:?})",
            stamp.hash_timestamped,
            stamp.tsa_provider,
            stamp.subject
        );
        Ok(stamp)
    }

    /// Whether a stored assertion exists and is well-formed.
    pub fn verify_timestamp(&self, timestamp_id: &str) -> LedgerResult<bool> {
        let stamp = self
            .store
            .get_timestamp(timestamp_id)?
            .ok_or_else(|| LedgerError::not_found("timestamp", timestamp_id))?;

        let well_formed = !stamp.tsa_response.is_empty()
            && !stamp.tsa_provider.is_empty()
            && stamp.hash_timestamped.is_well_formed();
        if !well_formed {
            return Ok(false);
        }
        if stamp.tsa_provider == self.authority.provider() {
            return Ok(self.authority.check(&stamp));
        }
        Ok(true)
    }
}
