//! Bookkeeping for secondary steps that failed after their event was durable.
//!
//! A retry first claims its gap with a compare-and-set on the attempt count
//! and holds it for [`GAP_CLAIM_LEASE_SECS`]. Concurrent retries of the same
//! gap lose with `ConcurrencyLoss`, so a step is never re-run twice at once.

use chrono::{DateTime, Duration, Utc};

use crate::error::{LedgerError, LedgerResult};
use crate::store::EvidenceStore;
use crate::types::{LinkageGap, LinkageStep};

/// How long a claimed gap stays reserved for the retry that claimed it.
pub const GAP_CLAIM_LEASE_SECS: i64 = 300;

/// Log a LinkageFailure and persist it as an open gap for later repair.
///
/// Returns the gap id, or `None` if even the gap could not be written.
pub(crate) fn record_gap(
    store: &dyn EvidenceStore,
    event_id: &str,
    step: LinkageStep,
    error: &LedgerError,
) -> Option<String> {
    tracing::warn!("linkage failure for event {event_id} ({step:?}): {error}");
    let gap = LinkageGap {
        gap_id: uuid::Uuid::new_v4().to_string(),
        event_id: event_id.to_string(),
        step,
        error: error.to_string(),
        recorded_at: Utc::now(),
        attempts: 0,
        claimed_at: None,
        resolved_at: None,
    };
    let gap_id = gap.gap_id.clone();
    match store.insert_linkage_gap(gap) {
        Ok(()) => Some(gap_id),
        Err(e) => {
            tracing::error!("failed to record linkage gap for event {event_id}: {e}");
            None
        }
    }
}

/// Reserve an open gap for one retry. A resolved gap is returned unchanged.
pub(crate) fn claim_gap(
    store: &dyn EvidenceStore,
    gap_id: &str,
    now: DateTime<Utc>,
) -> LedgerResult<LinkageGap> {
    let gap = store
        .get_linkage_gap(gap_id)?
        .ok_or_else(|| LedgerError::not_found("linkage gap", gap_id))?;
    if gap.resolved_at.is_some() {
        return Ok(gap);
    }
    if let Some(at) = gap.claimed_at {
        if now - at < Duration::seconds(GAP_CLAIM_LEASE_SECS) {
            return Err(LedgerError::ConcurrencyLoss {
                entity: "linkage gap",
                id: gap.gap_id,
                expected: "unclaimed".to_string(),
                actual: format!("claimed at {at}"),
            });
        }
    }

    let mut claimed = gap.clone();
    claimed.attempts = gap.attempts + 1;
    claimed.claimed_at = Some(now);
    store.update_linkage_gap(claimed.clone(), gap.attempts)?;
    Ok(claimed)
}

/// Release a claimed gap with the outcome of its retry.
pub(crate) fn settle_gap(
    store: &dyn EvidenceStore,
    mut claimed: LinkageGap,
    outcome: LedgerResult<String>,
) -> LedgerResult<LinkageGap> {
    let attempts = claimed.attempts;
    claimed.claimed_at = None;
    match outcome {
        Ok(id) => {
            claimed.resolved_at = Some(Utc::now());
            store.update_linkage_gap(claimed.clone(), attempts)?;
            tracing::info!("linkage gap {} repaired ({id})", claimed.gap_id);
            Ok(claimed)
        }
        Err(e) => {
            claimed.error = e.to_string();
            let event_id = claimed.event_id.clone();
            store.update_linkage_gap(claimed, attempts)?;
            Err(LedgerError::Linkage {
                event_id,
                detail: e.to_string(),
            })
        }
    }
}
