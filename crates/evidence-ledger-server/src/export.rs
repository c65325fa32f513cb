//! Offline verification of exported events.

use std::collections::BTreeMap;

use evidence_ledger::hash_chain::verify_events;
use evidence_ledger::{ChainReport, Event};

/// Parse an export, either a JSON array or one event per line.
pub fn parse_export(content: &str) -> anyhow::Result<Vec<Event>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("line {}: {e}", n + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Verify every source chain present in `events`, one report per source.
pub fn verify_export(events: Vec<Event>) -> Vec<ChainReport> {
    let mut by_source: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for event in events {
        by_source
            .entry(event.source_system.clone())
            .or_default()
            .push(event);
    }

    by_source
        .into_iter()
        .map(|(source, mut chain)| {
            chain.sort_by_key(|e| e.sequence_number);
            verify_events(&source, &chain)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evidence_ledger::{EvidenceLedger, LedgerConfig, NewEvent};
    use serde_json::json;

    async fn exported(n: usize) -> Vec<Event> {
        let ledger = EvidenceLedger::in_memory(LedgerConfig::default()).unwrap();
        for i in 0..n {
            let mut req = NewEvent::new("CONTROL.TESTED", "grc-tool", json!({ "run": i }));
            req.request_tsa_timestamp = Some(false);
            ledger.create_event(req).await.unwrap();
        }
        ledger.chain_events("grc-tool").unwrap()
    }

    #[tokio::test]
    async fn test_jsonl_export_verifies() {
        let events = exported(3).await;
        let jsonl: String = events
            .iter()
            .map(|e| serde_json::to_string(e).unwrap() + "\n")
            .collect();

        let reports = verify_export(parse_export(&jsonl).unwrap());
        assert_eq!(reports.len(), 1);
        assert!(reports[0].intact);
        assert_eq!(reports[0].length, 3);
    }

    #[tokio::test]
    async fn test_edited_payload_is_caught() {
        let mut events = exported(3).await;
        events[1].payload = json!({ "run": 99 });
        let array = serde_json::to_string(&events).unwrap();

        let reports = verify_export(parse_export(&array).unwrap());
        assert!(!reports[0].intact);
        assert!(reports[0].first_break.is_some());
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let err = parse_export("\nnot json\n").unwrap_err();
        assert!(err.to_string().starts_with("line 2"));
    }
}
