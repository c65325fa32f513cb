//! Evidence Ledger — tamper-evident compliance evidence: hash-chained events,
//! regulatory clocks, an evidence graph, and alert escalation.

pub mod alert;
pub mod alert_cache;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod graph;
pub mod hash_chain;
pub mod ingest;
pub mod ledger;
mod linkage;
pub mod store;
pub mod sweep;
pub mod tsa;
pub mod types;

pub use alert::{AlertService, AlertSummary, DashboardBus, NewAlert, Notification};
pub use clock::{ClockEngine, ClockSignal, ClockType, ClockUpdate, NewClock, WarningThreshold};
pub use config::LedgerConfig;
pub use decision::{DecisionReceipt, NewDecision};
pub use error::{LedgerError, LedgerResult};
pub use hash_chain::{compute_hash, ChainReport, HashChainAuthority};
pub use ingest::{EventReceipt, NewEvent};
pub use ledger::{ClockStatusChange, EvidenceLedger, LedgerBackends};
pub use store::{AlertStore, EvidenceStore, InMemoryStore, StoreError};
pub use sweep::SweepReport;
pub use tsa::{LocalTimestampAuthority, TimestampAuthority};
pub use types::*;
