//! Error taxonomy for the evidence ledger.

use crate::store::StoreError;

/// Errors surfaced by ledger services.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    /// Sequence/hash allocation lost a race. Retry the whole call.
    #[error("Chain conflict on source '{source_system}': {detail}")]
    ChainConflict {
        source_system: String,
        detail: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A secondary step failed after the core record was persisted.
    #[error("Linkage failure for event {event_id}: {detail}")]
    Linkage { event_id: String, detail: String },

    #[error("Notification failure on {channel}: {detail}")]
    Notification { channel: String, detail: String },

    #[error("External timestamp failure: {0}")]
    ExternalTimestamp(#[from] TsaError),

    /// An optimistic-concurrency check rejected the update.
    #[error("Concurrency loss on {entity} {id}: expected {expected}, found {actual}")]
    ConcurrencyLoss {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::ChainConflict { .. } => "E_CHAIN_CONFLICT",
            LedgerError::Validation(_) => "E_VALIDATION",
            LedgerError::NotFound { .. } => "E_NOT_FOUND",
            LedgerError::Linkage { .. } => "E_LINKAGE",
            LedgerError::Notification { .. } => "E_NOTIFICATION",
            LedgerError::ExternalTimestamp(_) => "E_EXTERNAL_TIMESTAMP",
            LedgerError::ConcurrencyLoss { .. } => "E_CONCURRENCY_LOSS",
            LedgerError::Template(_) => "E_TEMPLATE",
            LedgerError::Store(StoreError::Unavailable(_)) => "E_STORE_UNAVAILABLE",
            LedgerError::Store(_) => "E_STORE",
            LedgerError::Io(_) => "E_IO",
            LedgerError::Json(_) => "E_JSON",
        }
    }

    /// Whether a caller may retry the same call against current state.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LedgerError::ChainConflict { .. } | LedgerError::ConcurrencyLoss { .. }
        )
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ChainHeadMoved {
                source_system,
                expected,
                found,
            } => LedgerError::ChainConflict {
                source_system,
                detail: format!("expected head {expected:?}, found {found:?}"),
            },
            StoreError::StatusMismatch {
                entity,
                id,
                expected,
                actual,
            } => LedgerError::ConcurrencyLoss {
                entity,
                id,
                expected,
                actual,
            },
            StoreError::Missing { entity, id } => LedgerError::NotFound { entity, id },
            other => LedgerError::Store(other),
        }
    }
}

/// Errors from an external timestamping authority.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TsaError {
    #[error("authority unreachable: {0}")]
    Unreachable(String),

    #[error("authority timed out after {0} ms")]
    Timeout(u64),

    #[error("malformed assertion: {0}")]
    Malformed(String),
}

/// Errors from a single notification channel.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("no sink configured for channel {0}")]
    NoSink(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Template parse and render errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated token starting at byte {0}")]
    Unterminated(usize),

    #[error("empty token at byte {0}")]
    EmptyToken(usize),

    #[error("missing required binding '{0}'")]
    MissingBinding(String),
}

/// Convenience result type.
pub type LedgerResult<T> = Result<T, LedgerError>;
