//! Evidence Ledger server — REST surface, config resolution, and offline
//! chain verification for exported events.

pub mod config;
pub mod export;
pub mod rest;

pub use rest::{router, start, ApiError};
