//! # prime-memory
//!
//! Persistent audit trail of pairing sessions (SQLite-backed).

pub mod audit;

pub use audit::{AuditEntry, AuditLogger, AuditOutcome};
