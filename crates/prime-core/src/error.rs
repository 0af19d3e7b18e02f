//! Error types shared across prime-pair crates.

use thiserror::Error;

/// Failures raised by collaborators: config, the protocol bridge, the paste service.
#[derive(Debug, Error)]
pub enum PrimeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("paste error: {0}")]
    Paste(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a pairing session failed.
///
/// Every variant is reported to the caller as one `error` event; none escape
/// the session that raised it.
#[derive(Debug, Clone, Error)]
pub enum PairingError {
    /// Phone number is not a digits-only string. No session exists.
    #[error("invalid phone number: {0}")]
    InvalidInput(String),

    /// The credential workspace could not be created or removed.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// The protocol client rejected or failed the pairing-code request.
    #[error("pairing code request failed: {0}")]
    PairingCode(String),

    /// The connection closed for an unexpected reason, or the client could not start.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Credential upload failed or returned no usable paste id.
    #[error("credential export failed: {0}")]
    Export(String),

    /// The session id could not be delivered to the user's own account.
    #[error("message delivery failed: {0}")]
    Delivery(String),

    /// No pairing code arrived within the caller's wait bound.
    #[error("timed out waiting for pairing code")]
    TimedOut,

    /// The session was released before it finished.
    #[error("session cancelled")]
    Cancelled,
}

impl PairingError {
    /// Short machine-friendly label, used in audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Workspace(_) => "workspace",
            Self::PairingCode(_) => "pairing_code",
            Self::Connection(_) => "connection",
            Self::Export(_) => "export",
            Self::Delivery(_) => "delivery",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}
