//! Seams to the external collaborators: the WhatsApp protocol client and the
//! paste service.

use crate::error::PrimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Options used to construct one protocol client for one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    /// Directory holding this session's credential store.
    pub workspace: PathBuf,
    /// Previously persisted `creds.json`, if any.
    pub credentials: Option<serde_json::Value>,
    /// Client identity: `[name, browser, version]`.
    pub browser: [String; 3],
    /// Pinned protocol version; `None` lets the client resolve the latest.
    pub version: Option<[u32; 3]>,
    /// Never render a QR code to a terminal.
    pub print_qr: bool,
    pub log_level: String,
}

impl ClientOptions {
    /// Silent, non-interactive options for a workspace.
    pub fn new(workspace: PathBuf, browser: [String; 3]) -> Self {
        Self {
            workspace,
            credentials: None,
            browser,
            version: None,
            print_qr: false,
            log_level: "silent".to_string(),
        }
    }
}

/// Connection phase reported by `connection.update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Why the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    Replaced,
    ConnectionClosed,
    TimedOut,
    MultideviceMismatch,
    BadSession,
    RestartRequired,
    Unavailable,
    Forbidden,
    Other(u16),
}

impl DisconnectReason {
    /// Map a protocol status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            440 => Self::Replaced,
            428 => Self::ConnectionClosed,
            408 => Self::TimedOut,
            411 => Self::MultideviceMismatch,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            503 => Self::Unavailable,
            403 => Self::Forbidden,
            other => Self::Other(other),
        }
    }

    /// Parse a config name such as `"logged_out"`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "logged_out" => Some(Self::LoggedOut),
            "replaced" => Some(Self::Replaced),
            "connection_closed" => Some(Self::ConnectionClosed),
            "timed_out" => Some(Self::TimedOut),
            "multidevice_mismatch" => Some(Self::MultideviceMismatch),
            "bad_session" => Some(Self::BadSession),
            "restart_required" => Some(Self::RestartRequired),
            "unavailable" => Some(Self::Unavailable),
            "forbidden" => Some(Self::Forbidden),
            _ => None,
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Self::LoggedOut => "logged_out".to_string(),
            Self::Replaced => "replaced".to_string(),
            Self::ConnectionClosed => "connection_closed".to_string(),
            Self::TimedOut => "timed_out".to_string(),
            Self::MultideviceMismatch => "multidevice_mismatch".to_string(),
            Self::BadSession => "bad_session".to_string(),
            Self::RestartRequired => "restart_required".to_string(),
            Self::Unavailable => "unavailable".to_string(),
            Self::Forbidden => "forbidden".to_string(),
            Self::Other(code) => format!("status {code}"),
        }
    }
}

/// Details of the last disconnect, as reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnect {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Disconnect {
    /// Typed reason; a close without a status code counts as `ConnectionClosed`.
    pub fn reason(&self) -> DisconnectReason {
        self.status_code
            .map(DisconnectReason::from_code)
            .unwrap_or(DisconnectReason::ConnectionClosed)
    }
}

/// Payload of a `connection.update` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionState>,
    #[serde(default)]
    pub last_disconnect: Option<Disconnect>,
}

/// Events a protocol client emits for its session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionUpdate(ConnectionUpdate),
    /// Full credential document to persist as `creds.json`.
    CredsUpdate(serde_json::Value),
}

/// Subscription to a client's events. Dropping it detaches every handler.
pub type ClientEvents = mpsc::UnboundedReceiver<ClientEvent>;

/// One live connection to the messaging network.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Ask the network for a pairing code for `phone_number` (digits only).
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PrimeError>;

    /// Send a plain-text message.
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), PrimeError>;

    /// Close the connection and stop emitting events. Never fails; repeat calls are no-ops.
    async fn end(&self);
}

/// Builds protocol clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        options: ClientOptions,
    ) -> Result<(Arc<dyn ProtocolClient>, ClientEvents), PrimeError>;
}

/// Paste visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

/// A paste to create.
#[derive(Debug, Clone)]
pub struct Paste {
    pub text: String,
    pub title: String,
    /// Syntax format, e.g. `"json"`.
    pub format: String,
    pub visibility: Visibility,
    /// `None` means the paste never expires.
    pub expiration: Option<String>,
}

/// Remote text storage.
#[async_trait]
pub trait PasteService: Send + Sync {
    /// Create a paste and return its URL.
    async fn create_paste(&self, paste: &Paste) -> Result<String, PrimeError>;
}
