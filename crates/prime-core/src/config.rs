//! TOML configuration for the pairing gateway.
//!
//! Every section and field has a default, so an empty or missing file is a
//! valid configuration. `PORT` and `PASTEBIN_API_KEY` override the file.

use crate::error::PrimeError;
use crate::shellexpand;
use crate::traits::DisconnectReason;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default product tag prefixed to every generated session id.
pub const DEFAULT_PRODUCT_TAG: &str = "EF-PRIME-MD";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub paste: PasteConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for the admin endpoints. Empty disables auth.
    #[serde(default)]
    pub api_key: String,
    /// Origins allowed to call the API from a browser. `"*"` allows any;
    /// empty sends no CORS headers.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Session lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Root under which one credential workspace per session is created.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
    #[serde(default = "default_product_tag")]
    pub product_tag: String,
    /// Client identity reported to the network: `[name, browser, version]`.
    #[serde(default = "default_browser")]
    pub browser: [String; 3],
    /// Protocol version triple. Empty lets the bridge resolve the latest.
    #[serde(default)]
    pub version: Vec<u32>,
    /// Delay between client creation and the pairing-code request.
    #[serde(default = "default_code_request_delay_ms")]
    pub code_request_delay_ms: u64,
    /// Delay between connection-open and reading the credentials for export.
    #[serde(default)]
    pub export_delay_ms: u64,
    /// How long a completed session stays tracked before release.
    #[serde(default = "default_completion_grace_ms")]
    pub completion_grace_ms: u64,
    /// Upper bound for the HTTP caller waiting on a pairing code.
    #[serde(default = "default_code_timeout_secs")]
    pub code_timeout_secs: u64,
    /// Close reasons treated as a silent, expected termination.
    #[serde(default = "default_expected_close_reasons")]
    pub expected_close_reasons: Vec<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            product_tag: default_product_tag(),
            browser: default_browser(),
            version: Vec::new(),
            code_request_delay_ms: default_code_request_delay_ms(),
            export_delay_ms: 0,
            completion_grace_ms: default_completion_grace_ms(),
            code_timeout_secs: default_code_timeout_secs(),
            expected_close_reasons: default_expected_close_reasons(),
        }
    }
}

impl PairingConfig {
    /// Sessions root with `~` expanded.
    pub fn sessions_root(&self) -> PathBuf {
        PathBuf::from(shellexpand(&self.sessions_dir))
    }

    pub fn code_request_delay(&self) -> Duration {
        Duration::from_millis(self.code_request_delay_ms)
    }

    pub fn export_delay(&self) -> Duration {
        Duration::from_millis(self.export_delay_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }

    /// The protocol version triple, if one is pinned.
    pub fn version_triple(&self) -> Option<[u32; 3]> {
        match self.version.as_slice() {
            [a, b, c] => Some([*a, *b, *c]),
            _ => None,
        }
    }

    /// Parse `expected_close_reasons` into typed reasons.
    pub fn expected_close(&self) -> Result<Vec<DisconnectReason>, PrimeError> {
        self.expected_close_reasons
            .iter()
            .map(|name| {
                DisconnectReason::from_name(name).ok_or_else(|| {
                    PrimeError::Config(format!("unknown close reason in expected_close_reasons: {name}"))
                })
            })
            .collect()
    }
}

/// Stale-session sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_janitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval_secs(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// External WhatsApp bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    #[serde(default = "default_bridge_args")]
    pub args: Vec<String>,
    #[serde(default = "default_bridge_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: default_bridge_args(),
            request_timeout_secs: default_bridge_timeout_secs(),
        }
    }
}

/// Paste service credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasteConfig {
    #[serde(default = "default_paste_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Paste title. Empty means `"<product_tag> Session Credentials"`.
    #[serde(default)]
    pub title: String,
}

impl Default for PasteConfig {
    fn default() -> Self {
        Self {
            api_url: default_paste_api_url(),
            api_key: String::new(),
            title: String::new(),
        }
    }
}

/// SQLite audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_db_path")]
    pub db_path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_audit_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_sessions_dir() -> String {
    "~/.prime/sessions".to_string()
}
fn default_product_tag() -> String {
    DEFAULT_PRODUCT_TAG.to_string()
}
fn default_browser() -> [String; 3] {
    [
        DEFAULT_PRODUCT_TAG.to_string(),
        "Chrome".to_string(),
        "1.0.0".to_string(),
    ]
}
fn default_code_request_delay_ms() -> u64 {
    3000
}
fn default_completion_grace_ms() -> u64 {
    5000
}
fn default_code_timeout_secs() -> u64 {
    60
}
fn default_expected_close_reasons() -> Vec<String> {
    vec!["logged_out".to_string(), "replaced".to_string()]
}
fn default_janitor_interval_secs() -> u64 {
    60
}
fn default_max_age_secs() -> u64 {
    600
}
fn default_bridge_command() -> String {
    "node".to_string()
}
fn default_bridge_args() -> Vec<String> {
    vec!["bridge/index.js".to_string()]
}
fn default_bridge_timeout_secs() -> u64 {
    60
}
fn default_paste_api_url() -> String {
    "https://pastebin.com/api/api_post.php".to_string()
}
fn default_true() -> bool {
    true
}
fn default_audit_db_path() -> String {
    "~/.prime/audit.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "~/.prime/logs".to_string()
}

impl Config {
    /// Load config from a TOML file, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, PrimeError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| PrimeError::Config(format!("failed to read {}: {e}", path.display())))?;
            Self::parse(&content)?
        } else {
            info!("config: {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse config from TOML text without touching the environment.
    pub fn parse(content: &str) -> Result<Self, PrimeError> {
        toml::from_str(content).map_err(|e| PrimeError::Config(format!("invalid config: {e}")))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(key) = lookup("PASTEBIN_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.paste.api_key = key.trim().to_string();
        }
    }

    /// Reject values that would leave the gateway unable to run.
    pub fn validate(&self) -> Result<(), PrimeError> {
        self.pairing.expected_close()?;
        if !self.pairing.version.is_empty() && self.pairing.version.len() != 3 {
            return Err(PrimeError::Config(
                "pairing.version must be empty or have exactly three parts".to_string(),
            ));
        }
        if self.pairing.product_tag.trim().is_empty() {
            return Err(PrimeError::Config(
                "pairing.product_tag must not be empty".to_string(),
            ));
        }
        if self.bridge.command.trim().is_empty() {
            return Err(PrimeError::Config("bridge.command must not be empty".to_string()));
        }
        Ok(())
    }

    /// Title used for credential pastes.
    pub fn paste_title(&self) -> String {
        if self.paste.title.trim().is_empty() {
            format!("{} Session Credentials", self.pairing.product_tag)
        } else {
            self.paste.title.clone()
        }
    }
}
