//! Gateway — owns every pairing session and drives each one from phone number
//! to delivered session id.
//!
//! Includes: session registry, per-session driver tasks, the janitor, the
//! HTTP/WebSocket front end, and graceful shutdown.

mod export;
mod janitor;
mod lifecycle;
pub mod session;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use janitor::SweepReport;
pub use session::{
    CancelReason, EventSink, OwnerClaim, SessionEvent, SessionState, SessionSummary,
};

use crate::api;
use chrono::Utc;
use prime_core::config::{Config, ServerConfig};
use prime_core::error::{PairingError, PrimeError};
use prime_core::pairing::{mask_phone, new_session_key, validate_phone};
use prime_core::traits::{ClientFactory, ClientOptions, DisconnectReason, PasteService};
use prime_memory::AuditLogger;
use serde::Serialize;
use session::{PairingSession, Registration, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use workspace::{CredentialStore, Workspace};

/// How long shutdown waits for driver tasks to finish their cleanup.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolved runtime settings, derived once from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub sessions_root: PathBuf,
    pub product_tag: String,
    pub browser: [String; 3],
    pub version: Option<[u32; 3]>,
    pub code_request_delay: Duration,
    pub export_delay: Duration,
    pub completion_grace: Duration,
    pub code_timeout: Duration,
    /// Close reasons that end a session without an error event.
    pub expected_close: Vec<DisconnectReason>,
    pub paste_title: String,
    pub janitor_interval: Duration,
    pub max_age: Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, PrimeError> {
        let pairing = &config.pairing;
        Ok(Self {
            sessions_root: pairing.sessions_root(),
            product_tag: pairing.product_tag.clone(),
            browser: pairing.browser.clone(),
            version: pairing.version_triple(),
            code_request_delay: pairing.code_request_delay(),
            export_delay: pairing.export_delay(),
            completion_grace: pairing.completion_grace(),
            code_timeout: pairing.code_timeout(),
            expected_close: pairing.expected_close()?,
            paste_title: config.paste_title(),
            janitor_interval: config.janitor.interval(),
            max_age: config.janitor.max_age(),
        })
    }
}

/// Returned by [`Gateway::start_pairing`] once the code is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStarted {
    pub session_id: String,
    /// `None` when the workspace already held registered credentials.
    pub pairing_code: Option<String>,
}

/// The pairing gateway. Cheap to clone; every clone shares the same sessions.
#[derive(Clone)]
pub struct Gateway {
    factory: Arc<dyn ClientFactory>,
    paste: Arc<dyn PasteService>,
    audit: Option<AuditLogger>,
    settings: Arc<Settings>,
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    /// Create a new gateway.
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        paste: Arc<dyn PasteService>,
        audit: Option<AuditLogger>,
        settings: Settings,
    ) -> Self {
        Self {
            factory,
            paste,
            audit,
            settings: Arc::new(settings),
            registry: Arc::new(SessionRegistry::default()),
        }
    }

    /// Number of tracked sessions.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Start a pairing session for `phone_number`.
    ///
    /// Progress goes to `sink`; the call itself resolves as soon as the
    /// pairing code is issued (or the session fails first). Setup and the
    /// session itself run in their own task, so dropping this future never
    /// strands a half-built workspace. A session started under a stale
    /// `owner` claim is released before it registers.
    pub async fn start_pairing(
        &self,
        phone_number: &str,
        sink: EventSink,
        owner: Option<OwnerClaim>,
    ) -> Result<PairingStarted, PairingError> {
        let phone = match validate_phone(phone_number) {
            Ok(p) => p.to_string(),
            Err(e) => {
                sink.error(&e.to_string());
                return Err(e);
            }
        };

        let created_at = Utc::now();
        let id = loop {
            let id = new_session_key(created_at);
            if !self.registry.contains(&id) {
                break id;
            }
        };

        sink.status("initializing");

        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(self.clone().launch(
            id.clone(),
            phone,
            created_at,
            owner,
            sink,
            started_tx,
        ));

        match tokio::time::timeout(self.settings.code_timeout, started_rx).await {
            Ok(Ok(Ok(pairing_code))) => Ok(PairingStarted {
                session_id: id,
                pairing_code,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(PairingError::Cancelled),
            Err(_) => {
                warn!("session {id}: no pairing code within {:?}", self.settings.code_timeout);
                // Not registered yet: `launch` sees the closed receiver instead.
                if let Some(session) = self.registry.get(&id) {
                    self.force_release(&session, CancelReason::TimedOut).await;
                }
                Err(PairingError::TimedOut)
            }
        }
    }

    /// Build the workspace and client, register the session, and hand it to
    /// its driver.
    async fn launch(
        self,
        id: String,
        phone: String,
        created_at: chrono::DateTime<Utc>,
        owner: Option<OwnerClaim>,
        sink: EventSink,
        started: oneshot::Sender<lifecycle::StartResult>,
    ) {
        let reject = |err: PairingError, started: oneshot::Sender<lifecycle::StartResult>| {
            warn!("session {id}: {err}");
            sink.error(&err.to_string());
            let _ = started.send(Err(err));
        };

        let workspace = match Workspace::create(&self.settings.sessions_root, &id).await {
            Ok(ws) => ws,
            Err(e) => return reject(e, started),
        };

        let restored = CredentialStore::load(workspace.path()).await;
        let mut options =
            ClientOptions::new(workspace.path().to_path_buf(), self.settings.browser.clone());
        options.credentials = restored.credentials().cloned();
        options.version = self.settings.version;

        let (client, events) = match self.factory.create(options).await {
            Ok(pair) => pair,
            Err(e) => {
                workspace.remove().await;
                let err = PairingError::Connection(format!("client failed to start: {e}"));
                return reject(err, started);
            }
        };

        // The client may have restored credentials into the workspace on start.
        let store = CredentialStore::load(workspace.path()).await;

        let session = Arc::new(PairingSession::new(
            id.clone(),
            phone,
            created_at,
            owner,
            workspace,
            client,
        ));
        match self.registry.insert(session.clone()) {
            Registration::Added => {}
            Registration::IdTaken => {
                session.release().await;
                let err = PairingError::Workspace(format!("session id {id} already in use"));
                return reject(err, started);
            }
            Registration::Superseded | Registration::Closed => {
                debug!("session {id}: dropped before it started");
                session.release().await;
                let _ = started.send(Err(PairingError::Cancelled));
                return;
            }
        }

        info!(
            "session {id}: started for {}",
            mask_phone(&session.phone_number)
        );

        // The caller may have gone away while we were setting up.
        if sink.is_detached() || started.is_closed() {
            session.cancel(CancelReason::Disconnected);
        }

        let handle = tokio::spawn(lifecycle::drive(
            self.clone(),
            session.clone(),
            store,
            events,
            sink,
            started,
        ));
        session.set_driver(handle);
    }

    /// Public status of a session id: `waiting`, `paired`, or `not_found`.
    pub fn session_status(&self, session_id: &str) -> &'static str {
        self.registry
            .get(session_id)
            .map(|s| s.state().public_status())
            .unwrap_or("not_found")
    }

    /// Admin view of every tracked session, oldest first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let now = Utc::now();
        let mut sessions = self.registry.snapshot();
        sessions.sort_by_key(|s| s.created_at);
        sessions.iter().map(|s| s.summary(now)).collect()
    }

    /// Cancel a session and release it right away. Idempotent.
    pub(crate) async fn force_release(&self, session: &Arc<PairingSession>, reason: CancelReason) {
        session.cancel(reason);
        session.release().await;
        self.registry.remove(session);
    }

    /// Give `owner` a fresh claim on its single session slot, releasing the
    /// session it held before. Starts still in flight under an older claim
    /// will not register.
    pub async fn claim_owner(&self, owner: &str, reason: CancelReason) -> OwnerClaim {
        let (claim, previous) = self.registry.claim(owner);
        self.release_all(&previous, reason).await;
        claim
    }

    /// Release every session started by `owner` and forget its claim.
    /// Returns how many were released.
    pub async fn cancel_owned_by(&self, owner: &str, reason: CancelReason) -> usize {
        let sessions = self.registry.retire(owner);
        self.release_all(&sessions, reason).await;
        sessions.len()
    }

    async fn release_all(&self, sessions: &[Arc<PairingSession>], reason: CancelReason) {
        for session in sessions {
            info!("session {}: cancelled ({})", session.id, reason.as_str());
            self.force_release(session, reason).await;
        }
    }

    /// One janitor pass at `now`.
    pub async fn sweep(&self, now: chrono::DateTime<Utc>) -> SweepReport {
        janitor::sweep(self, now).await
    }

    /// Release every session and wait briefly for their drivers to finish.
    pub async fn shutdown(&self) {
        self.registry.close();
        if self.registry.is_empty() {
            return;
        }
        let sessions = self.registry.snapshot();
        info!("Shutting down {} active session(s)...", sessions.len());

        let mut handles = Vec::new();
        for session in &sessions {
            self.force_release(session, CancelReason::Shutdown).await;
            if let Some(handle) = session.take_driver() {
                handles.push(handle);
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown: session drivers did not finish within {SHUTDOWN_GRACE:?}");
        }
    }

    /// Serve HTTP and WebSocket until a shutdown signal, then release everything.
    pub async fn run(&self, server: ServerConfig) -> anyhow::Result<()> {
        info!(
            "prime-pair gateway running | product: {} | sessions: {} | auth: {}",
            self.settings.product_tag,
            self.settings.sessions_root.display(),
            if server.api_key.is_empty() {
                "disabled"
            } else {
                "enforced"
            }
        );

        let janitor = tokio::spawn(janitor::run(self.clone()));
        let result = api::serve(server, self.clone(), shutdown_signal()).await;

        janitor.abort();
        self.shutdown().await;
        info!("Shutdown complete.");
        result
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal");
}
