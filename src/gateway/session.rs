//! Pairing session state, caller-facing events, and the session registry.

use super::workspace::Workspace;
use chrono::{DateTime, Utc};
use prime_core::pairing::mask_phone;
use prime_core::traits::ProtocolClient;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Lifecycle state of one pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    CodeRequested,
    Connected,
    Completed,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Closed)
    }

    /// Public status string for `GET /session-status`.
    pub fn public_status(self) -> &'static str {
        match self {
            Self::Created | Self::CodeRequested => "waiting",
            Self::Connected | Self::Completed => "paired",
            Self::Failed | Self::Closed => "not_found",
        }
    }
}

/// Why a session was aborted from outside its own event flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The streaming connection that owns it went away.
    Disconnected,
    /// The owner started a newer session.
    Superseded,
    /// The janitor found it past the age limit.
    Evicted,
    /// The HTTP caller's wait for a pairing code ran out.
    TimedOut,
    Shutdown,
}

impl CancelReason {
    /// Whether the caller may still be listening and should hear about it.
    pub fn notifies_caller(self) -> bool {
        matches!(self, Self::Evicted | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Superseded => "superseded",
            Self::Evicted => "evicted",
            Self::TimedOut => "timed_out",
            Self::Shutdown => "shutdown",
        }
    }
}

/// An event delivered to the caller, serialized as `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SessionEvent {
    Status { message: String },
    PairingCode { code: String },
    Success { message: String },
    Error { message: String },
}

/// Where a session reports progress. Sends after the receiver is gone are dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink for callers that only use the returned result.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// True once a streaming caller has stopped listening.
    pub fn is_detached(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, message: &str) {
        self.emit(SessionEvent::Status {
            message: message.to_string(),
        });
    }

    pub fn pairing_code(&self, code: &str) {
        self.emit(SessionEvent::PairingCode {
            code: code.to_string(),
        });
    }

    pub fn success(&self, message: &str) {
        self.emit(SessionEvent::Success {
            message: message.to_string(),
        });
    }

    pub fn error(&self, message: &str) {
        self.emit(SessionEvent::Error {
            message: message.to_string(),
        });
    }
}

/// A caller's hold on its single live session slot. Claiming again for the
/// same caller makes every older claim stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerClaim {
    pub owner: String,
    generation: u64,
}

/// One pairing session: its workspace, its protocol client, and its state.
pub struct PairingSession {
    pub id: String,
    pub phone_number: String,
    pub created_at: DateTime<Utc>,
    /// Connection or request that started it, if any.
    pub owner: Option<OwnerClaim>,
    workspace: Workspace,
    client: tokio::sync::Mutex<Option<Arc<dyn ProtocolClient>>>,
    state: Mutex<SessionState>,
    pairing_code: OnceLock<String>,
    cancel: Notify,
    cancel_reason: OnceLock<CancelReason>,
    released: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PairingSession {
    pub fn new(
        id: String,
        phone_number: String,
        created_at: DateTime<Utc>,
        owner: Option<OwnerClaim>,
        workspace: Workspace,
        client: Arc<dyn ProtocolClient>,
    ) -> Self {
        Self {
            id,
            phone_number,
            created_at,
            owner,
            workspace,
            client: tokio::sync::Mutex::new(Some(client)),
            state: Mutex::new(SessionState::Created),
            pairing_code: OnceLock::new(),
            cancel: Notify::new(),
            cancel_reason: OnceLock::new(),
            released: AtomicBool::new(false),
            driver: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub(super) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.get().map(String::as_str)
    }

    /// Record the pairing code. Returns false if one was already set.
    pub(super) fn set_pairing_code(&self, code: String) -> bool {
        self.pairing_code.set(code).is_ok()
    }

    /// The live client, or `None` once released.
    pub(super) async fn client(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.client.lock().await.clone()
    }

    /// Ask the session's driver to stop. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.cancel_reason.set(reason);
        self.cancel.notify_one();
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason.get().copied()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub(super) async fn cancelled(&self) {
        if self.cancel_reason.get().is_some() {
            return;
        }
        self.cancel.notified().await;
    }

    pub(super) fn set_driver(&self, handle: JoinHandle<()>) {
        *self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub(super) fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// End the client and remove the workspace.
    ///
    /// Safe to call any number of times, from any exit path. A session that
    /// was not yet terminal is marked `Closed`.
    pub async fn release(&self) {
        let first = !self.released.swap(true, Ordering::SeqCst);

        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.end().await;
        }
        self.workspace.remove().await;

        {
            let mut state = self.lock_state();
            if !state.is_terminal() {
                *state = SessionState::Closed;
            }
        }

        if first {
            debug!("session {} released", self.id);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            phone: mask_phone(&self.phone_number),
            state: self.state(),
            age_secs: self.age(now).num_seconds().max(0),
            code_issued: self.pairing_code().is_some(),
        }
    }
}

/// Admin view of a tracked session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub phone: String,
    pub state: SessionState,
    pub age_secs: i64,
    pub code_issued: bool,
}

/// Result of [`SessionRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Another session already holds the id.
    IdTaken,
    /// The owner claimed a newer slot, or left, while this one was starting.
    Superseded,
    /// The gateway is shutting down.
    Closed,
}

#[derive(Default)]
struct Entries {
    sessions: HashMap<String, Arc<PairingSession>>,
    /// Current claim generation per owner.
    owners: HashMap<String, u64>,
    next_generation: u64,
    closed: bool,
}

impl Entries {
    fn owned_by(&self, owner: &str) -> Vec<Arc<PairingSession>> {
        self.sessions
            .values()
            .filter(|s| s.owner.as_ref().is_some_and(|c| c.owner == owner))
            .cloned()
            .collect()
    }
}

/// Every tracked session, keyed by id.
///
/// Owner claims live under the same lock as the sessions, so a claim and a
/// registration for the same owner are always ordered one way or the other.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<Entries>,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a session, unless its id is taken, its owner claim went stale,
    /// or the registry is closed.
    pub fn insert(&self, session: Arc<PairingSession>) -> Registration {
        let mut entries = self.lock();
        if entries.closed {
            return Registration::Closed;
        }
        if entries.sessions.contains_key(&session.id) {
            return Registration::IdTaken;
        }
        if let Some(claim) = &session.owner {
            if entries.owners.get(&claim.owner) != Some(&claim.generation) {
                return Registration::Superseded;
            }
        }
        entries.sessions.insert(session.id.clone(), session);
        Registration::Added
    }

    /// Stop tracking `session`, only if that exact session is the one registered.
    pub fn remove(&self, session: &Arc<PairingSession>) -> bool {
        let mut entries = self.lock();
        match entries.sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                entries.sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    /// Take a fresh claim for `owner`. Returns it with the sessions the owner
    /// held until now; starts holding an older claim will not register.
    pub fn claim(&self, owner: &str) -> (OwnerClaim, Vec<Arc<PairingSession>>) {
        let mut entries = self.lock();
        entries.next_generation += 1;
        let generation = entries.next_generation;
        entries.owners.insert(owner.to_string(), generation);
        let previous = entries.owned_by(owner);
        (
            OwnerClaim {
                owner: owner.to_string(),
                generation,
            },
            previous,
        )
    }

    /// Forget `owner` entirely, returning the sessions it still held.
    pub fn retire(&self, owner: &str) -> Vec<Arc<PairingSession>> {
        let mut entries = self.lock();
        entries.owners.remove(owner);
        entries.owned_by(owner)
    }

    /// Refuse every later registration.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn get(&self, id: &str) -> Option<Arc<PairingSession>> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().sessions.contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<Arc<PairingSession>> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}
