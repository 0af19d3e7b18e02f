//! Session lifecycle: the transition table and the per-session driver task.
//!
//! The driver owns the client's event subscription and feeds every event
//! through [`transition`]. Whatever ends the session (success, failure,
//! expected close, cancellation) funnels into one `finish` that releases
//! the session, deregisters it, and writes the audit row.

use super::export::{deliver_session_id, export_credentials};
use super::session::{CancelReason, EventSink, PairingSession, SessionState};
use super::workspace::CredentialStore;
use super::Gateway;
use prime_core::error::PairingError;
use prime_core::pairing::{format_pairing_code, mask_phone};
use prime_core::traits::{
    ClientEvent, ClientEvents, ConnectionState, ConnectionUpdate, DisconnectReason,
};
use prime_memory::{AuditEntry, AuditOutcome};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Result handed back to `start_pairing`: the formatted code, or `None` when
/// the device is already registered.
pub(super) type StartResult = Result<Option<String>, PairingError>;

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Workspace and client are ready.
    Ready { registered: bool },
    CodeIssued,
    CodeFailed(String),
    Open,
    Close {
        reason: DisconnectReason,
        expected: bool,
    },
    ExportDone,
    ExportFailed(String),
    Cancel,
}

/// What the driver does after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RequestCode,
    AwaitConnection,
    Continue,
    Export,
    Succeed,
    Fail(String),
    /// Terminal without a user-facing error.
    Silent,
    /// Not legal in this state; state unchanged.
    Ignore,
}

/// The transition table. Total: every (state, input) pair has an answer.
pub fn transition(state: SessionState, input: &Input) -> (SessionState, Action) {
    use SessionState::*;

    if state.is_terminal() {
        return (state, Action::Ignore);
    }

    match (state, input) {
        (_, Input::Cancel) => (Closed, Action::Silent),

        (Created, Input::Ready { registered: false }) => (CodeRequested, Action::RequestCode),
        (Created, Input::Ready { registered: true }) => (Created, Action::AwaitConnection),

        (CodeRequested, Input::CodeIssued) => (CodeRequested, Action::Continue),
        (CodeRequested, Input::CodeFailed(msg)) => (Failed, Action::Fail(msg.clone())),

        (Created | CodeRequested, Input::Open) => (Connected, Action::Export),
        (Created | CodeRequested, Input::Close { expected: true, .. }) => (Closed, Action::Silent),
        (Created | CodeRequested, Input::Close { reason, .. }) => (
            Failed,
            Action::Fail(format!("connection closed: {}", reason.as_str())),
        ),

        (Connected, Input::ExportDone) => (Completed, Action::Succeed),
        (Connected, Input::ExportFailed(msg)) => (Failed, Action::Fail(msg.clone())),

        (state, _) => (state, Action::Ignore),
    }
}

/// How a session ended.
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(PairingError),
    Closed(DisconnectReason),
    Cancelled(CancelReason),
}

struct Driver {
    gateway: Gateway,
    session: Arc<PairingSession>,
    store: CredentialStore,
    sink: EventSink,
    started: Option<oneshot::Sender<StartResult>>,
}

/// Run one session from client-ready to release.
pub(super) async fn drive(
    gateway: Gateway,
    session: Arc<PairingSession>,
    store: CredentialStore,
    mut events: ClientEvents,
    sink: EventSink,
    started: oneshot::Sender<StartResult>,
) {
    let mut driver = Driver {
        gateway,
        session: session.clone(),
        store,
        sink,
        started: Some(started),
    };

    let outcome = tokio::select! {
        _ = session.cancelled() => {
            Outcome::Cancelled(session.cancel_reason().unwrap_or(CancelReason::Shutdown))
        }
        outcome = driver.run(&mut events) => outcome,
    };
    if matches!(outcome, Outcome::Cancelled(_)) {
        driver.apply(Input::Cancel);
    }

    // Detach before teardown so no handler runs against a released session.
    drop(events);
    driver.finish(outcome).await;
}

impl Driver {
    /// Apply an input under the state lock.
    fn apply(&self, input: Input) -> Action {
        let mut state = self.session.lock_state();
        let (next, action) = transition(*state, &input);
        if action == Action::Ignore {
            debug!(
                "session {}: ignoring {input:?} in state {:?}",
                self.session.id, *state
            );
        } else if next != *state {
            debug!(
                "session {}: {:?} -> {next:?} on {input:?}",
                self.session.id, *state
            );
        }
        *state = next;
        action
    }

    fn resolve_start(&mut self, result: StartResult) {
        if let Some(tx) = self.started.take() {
            let _ = tx.send(result);
        }
    }

    async fn run(&mut self, events: &mut ClientEvents) -> Outcome {
        let registered = self.store.is_registered();
        match self.apply(Input::Ready { registered }) {
            Action::RequestCode => {
                if let Some(outcome) = self.request_code().await {
                    return outcome;
                }
            }
            Action::AwaitConnection => {
                self.sink
                    .status("already registered, waiting for connection");
                self.resolve_start(Ok(None));
            }
            _ => {}
        }

        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::CredsUpdate(creds) => self.persist_creds(creds).await,
                ClientEvent::ConnectionUpdate(update) => {
                    if let Some(outcome) = self.on_connection(update).await {
                        return outcome;
                    }
                }
            }
        }

        // The client stopped emitting without a close event.
        let reason = DisconnectReason::ConnectionClosed;
        match self.apply(Input::Close {
            reason,
            expected: false,
        }) {
            Action::Fail(msg) => self.fail(PairingError::Connection(msg)),
            _ => Outcome::Closed(reason),
        }
    }

    async fn request_code(&mut self) -> Option<Outcome> {
        self.sink.status("requesting pairing code");

        let delay = self.gateway.settings.code_request_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some(client) = self.session.client().await else {
            return Some(Outcome::Cancelled(
                self.session
                    .cancel_reason()
                    .unwrap_or(CancelReason::Shutdown),
            ));
        };

        match client.request_pairing_code(&self.session.phone_number).await {
            Ok(raw) => {
                let code = format_pairing_code(&raw);
                if !self.session.set_pairing_code(code.clone()) {
                    warn!("session {}: pairing code already set", self.session.id);
                }
                self.apply(Input::CodeIssued);
                info!(
                    "session {}: pairing code issued for {}",
                    self.session.id,
                    mask_phone(&self.session.phone_number)
                );
                self.sink.pairing_code(&code);
                self.resolve_start(Ok(Some(code)));
                None
            }
            Err(e) => {
                let message = e.to_string();
                match self.apply(Input::CodeFailed(message.clone())) {
                    Action::Fail(msg) => Some(self.fail(PairingError::PairingCode(msg))),
                    _ => Some(self.fail(PairingError::PairingCode(message))),
                }
            }
        }
    }

    /// `creds.update`: persist before the next event is handled.
    async fn persist_creds(&mut self, creds: serde_json::Value) {
        if let Err(e) = self.store.save(creds).await {
            warn!("session {}: failed to persist credentials: {e}", self.session.id);
        }
    }

    async fn on_connection(&mut self, update: ConnectionUpdate) -> Option<Outcome> {
        match update.connection {
            Some(ConnectionState::Open) => match self.apply(Input::Open) {
                Action::Export => Some(self.export().await),
                _ => None,
            },
            Some(ConnectionState::Close) => {
                let disconnect = update.last_disconnect.unwrap_or_default();
                let reason = disconnect.reason();
                let expected = self.gateway.settings.expected_close.contains(&reason);
                match self.apply(Input::Close { reason, expected }) {
                    Action::Silent => {
                        info!(
                            "session {}: connection closed ({}), ending quietly",
                            self.session.id,
                            reason.as_str()
                        );
                        self.resolve_start(Err(PairingError::Connection(format!(
                            "connection closed: {}",
                            reason.as_str()
                        ))));
                        Some(Outcome::Closed(reason))
                    }
                    Action::Fail(msg) => {
                        let msg = match disconnect.message {
                            Some(detail) if !detail.is_empty() => format!("{msg} ({detail})"),
                            _ => msg,
                        };
                        Some(self.fail(PairingError::Connection(msg)))
                    }
                    _ => None,
                }
            }
            Some(ConnectionState::Connecting) | None => None,
        }
    }

    /// Connected: upload credentials, send the id twice-over, report.
    async fn export(&mut self) -> Outcome {
        info!("session {}: connected", self.session.id);
        self.sink.status("connected, exporting session");

        let delay = self.gateway.settings.export_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.export_and_deliver().await {
            Ok(()) => {
                self.apply(Input::ExportDone);
                self.sink
                    .success("Session ID sent to your WhatsApp. Check your messages.");
                Outcome::Completed
            }
            Err(err) => {
                self.apply(Input::ExportFailed(err.to_string()));
                self.fail(err)
            }
        }
    }

    async fn export_and_deliver(&self) -> Result<(), PairingError> {
        let settings = &self.gateway.settings;
        let session_id = export_credentials(
            &*self.gateway.paste,
            &self.store,
            &settings.paste_title,
            &settings.product_tag,
        )
        .await?;

        let client = self
            .session
            .client()
            .await
            .ok_or_else(|| PairingError::Delivery("client already released".to_string()))?;

        deliver_session_id(
            &*client,
            &self.session.phone_number,
            &session_id,
            &settings.product_tag,
            chrono::Local::now(),
        )
        .await?;

        info!(
            "session {}: session id delivered to {}",
            self.session.id,
            mask_phone(&self.session.phone_number)
        );
        Ok(())
    }

    /// Report a failure to the caller once.
    fn fail(&mut self, err: PairingError) -> Outcome {
        warn!("session {}: {err}", self.session.id);
        self.sink.error(&err.to_string());
        self.resolve_start(Err(err.clone()));
        Outcome::Failed(err)
    }

    async fn finish(mut self, outcome: Outcome) {
        if let Outcome::Cancelled(reason) = &outcome {
            if reason.notifies_caller() {
                let message = match reason {
                    CancelReason::TimedOut => "timed out waiting for pairing code",
                    _ => "session expired, please start a new one",
                };
                self.sink.error(message);
            }
            let err = match reason {
                CancelReason::TimedOut => PairingError::TimedOut,
                _ => PairingError::Cancelled,
            };
            self.resolve_start(Err(err));
        }

        if matches!(outcome, Outcome::Completed) {
            let grace = self.gateway.settings.completion_grace;
            if !grace.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(grace) => {}
                    _ = self.session.cancelled() => {}
                }
            }
        }

        self.session.release().await;
        self.gateway.registry.remove(&self.session);

        let (audit_outcome, detail) = match &outcome {
            Outcome::Completed => (AuditOutcome::Completed, None),
            Outcome::Failed(err) => (AuditOutcome::Failed, Some(format!("{}: {err}", err.kind()))),
            Outcome::Closed(reason) => (AuditOutcome::Closed, Some(reason.as_str())),
            Outcome::Cancelled(CancelReason::Evicted) => {
                (AuditOutcome::Evicted, Some("evicted".to_string()))
            }
            Outcome::Cancelled(reason) => {
                (AuditOutcome::Cancelled, Some(reason.as_str().to_string()))
            }
        };

        let elapsed = self.session.age(chrono::Utc::now());
        info!(
            "session {} finished: {} after {}s",
            self.session.id,
            audit_outcome.as_str(),
            elapsed.num_seconds()
        );

        if let Some(audit) = &self.gateway.audit {
            let entry = AuditEntry {
                session_id: self.session.id.clone(),
                phone: mask_phone(&self.session.phone_number),
                outcome: audit_outcome,
                detail,
                duration_ms: elapsed.num_milliseconds(),
            };
            if let Err(e) = audit.log(&entry).await {
                warn!("session {}: audit write failed: {e}", self.session.id);
            }
        }
    }
}
