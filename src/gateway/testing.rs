//! In-process fakes for the protocol client and paste service.

use super::{Gateway, SessionEvent, Settings};
use async_trait::async_trait;
use prime_core::error::PrimeError;
use prime_core::traits::{
    ClientEvent, ClientEvents, ClientFactory, ClientOptions, ConnectionState, ConnectionUpdate,
    Disconnect, DisconnectReason, Paste, PasteService, ProtocolClient,
};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Scripted protocol client.
pub struct FakeClient {
    pub code: Mutex<Result<String, String>>,
    pub code_delay: Mutex<Duration>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail_send: AtomicBool,
    pub ended: AtomicUsize,
    pub code_requests: AtomicUsize,
}

impl FakeClient {
    fn new() -> Self {
        Self {
            code: Mutex::new(Ok("ABCD1234EFGH".to_string())),
            code_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            ended: AtomicUsize::new(0),
            code_requests: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn end_count(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn request_pairing_code(&self, _phone_number: &str) -> Result<String, PrimeError> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.code_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.code
            .lock()
            .unwrap()
            .clone()
            .map_err(PrimeError::Channel)
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<(), PrimeError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(PrimeError::Channel("not connected".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }

    async fn end(&self) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one [`FakeClient`] and keeps the event sender so tests can
/// play the network side.
pub struct FakeFactory {
    pub client: Arc<FakeClient>,
    pub fail: AtomicBool,
    /// How long `create` takes.
    pub create_delay: Mutex<Duration>,
    /// Credentials the client writes into its workspace on start, as a
    /// client restoring an already linked device would.
    pub restored: Mutex<Option<Value>>,
    pub events: Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>,
    pub last_options: Mutex<Option<ClientOptions>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            client: Arc::new(FakeClient::new()),
            fail: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            restored: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
        }
    }

    fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.events
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no client created yet")
    }

    /// Emit an event from the most recently created client.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.sender().send(event);
    }

    pub fn open(&self) {
        self.emit(ClientEvent::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionState::Open),
            last_disconnect: None,
        }));
    }

    /// Close with a protocol status code, e.g. 401 for logged out.
    pub fn close(&self, code: u16) {
        self.emit(ClientEvent::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(Disconnect {
                status_code: Some(code),
                message: None,
            }),
        }));
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(
        &self,
        options: ClientOptions,
    ) -> Result<(Arc<dyn ProtocolClient>, ClientEvents), PrimeError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PrimeError::Channel("bridge not found".to_string()));
        }
        if let Some(creds) = self.restored.lock().unwrap().clone() {
            std::fs::write(
                options.workspace.join(super::workspace::CREDS_FILE),
                creds.to_string(),
            )
            .unwrap();
        }
        *self.last_options.lock().unwrap() = Some(options);
        let (tx, rx) = mpsc::unbounded_channel();
        self.events.lock().unwrap().push(tx);
        let client: Arc<dyn ProtocolClient> = self.client.clone();
        Ok((client, rx))
    }
}

/// Paste service that records what it was asked to store.
pub struct FakePaste {
    pub result: Mutex<Result<String, String>>,
    pub pastes: Mutex<Vec<Paste>>,
}

impl FakePaste {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(Ok("https://paste.example/abcd123".to_string())),
            pastes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PasteService for FakePaste {
    async fn create_paste(&self, paste: &Paste) -> Result<String, PrimeError> {
        self.pastes.lock().unwrap().push(paste.clone());
        self.result.lock().unwrap().clone().map_err(PrimeError::Paste)
    }
}

/// Zero delays, a short code timeout, and a ten-minute age limit.
pub fn settings(root: &Path) -> Settings {
    Settings {
        sessions_root: root.to_path_buf(),
        product_tag: "EF-PRIME-MD".to_string(),
        browser: [
            "EF-PRIME-MD".to_string(),
            "Chrome".to_string(),
            "1.0.0".to_string(),
        ],
        version: None,
        code_request_delay: Duration::ZERO,
        export_delay: Duration::ZERO,
        completion_grace: Duration::ZERO,
        code_timeout: WAIT,
        expected_close: vec![DisconnectReason::LoggedOut, DisconnectReason::Replaced],
        paste_title: "EF-PRIME-MD Session Credentials".to_string(),
        janitor_interval: Duration::from_secs(60),
        max_age: Duration::from_secs(600),
    }
}

/// A gateway wired to fresh fakes.
pub struct Harness {
    pub gateway: Gateway,
    pub factory: Arc<FakeFactory>,
    pub paste: Arc<FakePaste>,
    pub root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    /// Build with adjusted settings.
    pub fn with(adjust: impl FnOnce(&mut Settings)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut settings = settings(root.path());
        adjust(&mut settings);
        let factory = Arc::new(FakeFactory::new());
        let paste = Arc::new(FakePaste::new());
        let gateway = Gateway::new(factory.clone(), paste.clone(), None, settings);
        Self {
            gateway,
            factory,
            paste,
            root,
        }
    }
}

/// Poll `check` until it holds or [`WAIT`] runs out.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Next caller event, failing the test after [`WAIT`].
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Drain events until `pred` matches, returning everything seen.
pub async fn events_until(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let ev = next_event(rx).await;
        let done = pred(&ev);
        seen.push(ev);
        if done {
            return seen;
        }
    }
}
