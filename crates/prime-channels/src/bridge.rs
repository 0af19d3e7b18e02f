//! Protocol client backed by an external WhatsApp bridge process.
//!
//! One bridge process per session, spoken to over newline-delimited JSON on
//! stdin/stdout. A reader task routes responses to their waiting requests and
//! forwards `connection.update` / `creds.update` lines to the session.

mod protocol;

use async_trait::async_trait;
use prime_core::config::BridgeConfig;
use prime_core::error::PrimeError;
use prime_core::traits::{ClientEvent, ClientEvents, ClientFactory, ClientOptions, ProtocolClient};
use protocol::{encode_request, pairing_code_from_result, parse_line, Inbound};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long `end()` waits for the bridge to exit after the kill.
const EXIT_WAIT_SECS: u64 = 5;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// A protocol client living in a bridge child process.
pub struct BridgeClient {
    label: String,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<BufWriter<ChildStdin>>>,
    pending: Pending,
    next_id: AtomicU64,
    /// Stdout reader and stderr logger.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    request_timeout: Duration,
    ended: AtomicBool,
}

impl BridgeClient {
    /// Spawn a bridge, start its reader, and send `init` with the client options.
    pub async fn spawn(
        config: &BridgeConfig,
        options: ClientOptions,
    ) -> Result<(Arc<Self>, ClientEvents), PrimeError> {
        let label = options
            .workspace
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bridge".to_string());

        debug!(
            "bridge: spawning for {label}: {} {}",
            config.command,
            config.args.join(" ")
        );

        let mut child = tokio::process::Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PrimeError::Channel(format!("failed to spawn '{}': {e}", config.command)))?;

        let stdin = BufWriter::new(
            child
                .stdin
                .take()
                .ok_or_else(|| PrimeError::Channel(format!("no stdin for bridge {label}")))?,
        );
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PrimeError::Channel(format!("no stdout for bridge {label}")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PrimeError::Channel(format!("no stderr for bridge {label}")))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(
            stdout,
            pending.clone(),
            events_tx,
            label.clone(),
        ));
        let stderr_logger = tokio::spawn({
            let label = label.clone();
            async move {
                log_stderr(stderr, &label).await;
            }
        });

        let client = Arc::new(Self {
            label,
            child: tokio::sync::Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(vec![reader, stderr_logger]),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            ended: AtomicBool::new(false),
        });

        let params = serde_json::to_value(&options)?;
        if let Err(e) = client.request("init", Some(params)).await {
            client.end().await;
            return Err(e);
        }
        debug!("bridge: {} initialized", client.label);

        Ok((client, events_rx))
    }

    /// Send a request and wait for its response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, PrimeError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(PrimeError::Channel(format!(
                "bridge {} already ended",
                self.label
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        let line = encode_request(id, method, params)?;
        if let Err(e) = self.write_line(&line).await {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(PrimeError::Channel(format!("{method}: {message}"))),
            Ok(Err(_)) => Err(PrimeError::Channel(format!(
                "bridge {} exited during {method}",
                self.label
            ))),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(PrimeError::Channel(format!(
                    "bridge {} timed out on {method} (>{}s)",
                    self.label,
                    self.request_timeout.as_secs()
                )))
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), PrimeError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| PrimeError::Channel(format!("bridge {} stdin closed", self.label)))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PrimeError> {
        let params = serde_json::json!({ "phoneNumber": phone_number });
        let result = self.request("requestPairingCode", Some(params)).await?;
        pairing_code_from_result(&result)
            .ok_or_else(|| PrimeError::Channel("bridge returned no pairing code".to_string()))
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<(), PrimeError> {
        let params = serde_json::json!({ "jid": jid, "content": { "text": text } });
        self.request("sendMessage", Some(params)).await?;
        Ok(())
    }

    async fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        // Best effort: let the bridge log out of its socket cleanly.
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(line) = encode_request(id, "end", None) {
            let _ = self.write_line(&line).await;
        }
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(Duration::from_secs(EXIT_WAIT_SECS)) => {
                    warn!("bridge: {} did not exit after kill", self.label);
                }
            }
        }

        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in tasks {
            handle.abort();
        }

        fail_pending(&self.pending, "bridge ended");
        debug!("bridge: {} ended", self.label);
    }
}

/// Builds one [`BridgeClient`] per session from the `[bridge]` config.
pub struct BridgeClientFactory {
    config: BridgeConfig,
}

impl BridgeClientFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for BridgeClientFactory {
    async fn create(
        &self,
        options: ClientOptions,
    ) -> Result<(Arc<dyn ProtocolClient>, ClientEvents), PrimeError> {
        let (client, events) = BridgeClient::spawn(&self.config, options).await?;
        let client: Arc<dyn ProtocolClient> = client;
        Ok((client, events))
    }
}

/// Forward the bridge's stderr to the debug log, line by line, until it
/// closes. Returns how many lines were logged.
async fn log_stderr<R: AsyncRead + Unpin>(stderr: R, label: &str) -> usize {
    let mut lines = BufReader::new(stderr).lines();
    let mut count = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!("bridge: {label} stderr: {line}");
                    count += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("bridge: {label} stderr unreadable: {e}");
                break;
            }
        }
    }
    count
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, String>>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fail_pending(pending: &Pending, reason: &str) {
    for (_, tx) in lock_pending(pending).drain() {
        let _ = tx.send(Err(reason.to_string()));
    }
}

/// Deliver one decoded line to its waiter or to the session's event channel.
fn route(
    inbound: Inbound,
    pending: &Pending,
    events: &mpsc::UnboundedSender<ClientEvent>,
    label: &str,
) {
    match inbound {
        Inbound::Response { id, result } => match lock_pending(pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("bridge: {label} response for unknown request {id}"),
        },
        Inbound::Event(event) => {
            if events.send(event).is_err() {
                debug!("bridge: {label} event dropped, session detached");
            }
        }
        Inbound::Ignored(line) if !line.is_empty() => {
            debug!("bridge: {label} ignored line: {line}");
        }
        Inbound::Ignored(_) => {}
    }
}

async fn read_loop(
    stdout: ChildStdout,
    pending: Pending,
    events: mpsc::UnboundedSender<ClientEvent>,
    label: String,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route(parse_line(&line), &pending, &events, &label),
            Ok(None) => {
                debug!("bridge: {label} stdout closed");
                break;
            }
            Err(e) => {
                warn!("bridge: {label} read failed: {e}");
                break;
            }
        }
    }
    fail_pending(&pending, "bridge exited");
}
