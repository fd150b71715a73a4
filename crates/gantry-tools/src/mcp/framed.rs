//! Newline-delimited JSON-RPC over a child process's stdin/stdout.
//!
//! Shared by the stdio and container transports. One long-lived child per
//! backend; concurrent requests are multiplexed over its single pipe pair
//! and correlated by id:
//!
//! - a writer task owns stdin and writes whole frames, so a cancelled request
//!   can never leave half a frame on the pipe
//! - a reader task owns stdout and hands each response to the waiter
//!   registered under its id in the [`PendingTable`]
//! - a timed-out request removes only its own entry; its late response finds
//!   no waiter and is dropped
//! - stdout EOF closes the table, failing every waiter (current and future)
//!   with `BackendCrashed`, and runs the [`ExitHook`] unless the gateway
//!   itself was stopping the process

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use gantry_types::errors::{GatewayError, TransportFailure};
use gantry_types::model::JsonRpcMessage;

use super::transport::StopOutcome;

/// Frames queued for the writer task before senders wait.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Called when a backend process's output closes without the gateway asking.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

// ============================================================
// Pending table
// ============================================================

#[derive(Default)]
struct PendingState {
    waiters: HashMap<String, oneshot::Sender<JsonRpcMessage>>,
    closed: bool,
}

/// In-flight requests keyed by JSON-RPC id.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: StdMutex<PendingState>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `key`.
    ///
    /// Fails with `BackendCrashed` once the output stream has closed.
    pub(crate) fn register(
        &self,
        key: &str,
    ) -> Result<oneshot::Receiver<JsonRpcMessage>, TransportFailure> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportFailure::BackendCrashed);
        }
        if state.waiters.contains_key(key) {
            return Err(TransportFailure::Protocol(format!(
                "request id {key} is already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(key.to_string(), tx);
        Ok(rx)
    }

    /// Deliver a response. Returns false when nobody is waiting for it.
    pub(crate) fn complete(&self, key: &str, message: JsonRpcMessage) -> bool {
        let waiter = self.lock().waiters.remove(key);
        match waiter {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Forget a waiter whose request was cancelled.
    pub(crate) fn cancel(&self, key: &str) {
        self.lock().waiters.remove(key);
    }

    /// Close the table, dropping every waiter. Returns how many were failed.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let failed = state.waiters.len();
        state.waiters.clear();
        failed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

// ============================================================
// FramedProcess
// ============================================================

/// A spawned backend process speaking newline-delimited JSON-RPC.
pub(crate) struct FramedProcess {
    backend: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    writer: StdMutex<Option<mpsc::Sender<String>>>,
    writer_task: JoinHandle<()>,
    pending: Arc<PendingTable>,
    /// Set once the gateway starts closing the process.
    closing: Arc<AtomicBool>,
}

impl FramedProcess {
    /// Spawn `command` with piped stdio and start the reader, writer and
    /// stderr forwarding tasks.
    ///
    /// Returns as soon as the process exists; the tool server inside may
    /// still be initializing. `on_exit` runs if the process goes away on its own.
    pub(crate) fn spawn(
        backend: &str,
        mut command: Command,
        on_exit: Option<ExitHook>,
    ) -> Result<Self, GatewayError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| GatewayError::Startup {
            backend: backend.to_string(),
            reason: format!("failed to spawn process: {e}"),
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(GatewayError::Startup {
                    backend: backend.to_string(),
                    reason: "child process has no piped stdio".to_string(),
                })
            }
        };

        let pid = child.id();
        let pending = Arc::new(PendingTable::default());
        let closing = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let writer_task = tokio::spawn(write_frames(backend.to_string(), stdin, rx));
        tokio::spawn(read_frames(
            backend.to_string(),
            stdout,
            pending.clone(),
            closing.clone(),
            on_exit,
        ));
        tokio::spawn(forward_stderr(backend.to_string(), stderr));

        tracing::info!(backend, pid, "backend process spawned");

        Ok(Self {
            backend: backend.to_string(),
            pid,
            child: Mutex::new(Some(child)),
            writer: StdMutex::new(Some(tx)),
            writer_task,
            pending,
            closing,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the process's output stream has closed.
    pub(crate) fn has_exited(&self) -> bool {
        self.pending.is_closed()
    }

    /// Send one request and wait at most `timeout` for the response with the same id.
    pub(crate) async fn send(
        &self,
        request: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<JsonRpcMessage, GatewayError> {
        let key = request.id_key().ok_or_else(|| {
            GatewayError::Internal("framed transports only carry requests with an id".to_string())
        })?;
        let frame = serde_json::to_string(&request)?;
        let writer = self.writer()?;

        let rx = self.pending.register(&key).map_err(|f| self.failure(f))?;

        let exchange = async move {
            writer
                .send(frame)
                .await
                .map_err(|_| TransportFailure::BackendCrashed)?;
            rx.await.map_err(|_| TransportFailure::BackendCrashed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(failure)) => {
                self.pending.cancel(&key);
                Err(self.failure(failure))
            }
            Err(_) => {
                self.pending.cancel(&key);
                tracing::debug!(
                    backend = %self.backend,
                    id = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out; a late response will be dropped"
                );
                Err(self.failure(TransportFailure::Timeout))
            }
        }
    }

    /// Write a notification frame. Nothing is waited for beyond the write queue.
    pub(crate) async fn notify(
        &self,
        message: JsonRpcMessage,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let frame = serde_json::to_string(&message)?;
        let writer = self.writer()?;
        match tokio::time::timeout(timeout, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.failure(TransportFailure::BackendCrashed)),
            Err(_) => Err(self.failure(TransportFailure::Timeout)),
        }
    }

    fn writer(&self) -> Result<mpsc::Sender<String>, GatewayError> {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| self.failure(TransportFailure::Closed))
    }

    /// Close stdin, wait up to `grace` for the process to exit, then kill it.
    pub(crate) async fn shutdown(&self, grace: Duration) -> Result<StopOutcome, GatewayError> {
        tracing::debug!(
            backend = %self.backend,
            in_flight = self.pending.len(),
            "stopping backend process"
        );
        self.close_input();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(StopOutcome::Graceful);
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                log_exit(&self.backend, status);
                Ok(StopOutcome::Graceful)
            }
            Ok(Err(e)) => Err(GatewayError::Io(format!(
                "failed to wait for backend '{}': {e}",
                self.backend
            ))),
            Err(_) => {
                tracing::warn!(
                    backend = %self.backend,
                    grace_ms = grace.as_millis() as u64,
                    "backend did not exit within grace period; killing"
                );
                child.kill().await.map_err(|e| {
                    GatewayError::Io(format!("failed to kill backend '{}': {e}", self.backend))
                })?;
                Ok(StopOutcome::Killed)
            }
        }
    }

    /// Kill the process immediately.
    pub(crate) async fn kill(&self) -> Result<(), GatewayError> {
        self.close_input();
        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await.map_err(|e| {
                GatewayError::Io(format!("failed to kill backend '{}': {e}", self.backend))
            })?;
        }
        Ok(())
    }

    /// Stop accepting frames and close the child's stdin.
    fn close_input(&self) {
        self.closing.store(true, Ordering::Release);
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.writer_task.abort();
    }

    fn failure(&self, failure: TransportFailure) -> GatewayError {
        GatewayError::transport(&self.backend, failure)
    }
}

fn log_exit(backend: &str, status: ExitStatus) {
    if status.success() {
        tracing::info!(backend, "backend process exited");
    } else {
        tracing::warn!(backend, %status, "backend process exited with failure");
    }
}

// ============================================================
// Pipe tasks
// ============================================================

async fn write_frames(backend: String, mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(frame) = rx.recv().await {
        let written = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(backend = %backend, error = %e, "failed to write to backend stdin");
            break;
        }
    }
}

async fn read_frames(
    backend: String,
    stdout: ChildStdout,
    pending: Arc<PendingTable>,
    closing: Arc<AtomicBool>,
    on_exit: Option<ExitHook>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_frame(&backend, &pending, &line),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "failed to read backend stdout");
                break;
            }
        }
    }

    let failed = pending.close();
    if closing.load(Ordering::Acquire) {
        tracing::info!(backend = %backend, failed_requests = failed, "backend output stream closed");
        return;
    }
    tracing::error!(backend = %backend, failed_requests = failed, "backend process exited unexpectedly");
    if let Some(on_exit) = on_exit {
        on_exit();
    }
}

fn dispatch_frame(backend: &str, pending: &PendingTable, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let message = match serde_json::from_str::<JsonRpcMessage>(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(backend, error = %e, "ignoring non-JSON-RPC line on backend stdout");
            return;
        }
    };

    if !message.is_response() {
        tracing::debug!(backend, method = ?message.method, "ignoring backend-initiated message");
        return;
    }

    if let Some(key) = message.id_key() {
        if !pending.complete(&key, message) {
            tracing::debug!(backend, id = %key, "dropping response with no waiting request");
        }
    }
}

async fn forward_stderr(backend: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(backend = %backend, line = %line, "backend stderr");
    }
}
