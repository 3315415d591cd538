//! Transport bridge: one network client bound to one agent process.
//!
//! The bridge is an explicit state machine:
//!
//! ```text
//! Idle ──attach──▶ Bound(client, process) ──(client closes | process exits | attach)──▶ Idle
//! ```
//!
//! There is no half-bound state: every transition happens under one lock,
//! and the torn-down binding is closed/killed after the lock is released.
//!
//! Each bound process is driven by three tasks:
//! - a stdout reader that relays framed lines to the client,
//! - a stdin writer fed by [`Bridge::forward`],
//! - a supervisor that owns the [`Child`] and either observes its exit or
//!   terminates it when the binding is torn down.
//!
//! Every relay is guarded by id: a line from process `p` reaches the client
//! only while `p` is still bound, and a client line reaches the process only
//! while the client's [`Attachment`] still matches the binding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::codec::Frame;
use crate::acp::reader::{run_reader, StreamEnd};
use crate::acp::spawner::{describe_exit, spawn_agent, terminate, AgentProcess, SpawnConfig};
use crate::acp::writer::run_writer;
use crate::Result;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Fatal bridge error: spawn failure, process exit, stream error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Bad or missing session token.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Capacity of the stdout frame channel between reader and relay.
const FRAME_CHANNEL_CAPACITY: usize = 64;

// ── Client side ──────────────────────────────────────────────────────────────

/// Something the bridge wants the network layer to do with its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Deliver one protocol line.
    Text(String),
    /// Close the connection.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// The bridge's reference to one network client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: u64,
    tx: mpsc::UnboundedSender<ClientFrame>,
}

impl ClientHandle {
    /// Connection id, unique per bridge.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: ClientFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    fn close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(client_id = self.id, code, reason = %reason, "bridge: closing client");
        let _ = self.send(ClientFrame::Close { code, reason });
    }
}

/// Proof of a successful [`Bridge::attach`]; required to forward lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Bound client.
    pub client_id: u64,
    /// Process bound to that client.
    pub process_id: u64,
}

/// Observable bridge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Nothing attached.
    Idle,
    /// One client bound to one process.
    Bound(Attachment),
}

// ── Internal state ───────────────────────────────────────────────────────────

struct ProcessHandle {
    id: u64,
    stdin_tx: mpsc::UnboundedSender<String>,
    kill: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

struct Binding {
    client: ClientHandle,
    process: ProcessHandle,
}

impl Binding {
    fn attachment(&self) -> Attachment {
        Attachment {
            client_id: self.client.id,
            process_id: self.process.id,
        }
    }
}

struct Inner {
    binding: Mutex<Option<Binding>>,
    next_client: AtomicU64,
    next_process: AtomicU64,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Binding>> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the binding if `pred` holds for it.
    fn take_if(&self, pred: impl FnOnce(&Binding) -> bool) -> Option<Binding> {
        let mut guard = self.lock();
        if guard.as_ref().is_some_and(pred) {
            guard.take()
        } else {
            None
        }
    }

    /// Relay one stdout line to the client bound to `process_id`.
    fn relay_to_client(&self, process_id: u64, line: String) {
        let guard = self.lock();
        match guard.as_ref() {
            Some(b) if b.process.id == process_id => {
                if !b.client.send(ClientFrame::Text(line)) {
                    debug!(client_id = b.client.id, process_id, "bridge: client gone, dropping line");
                }
            }
            _ => debug!(process_id, "bridge: stale process, dropping line"),
        }
    }

    /// Process `process_id` exited or its stream failed.
    fn process_ended(&self, process_id: u64, reason: &str) {
        let Some(binding) = self.take_if(|b| b.process.id == process_id) else {
            debug!(process_id, reason, "bridge: stale process ended");
            return;
        };
        info!(
            client_id = binding.client.id,
            process_id,
            reason,
            "bridge: agent process ended, closing client"
        );
        binding.client.close(CLOSE_INTERNAL_ERROR, reason);
        binding.process.kill.cancel();
    }
}

// ── Bridge ───────────────────────────────────────────────────────────────────

/// Single-client, single-process transport bridge.
///
/// Cheap to clone; all clones share the same binding.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Create an idle bridge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                binding: Mutex::new(None),
                next_client: AtomicU64::new(1),
                next_process: AtomicU64::new(1),
            }),
        }
    }

    /// Allocate a handle for a newly connected client.
    ///
    /// The receiver yields every frame the bridge sends to that client; the
    /// network layer pumps it onto the socket.
    #[must_use]
    pub fn register_client(&self) -> (ClientHandle, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        (ClientHandle { id, tx }, rx)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.inner
            .lock()
            .as_ref()
            .map_or(BridgeState::Idle, |b| BridgeState::Bound(b.attachment()))
    }

    /// Bind `client` to a freshly spawned process.
    ///
    /// Any existing binding is torn down first: its client is closed with
    /// [`CLOSE_NORMAL`] ("replaced") and its process terminated.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`](crate::AppError::Spawn) when the process
    /// cannot be started. `client` is then closed with
    /// [`CLOSE_INTERNAL_ERROR`] and the bridge stays idle.
    pub fn attach(&self, client: ClientHandle, spawn: &SpawnConfig) -> Result<Attachment> {
        let previous = self.inner.lock().take();
        if let Some(previous) = previous {
            info!(
                old_client_id = previous.client.id,
                new_client_id = client.id,
                "bridge: replacing attached client"
            );
            teardown(previous, CLOSE_NORMAL, "replaced");
        }

        let AgentProcess {
            child,
            stdin,
            stdout,
        } = match spawn_agent(spawn) {
            Ok(process) => process,
            Err(err) => {
                warn!(client_id = client.id, error = %err, "bridge: spawn failed");
                client.close(CLOSE_INTERNAL_ERROR, err.to_string());
                return Err(err);
            }
        };

        let process_id = self.inner.next_process.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let label = format!("process-{process_id}");

        tokio::spawn({
            let label = label.clone();
            let kill = kill.clone();
            async move {
                if let Err(err) = run_writer(label.clone(), stdin, stdin_rx, kill).await {
                    debug!(label, error = %err, "bridge: stdin writer stopped");
                }
            }
        });

        let reader = tokio::spawn(relay_stdout(
            Arc::clone(&self.inner),
            process_id,
            label,
            stdout,
            kill.clone(),
        ));

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            process_id,
            child,
            reader,
            kill.clone(),
            spawn.kill_grace,
        ));

        let binding = Binding {
            client,
            process: ProcessHandle {
                id: process_id,
                stdin_tx,
                kill,
                supervisor: Some(supervisor),
            },
        };
        let attachment = binding.attachment();

        // A concurrent attach may have bound in the meantime; last one wins.
        let displaced = self.inner.lock().replace(binding);
        if let Some(displaced) = displaced {
            teardown(displaced, CLOSE_NORMAL, "replaced");
        }

        info!(
            client_id = attachment.client_id,
            process_id, "bridge: client attached"
        );
        Ok(attachment)
    }

    /// Forward one client line to the bound process.
    ///
    /// Returns `false` (and drops the line) when `attachment` is stale.
    pub fn forward(&self, attachment: Attachment, line: String) -> bool {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(b) if b.attachment() == attachment => b.process.stdin_tx.send(line).is_ok(),
            _ => {
                debug!(
                    client_id = attachment.client_id,
                    process_id = attachment.process_id,
                    "bridge: stale attachment, dropping client line"
                );
                false
            }
        }
    }

    /// The client went away: terminate its process.
    ///
    /// Idempotent; returns `true` only for the call that tore the binding
    /// down.
    pub fn detach(&self, client_id: u64) -> bool {
        let Some(binding) = self.inner.take_if(|b| b.client.id == client_id) else {
            debug!(client_id, "bridge: detach of unbound client ignored");
            return false;
        };
        info!(
            client_id,
            process_id = binding.process.id,
            "bridge: client detached, terminating process"
        );
        binding.process.kill.cancel();
        true
    }

    /// Process-wide teardown: close the client, terminate the process and
    /// wait (bounded) for it to go away.
    pub async fn shutdown(&self) {
        let Some(mut binding) = self.inner.lock().take() else {
            return;
        };
        info!(
            client_id = binding.client.id,
            process_id = binding.process.id,
            "bridge: shutting down"
        );
        let supervisor = binding.process.supervisor.take();
        teardown(binding, CLOSE_GOING_AWAY, "server shutting down");
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }
}

fn teardown(binding: Binding, code: u16, reason: &str) {
    binding.client.close(code, reason);
    binding.process.kill.cancel();
}

// ── Process tasks ────────────────────────────────────────────────────────────

/// Read stdout frames and relay each verbatim line while `process_id` is bound.
async fn relay_stdout(
    inner: Arc<Inner>,
    process_id: u64,
    label: String,
    stdout: tokio::process::ChildStdout,
    kill: CancellationToken,
) -> StreamEnd {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    let reader = run_reader(label, stdout, frame_tx, kill);
    let relay = async {
        while let Some(frame) = frame_rx.recv().await {
            inner.relay_to_client(process_id, frame.line);
        }
    };
    let (end, ()) = tokio::join!(reader, relay);
    end
}

/// Own the child until it exits or the binding is torn down.
async fn supervise(
    inner: Arc<Inner>,
    process_id: u64,
    mut child: Child,
    mut reader: JoinHandle<StreamEnd>,
    kill: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        biased;

        () = kill.cancelled() => {
            let status = terminate(&mut child, grace).await;
            debug!(process_id, status = %describe_exit(status), "bridge: process terminated");
        }

        status = child.wait() => {
            // Let the reader flush what the process wrote before exiting.
            let _ = tokio::time::timeout(grace, &mut reader).await;
            let reason = match status {
                Ok(status) => describe_exit(Some(status)),
                Err(err) => format!("process wait failed: {err}"),
            };
            inner.process_ended(process_id, &reason);
        }

        end = &mut reader => {
            let reason = match end {
                Ok(end) => end.reason(),
                Err(err) => format!("reader task failed: {err}"),
            };
            inner.process_ended(process_id, &reason);
            let status = terminate(&mut child, grace).await;
            debug!(process_id, status = %describe_exit(status), "bridge: process terminated after stream end");
        }
    }
}
