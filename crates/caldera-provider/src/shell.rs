//! Interactive shell streams and their lifetime supervision
//!
//! A shell is one bidirectional frame stream per session, multiplexed onto
//! provider exec calls. The supervisor enforces an idle timer and a hard
//! duration cap independent of the session monitor; expiry performs a
//! graceful close that the owner turns into a normal session delete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::ExecResult;

/// One frame on a shell stream
#[derive(Debug, Clone, PartialEq)]
pub enum ShellFrame {
    /// Client input (a command line or raw bytes, depending on provider)
    Stdin(String),
    Stdout(String),
    Stderr(String),
    /// A complete one-shot execution result (jobs provider)
    Exec(ExecResult),
    Info(String),
    Closed { reason: String },
}

/// One end of a bidirectional shell stream
#[derive(Debug)]
pub struct ShellStream {
    pub tx: mpsc::Sender<ShellFrame>,
    pub rx: mpsc::Receiver<ShellFrame>,
}

impl ShellStream {
    /// Create a connected pair of stream ends
    pub fn pair(buffer: usize) -> (ShellStream, ShellStream) {
        let (left_tx, right_rx) = mpsc::channel(buffer);
        let (right_tx, left_rx) = mpsc::channel(buffer);
        (
            ShellStream {
                tx: left_tx,
                rx: left_rx,
            },
            ShellStream {
                tx: right_tx,
                rx: right_rx,
            },
        )
    }

    pub async fn send(&self, frame: ShellFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub async fn recv(&mut self) -> Option<ShellFrame> {
        self.rx.recv().await
    }
}

/// Shell lifetime limits
#[derive(Debug, Clone)]
pub struct ShellLimits {
    pub idle_timeout: Duration,
    pub max_duration: Duration,
}

impl Default for ShellLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            max_duration: Duration::from_secs(8 * 3600),
        }
    }
}

/// Type alias for a supervised shell task with its cancellation token
type ShellTask = (JoinHandle<()>, CancellationToken);

/// Supervises active shell sessions, enforcing idle and hard-cap timers.
///
/// Closed session ids are reported on the `closed` channel so the owner can
/// run a normal delete.
pub struct ShellSupervisor {
    tasks: Arc<RwLock<HashMap<String, ShellTask>>>,
    limits: ShellLimits,
    closed_tx: mpsc::Sender<String>,
}

impl ShellSupervisor {
    pub fn new(limits: ShellLimits, closed_tx: mpsc::Sender<String>) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            limits,
            closed_tx,
        }
    }

    /// Wrap a provider shell stream; the returned stream is what the
    /// transport layer hands to the WebSocket.
    pub async fn supervise(&self, session_id: &str, mut upstream: ShellStream) -> ShellStream {
        let (client_end, mut inner_end) = ShellStream::pair(upstream.tx.max_capacity().max(16));

        let session_id_str = session_id.to_string();
        let limits = self.limits.clone();
        let closed_tx = self.closed_tx.clone();
        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let hard_deadline = started + limits.max_duration;
            let mut idle_deadline = started + limits.idle_timeout;

            let reason = loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        break "closed";
                    }
                    _ = sleep_until(hard_deadline) => {
                        warn!("Shell for session {} reached hard duration cap", session_id_str);
                        break "max_duration_exceeded";
                    }
                    _ = sleep_until(idle_deadline) => {
                        info!("Shell for session {} idle timeout", session_id_str);
                        break "idle_timeout";
                    }
                    frame = inner_end.rx.recv() => {
                        match frame {
                            Some(frame) => {
                                idle_deadline = Instant::now() + limits.idle_timeout;
                                if upstream.tx.send(frame).await.is_err() {
                                    break "backend_closed";
                                }
                            }
                            None => break "client_disconnected",
                        }
                    }
                    frame = upstream.rx.recv() => {
                        match frame {
                            Some(frame) => {
                                idle_deadline = Instant::now() + limits.idle_timeout;
                                if inner_end.tx.send(frame).await.is_err() {
                                    break "client_disconnected";
                                }
                            }
                            None => break "backend_closed",
                        }
                    }
                }
            };

            let _ = inner_end
                .tx
                .send(ShellFrame::Closed {
                    reason: reason.to_string(),
                })
                .await;

            if closed_tx.send(session_id_str.clone()).await.is_err() {
                debug!("No listener for shell close of session {}", session_id_str);
            }
            info!("Shell for session {} closed: {}", session_id_str, reason);
        });

        let mut tasks = self.tasks.write().await;
        if let Some((old_task, old_token)) = tasks.insert(
            session_id.to_string(),
            (task, cancellation_token),
        ) {
            // A session has at most one live shell; replace the previous one
            old_token.cancel();
            old_task.abort();
        }

        client_end
    }

    /// Close a supervised shell, waiting briefly for the task to finish.
    pub async fn close(&self, session_id: &str) {
        let mut tasks = self.tasks.write().await;

        if let Some((task, cancellation_token)) = tasks.remove(session_id) {
            cancellation_token.cancel();

            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => info!("Shell for session {} stopped gracefully", session_id),
                Ok(Err(e)) => warn!("Shell task for session {} failed: {}", session_id, e),
                Err(_) => warn!(
                    "Shell task for session {} did not stop within timeout",
                    session_id
                ),
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}
