//! Uniform contract across session backends

use async_trait::async_trait;
use caldera_common::error::Result;
use caldera_common::types::ProviderKind;
use std::time::Duration;

use crate::shell::ShellStream;
use crate::types::{ExecHandle, ExecOutcome, ExecResult, SessionInfo, SessionRequest};

/// A backend implementation that realizes sessions.
///
/// The manager holds no provider-specific code paths beyond the selection
/// rules; everything else goes through this trait object.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provision a session. Failures leave nothing for the caller to persist.
    async fn create(&self, req: &SessionRequest) -> Result<SessionInfo>;

    /// Fetch a session, refreshing its status from the backend when possible.
    /// `None` means the backend has no trace of it.
    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>>;

    /// Tear down a session and its scoped resources. Idempotent: absent
    /// resources are not an error.
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Run a command in the session. The synchronous path honors `timeout`
    /// (returncode 124 on deadline, backend not guaranteed cancelled); the
    /// asynchronous path returns a submission handle immediately.
    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        async_execution: bool,
    ) -> Result<ExecOutcome>;

    /// Poll an asynchronous submission. `None` while the job is still
    /// running; the final result once it reaches a terminal state.
    async fn get_job_status(&self, handle: &ExecHandle) -> Result<Option<ExecResult>>;

    /// Open a bidirectional shell stream suitable for WebSocket bridging.
    async fn open_shell(&self, session_id: &str) -> Result<ShellStream>;
}
