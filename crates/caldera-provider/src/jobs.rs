//! Serverless jobs provider
//!
//! The session is a long-lived service endpoint; command execution is not
//! in-band with the service. Each execute submits a one-shot job that runs
//! the command in an environment equivalent to the service's container.
//! The backend may scale the service to zero when idle; the first execute
//! or shell frame cold-starts it transparently.

use async_trait::async_trait;
use caldera_common::error::{Error, Result};
use caldera_common::types::{ProviderKind, SessionStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::backend::{JobState, JobsBackend, ServiceSpec};
use crate::driver::ProviderDriver;
use crate::shell::{ShellFrame, ShellStream};
use crate::types::{ExecHandle, ExecOutcome, ExecResult, SessionInfo, SessionRequest};

/// Knobs for the jobs provider
#[derive(Debug, Clone)]
pub struct JobsProviderConfig {
    pub poll_interval: Duration,
    pub default_image: String,
    pub job_idle_ttl: Duration,
    /// Timeout applied to shell-initiated execs
    pub shell_exec_timeout: Duration,
    pub shell_buffer: usize,
}

impl Default for JobsProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            default_image: "alpine:3.19".to_string(),
            job_idle_ttl: Duration::from_secs(240 * 60),
            shell_exec_timeout: Duration::from_secs(120),
            shell_buffer: 64,
        }
    }
}

#[derive(Clone)]
pub struct JobsProvider {
    backend: Arc<dyn JobsBackend>,
    sessions: Arc<RwLock<HashMap<String, SessionInfo>>>,
    config: JobsProviderConfig,
}

fn service_name_for(session_id: &str) -> String {
    format!("svc-{session_id}")
}

fn bucket_name_for(session_id: &str) -> String {
    format!("bucket-{session_id}")
}

impl JobsProvider {
    pub fn new(backend: Arc<dyn JobsBackend>) -> Self {
        Self::with_config(backend, JobsProviderConfig::default())
    }

    pub fn with_config(backend: Arc<dyn JobsBackend>, config: JobsProviderConfig) -> Self {
        Self {
            backend,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    fn resolve_image(&self, req: &SessionRequest) -> String {
        req.image_spec
            .image_url
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone())
    }

    fn assemble_env(req: &SessionRequest, bucket_name: Option<&str>) -> HashMap<String, String> {
        let mut env = req.env.clone();
        env.insert("WORKSPACE_ID".to_string(), req.workspace_id.clone());
        env.insert("NAMESPACE".to_string(), req.namespace.clone());
        env.insert("USER".to_string(), req.user.clone());
        if let Some(bucket) = bucket_name {
            env.insert("BUCKET_NAME".to_string(), bucket.to_string());
        }
        env
    }

    async fn resolve_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.get(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }
}

#[async_trait]
impl ProviderDriver for JobsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Jobs
    }

    async fn create(&self, req: &SessionRequest) -> Result<SessionInfo> {
        let session_id = req
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
        let service_name = service_name_for(&session_id);
        let bucket_name = req.request_bucket.then(|| bucket_name_for(&session_id));

        let spec = ServiceSpec {
            service_name: service_name.clone(),
            image: self.resolve_image(req),
            env: Self::assemble_env(req, bucket_name.as_deref()),
            idle_ttl: self.config.job_idle_ttl,
            bucket_name: bucket_name.clone(),
            bucket_size_gb: req.bucket_size_gb,
        };

        let endpoint = self.backend.deploy_service(&spec).await?;

        let mut details = HashMap::new();
        details.insert("service_name".to_string(), service_name);
        if let Some(bucket) = &bucket_name {
            details.insert("bucket_name".to_string(), bucket.clone());
        }

        let info = SessionInfo {
            id: session_id.clone(),
            provider: ProviderKind::Jobs,
            workspace_id: req.workspace_id.clone(),
            user: req.user.clone(),
            namespace: req.namespace.clone(),
            status: SessionStatus::Running,
            url: Some(endpoint.url),
            websocket: None,
            created_at: Utc::now(),
            storage_config: serde_json::json!({
                "bucket": bucket_name,
                "bucket_size_gb": req.bucket_size_gb,
            }),
            details,
        };

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), info.clone());

        info!(session_id = %session_id, "Jobs session created");

        Ok(info)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let cached = self.sessions.read().await.get(session_id).cloned();
        let Some(mut info) = cached else {
            return Ok(None);
        };

        // Refresh from the backend; a missing service means the session is
        // gone regardless of what we remember.
        match self.backend.get_service(&service_name_for(session_id)).await {
            Ok(Some(endpoint)) => {
                info.url = Some(endpoint.url);
                info.status = SessionStatus::Running;
                self.sessions
                    .write()
                    .await
                    .insert(session_id.to_string(), info.clone());
                Ok(Some(info))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                debug!(session_id = %session_id, "Service refresh failed: {e}");
                Ok(Some(info))
            }
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.write().await.remove(session_id);

        let service_deleted = self
            .backend
            .delete_service(&service_name_for(session_id))
            .await?;

        // Per-session bucket scaffolding goes with the service
        let bucket_name = removed
            .as_ref()
            .and_then(|info| info.details.get("bucket_name").cloned())
            .unwrap_or_else(|| bucket_name_for(session_id));
        if let Err(e) = self.backend.delete_bucket(&bucket_name).await {
            warn!(session_id = %session_id, "Bucket teardown failed: {e}");
        }

        Ok(removed.is_some() || service_deleted)
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        async_execution: bool,
    ) -> Result<ExecOutcome> {
        let info = self.resolve_session(session_id).await?;
        let service_name = info
            .details
            .get("service_name")
            .cloned()
            .unwrap_or_else(|| service_name_for(session_id));

        let submission = self.backend.submit_job(&service_name, command).await?;

        if async_execution {
            return Ok(ExecOutcome::Submitted(ExecHandle {
                session_id: session_id.to_string(),
                job_id: submission.job_id,
                job_name: submission.job_name,
            }));
        }

        // Poll until the job reaches a terminal state or the deadline
        // elapses. On timeout the job is left in place.
        let deadline = Instant::now() + timeout;
        let mut poll = interval(self.config.poll_interval);
        loop {
            poll.tick().await;

            match self.backend.job_state(&submission.job_id).await? {
                JobState::Finished(result) => return Ok(ExecOutcome::Completed(result)),
                JobState::Pending | JobState::Running => {
                    if Instant::now() >= deadline {
                        debug!(
                            session_id = %session_id,
                            job_id = %submission.job_id,
                            "Job exceeded caller deadline"
                        );
                        return Ok(ExecOutcome::Completed(ExecResult::timed_out(
                            timeout.as_secs(),
                        )));
                    }
                }
            }
        }
    }

    async fn get_job_status(&self, handle: &ExecHandle) -> Result<Option<ExecResult>> {
        match self.backend.job_state(&handle.job_id).await? {
            JobState::Finished(result) => Ok(Some(result)),
            JobState::Pending | JobState::Running => Ok(None),
        }
    }

    async fn open_shell(&self, session_id: &str) -> Result<ShellStream> {
        self.resolve_session(session_id).await?;

        let (client_end, mut session_end) = ShellStream::pair(self.config.shell_buffer);
        let provider = self.clone();
        let session_id = session_id.to_string();
        let exec_timeout = self.config.shell_exec_timeout;

        // Multiplex user input frames over successive one-shot execs,
        // streaming results back. Latency is dominated by job submission.
        tokio::spawn(async move {
            while let Some(frame) = session_end.rx.recv().await {
                let ShellFrame::Stdin(command) = frame else {
                    continue;
                };

                let frame = match provider
                    .execute(&session_id, &command, exec_timeout, false)
                    .await
                {
                    Ok(ExecOutcome::Completed(result)) => ShellFrame::Exec(result),
                    Ok(ExecOutcome::Submitted(_)) => unreachable!("sync execute"),
                    Err(e) => ShellFrame::Stderr(e.to_string()),
                };

                if session_end.tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(client_end)
    }
}
