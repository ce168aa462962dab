//! Pod provider
//!
//! The session is a dedicated pod in a per-namespace isolation unit;
//! commands run inside the live pod. Creation waits for readiness with a
//! bounded deadline before reporting the session as running.

use async_trait::async_trait;
use caldera_common::error::{Error, Result};
use caldera_common::types::{ProviderKind, ResourceTier, SessionStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::backend::{PodPhase, PodSpec, PodsBackend};
use crate::driver::ProviderDriver;
use crate::shell::ShellStream;
use crate::types::{ExecHandle, ExecOutcome, ExecResult, SessionInfo, SessionRequest};

/// Knobs for the pods provider
#[derive(Debug, Clone)]
pub struct PodsProviderConfig {
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub default_image: String,
}

impl Default for PodsProviderConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(120),
            readiness_poll_interval: Duration::from_millis(500),
            default_image: "alpine:3.19".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct PodsProvider {
    backend: Arc<dyn PodsBackend>,
    sessions: Arc<RwLock<HashMap<String, SessionInfo>>>,
    config: PodsProviderConfig,
}

fn pod_name_for(session_id: &str) -> String {
    format!("pod-{session_id}")
}

fn k8s_namespace_for(namespace: &str) -> String {
    format!("ns-{namespace}")
}

/// Requested CPU/memory for a symbolic tier
fn tier_resources(tier: ResourceTier) -> (&'static str, &'static str, &'static str, &'static str) {
    match tier {
        ResourceTier::Small => ("250m", "500m", "512Mi", "1Gi"),
        ResourceTier::Medium => ("500m", "1", "1Gi", "2Gi"),
        ResourceTier::Large => ("1", "2", "2Gi", "4Gi"),
        ResourceTier::Gpu => ("2", "4", "4Gi", "8Gi"),
    }
}

impl PodsProvider {
    pub fn new(backend: Arc<dyn PodsBackend>) -> Self {
        Self::with_config(backend, PodsProviderConfig::default())
    }

    pub fn with_config(backend: Arc<dyn PodsBackend>, config: PodsProviderConfig) -> Self {
        Self {
            backend,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    fn build_pod_spec(&self, req: &SessionRequest, session_id: &str) -> PodSpec {
        let (cpu_request, cpu_limit, memory_request, memory_limit) =
            tier_resources(req.resource_tier);

        let mut spec = PodSpec {
            namespace: k8s_namespace_for(&req.namespace),
            pod_name: pod_name_for(session_id),
            image: req
                .image_spec
                .image_url
                .clone()
                .unwrap_or_else(|| self.config.default_image.clone()),
            ttl_minutes: req.ttl_minutes,
            env: req.env.clone(),
            cpu_request: Some(cpu_request.to_string()),
            cpu_limit: Some(cpu_limit.to_string()),
            memory_request: Some(memory_request.to_string()),
            memory_limit: Some(memory_limit.to_string()),
            gpu_type: None,
            gpu_count: None,
            persistent_storage_gb: req
                .request_persistent_storage
                .then_some(req.persistent_storage_size_gb),
            bucket_name: req
                .request_bucket
                .then(|| format!("bucket-{session_id}")),
        };

        // Explicit resource asks override the symbolic tier
        if let Some(explicit) = &req.resource_spec {
            if explicit.cpu_request.is_some() {
                spec.cpu_request = explicit.cpu_request.clone();
            }
            if explicit.cpu_limit.is_some() {
                spec.cpu_limit = explicit.cpu_limit.clone();
            }
            if explicit.memory_request.is_some() {
                spec.memory_request = explicit.memory_request.clone();
            }
            if explicit.memory_limit.is_some() {
                spec.memory_limit = explicit.memory_limit.clone();
            }
            spec.gpu_type = explicit.gpu_type.clone();
            spec.gpu_count = explicit.gpu_count;
        } else if req.resource_tier == ResourceTier::Gpu {
            spec.gpu_count = Some(1);
        }

        spec.env
            .insert("WORKSPACE_ID".to_string(), req.workspace_id.clone());
        spec.env.insert("NAMESPACE".to_string(), req.namespace.clone());
        spec.env.insert("USER".to_string(), req.user.clone());
        if let Some(bucket) = &spec.bucket_name {
            spec.env.insert("BUCKET_NAME".to_string(), bucket.clone());
        }

        spec
    }

    async fn wait_for_readiness(&self, namespace: &str, pod_name: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.readiness_timeout;
        let mut poll = interval(self.config.readiness_poll_interval);

        loop {
            poll.tick().await;

            match self.backend.pod_phase(namespace, pod_name).await? {
                PodPhase::Running => return Ok(()),
                PodPhase::Failed => {
                    return Err(Error::provider_unavailable(format!(
                        "pod {pod_name} entered failed phase"
                    )))
                }
                PodPhase::Pending | PodPhase::Succeeded | PodPhase::Missing => {
                    if Instant::now() >= deadline {
                        return Err(Error::provider_unavailable(format!(
                            "pod {pod_name} not ready within {:?}",
                            self.config.readiness_timeout
                        )));
                    }
                }
            }
        }
    }

    async fn resolve_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.get(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    fn pod_coordinates(info: &SessionInfo, session_id: &str) -> (String, String) {
        let namespace = info
            .details
            .get("k8s_ns")
            .cloned()
            .unwrap_or_else(|| k8s_namespace_for(&info.namespace));
        let pod_name = info
            .details
            .get("pod_name")
            .cloned()
            .unwrap_or_else(|| pod_name_for(session_id));
        (namespace, pod_name)
    }
}

#[async_trait]
impl ProviderDriver for PodsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Pods
    }

    async fn create(&self, req: &SessionRequest) -> Result<SessionInfo> {
        let session_id = req
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
        let spec = self.build_pod_spec(req, &session_id);

        self.backend.apply_pod(&spec).await?;

        if let Err(e) = self.wait_for_readiness(&spec.namespace, &spec.pod_name).await {
            // Leave nothing running behind a failed create
            let _ = self.backend.delete_pod(&spec.namespace, &spec.pod_name).await;
            return Err(e);
        }

        let mut details = HashMap::new();
        details.insert("k8s_ns".to_string(), spec.namespace.clone());
        details.insert("pod_name".to_string(), spec.pod_name.clone());
        if let Some(bucket) = &spec.bucket_name {
            details.insert("bucket_name".to_string(), bucket.clone());
        }

        let info = SessionInfo {
            id: session_id.clone(),
            provider: ProviderKind::Pods,
            workspace_id: req.workspace_id.clone(),
            user: req.user.clone(),
            namespace: req.namespace.clone(),
            status: SessionStatus::Running,
            url: None,
            websocket: Some(format!("/sessions/{session_id}/shell")),
            created_at: Utc::now(),
            storage_config: serde_json::json!({
                "persistent_storage_gb": spec.persistent_storage_gb,
                "bucket": spec.bucket_name,
            }),
            details,
        };

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), info.clone());

        info!(session_id = %session_id, pod_name = %spec.pod_name, "Pod session created");

        Ok(info)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let cached = self.sessions.read().await.get(session_id).cloned();
        let Some(mut info) = cached else {
            return Ok(None);
        };

        let (namespace, pod_name) = Self::pod_coordinates(&info, session_id);
        match self.backend.pod_phase(&namespace, &pod_name).await {
            Ok(PodPhase::Running) => {
                info.status = SessionStatus::Running;
            }
            Ok(PodPhase::Pending) => {
                info.status = SessionStatus::Creating;
            }
            Ok(PodPhase::Succeeded) => {
                info.status = SessionStatus::Terminated;
            }
            Ok(PodPhase::Failed) => {
                info.status = SessionStatus::Failed;
            }
            Ok(PodPhase::Missing) => return Ok(None),
            Err(e) => {
                debug!(session_id = %session_id, "Pod refresh failed: {e}");
            }
        }

        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), info.clone());

        Ok(Some(info))
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let removed = self.sessions.write().await.remove(session_id);

        let (namespace, pod_name) = match &removed {
            Some(info) => Self::pod_coordinates(info, session_id),
            None => (
                // Best guess for sessions this process never saw
                k8s_namespace_for("unknown"),
                pod_name_for(session_id),
            ),
        };

        let pod_deleted = self.backend.delete_pod(&namespace, &pod_name).await?;

        if removed.is_none() && !pod_deleted {
            return Ok(false);
        }

        info!(session_id = %session_id, "Pod session deleted");
        Ok(true)
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        async_execution: bool,
    ) -> Result<ExecOutcome> {
        let info = self.resolve_session(session_id).await?;
        let (namespace, pod_name) = Self::pod_coordinates(&info, session_id);

        if async_execution {
            let job_id = self
                .backend
                .spawn_background(&namespace, &pod_name, command)
                .await?;
            return Ok(ExecOutcome::Submitted(ExecHandle {
                session_id: session_id.to_string(),
                job_id,
                job_name: pod_name,
            }));
        }

        // The deadline bounds our wait, not the process: the in-pod command
        // is not guaranteed to have been cancelled.
        match tokio::time::timeout(timeout, self.backend.exec(&namespace, &pod_name, command))
            .await
        {
            Ok(result) => Ok(ExecOutcome::Completed(result?)),
            Err(_) => {
                warn!(session_id = %session_id, "Exec exceeded caller deadline");
                Ok(ExecOutcome::Completed(ExecResult::timed_out(
                    timeout.as_secs(),
                )))
            }
        }
    }

    async fn get_job_status(&self, handle: &ExecHandle) -> Result<Option<ExecResult>> {
        let info = self.resolve_session(&handle.session_id).await?;
        let (namespace, pod_name) = Self::pod_coordinates(&info, &handle.session_id);

        self.backend
            .probe_background(&namespace, &pod_name, &handle.job_id)
            .await
    }

    async fn open_shell(&self, session_id: &str) -> Result<ShellStream> {
        let info = self.resolve_session(session_id).await?;
        let (namespace, pod_name) = Self::pod_coordinates(&info, session_id);

        self.backend.open_exec_stream(&namespace, &pod_name).await
    }
}
