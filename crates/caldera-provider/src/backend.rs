//! Thin adapter traits over the concrete cloud SDKs.
//!
//! The orchestration core never talks to a cloud API directly; it drives
//! these narrow seams, which a deployment wires to the real SDK calls.

use async_trait::async_trait;
use caldera_common::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::shell::ShellStream;
use crate::types::ExecResult;

/// Spec for a per-session serverless service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// Idle TTL after which the backend may scale the service to zero
    pub idle_ttl: Duration,
    pub bucket_name: Option<String>,
    pub bucket_size_gb: Option<u32>,
}

/// A deployed serverless service endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_name: String,
    pub url: String,
}

/// Handle for a one-shot job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub job_id: String,
    pub job_name: String,
}

/// Observed state of a one-shot job
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Finished(ExecResult),
}

/// Serverless jobs backend: a long-lived service endpoint whose command
/// execution runs as one-shot jobs in an equivalent container environment.
#[async_trait]
pub trait JobsBackend: Send + Sync {
    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<ServiceEndpoint>;
    async fn get_service(&self, service_name: &str) -> Result<Option<ServiceEndpoint>>;
    /// Idempotent; deleting an absent service returns `false`.
    async fn delete_service(&self, service_name: &str) -> Result<bool>;
    async fn submit_job(&self, service_name: &str, command: &str) -> Result<JobSubmission>;
    async fn job_state(&self, job_id: &str) -> Result<JobState>;
    /// Tear down per-session bucket scaffolding; idempotent.
    async fn delete_bucket(&self, bucket_name: &str) -> Result<bool>;
}

/// Spec for a dedicated session pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSpec {
    pub namespace: String,
    pub pod_name: String,
    pub image: String,
    /// Session TTL enforced by the isolation unit
    pub ttl_minutes: u32,
    pub env: HashMap<String, String>,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub gpu_type: Option<String>,
    pub gpu_count: Option<u32>,
    pub persistent_storage_gb: Option<u32>,
    pub bucket_name: Option<String>,
}

/// Observed pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Missing,
}

/// Pod backend: a dedicated long-lived pod per session; commands run inside
/// the live pod.
#[async_trait]
pub trait PodsBackend: Send + Sync {
    async fn apply_pod(&self, spec: &PodSpec) -> Result<()>;
    async fn pod_phase(&self, namespace: &str, pod_name: &str) -> Result<PodPhase>;
    /// Idempotent; deleting an absent pod returns `false`.
    async fn delete_pod(&self, namespace: &str, pod_name: &str) -> Result<bool>;
    /// Execute in the pod and wait for completion. The caller enforces its
    /// own deadline on top of this.
    async fn exec(&self, namespace: &str, pod_name: &str, command: &str) -> Result<ExecResult>;
    /// Launch a command as a background process; returns a job id scoped to
    /// the pod's exec session.
    async fn spawn_background(
        &self,
        namespace: &str,
        pod_name: &str,
        command: &str,
    ) -> Result<String>;
    /// Inspect a background job; `None` while still running.
    async fn probe_background(
        &self,
        namespace: &str,
        pod_name: &str,
        job_id: &str,
    ) -> Result<Option<ExecResult>>;
    /// Bidirectional stream bridged to the pod's exec channel.
    async fn open_exec_stream(&self, namespace: &str, pod_name: &str) -> Result<ShellStream>;
}
