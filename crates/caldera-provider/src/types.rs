//! Request and response value objects shared by both providers

use caldera_common::types::{ProviderKind, ResourceTier, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Explicit resource asks, used instead of a symbolic tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub gpu_type: Option<String>,
    pub gpu_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image_type: String,
    pub image_url: Option<String>,
    pub image_tag: Option<String>,
}

fn default_provider() -> String {
    "auto".to_string()
}

fn default_ttl_minutes() -> u32 {
    60
}

fn default_persistent_storage_size_gb() -> u32 {
    10
}

/// A session creation request as accepted from the transport layer.
///
/// `provider` is kept as the raw caller string so unsupported names can be
/// observed and redirected rather than rejected at deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Client-generated session id; minted by the provider when absent.
    /// Duplicates are rejected by the store's uniqueness constraint.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    pub workspace_id: String,
    pub namespace: String,
    pub user: String,
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u32,
    #[serde(default, alias = "resource_package")]
    pub resource_tier: ResourceTier,
    #[serde(default)]
    pub resource_spec: Option<ResourceSpec>,
    #[serde(default)]
    pub image_spec: ImageSpec,
    #[serde(default)]
    pub request_persistent_storage: bool,
    #[serde(default = "default_persistent_storage_size_gb")]
    pub persistent_storage_size_gb: u32,
    #[serde(default)]
    pub request_bucket: bool,
    #[serde(default)]
    pub bucket_size_gb: Option<u32>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub needs_shell: bool,
    #[serde(default)]
    pub long_lived: bool,
    #[serde(default)]
    pub expected_duration_minutes: Option<u32>,
}

impl SessionRequest {
    pub fn new(workspace_id: &str, namespace: &str, user: &str) -> Self {
        Self {
            provider: default_provider(),
            session_id: None,
            template_id: None,
            workspace_id: workspace_id.to_string(),
            namespace: namespace.to_string(),
            user: user.to_string(),
            ttl_minutes: default_ttl_minutes(),
            resource_tier: ResourceTier::default(),
            resource_spec: None,
            image_spec: ImageSpec::default(),
            request_persistent_storage: false,
            persistent_storage_size_gb: default_persistent_storage_size_gb(),
            request_bucket: false,
            bucket_size_gb: None,
            env: HashMap::new(),
            needs_shell: false,
            long_lived: false,
            expected_duration_minutes: None,
        }
    }

    /// True while the caller has not overridden the TTL default; template
    /// TTLs only apply in that case.
    pub fn uses_default_ttl(&self) -> bool {
        self.ttl_minutes == default_ttl_minutes()
    }
}

/// A running (or reconstructed) session as seen by callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub provider: ProviderKind,
    pub workspace_id: String,
    pub user: String,
    pub namespace: String,
    pub status: SessionStatus,
    pub url: Option<String>,
    pub websocket: Option<String>,
    pub created_at: DateTime<Utc>,
    pub storage_config: serde_json::Value,
    /// Provider-specific details (pod name, k8s namespace, service URL)
    pub details: HashMap<String, String>,
}

impl SessionInfo {
    /// Minimal reconstruction for rows that exist only in the store
    pub fn reconstructed(
        id: &str,
        provider: ProviderKind,
        workspace_id: &str,
        user: &str,
        status: SessionStatus,
    ) -> Self {
        Self {
            id: id.to_string(),
            provider,
            workspace_id: workspace_id.to_string(),
            user: user.to_string(),
            namespace: "unknown".to_string(),
            status,
            url: None,
            websocket: None,
            created_at: Utc::now(),
            storage_config: serde_json::Value::Null,
            details: HashMap::new(),
        }
    }
}

/// Result of a completed command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub success: bool,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            returncode: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(returncode: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            returncode,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// The conventional shape for a deadline overrun: exit code 124, the
    /// backend job is left in place.
    pub fn timed_out(timeout_secs: u64) -> Self {
        Self {
            success: false,
            returncode: 124,
            stdout: String::new(),
            stderr: format!("command timed out after {timeout_secs}s"),
        }
    }
}

/// Handle for an asynchronously submitted command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecHandle {
    pub session_id: String,
    pub job_id: String,
    pub job_name: String,
}

/// What an `execute` call produced: a finished result for the synchronous
/// path, or a submission handle for the asynchronous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecOutcome {
    Completed(ExecResult),
    Submitted(ExecHandle),
}

impl ExecOutcome {
    pub fn into_result(self) -> Option<ExecResult> {
        match self {
            ExecOutcome::Completed(result) => Some(result),
            ExecOutcome::Submitted(_) => None,
        }
    }
}
