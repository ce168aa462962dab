//! Row shapes the store reads and writes

use caldera_common::types::{
    AccessMode, BillingStatus, CreditBalance, ProviderKind, SessionStatus, StorageType, UserId,
    UserType, WorkspaceId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub email: String,
    pub name: String,
    pub user_type: UserType,
    pub credits: CreditBalance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_id: UserId,
    pub email: String,
    pub name: String,
    pub user_type: UserType,
    pub initial_credits: CreditBalance,
}

/// Partial user update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub user_type: Option<UserType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub name: String,
    pub resource_package: String,
    pub description: Option<String>,
    pub default_bucket_id: Option<String>,
    pub default_filestore_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub workspace_id: WorkspaceId,
    /// Denormalized owner; backfilled by migration for old rows
    pub user_id: Option<UserId>,
    /// Raw persisted provider string; may be an unrecognized value
    pub provider: String,
    pub status: SessionStatus,
    pub storage_config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Persisted provider, when it names a supported backend
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        ProviderKind::normalize(&self.provider)
    }
}

/// Partial session update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub user_id: Option<UserId>,
    pub storage_config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBillingRecord {
    pub session_id: String,
    pub user_id: UserId,
    pub hourly_rate: Decimal,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_hours: Option<Decimal>,
    pub total_cost: Option<Decimal>,
    pub status: BillingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageResourceRecord {
    pub resource_id: String,
    pub user_id: UserId,
    pub workspace_id: Option<WorkspaceId>,
    pub storage_type: StorageType,
    pub resource_name: String,
    pub size_gb: i64,
    pub state: String,
    pub is_default: bool,
    pub auto_mount: bool,
    pub mount_path: Option<String>,
    pub access_mode: AccessMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAttachmentRecord {
    pub session_id: String,
    pub storage_id: String,
    pub mount_path: String,
    pub access_mode: AccessMode,
    pub attached_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
}

/// Joined view the session monitor iterates: running sessions with their
/// active billing row
#[derive(Debug, Clone)]
pub struct ActiveSessionRow {
    pub session_id: String,
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub provider: String,
    pub hourly_rate: Decimal,
    pub billing_start_time: DateTime<Utc>,
}
