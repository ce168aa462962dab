use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User identifier (opaque, assigned by the auth layer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workspace identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credit balance in USD with precision handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreditBalance(Decimal);

impl CreditBalance {
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn from_decimal(amount: Decimal) -> Self {
        Self(amount.round_dp(6)) // 6 decimal places for micro-credits
    }

    pub fn from_f64(amount: f64) -> Option<Self> {
        Decimal::from_f64(amount).map(|d| Self(d.round_dp(6)))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn add(&self, other: CreditBalance) -> Self {
        Self::from_decimal(self.0 + other.0)
    }

    pub fn subtract(&self, other: CreditBalance) -> Option<Self> {
        if self.0 >= other.0 {
            Some(Self::from_decimal(self.0 - other.0))
        } else {
            None
        }
    }

    pub fn multiply(&self, factor: Decimal) -> Self {
        Self::from_decimal(self.0 * factor)
    }

    pub fn is_sufficient(&self, required: CreditBalance) -> bool {
        self.0 >= required.0
    }
}

impl fmt::Display for CreditBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CreditBalance {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_decimal(Decimal::from_str(s)?))
    }
}

/// Account tier a user is subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Free,
    Pro,
    Enterprise,
    Admin,
}

impl UserType {
    pub fn all() -> [UserType; 4] {
        [
            UserType::Free,
            UserType::Pro,
            UserType::Enterprise,
            UserType::Admin,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Free => "free",
            UserType::Pro => "pro",
            UserType::Enterprise => "enterprise",
            UserType::Admin => "admin",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(UserType::Free),
            "pro" => Ok(UserType::Pro),
            "enterprise" => Ok(UserType::Enterprise),
            "admin" => Ok(UserType::Admin),
            other => Err(format!("unknown user type: {other}")),
        }
    }
}

/// Symbolic resource allocation tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceTier {
    Small,
    Medium,
    Large,
    Gpu,
}

impl ResourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Small => "small",
            ResourceTier::Medium => "medium",
            ResourceTier::Large => "large",
            ResourceTier::Gpu => "gpu",
        }
    }
}

impl Default for ResourceTier {
    fn default() -> Self {
        ResourceTier::Small
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResourceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(ResourceTier::Small),
            "medium" => Ok(ResourceTier::Medium),
            "large" => Ok(ResourceTier::Large),
            "gpu" => Ok(ResourceTier::Gpu),
            other => Err(format!("unknown resource tier: {other}")),
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Running,
    Terminated,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Creating, SessionStatus::Running)
                | (SessionStatus::Creating, SessionStatus::Failed)
                | (SessionStatus::Running, SessionStatus::Terminated)
                | (SessionStatus::Running, SessionStatus::Failed)
                | (SessionStatus::Running, SessionStatus::Expired)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(SessionStatus::Creating),
            "running" => Ok(SessionStatus::Running),
            "terminated" => Ok(SessionStatus::Terminated),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Backend kind a session is realized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Jobs,
    Pods,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Jobs => "jobs",
            ProviderKind::Pods => "pods",
        }
    }

    /// Accepts the wire value or the enum name in any case; `None` for anything else.
    pub fn normalize(value: &str) -> Option<ProviderKind> {
        match value.to_ascii_lowercase().as_str() {
            "jobs" => Some(ProviderKind::Jobs),
            "pods" => Some(ProviderKind::Pods),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session billing row states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    Completed,
    Cancelled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Active => "active",
            BillingStatus::Completed => "completed",
            BillingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BillingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BillingStatus::Active),
            "completed" => Ok(BillingStatus::Completed),
            "cancelled" => Ok(BillingStatus::Cancelled),
            other => Err(format!("unknown billing status: {other}")),
        }
    }
}

/// Storage backend flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Bucket,
    Filestore,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Bucket => "bucket",
            StorageType::Filestore => "filestore",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bucket" => Ok(StorageType::Bucket),
            "filestore" => Ok(StorageType::Filestore),
            other => Err(format!("unknown storage type: {other}")),
        }
    }
}

/// Mount access mode for attached storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "RW")]
    ReadWrite,
    #[serde(rename = "RO")]
    ReadOnly,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "RW",
            AccessMode::ReadOnly => "RO",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RW" => Ok(AccessMode::ReadWrite),
            "RO" => Ok(AccessMode::ReadOnly),
            other => Err(format!("unknown access mode: {other}")),
        }
    }
}

/// One entry in a user's append-only credit ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub transaction_id: String,
    pub user_id: UserId,
    /// Signed; positive = credit, negative = debit
    pub amount: Decimal,
    pub source: String,
    pub description: Option<String>,
    pub session_id: Option<String>,
    pub storage_resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    pub fn is_credit(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}
