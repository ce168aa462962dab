use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ResourceTier, StorageType, UserType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalderaConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub billing: BillingConfig,
    pub monitor: MonitorConfig,
    pub shell: ShellConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub environment: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path; ":memory:" for ephemeral instances
    pub path: String,
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

/// Pricing tables ("recognized options")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub hourly_rates: HourlyRates,
    pub credit_bonuses: CreditBonuses,
    pub tier_multipliers: TierMultipliers,
    pub storage_pricing: StoragePricing,
    pub credit_purchase: CreditPurchaseConfig,
    pub storage_quotas: StorageQuotas,
}

/// Per-user-type base hourly rate in USD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyRates {
    pub free: Decimal,
    pub pro: Decimal,
    pub enterprise: Decimal,
    pub admin: Decimal,
}

impl HourlyRates {
    pub fn for_user_type(&self, user_type: UserType) -> Decimal {
        match user_type {
            UserType::Free => self.free,
            UserType::Pro => self.pro,
            UserType::Enterprise => self.enterprise,
            UserType::Admin => self.admin,
        }
    }
}

/// Signup credit bonus granted per user type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditBonuses {
    pub free: Decimal,
    pub pro: Decimal,
    pub enterprise: Decimal,
    pub admin: Decimal,
}

impl CreditBonuses {
    pub fn for_user_type(&self, user_type: UserType) -> Decimal {
        match user_type {
            UserType::Free => self.free,
            UserType::Pro => self.pro,
            UserType::Enterprise => self.enterprise,
            UserType::Admin => self.admin,
        }
    }
}

/// Symbolic tier cost multipliers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierMultipliers {
    pub small: Decimal,
    pub medium: Decimal,
    pub large: Decimal,
    pub gpu: Decimal,
}

impl TierMultipliers {
    pub fn for_tier(&self, tier: ResourceTier) -> Decimal {
        match tier {
            ResourceTier::Small => self.small,
            ResourceTier::Medium => self.medium,
            ResourceTier::Large => self.large,
            ResourceTier::Gpu => self.gpu,
        }
    }
}

/// Monthly per-GB storage rates in USD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePricing {
    pub bucket_per_gb_monthly: Decimal,
    pub filestore_per_gb_monthly: Decimal,
}

impl StoragePricing {
    pub fn monthly_rate(&self, storage_type: StorageType) -> Decimal {
        match storage_type {
            StorageType::Bucket => self.bucket_per_gb_monthly,
            StorageType::Filestore => self.filestore_per_gb_monthly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditPurchaseConfig {
    pub min_amount: Decimal,
    pub bonus_percent: Decimal,
}

/// Per-user-type caps on storage resources; -1 means unlimited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageQuotas {
    pub free_buckets: i32,
    pub free_filestores: i32,
    pub pro_buckets: i32,
    pub pro_filestores: i32,
    pub enterprise_buckets: i32,
    pub enterprise_filestores: i32,
    pub admin_buckets: i32,
    pub admin_filestores: i32,
}

impl StorageQuotas {
    pub fn limit(&self, user_type: UserType, storage_type: StorageType) -> i32 {
        match (user_type, storage_type) {
            (UserType::Free, StorageType::Bucket) => self.free_buckets,
            (UserType::Free, StorageType::Filestore) => self.free_filestores,
            (UserType::Pro, StorageType::Bucket) => self.pro_buckets,
            (UserType::Pro, StorageType::Filestore) => self.pro_filestores,
            (UserType::Enterprise, StorageType::Bucket) => self.enterprise_buckets,
            (UserType::Enterprise, StorageType::Filestore) => self.enterprise_filestores,
            (UserType::Admin, StorageType::Bucket) => self.admin_buckets,
            (UserType::Admin, StorageType::Filestore) => self.admin_filestores,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub max_duration_hours: f64,
    pub max_cost_usd: f64,
    pub check_interval_minutes: u64,
    pub min_session_age_minutes: u64,
    pub grace_period_minutes: u64,
    /// Fraction of an hour of runway below which a session is killed
    pub low_credit_runway_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub idle_timeout_minutes: u64,
    pub max_duration_hours: u64,
    pub frame_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub jobs_poll_interval_ms: u64,
    pub pods_readiness_timeout_secs: u64,
    pub pods_readiness_poll_interval_ms: u64,
    pub default_image: String,
    pub job_idle_ttl_minutes: u64,
}

impl Default for CalderaConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "caldera".to_string(),
                environment: "development".to_string(),
                log_level: "info".to_string(),
            },
            database: DatabaseConfig {
                path: "caldera.db".to_string(),
                busy_timeout_ms: 5000,
                max_connections: 8,
            },
            billing: BillingConfig {
                hourly_rates: HourlyRates {
                    free: dec!(0.05),
                    pro: dec!(0.025),
                    enterprise: dec!(0.01),
                    admin: dec!(0.0),
                },
                credit_bonuses: CreditBonuses {
                    free: dec!(5.0),
                    pro: dec!(0.0),
                    enterprise: dec!(0.0),
                    admin: dec!(0.0),
                },
                tier_multipliers: TierMultipliers {
                    small: dec!(1.0),
                    medium: dec!(1.5),
                    large: dec!(2.0),
                    gpu: dec!(5.0),
                },
                storage_pricing: StoragePricing {
                    bucket_per_gb_monthly: dec!(0.02),
                    filestore_per_gb_monthly: dec!(0.17),
                },
                credit_purchase: CreditPurchaseConfig {
                    min_amount: dec!(10.0),
                    bonus_percent: dec!(0),
                },
                storage_quotas: StorageQuotas {
                    free_buckets: 1,
                    free_filestores: 1,
                    pro_buckets: 5,
                    pro_filestores: 3,
                    enterprise_buckets: 100,
                    enterprise_filestores: 50,
                    admin_buckets: -1,
                    admin_filestores: -1,
                },
            },
            monitor: MonitorConfig {
                max_duration_hours: 48.0,
                max_cost_usd: 500.0,
                check_interval_minutes: 30,
                min_session_age_minutes: 60,
                grace_period_minutes: 15,
                low_credit_runway_factor: 0.1,
            },
            shell: ShellConfig {
                idle_timeout_minutes: 30,
                max_duration_hours: 8,
                frame_buffer_size: 256,
            },
            provider: ProviderConfig {
                jobs_poll_interval_ms: 500,
                pods_readiness_timeout_secs: 120,
                pods_readiness_poll_interval_ms: 500,
                default_image: "alpine:3.19".to_string(),
                job_idle_ttl_minutes: 240,
            },
        }
    }
}

impl CalderaConfig {
    pub fn load(path_override: Option<PathBuf>) -> Result<CalderaConfig> {
        let default_config = CalderaConfig::default();

        let mut figment = Figment::from(Serialized::defaults(default_config));

        if let Some(path) = path_override {
            if path.exists() {
                figment = figment.merge(Toml::file(&path));
            }
        } else {
            let default_path = PathBuf::from("caldera.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }

        figment = figment.merge(Env::prefixed("CALDERA_").split("__"));

        figment.extract().map_err(|e| Error::Config {
            message: e.to_string(),
        })
    }

    pub fn load_from_file(path: &Path) -> Result<CalderaConfig> {
        Self::load(Some(path.to_path_buf()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(Error::Config {
                message: "database.path cannot be empty".to_string(),
            });
        }

        if self.monitor.check_interval_minutes == 0 {
            return Err(Error::Config {
                message: "monitor.check_interval_minutes must be non-zero".to_string(),
            });
        }

        if self.monitor.max_duration_hours <= 0.0 {
            return Err(Error::Config {
                message: "monitor.max_duration_hours must be positive".to_string(),
            });
        }

        if self.billing.credit_purchase.min_amount < Decimal::ZERO {
            return Err(Error::Config {
                message: "billing.credit_purchase.min_amount must be non-negative".to_string(),
            });
        }

        if self.shell.frame_buffer_size == 0 {
            return Err(Error::Config {
                message: "shell.frame_buffer_size must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.database.path == ":memory:" && self.service.environment == "production" {
            warnings.push("In-memory database configured in production environment".to_string());
        }

        if self.billing.hourly_rates.free > self.billing.hourly_rates.pro {
            warnings.push("Free tier hourly rate exceeds pro tier rate".to_string());
        }

        warnings
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.check_interval_minutes * 60)
    }

    pub fn shell_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.shell.idle_timeout_minutes * 60)
    }

    pub fn shell_max_duration(&self) -> Duration {
        Duration::from_secs(self.shell.max_duration_hours * 3600)
    }

    pub fn jobs_poll_interval(&self) -> Duration {
        Duration::from_millis(self.provider.jobs_poll_interval_ms)
    }

    pub fn pods_readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.pods_readiness_timeout_secs)
    }

    pub fn pods_readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.provider.pods_readiness_poll_interval_ms)
    }
}
