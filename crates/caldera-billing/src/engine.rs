//! Billing engine: wall-clock to money, atomic debits, ledger upkeep
//!
//! Sits between the session layer and the store. Start and stop are
//! critical sections: failures bubble up, never silently swallowed.
//! Concurrent stops are idempotent; only the first completes the row.

use std::sync::Arc;

use caldera_common::config::BillingConfig;
use caldera_common::error::{Error, Result};
use caldera_common::types::{CreditBalance, ResourceTier, StorageType, UserId};
use caldera_store::{SessionBillingRecord, Store};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditPurchase {
    pub transaction_id: String,
    pub user_id: UserId,
    pub amount_usd: Decimal,
    pub bonus_credits: Decimal,
    pub total_credits: Decimal,
    pub payment_method: String,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCharge {
    pub user_id: UserId,
    pub storage_type: StorageType,
    pub size_gb: i64,
    pub duration_days: i64,
    pub cost: Decimal,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSummary {
    pub user_id: UserId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub current_balance: Decimal,
    pub total_credits_added: Decimal,
    pub total_credits_used: Decimal,
    pub net_change: Decimal,
    pub transaction_count: usize,
}

/// Current pricing snapshot for the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInfo {
    pub hourly_rates: caldera_common::config::HourlyRates,
    pub tier_multipliers: caldera_common::config::TierMultipliers,
    pub storage_pricing: caldera_common::config::StoragePricing,
    pub credit_purchase: caldera_common::config::CreditPurchaseConfig,
}

pub struct BillingEngine {
    store: Arc<Store>,
    pricing: BillingConfig,
}

impl BillingEngine {
    pub fn new(store: Arc<Store>, pricing: BillingConfig) -> Self {
        Self { store, pricing }
    }

    /// Effective hourly rate for a user on a tier:
    /// `base rate(user_type) * tier multiplier`.
    async fn effective_hourly_rate(
        &self,
        user_id: &UserId,
        tier: ResourceTier,
    ) -> Result<Decimal> {
        let user = self.store.get_user(user_id).await?;
        let base = self.pricing.hourly_rates.for_user_type(user.user_type);
        Ok(base * self.pricing.tier_multipliers.for_tier(tier))
    }

    /// Cost of a session of the given duration, rounded to 4 decimal places.
    pub async fn calculate_session_cost(
        &self,
        user_id: &UserId,
        duration_hours: Decimal,
        tier: ResourceTier,
    ) -> Result<Decimal> {
        let rate = self.effective_hourly_rate(user_id, tier).await?;
        let cost = CreditBalance::from_decimal(rate).multiply(duration_hours);
        Ok(cost.as_decimal().round_dp(4))
    }

    /// Cost of storage over a duration, from the monthly per-GB table.
    pub fn calculate_storage_cost(
        &self,
        storage_type: StorageType,
        size_gb: i64,
        duration_days: i64,
    ) -> Decimal {
        let monthly_rate = self.pricing.storage_pricing.monthly_rate(storage_type);
        let monthly_cost = CreditBalance::from_decimal(monthly_rate).multiply(Decimal::from(size_gb));
        let duration_months = Decimal::from(duration_days) / dec!(30);
        monthly_cost.multiply(duration_months).as_decimal().round_dp(4)
    }

    /// Open the billing row for a session at the user's effective rate.
    pub async fn start_session_billing(
        &self,
        session_id: &str,
        user_id: &UserId,
        tier: ResourceTier,
    ) -> Result<SessionBillingRecord> {
        let rate = self.effective_hourly_rate(user_id, tier).await?;
        let record = self
            .store
            .start_session_billing(session_id, user_id, rate)
            .await?;

        info!(session_id = %session_id, hourly_rate = %rate, tier = %tier, "Started session billing");

        Ok(record)
    }

    /// Close the billing row, computing fractional hours with millisecond
    /// precision: a 30-second session produces a nonzero cost.
    pub async fn stop_session_billing(&self, session_id: &str) -> Result<SessionBillingRecord> {
        let billing = self
            .store
            .get_session_billing_info(session_id)
            .await?
            .ok_or_else(|| Error::BillingNotActive {
                session_id: session_id.to_string(),
            })?;

        let elapsed_ms = (Utc::now() - billing.start_time).num_milliseconds().max(0);
        let total_hours = (Decimal::from(elapsed_ms) / dec!(3600000)).round_dp(6);

        let stopped = self.store.stop_session_billing(session_id, total_hours).await?;
        if !stopped {
            return Err(Error::BillingNotActive {
                session_id: session_id.to_string(),
            });
        }

        let completed = self
            .store
            .get_session_billing_info(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("billing row for session {session_id}")))?;

        info!(
            session_id = %session_id,
            total_hours = %total_hours,
            total_cost = %completed.total_cost.unwrap_or_default(),
            "Stopped session billing"
        );

        Ok(completed)
    }

    /// Purchase credits: enforce the minimum, apply the bonus percentage,
    /// and credit the total in one logical commit.
    pub async fn purchase_credits(
        &self,
        user_id: &UserId,
        amount_usd: Decimal,
        payment_method: &str,
    ) -> Result<CreditPurchase> {
        let min_amount = self.pricing.credit_purchase.min_amount;
        if amount_usd < min_amount {
            return Err(Error::invalid_input(format!(
                "minimum credit purchase amount is {min_amount}"
            )));
        }

        let bonus = (amount_usd * self.pricing.credit_purchase.bonus_percent / dec!(100))
            .round_dp(6);
        let total = amount_usd + bonus;

        let new_balance = self
            .store
            .add_credits(
                user_id,
                CreditBalance::from_decimal(total),
                "credit_purchase",
                Some(&format!(
                    "Purchased {amount_usd} USD of credits via {payment_method}"
                )),
            )
            .await?;

        info!(user_id = %user_id, amount = %amount_usd, total = %total, "Credits purchased");

        Ok(CreditPurchase {
            transaction_id: Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            amount_usd,
            bonus_credits: bonus,
            total_credits: total,
            payment_method: payment_method.to_string(),
            new_balance: new_balance.as_decimal(),
        })
    }

    pub async fn check_user_credit_balance(
        &self,
        user_id: &UserId,
        required: Decimal,
    ) -> Result<bool> {
        let balance = self.store.get_user_credits(user_id).await?;
        Ok(balance.is_sufficient(CreditBalance::from_decimal(required)))
    }

    /// Charge for a new storage resource: enforce the per-tier quota, then
    /// the balance, then deduct with resource attribution. Storage that
    /// prices out is rejected.
    pub async fn process_storage_creation_billing(
        &self,
        user_id: &UserId,
        storage_type: StorageType,
        size_gb: i64,
        duration_days: i64,
        storage_resource_id: &str,
    ) -> Result<StorageCharge> {
        let user = self.store.get_user(user_id).await?;
        let quota = self.pricing.storage_quotas.limit(user.user_type, storage_type);
        if quota >= 0 {
            let existing = self
                .store
                .count_storage_resources(user_id, storage_type)
                .await?;
            if existing >= quota as i64 {
                return Err(Error::QuotaExceeded {
                    message: format!(
                        "{} {storage_type} resources allowed for {} tier",
                        quota, user.user_type
                    ),
                });
            }
        }

        let cost = self.calculate_storage_cost(storage_type, size_gb, duration_days);

        let new_balance = self
            .store
            .deduct_credits(
                user_id,
                CreditBalance::from_decimal(cost),
                &format!("storage creation: {storage_type}"),
                None,
                Some(storage_resource_id),
            )
            .await?;

        Ok(StorageCharge {
            user_id: user_id.clone(),
            storage_type,
            size_gb,
            duration_days,
            cost,
            new_balance: new_balance.as_decimal(),
        })
    }

    /// Ledger-derived summary over a window (defaults to the last 30 days).
    pub async fn get_user_billing_summary(
        &self,
        user_id: &UserId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<BillingSummary> {
        let period_end = end.unwrap_or_else(Utc::now);
        let period_start = start.unwrap_or(period_end - chrono::Duration::days(30));

        let history = self
            .store
            .get_credit_history(user_id, Some(period_start), Some(period_end))
            .await?;

        let total_credits_added: Decimal = history
            .iter()
            .filter(|t| t.is_credit())
            .map(|t| t.amount)
            .sum();
        let total_credits_used: Decimal = history
            .iter()
            .filter(|t| !t.is_credit())
            .map(|t| -t.amount)
            .sum();

        let balance = self.store.get_user_credits(user_id).await?;

        Ok(BillingSummary {
            user_id: user_id.clone(),
            period_start,
            period_end,
            current_balance: balance.as_decimal(),
            total_credits_added,
            total_credits_used,
            net_change: total_credits_added - total_credits_used,
            transaction_count: history.len(),
        })
    }

    pub fn pricing_info(&self) -> PricingInfo {
        PricingInfo {
            hourly_rates: self.pricing.hourly_rates.clone(),
            tier_multipliers: self.pricing.tier_multipliers.clone(),
            storage_pricing: self.pricing.storage_pricing.clone(),
            credit_purchase: self.pricing.credit_purchase.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caldera_common::config::CalderaConfig;
    use caldera_common::types::{UserType, WorkspaceId};
    use caldera_store::NewUser;
    use serde_json::json;

    async fn engine_with_user(user_type: UserType, credits: f64) -> (Arc<Store>, BillingEngine) {
        let store = Arc::new(Store::for_testing().await.unwrap());
        store
            .create_user(NewUser {
                user_id: UserId::new("alice"),
                email: "alice@example.com".to_string(),
                name: "alice".to_string(),
                user_type,
                initial_credits: CreditBalance::from_f64(credits).unwrap(),
            })
            .await
            .unwrap();
        let engine = BillingEngine::new(store.clone(), CalderaConfig::default().billing);
        (store, engine)
    }

    async fn seed_session(store: &Store) {
        store
            .create_workspace(
                &WorkspaceId::new("ws-1"),
                &UserId::new("alice"),
                "scratch",
                "small",
                None,
            )
            .await
            .unwrap();
        store
            .create_session(&WorkspaceId::new("ws-1"), "s-1", "pods", &json!({}))
            .await
            .unwrap();
    }

    /// Shift a billing row's start time into the past so stop sees a real
    /// elapsed duration.
    async fn backdate_billing(store: &Store, session_id: &str, seconds: i64) {
        let backdated = (Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339();
        sqlx::query("UPDATE session_billing SET start_time = ? WHERE session_id = ?")
            .bind(backdated)
            .bind(session_id)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_cost_boundaries() {
        // free tier: 0.05/h, small multiplier 1.0
        let (_store, engine) = engine_with_user(UserType::Free, 0.0).await;
        let user = UserId::new("alice");

        for (duration_hours, expected) in [
            (dec!(0.008333), dec!(0.0004)),  // 30 s
            (dec!(0.016667), dec!(0.0008)),  // 1 min
            (dec!(0.5), dec!(0.0250)),       // 30 min
            (dec!(0.75), dec!(0.0375)),      // 45 min
            (dec!(1), dec!(0.0500)),         // 1 h
            (dec!(2), dec!(0.1000)),         // 2 h
        ] {
            let cost = engine
                .calculate_session_cost(&user, duration_hours, ResourceTier::Small)
                .await
                .unwrap();
            let exact = dec!(0.05) * duration_hours;
            assert!((cost - exact).abs() <= dec!(0.0001), "duration {duration_hours}: {cost} vs {exact}");
            assert_eq!(cost, expected);
        }
    }

    #[tokio::test]
    async fn test_tier_multipliers_apply() {
        let (_store, engine) = engine_with_user(UserType::Pro, 0.0).await;
        let user = UserId::new("alice");

        // pro 0.025/h * gpu 5.0 = 0.125/h
        let cost = engine
            .calculate_session_cost(&user, dec!(2), ResourceTier::Gpu)
            .await
            .unwrap();
        assert_eq!(cost, dec!(0.2500));
    }

    #[tokio::test]
    async fn test_storage_cost_table() {
        let (_store, engine) = engine_with_user(UserType::Free, 0.0).await;

        // 10 GB bucket for 30 days = 10 * 0.02 = 0.20
        assert_eq!(
            engine.calculate_storage_cost(StorageType::Bucket, 10, 30),
            dec!(0.2000)
        );
        // 10 GB filestore for 15 days = 10 * 0.17 * 0.5 = 0.85
        assert_eq!(
            engine.calculate_storage_cost(StorageType::Filestore, 10, 15),
            dec!(0.8500)
        );
    }

    #[tokio::test]
    async fn test_purchase_session_deduction_scenario() {
        // User with 0 credits, pro tier; purchase 25, run 2 h on medium
        let (store, engine) = engine_with_user(UserType::Pro, 0.0).await;
        let user = UserId::new("alice");
        seed_session(&store).await;

        let purchase = engine.purchase_credits(&user, dec!(25.00), "test").await.unwrap();
        assert_eq!(purchase.total_credits, dec!(25.00));
        assert_eq!(purchase.new_balance, dec!(25.00));

        // pro 0.025 * medium 1.5 = 0.0375/h
        let billing = engine
            .start_session_billing("s-1", &user, ResourceTier::Medium)
            .await
            .unwrap();
        assert_eq!(billing.hourly_rate, dec!(0.0375));

        backdate_billing(&store, "s-1", 2 * 3600).await;

        let completed = engine.stop_session_billing("s-1").await.unwrap();
        let hours = completed.total_hours.unwrap();
        assert!((hours - dec!(2.0)).abs() < dec!(0.001), "hours = {hours}");
        assert_eq!(completed.total_cost.unwrap(), dec!(0.0750));

        let balance = store.get_user_credits(&user).await.unwrap();
        assert_eq!(balance.as_decimal(), dec!(24.9250));
    }

    #[tokio::test]
    async fn test_fractional_second_billing() {
        let (store, engine) = engine_with_user(UserType::Free, 1.0).await;
        let user = UserId::new("alice");
        seed_session(&store).await;

        engine
            .start_session_billing("s-1", &user, ResourceTier::Small)
            .await
            .unwrap();
        backdate_billing(&store, "s-1", 30).await;

        let completed = engine.stop_session_billing("s-1").await.unwrap();
        let hours = completed.total_hours.unwrap();
        let cost = completed.total_cost.unwrap();

        // ~0.00833 h at 0.05/h, rounded to 4 dp
        assert!(hours > dec!(0.008) && hours < dec!(0.009), "hours = {hours}");
        assert!(cost > Decimal::ZERO, "30s session must cost something");
        assert_eq!(cost, (hours * dec!(0.05)).round_dp(4));

        let balance = store.get_user_credits(&user).await.unwrap();
        assert_eq!(balance.as_decimal(), dec!(1.0) - cost);
    }

    #[tokio::test]
    async fn test_double_start_and_double_stop() {
        let (store, engine) = engine_with_user(UserType::Free, 10.0).await;
        let user = UserId::new("alice");
        seed_session(&store).await;

        engine
            .start_session_billing("s-1", &user, ResourceTier::Small)
            .await
            .unwrap();
        let err = engine
            .start_session_billing("s-1", &user, ResourceTier::Small)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        engine.stop_session_billing("s-1").await.unwrap();
        let err = engine.stop_session_billing("s-1").await.unwrap_err();
        assert!(matches!(err, Error::BillingNotActive { .. }));
    }

    #[tokio::test]
    async fn test_check_credit_balance() {
        let (_store, engine) = engine_with_user(UserType::Free, 1.0).await;
        let user = UserId::new("alice");

        assert!(engine
            .check_user_credit_balance(&user, dec!(1.00))
            .await
            .unwrap());
        assert!(!engine
            .check_user_credit_balance(&user, dec!(1.01))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_purchase_below_minimum_rejected() {
        let (_store, engine) = engine_with_user(UserType::Free, 0.0).await;
        let err = engine
            .purchase_credits(&UserId::new("alice"), dec!(5.00), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_purchase_bonus_percent() {
        let (store, engine) = {
            let store = Arc::new(Store::for_testing().await.unwrap());
            store
                .create_user(NewUser {
                    user_id: UserId::new("alice"),
                    email: "alice@example.com".to_string(),
                    name: "alice".to_string(),
                    user_type: UserType::Free,
                    initial_credits: CreditBalance::zero(),
                })
                .await
                .unwrap();
            let mut pricing = CalderaConfig::default().billing;
            pricing.credit_purchase.bonus_percent = dec!(10);
            (store.clone(), BillingEngine::new(store, pricing))
        };

        let purchase = engine
            .purchase_credits(&UserId::new("alice"), dec!(20.00), "test")
            .await
            .unwrap();
        assert_eq!(purchase.bonus_credits, dec!(2.00));
        assert_eq!(purchase.total_credits, dec!(22.00));

        let balance = store.get_user_credits(&UserId::new("alice")).await.unwrap();
        assert_eq!(balance.as_decimal(), dec!(22.00));
    }

    #[tokio::test]
    async fn test_storage_billing_quota_and_balance() {
        let (store, engine) = engine_with_user(UserType::Free, 1.0).await;
        let user = UserId::new("alice");

        // First bucket fits the free quota and the balance
        let charge = engine
            .process_storage_creation_billing(&user, StorageType::Bucket, 10, 30, "b-1")
            .await
            .unwrap();
        assert_eq!(charge.cost, dec!(0.2000));

        store
            .create_storage_resource("b-1", &user, StorageType::Bucket, "bucket-one", 10)
            .await
            .unwrap();

        // Second bucket exceeds the free quota of 1
        let err = engine
            .process_storage_creation_billing(&user, StorageType::Bucket, 10, 30, "b-2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // A filestore that prices out is rejected with no ledger row
        let err = engine
            .process_storage_creation_billing(&user, StorageType::Filestore, 100, 30, "f-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn test_billing_summary_from_ledger() {
        let (_store, engine) = engine_with_user(UserType::Free, 0.0).await;
        let user = UserId::new("alice");

        engine.purchase_credits(&user, dec!(50.00), "test").await.unwrap();
        engine
            .process_storage_creation_billing(&user, StorageType::Bucket, 10, 30, "b-1")
            .await
            .unwrap();

        let summary = engine.get_user_billing_summary(&user, None, None).await.unwrap();
        assert_eq!(summary.total_credits_added, dec!(50.00));
        assert_eq!(summary.total_credits_used, dec!(0.20));
        assert_eq!(summary.net_change, dec!(49.80));
        assert_eq!(summary.current_balance, dec!(49.80));
        assert_eq!(summary.transaction_count, 2);
    }
}
