//! User account service: registration with signup bonus, profile lookups,
//! tier changes. Balance mutations all route through the store's credit
//! primitives so the ledger stays authoritative.

use std::sync::Arc;

use caldera_common::config::BillingConfig;
use caldera_common::error::{Error, Result};
use caldera_common::types::{CreditBalance, CreditTransaction, UserId, UserType};
use caldera_store::{NewUser, Store, UserRecord, UserUpdate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user: UserRecord,
    pub balance: Decimal,
    pub recent_transactions: Vec<CreditTransaction>,
}

pub struct UserService {
    store: Arc<Store>,
    pricing: BillingConfig,
}

impl UserService {
    pub fn new(store: Arc<Store>, pricing: BillingConfig) -> Self {
        Self { store, pricing }
    }

    /// Create an account and grant the tier's signup bonus through the
    /// ledger. Duplicate ids or emails surface as conflicts.
    pub async fn register_user(
        &self,
        user_id: &UserId,
        email: &str,
        name: &str,
        user_type: UserType,
    ) -> Result<UserRecord> {
        if let Some(existing) = self.store.get_user_by_email(email).await? {
            return Err(Error::conflict(format!(
                "email {email} already registered to {}",
                existing.user_id
            )));
        }

        self.store
            .create_user(NewUser {
                user_id: user_id.clone(),
                email: email.to_string(),
                name: name.to_string(),
                user_type,
                initial_credits: CreditBalance::zero(),
            })
            .await?;

        let bonus = self.pricing.credit_bonuses.for_user_type(user_type);
        if bonus > Decimal::ZERO {
            self.store
                .add_credits(
                    user_id,
                    CreditBalance::from_decimal(bonus),
                    "signup_bonus",
                    Some(&format!("Signup bonus for {user_type} tier")),
                )
                .await?;
        }

        info!(user_id = %user_id, user_type = %user_type, bonus = %bonus, "User registered");

        self.store.get_user(user_id).await
    }

    pub async fn get_profile(&self, user_id: &UserId) -> Result<UserProfile> {
        let user = self.store.get_user(user_id).await?;
        let balance = self.store.get_user_credits(user_id).await?;
        let mut recent_transactions = self.store.get_credit_history(user_id, None, None).await?;
        recent_transactions.truncate(20);

        Ok(UserProfile {
            user,
            balance: balance.as_decimal(),
            recent_transactions,
        })
    }

    /// Move a user to another tier; takes effect for sessions billed after
    /// the change (open billing rows keep their locked-in rate).
    pub async fn change_user_type(
        &self,
        user_id: &UserId,
        user_type: UserType,
    ) -> Result<UserRecord> {
        let updated = self
            .store
            .update_user(
                user_id,
                UserUpdate {
                    user_type: Some(user_type),
                    ..Default::default()
                },
            )
            .await?;

        info!(user_id = %user_id, user_type = %user_type, "User tier changed");
        Ok(updated)
    }

    /// Remove the account; workspaces, sessions, billing rows, and the
    /// ledger cascade.
    pub async fn delete_user(&self, user_id: &UserId) -> Result<bool> {
        self.store.delete_user(user_id).await
    }
}
