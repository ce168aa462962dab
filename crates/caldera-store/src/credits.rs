use caldera_common::error::{Error, Result};
use caldera_common::types::{CreditBalance, CreditTransaction, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{map_sqlx_error, parse_decimal, parse_timestamp, Store};

fn row_to_transaction(row: &SqliteRow) -> Result<CreditTransaction> {
    Ok(CreditTransaction {
        transaction_id: row
            .try_get("transaction_id")
            .map_err(|e| Error::database("transaction_id", e))?,
        user_id: UserId::new(
            row.try_get::<String, _>("user_id")
                .map_err(|e| Error::database("user_id", e))?,
        ),
        amount: parse_decimal(row, "amount")?,
        source: row
            .try_get("source")
            .map_err(|e| Error::database("source", e))?,
        description: row
            .try_get("description")
            .map_err(|e| Error::database("description", e))?,
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::database("session_id", e))?,
        storage_resource_id: row
            .try_get("storage_resource_id")
            .map_err(|e| Error::database("storage_resource_id", e))?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

impl Store {
    pub async fn get_user_credits(&self, user_id: &UserId) -> Result<CreditBalance> {
        let raw: Option<String> = sqlx::query_scalar("SELECT credits FROM users WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_user_credits", e))?;

        let raw = raw.ok_or_else(|| Error::not_found(format!("user {user_id}")))?;
        let balance = Decimal::from_str(&raw).map_err(|e| Error::database("credits", e))?;
        Ok(CreditBalance::from_decimal(balance))
    }

    /// Add credits to a user's balance, appending a ledger entry in the same
    /// transaction.
    pub async fn add_credits(
        &self,
        user_id: &UserId,
        amount: CreditBalance,
        source: &str,
        description: Option<&str>,
    ) -> Result<CreditBalance> {
        if !amount.is_positive() {
            return Err(Error::invalid_input("credit amount must be positive"));
        }

        let _guard = self.write_lock.lock().await;

        let current = self.get_user_credits(user_id).await?;
        let new_balance = current.add(amount);

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("add_credits", e))?;

        sqlx::query("UPDATE users SET credits = ?, updated_at = ? WHERE user_id = ?")
            .bind(new_balance.as_decimal().to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("add_credits", e))?;

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (transaction_id, user_id, amount, source, description, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.as_str())
        .bind(amount.as_decimal().to_string())
        .bind(source)
        .bind(description)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("add_credits", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("add_credits", e))?;

        debug!(user_id = %user_id, amount = %amount, source = %source, "Credits added");

        Ok(new_balance)
    }

    /// Deduct credits from a user's balance, appending a negative ledger
    /// entry in the same transaction. Fails without writing anything when
    /// the balance is insufficient.
    pub async fn deduct_credits(
        &self,
        user_id: &UserId,
        amount: CreditBalance,
        reason: &str,
        session_id: Option<&str>,
        storage_resource_id: Option<&str>,
    ) -> Result<CreditBalance> {
        if !amount.is_positive() {
            return Err(Error::invalid_input("deduction amount must be positive"));
        }

        let _guard = self.write_lock.lock().await;

        let current = self.get_user_credits(user_id).await?;
        let new_balance = current.subtract(amount).ok_or({
            Error::InsufficientCredits {
                available: current.as_decimal(),
                required: amount.as_decimal(),
            }
        })?;

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("deduct_credits", e))?;

        sqlx::query("UPDATE users SET credits = ?, updated_at = ? WHERE user_id = ?")
            .bind(new_balance.as_decimal().to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("deduct_credits", e))?;

        sqlx::query(
            r#"
            INSERT INTO credit_transactions
            (transaction_id, user_id, amount, source, description, session_id, storage_resource_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.as_str())
        .bind((-amount.as_decimal()).to_string())
        .bind(reason)
        .bind(reason)
        .bind(session_id)
        .bind(storage_resource_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("deduct_credits", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("deduct_credits", e))?;

        if new_balance.is_zero() {
            warn!(user_id = %user_id, "User balance exhausted");
        }

        Ok(new_balance)
    }

    /// Ledger rows for a user, newest first; totally ordered by created_at
    /// with insertion order breaking ties.
    pub async fn get_credit_history(
        &self,
        user_id: &UserId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<CreditTransaction>> {
        let mut query =
            String::from("SELECT * FROM credit_transactions WHERE user_id = ?");
        if start.is_some() {
            query.push_str(" AND created_at >= ?");
        }
        if end.is_some() {
            query.push_str(" AND created_at <= ?");
        }
        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut q = sqlx::query(&query).bind(user_id.as_str());
        if let Some(start) = start {
            q = q.bind(start.to_rfc3339());
        }
        if let Some(end) = end {
            q = q.bind(end.to_rfc3339());
        }

        let rows = q
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_credit_history", e))?;

        rows.iter().map(row_to_transaction).collect()
    }
}
