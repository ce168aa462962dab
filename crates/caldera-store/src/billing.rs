use caldera_common::error::{Error, Result};
use caldera_common::types::{BillingStatus, UserId, WorkspaceId};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{ActiveSessionRow, SessionBillingRecord};
use crate::store::{
    map_sqlx_error, parse_decimal, parse_decimal_opt, parse_timestamp, parse_timestamp_opt, Store,
};

fn row_to_billing(row: &SqliteRow) -> Result<SessionBillingRecord> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| Error::database("status", e))?;

    Ok(SessionBillingRecord {
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::database("session_id", e))?,
        user_id: UserId::new(
            row.try_get::<String, _>("user_id")
                .map_err(|e| Error::database("user_id", e))?,
        ),
        hourly_rate: parse_decimal(row, "hourly_rate")?,
        start_time: parse_timestamp(row, "start_time")?,
        end_time: parse_timestamp_opt(row, "end_time")?,
        total_hours: parse_decimal_opt(row, "total_hours")?,
        total_cost: parse_decimal_opt(row, "total_cost")?,
        status: BillingStatus::from_str(&status_raw)
            .map_err(|msg| Error::Internal { message: msg })?,
    })
}

impl Store {
    /// Open the billing row for a session. A session has at most one row;
    /// a second start is a conflict.
    pub async fn start_session_billing(
        &self,
        session_id: &str,
        user_id: &UserId,
        hourly_rate: Decimal,
    ) -> Result<SessionBillingRecord> {
        if hourly_rate < Decimal::ZERO {
            return Err(Error::invalid_input("hourly rate must be non-negative"));
        }

        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO session_billing (session_id, user_id, hourly_rate, start_time, status)
            VALUES (?, ?, ?, ?, 'active')
            "#,
        )
        .bind(session_id)
        .bind(user_id.as_str())
        .bind(hourly_rate.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("start_session_billing", e))?;

        info!(session_id = %session_id, user_id = %user_id, hourly_rate = %hourly_rate, "Session billing started");

        drop(_guard);
        self.get_session_billing_info(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("billing row for session {session_id}")))
    }

    /// Close an active billing row and deduct the final cost, atomically.
    ///
    /// Returns `false` when no active row exists (already stopped, or never
    /// started) — concurrent stops are idempotent. When the user's balance
    /// cannot cover the cost the deduction is clamped so the balance lands
    /// at zero and the row still completes.
    pub async fn stop_session_billing(
        &self,
        session_id: &str,
        total_hours: Decimal,
    ) -> Result<bool> {
        if total_hours < Decimal::ZERO {
            return Err(Error::invalid_input("total hours must be non-negative"));
        }

        let _guard = self.write_lock.lock().await;

        let Some(billing) = self.get_session_billing_info(session_id).await? else {
            return Ok(false);
        };
        if billing.status != BillingStatus::Active {
            return Ok(false);
        }

        let total_hours = total_hours.round_dp(6);
        let total_cost = (billing.hourly_rate * total_hours).round_dp(4);

        let balance_raw: Option<String> =
            sqlx::query_scalar("SELECT credits FROM users WHERE user_id = ?")
                .bind(billing.user_id.as_str())
                .fetch_optional(self.pool())
                .await
                .map_err(|e| map_sqlx_error("stop_session_billing", e))?;
        let balance = balance_raw
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);

        // The session is over either way; an under-funded user pays what is
        // left and lands at exactly zero.
        let deduction = if total_cost > balance {
            warn!(
                session_id = %session_id,
                user_id = %billing.user_id,
                cost = %total_cost,
                balance = %balance,
                "Final session cost exceeds balance, clamping deduction"
            );
            balance
        } else {
            total_cost
        };
        let new_balance = balance - deduction;

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("stop_session_billing", e))?;

        let result = sqlx::query(
            r#"
            UPDATE session_billing
            SET end_time = ?, total_hours = ?, total_cost = ?, status = 'completed'
            WHERE session_id = ? AND status = 'active'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(total_hours.to_string())
        .bind(total_cost.to_string())
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("stop_session_billing", e))?;

        if result.rows_affected() == 0 {
            // Lost the race to a concurrent stop; nothing to deduct
            return Ok(false);
        }

        if deduction > Decimal::ZERO {
            sqlx::query("UPDATE users SET credits = ?, updated_at = ? WHERE user_id = ?")
                .bind(new_balance.to_string())
                .bind(Utc::now().to_rfc3339())
                .bind(billing.user_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("stop_session_billing", e))?;

            sqlx::query(
                r#"
                INSERT INTO credit_transactions
                (transaction_id, user_id, amount, source, description, session_id, created_at)
                VALUES (?, ?, ?, 'session runtime', 'session runtime', ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(billing.user_id.as_str())
            .bind((-deduction).to_string())
            .bind(session_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("stop_session_billing", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("stop_session_billing", e))?;

        info!(
            session_id = %session_id,
            total_hours = %total_hours,
            total_cost = %total_cost,
            "Session billing stopped"
        );

        Ok(true)
    }

    pub async fn get_session_billing_info(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionBillingRecord>> {
        let row = sqlx::query("SELECT * FROM session_billing WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_session_billing_info", e))?;

        row.as_ref().map(row_to_billing).transpose()
    }

    /// Running sessions joined with their active billing rows — the view
    /// the session monitor iterates.
    pub async fn list_active_sessions_for_monitor(&self) -> Result<Vec<ActiveSessionRow>> {
        let rows = sqlx::query(
            r#"
            SELECT s.session_id, s.workspace_id, s.provider,
                   sb.user_id, sb.hourly_rate, sb.start_time
            FROM sessions s
            JOIN session_billing sb ON s.session_id = sb.session_id
            WHERE s.status = 'running' AND sb.status = 'active'
            ORDER BY sb.start_time
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_active_sessions_for_monitor", e))?;

        rows.iter()
            .map(|row| {
                Ok(ActiveSessionRow {
                    session_id: row
                        .try_get("session_id")
                        .map_err(|e| Error::database("session_id", e))?,
                    workspace_id: WorkspaceId::new(
                        row.try_get::<String, _>("workspace_id")
                            .map_err(|e| Error::database("workspace_id", e))?,
                    ),
                    user_id: UserId::new(
                        row.try_get::<String, _>("user_id")
                            .map_err(|e| Error::database("user_id", e))?,
                    ),
                    provider: row
                        .try_get("provider")
                        .map_err(|e| Error::database("provider", e))?,
                    hourly_rate: parse_decimal(row, "hourly_rate")?,
                    billing_start_time: parse_timestamp(row, "start_time")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NewUser, SessionUpdate};
    use caldera_common::types::{CreditBalance, SessionStatus, UserType};
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn store_with_session(credits: CreditBalance) -> Store {
        let store = Store::for_testing().await.unwrap();
        store
            .create_user(NewUser {
                user_id: UserId::new("alice"),
                email: "alice@example.com".to_string(),
                name: "alice".to_string(),
                user_type: UserType::Pro,
                initial_credits: credits,
            })
            .await
            .unwrap();
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
        store
    }

    #[tokio::test]
    async fn test_start_twice_conflicts() {
        let store = store_with_session(CreditBalance::from_f64(10.0).unwrap()).await;

        store
            .start_session_billing("s-1", &UserId::new("alice"), dec!(0.05))
            .await
            .unwrap();
        let err = store
            .start_session_billing("s-1", &UserId::new("alice"), dec!(0.05))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_stop_completes_row_and_deducts() {
        let store = store_with_session(CreditBalance::from_f64(25.0).unwrap()).await;
        let user = UserId::new("alice");

        store
            .start_session_billing("s-1", &user, dec!(0.0375))
            .await
            .unwrap();
        assert!(store
            .stop_session_billing("s-1", dec!(2.0))
            .await
            .unwrap());

        let billing = store
            .get_session_billing_info("s-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(billing.status, BillingStatus::Completed);
        assert_eq!(billing.total_hours, Some(dec!(2.0)));
        assert_eq!(billing.total_cost, Some(dec!(0.0750)));
        assert!(billing.end_time.unwrap() >= billing.start_time);

        let balance = store.get_user_credits(&user).await.unwrap();
        assert_eq!(balance.as_decimal(), dec!(24.9250));

        // Deduction is attributed to the session in the ledger
        let history = store.get_credit_history(&user, None, None).await.unwrap();
        assert_eq!(history[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(history[0].amount, dec!(-0.0750));
    }

    #[tokio::test]
    async fn test_double_stop_is_idempotent() {
        let store = store_with_session(CreditBalance::from_f64(10.0).unwrap()).await;
        let user = UserId::new("alice");

        store
            .start_session_billing("s-1", &user, dec!(0.05))
            .await
            .unwrap();
        assert!(store.stop_session_billing("s-1", dec!(1.0)).await.unwrap());
        assert!(!store.stop_session_billing("s-1", dec!(1.0)).await.unwrap());

        // Only one debit row
        let history = store.get_credit_history(&user, None, None).await.unwrap();
        let debits = history.iter().filter(|t| !t.is_credit()).count();
        assert_eq!(debits, 1);
    }

    #[tokio::test]
    async fn test_stop_clamps_deduction_to_balance() {
        let store = store_with_session(CreditBalance::from_f64(0.01).unwrap()).await;
        let user = UserId::new("alice");

        store
            .start_session_billing("s-1", &user, dec!(0.05))
            .await
            .unwrap();
        assert!(store.stop_session_billing("s-1", dec!(10.0)).await.unwrap());

        let billing = store
            .get_session_billing_info("s-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(billing.total_cost, Some(dec!(0.5000)));

        // Balance drained to exactly zero, never negative
        let balance = store.get_user_credits(&user).await.unwrap();
        assert!(balance.is_zero());
    }

    #[tokio::test]
    async fn test_monitor_view_joins_running_and_active() {
        let store = store_with_session(CreditBalance::from_f64(10.0).unwrap()).await;
        let user = UserId::new("alice");

        store
            .start_session_billing("s-1", &user, dec!(0.05))
            .await
            .unwrap();

        // Not yet running, so not visible to the monitor
        assert!(store
            .list_active_sessions_for_monitor()
            .await
            .unwrap()
            .is_empty());

        store
            .update_session(
                "s-1",
                SessionUpdate {
                    status: Some(SessionStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store.list_active_sessions_for_monitor().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s-1");
        assert_eq!(active[0].user_id, user);
        assert_eq!(active[0].hourly_rate, dec!(0.05));

        // Completed billing drops the session from the view
        store.stop_session_billing("s-1", dec!(0.5)).await.unwrap();
        assert!(store
            .list_active_sessions_for_monitor()
            .await
            .unwrap()
            .is_empty());
    }
}
