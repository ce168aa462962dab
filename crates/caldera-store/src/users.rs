use caldera_common::error::{Error, Result};
use caldera_common::types::{CreditBalance, UserId, UserType};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::entities::{NewUser, UserRecord, UserUpdate};
use crate::store::{map_sqlx_error, parse_decimal, parse_timestamp, Store};

fn row_to_user(row: &SqliteRow) -> Result<UserRecord> {
    let user_type_raw: String = row
        .try_get("user_type")
        .map_err(|e| Error::database("user_type", e))?;

    Ok(UserRecord {
        user_id: UserId::new(
            row.try_get::<String, _>("user_id")
                .map_err(|e| Error::database("user_id", e))?,
        ),
        email: row
            .try_get("email")
            .map_err(|e| Error::database("email", e))?,
        name: row
            .try_get("name")
            .map_err(|e| Error::database("name", e))?,
        user_type: UserType::from_str(&user_type_raw)
            .map_err(|msg| Error::Internal { message: msg })?,
        credits: CreditBalance::from_decimal(parse_decimal(row, "credits")?),
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

impl Store {
    pub async fn create_user(&self, new_user: NewUser) -> Result<UserRecord> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, name, user_type, credits, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new_user.user_id.as_str())
        .bind(&new_user.email)
        .bind(&new_user.name)
        .bind(new_user.user_type.as_str())
        .bind(new_user.initial_credits.as_decimal().to_string())
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;

        info!(user_id = %new_user.user_id, user_type = %new_user.user_type, "User created");

        self.get_user(&new_user.user_id).await
    }

    pub async fn get_user(&self, user_id: &UserId) -> Result<UserRecord> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?
            .ok_or_else(|| Error::not_found(format!("user {user_id}")))?;

        row_to_user(&row)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_user_by_email", e))?;

        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("list_users", e))?;

        rows.iter().map(row_to_user).collect()
    }

    pub async fn update_user(&self, user_id: &UserId, update: UserUpdate) -> Result<UserRecord> {
        let _guard = self.write_lock.lock().await;

        let current = self.get_user(user_id).await?;
        let email = update.email.unwrap_or(current.email);
        let name = update.name.unwrap_or(current.name);
        let user_type = update.user_type.unwrap_or(current.user_type);

        sqlx::query(
            r#"
            UPDATE users
            SET email = ?, name = ?, user_type = ?, updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(&email)
        .bind(&name)
        .bind(user_type.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.as_str())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("update_user", e))?;

        drop(_guard);
        self.get_user(user_id).await
    }

    /// Delete a user; workspaces, sessions, billing rows, ledger entries,
    /// and storage resources cascade.
    pub async fn delete_user(&self, user_id: &UserId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM users WHERE user_id = ?")
            .bind(user_id.as_str())
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;

        Ok(result.rows_affected() > 0)
    }
}
