use caldera_common::error::{Error, Result};
use caldera_common::types::{SessionStatus, UserId, WorkspaceId};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use crate::entities::{SessionRecord, SessionUpdate};
use crate::store::{map_sqlx_error, parse_timestamp, Store};

fn row_to_session(row: &SqliteRow) -> Result<SessionRecord> {
    let status_raw: String = row
        .try_get("status")
        .map_err(|e| Error::database("status", e))?;
    let storage_raw: String = row
        .try_get("storage_config")
        .map_err(|e| Error::database("storage_config", e))?;
    let user_id: Option<String> = row
        .try_get("user_id")
        .map_err(|e| Error::database("user_id", e))?;

    Ok(SessionRecord {
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::database("session_id", e))?,
        workspace_id: WorkspaceId::new(
            row.try_get::<String, _>("workspace_id")
                .map_err(|e| Error::database("workspace_id", e))?,
        ),
        user_id: user_id.map(UserId::new),
        provider: row
            .try_get("provider")
            .map_err(|e| Error::database("provider", e))?,
        status: SessionStatus::from_str(&status_raw)
            .map_err(|msg| Error::Internal { message: msg })?,
        storage_config: serde_json::from_str(&storage_raw).unwrap_or(Value::Null),
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

impl Store {
    /// Persist a new session row. A duplicate client-generated id is
    /// rejected by the primary key and surfaces as a conflict.
    pub async fn create_session(
        &self,
        workspace_id: &WorkspaceId,
        session_id: &str,
        provider: &str,
        storage_config: &Value,
    ) -> Result<SessionRecord> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, workspace_id, provider, storage_config, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'creating', ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(workspace_id.as_str())
        .bind(provider)
        .bind(storage_config.to_string())
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("create_session", e))?;

        debug!(session_id = %session_id, workspace_id = %workspace_id, provider = %provider, "Session row created");

        self.get_session(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord> {
        let _guard = self.write_lock.lock().await;

        let current = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))?;

        let status = update.status.unwrap_or(current.status);
        let user_id = update
            .user_id
            .map(|u| u.as_str().to_string())
            .or_else(|| current.user_id.as_ref().map(|u| u.as_str().to_string()));
        let storage_config = update.storage_config.unwrap_or(current.storage_config);

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, user_id = ?, storage_config = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(user_id)
        .bind(storage_config.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("update_session", e))?;

        drop(_guard);
        self.get_session(session_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_session", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_sessions(
        &self,
        workspace_id: Option<&WorkspaceId>,
    ) -> Result<Vec<SessionRecord>> {
        let rows = match workspace_id {
            Some(workspace_id) => {
                sqlx::query("SELECT * FROM sessions WHERE workspace_id = ? ORDER BY created_at")
                    .bind(workspace_id.as_str())
                    .fetch_all(self.pool())
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM sessions ORDER BY created_at")
                    .fetch_all(self.pool())
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("list_sessions", e))?;

        rows.iter().map(row_to_session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewUser;
    use caldera_common::types::{CreditBalance, UserType};
    use serde_json::json;

    async fn store_with_workspace() -> Store {
        let store = Store::for_testing().await.unwrap();
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
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = store_with_workspace().await;
        let ws = WorkspaceId::new("ws-1");

        let created = store
            .create_session(&ws, "s-1", "pods", &json!({"bucket": "b-1"}))
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Creating);
        assert_eq!(created.storage_config["bucket"], "b-1");

        let updated = store
            .update_session(
                "s-1",
                SessionUpdate {
                    status: Some(SessionStatus::Running),
                    user_id: Some(UserId::new("alice")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.user_id, Some(UserId::new("alice")));

        assert!(store.delete_session("s-1").await.unwrap());
        assert!(!store.delete_session("s-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_session_id_conflicts() {
        let store = store_with_workspace().await;
        let ws = WorkspaceId::new("ws-1");

        store
            .create_session(&ws, "s-1", "pods", &json!({}))
            .await
            .unwrap();
        let err = store
            .create_session(&ws, "s-1", "jobs", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_unrecognized_provider_round_trips() {
        let store = store_with_workspace().await;
        let ws = WorkspaceId::new("ws-1");

        // An unknown provider string is preserved verbatim; callers decide
        // how to reconstruct such rows.
        let created = store
            .create_session(&ws, "s-legacy", "workstations", &json!({}))
            .await
            .unwrap();
        assert_eq!(created.provider, "workstations");
        assert!(created.provider_kind().is_none());
    }

    #[tokio::test]
    async fn test_list_scoped_by_workspace() {
        let store = store_with_workspace().await;
        store
            .create_workspace(
                &WorkspaceId::new("ws-2"),
                &UserId::new("alice"),
                "other",
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
            .create_session(&WorkspaceId::new("ws-2"), "s-2", "jobs", &json!({}))
            .await
            .unwrap();

        let all = store.list_sessions(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let scoped = store
            .list_sessions(Some(&WorkspaceId::new("ws-2")))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].session_id, "s-2");
    }
}
