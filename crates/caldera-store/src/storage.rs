use caldera_common::error::{Error, Result};
use caldera_common::types::{AccessMode, StorageType, UserId, WorkspaceId};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;

use crate::entities::{SessionAttachmentRecord, StorageResourceRecord};
use crate::store::{map_sqlx_error, parse_timestamp, parse_timestamp_opt, Store};

fn row_to_storage(row: &SqliteRow) -> Result<StorageResourceRecord> {
    let storage_type_raw: String = row
        .try_get("storage_type")
        .map_err(|e| Error::database("storage_type", e))?;
    let access_mode_raw: String = row
        .try_get("access_mode")
        .map_err(|e| Error::database("access_mode", e))?;
    let workspace_id: Option<String> = row
        .try_get("workspace_id")
        .map_err(|e| Error::database("workspace_id", e))?;

    Ok(StorageResourceRecord {
        resource_id: row
            .try_get("resource_id")
            .map_err(|e| Error::database("resource_id", e))?,
        user_id: UserId::new(
            row.try_get::<String, _>("user_id")
                .map_err(|e| Error::database("user_id", e))?,
        ),
        workspace_id: workspace_id.map(WorkspaceId::new),
        storage_type: StorageType::from_str(&storage_type_raw)
            .map_err(|msg| Error::Internal { message: msg })?,
        resource_name: row
            .try_get("resource_name")
            .map_err(|e| Error::database("resource_name", e))?,
        size_gb: row
            .try_get("size_gb")
            .map_err(|e| Error::database("size_gb", e))?,
        state: row
            .try_get("state")
            .map_err(|e| Error::database("state", e))?,
        is_default: row
            .try_get::<i64, _>("is_default")
            .map_err(|e| Error::database("is_default", e))?
            != 0,
        auto_mount: row
            .try_get::<i64, _>("auto_mount")
            .map_err(|e| Error::database("auto_mount", e))?
            != 0,
        mount_path: row
            .try_get("mount_path")
            .map_err(|e| Error::database("mount_path", e))?,
        access_mode: AccessMode::from_str(&access_mode_raw)
            .map_err(|msg| Error::Internal { message: msg })?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn row_to_attachment(row: &SqliteRow) -> Result<SessionAttachmentRecord> {
    let access_mode_raw: String = row
        .try_get("access_mode")
        .map_err(|e| Error::database("access_mode", e))?;

    Ok(SessionAttachmentRecord {
        session_id: row
            .try_get("session_id")
            .map_err(|e| Error::database("session_id", e))?,
        storage_id: row
            .try_get("storage_id")
            .map_err(|e| Error::database("storage_id", e))?,
        mount_path: row
            .try_get("mount_path")
            .map_err(|e| Error::database("mount_path", e))?,
        access_mode: AccessMode::from_str(&access_mode_raw)
            .map_err(|msg| Error::Internal { message: msg })?,
        attached_at: parse_timestamp(row, "attached_at")?,
        detached_at: parse_timestamp_opt(row, "detached_at")?,
    })
}

impl Store {
    pub async fn create_storage_resource(
        &self,
        resource_id: &str,
        user_id: &UserId,
        storage_type: StorageType,
        resource_name: &str,
        size_gb: i64,
    ) -> Result<StorageResourceRecord> {
        sqlx::query(
            r#"
            INSERT INTO storage_resources (resource_id, user_id, storage_type, resource_name, size_gb, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(resource_id)
        .bind(user_id.as_str())
        .bind(storage_type.as_str())
        .bind(resource_name)
        .bind(size_gb)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("create_storage_resource", e))?;

        self.get_storage_resource(resource_id).await
    }

    pub async fn get_storage_resource(&self, resource_id: &str) -> Result<StorageResourceRecord> {
        let row = sqlx::query("SELECT * FROM storage_resources WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_storage_resource", e))?
            .ok_or_else(|| Error::not_found(format!("storage resource {resource_id}")))?;

        row_to_storage(&row)
    }

    /// Update mount behavior for a storage resource
    pub async fn update_storage_mount(
        &self,
        resource_id: &str,
        auto_mount: bool,
        mount_path: Option<&str>,
        access_mode: AccessMode,
    ) -> Result<StorageResourceRecord> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE storage_resources
            SET auto_mount = ?, mount_path = ?, access_mode = ?
            WHERE resource_id = ?
            "#,
        )
        .bind(auto_mount as i64)
        .bind(mount_path)
        .bind(access_mode.as_str())
        .bind(resource_id)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("update_storage_mount", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("storage resource {resource_id}")));
        }

        drop(_guard);
        self.get_storage_resource(resource_id).await
    }

    /// Count a user's storage resources of one type; used by quota checks.
    pub async fn count_storage_resources(
        &self,
        user_id: &UserId,
        storage_type: StorageType,
    ) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM storage_resources WHERE user_id = ? AND storage_type = ?",
        )
        .bind(user_id.as_str())
        .bind(storage_type.as_str())
        .fetch_one(self.pool())
        .await
        .map_err(|e| map_sqlx_error("count_storage_resources", e))
    }

    pub async fn assign_storage_to_workspace(
        &self,
        resource_id: &str,
        workspace_id: &WorkspaceId,
    ) -> Result<StorageResourceRecord> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "UPDATE storage_resources SET workspace_id = ? WHERE resource_id = ?",
        )
        .bind(workspace_id.as_str())
        .bind(resource_id)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("assign_storage_to_workspace", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("storage resource {resource_id}")));
        }

        drop(_guard);
        self.get_storage_resource(resource_id).await
    }

    /// Make one resource the default for its `(workspace, storage_type)`
    /// pair, clearing any previous default and mirroring the choice onto
    /// the workspace row — all in one transaction.
    pub async fn set_workspace_default_storage(
        &self,
        workspace_id: &WorkspaceId,
        storage_type: StorageType,
        resource_id: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let resource = self.get_storage_resource(resource_id).await?;
        if resource.storage_type != storage_type {
            return Err(Error::invalid_input(format!(
                "resource {resource_id} is {}, not {}",
                resource.storage_type, storage_type
            )));
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("set_workspace_default_storage", e))?;

        sqlx::query(
            r#"
            UPDATE storage_resources SET is_default = 0
            WHERE workspace_id = ? AND storage_type = ? AND is_default = 1
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(storage_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_workspace_default_storage", e))?;

        sqlx::query(
            "UPDATE storage_resources SET workspace_id = ?, is_default = 1 WHERE resource_id = ?",
        )
        .bind(workspace_id.as_str())
        .bind(resource_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_workspace_default_storage", e))?;

        let column = match storage_type {
            StorageType::Bucket => "default_bucket_id",
            StorageType::Filestore => "default_filestore_id",
        };
        sqlx::query(&format!(
            "UPDATE workspaces SET {column} = ?, updated_at = ? WHERE workspace_id = ?"
        ))
        .bind(resource_id)
        .bind(Utc::now().to_rfc3339())
        .bind(workspace_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_workspace_default_storage", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("set_workspace_default_storage", e))?;

        debug!(workspace_id = %workspace_id, resource_id = %resource_id, storage_type = %storage_type, "Workspace default storage set");

        Ok(())
    }

    pub async fn list_workspace_storage(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<StorageResourceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM storage_resources WHERE workspace_id = ? ORDER BY created_at",
        )
        .bind(workspace_id.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_workspace_storage", e))?;

        rows.iter().map(row_to_storage).collect()
    }

    pub async fn attach_session_storage(
        &self,
        session_id: &str,
        storage_id: &str,
        mount_path: &str,
        access_mode: AccessMode,
    ) -> Result<SessionAttachmentRecord> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO session_attachments (session_id, storage_id, mount_path, access_mode, attached_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(storage_id)
        .bind(mount_path)
        .bind(access_mode.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("attach_session_storage", e))?;

        drop(_guard);

        let attachments = self.list_session_attachments(session_id).await?;
        attachments
            .into_iter()
            .find(|a| a.storage_id == storage_id)
            .ok_or_else(|| Error::not_found(format!("attachment {session_id}/{storage_id}")))
    }

    /// Mark an attachment detached; the row is kept for attachment history.
    pub async fn detach_session_storage(
        &self,
        session_id: &str,
        storage_id: &str,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE session_attachments SET detached_at = ?
            WHERE session_id = ? AND storage_id = ? AND detached_at IS NULL
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(storage_id)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("detach_session_storage", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_session_attachments(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionAttachmentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM session_attachments WHERE session_id = ? ORDER BY attached_at",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_session_attachments", e))?;

        rows.iter().map(row_to_attachment).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NewUser;
    use caldera_common::types::{CreditBalance, UserType};
    use serde_json::json;

    async fn seeded_store() -> Store {
        let store = Store::for_testing().await.unwrap();
        store
            .create_user(NewUser {
                user_id: UserId::new("alice"),
                email: "alice@example.com".to_string(),
                name: "alice".to_string(),
                user_type: UserType::Pro,
                initial_credits: CreditBalance::from_f64(50.0).unwrap(),
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
    async fn test_default_storage_is_unique_per_type() {
        let store = seeded_store().await;
        let ws = WorkspaceId::new("ws-1");
        let user = UserId::new("alice");

        store
            .create_storage_resource("b-1", &user, StorageType::Bucket, "bucket-one", 10)
            .await
            .unwrap();
        store
            .create_storage_resource("b-2", &user, StorageType::Bucket, "bucket-two", 10)
            .await
            .unwrap();

        store
            .set_workspace_default_storage(&ws, StorageType::Bucket, "b-1")
            .await
            .unwrap();
        store
            .set_workspace_default_storage(&ws, StorageType::Bucket, "b-2")
            .await
            .unwrap();

        let storage = store.list_workspace_storage(&ws).await.unwrap();
        let defaults: Vec<_> = storage.iter().filter(|s| s.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].resource_id, "b-2");

        // Workspace row mirrors the default
        let workspace = store.get_workspace(&ws).await.unwrap();
        assert_eq!(workspace.default_bucket_id.as_deref(), Some("b-2"));
    }

    #[tokio::test]
    async fn test_default_rejects_type_mismatch() {
        let store = seeded_store().await;
        let user = UserId::new("alice");

        store
            .create_storage_resource("f-1", &user, StorageType::Filestore, "fs-one", 20)
            .await
            .unwrap();

        let err = store
            .set_workspace_default_storage(&WorkspaceId::new("ws-1"), StorageType::Bucket, "f-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_attach_detach_lifecycle() {
        let store = seeded_store().await;
        let user = UserId::new("alice");

        store
            .create_session(&WorkspaceId::new("ws-1"), "s-1", "pods", &json!({}))
            .await
            .unwrap();
        store
            .create_storage_resource("b-1", &user, StorageType::Bucket, "bucket-one", 10)
            .await
            .unwrap();

        let attachment = store
            .attach_session_storage("s-1", "b-1", "/mnt/bucket", AccessMode::ReadWrite)
            .await
            .unwrap();
        assert!(attachment.detached_at.is_none());

        assert!(store.detach_session_storage("s-1", "b-1").await.unwrap());
        // Second detach is a no-op
        assert!(!store.detach_session_storage("s-1", "b-1").await.unwrap());

        let attachments = store.list_session_attachments("s-1").await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].detached_at.is_some());
    }

    #[tokio::test]
    async fn test_assign_storage_to_workspace() {
        let store = seeded_store().await;
        let user = UserId::new("alice");

        store
            .create_storage_resource("b-1", &user, StorageType::Bucket, "bucket-one", 10)
            .await
            .unwrap();
        let assigned = store
            .assign_storage_to_workspace("b-1", &WorkspaceId::new("ws-1"))
            .await
            .unwrap();
        assert_eq!(assigned.workspace_id, Some(WorkspaceId::new("ws-1")));

        let err = store
            .assign_storage_to_workspace("missing", &WorkspaceId::new("ws-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_quota_counting() {
        let store = seeded_store().await;
        let user = UserId::new("alice");

        store
            .create_storage_resource("b-1", &user, StorageType::Bucket, "bucket-one", 10)
            .await
            .unwrap();
        store
            .create_storage_resource("f-1", &user, StorageType::Filestore, "fs-one", 20)
            .await
            .unwrap();

        assert_eq!(
            store
                .count_storage_resources(&user, StorageType::Bucket)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .count_storage_resources(&user, StorageType::Filestore)
                .await
                .unwrap(),
            1
        );
    }
}
