use caldera_common::error::{Error, Result};
use caldera_common::types::{UserId, WorkspaceId};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::entities::WorkspaceRecord;
use crate::store::{map_sqlx_error, parse_timestamp, Store};

fn row_to_workspace(row: &SqliteRow) -> Result<WorkspaceRecord> {
    Ok(WorkspaceRecord {
        workspace_id: WorkspaceId::new(
            row.try_get::<String, _>("workspace_id")
                .map_err(|e| Error::database("workspace_id", e))?,
        ),
        user_id: UserId::new(
            row.try_get::<String, _>("user_id")
                .map_err(|e| Error::database("user_id", e))?,
        ),
        name: row
            .try_get("name")
            .map_err(|e| Error::database("name", e))?,
        resource_package: row
            .try_get("resource_package")
            .map_err(|e| Error::database("resource_package", e))?,
        description: row
            .try_get("description")
            .map_err(|e| Error::database("description", e))?,
        default_bucket_id: row
            .try_get("default_bucket_id")
            .map_err(|e| Error::database("default_bucket_id", e))?,
        default_filestore_id: row
            .try_get("default_filestore_id")
            .map_err(|e| Error::database("default_filestore_id", e))?,
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

impl Store {
    pub async fn create_workspace(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &UserId,
        name: &str,
        resource_package: &str,
        description: Option<&str>,
    ) -> Result<WorkspaceRecord> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO workspaces (workspace_id, user_id, name, resource_package, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(user_id.as_str())
        .bind(name)
        .bind(resource_package)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("create_workspace", e))?;

        self.get_workspace(workspace_id).await
    }

    pub async fn get_workspace(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceRecord> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE workspace_id = ?")
            .bind(workspace_id.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_workspace", e))?
            .ok_or_else(|| Error::not_found(format!("workspace {workspace_id}")))?;

        row_to_workspace(&row)
    }

    pub async fn list_workspaces(&self, user_id: &UserId) -> Result<Vec<WorkspaceRecord>> {
        let rows = sqlx::query("SELECT * FROM workspaces WHERE user_id = ? ORDER BY created_at")
            .bind(user_id.as_str())
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("list_workspaces", e))?;

        rows.iter().map(row_to_workspace).collect()
    }

    pub async fn delete_workspace(&self, workspace_id: &WorkspaceId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM workspaces WHERE workspace_id = ?")
            .bind(workspace_id.as_str())
            .execute(self.pool())
            .await
            .map_err(|e| map_sqlx_error("delete_workspace", e))?;

        Ok(result.rows_affected() > 0)
    }
}
