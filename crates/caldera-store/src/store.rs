use std::str::FromStr;
use std::sync::Arc;

use caldera_common::error::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::info;

/// Durable system-of-record backed by an embedded SQLite database.
///
/// Multi-statement writes are serialized through a process-wide lock; all
/// multi-row invariants (credit deduction + ledger append, billing stop +
/// deduction) commit as one transaction.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    pub(crate) write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Get access to the underlying database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn for_testing() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::database("connect", e))?;
        Self::connect_and_migrate(options, true).await
    }

    pub async fn new(database_path: &str) -> Result<Self> {
        let path = database_path
            .strip_prefix("sqlite:")
            .unwrap_or(database_path);
        if path == ":memory:" {
            return Self::for_testing().await;
        }

        Self::connect_and_migrate(SqliteConnectOptions::new().filename(path), false).await
    }

    async fn connect_and_migrate(
        options: SqliteConnectOptions,
        single_connection: bool,
    ) -> Result<Self> {
        // SQLite tuned for concurrent use; these options apply to every
        // pooled connection
        let mut options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_millis(5000));
        if !single_connection {
            // WAL only applies to file-backed databases
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // An in-memory database exists per connection; pin the pool to one
        // long-lived connection so every caller sees the same data
        let mut pool_options = SqlitePoolOptions::new();
        if single_connection {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| Error::database("connect", e))?;

        let instance = Self::with_pool(pool);
        instance.run_migrations().await?;

        Ok(instance)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                user_type TEXT NOT NULL DEFAULT 'free',
                credits TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workspaces (
                workspace_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                resource_package TEXT NOT NULL,
                description TEXT,
                default_bucket_id TEXT,
                default_filestore_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users (user_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                storage_config TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'creating',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (workspace_id) REFERENCES workspaces (workspace_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS session_billing (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                hourly_rate TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                total_hours TEXT,
                total_cost TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                FOREIGN KEY (user_id) REFERENCES users (user_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS credit_transactions (
                transaction_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                source TEXT NOT NULL,
                description TEXT,
                session_id TEXT,
                storage_resource_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users (user_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS storage_resources (
                resource_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                workspace_id TEXT,
                storage_type TEXT NOT NULL,
                resource_name TEXT NOT NULL,
                size_gb INTEGER NOT NULL DEFAULT 10,
                state TEXT NOT NULL DEFAULT 'ready',
                is_default INTEGER NOT NULL DEFAULT 0,
                auto_mount INTEGER NOT NULL DEFAULT 0,
                mount_path TEXT,
                access_mode TEXT NOT NULL DEFAULT 'RW',
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users (user_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS session_attachments (
                session_id TEXT NOT NULL,
                storage_id TEXT NOT NULL,
                mount_path TEXT NOT NULL,
                access_mode TEXT NOT NULL DEFAULT 'RW',
                attached_at TEXT NOT NULL,
                detached_at TEXT,
                PRIMARY KEY (session_id, storage_id),
                FOREIGN KEY (session_id) REFERENCES sessions (session_id) ON DELETE CASCADE,
                FOREIGN KEY (storage_id) REFERENCES storage_resources (resource_id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database("run_migrations", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workspaces_user ON workspaces(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_billing_status ON session_billing(status);
            CREATE INDEX IF NOT EXISTS idx_billing_user ON session_billing(user_id);
            CREATE INDEX IF NOT EXISTS idx_ledger_user ON credit_transactions(user_id);
            CREATE INDEX IF NOT EXISTS idx_ledger_created ON credit_transactions(created_at);
            CREATE INDEX IF NOT EXISTS idx_storage_user ON storage_resources(user_id);
            CREATE INDEX IF NOT EXISTS idx_storage_workspace ON storage_resources(workspace_id, storage_type);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_storage_default
                ON storage_resources(workspace_id, storage_type) WHERE is_default = 1;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database("run_migrations", e))?;

        // Denormalize user_id into sessions (older schemas lack the column)
        let user_id_exists: bool = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) > 0
            FROM pragma_table_info('sessions')
            WHERE name = 'user_id'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .unwrap_or(false);

        if !user_id_exists {
            sqlx::query(
                r#"
                ALTER TABLE sessions
                ADD COLUMN user_id TEXT;
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database("run_migrations", e))?;

            // Best-effort backfill from the owning workspace
            let _ = sqlx::query(
                r#"
                UPDATE sessions
                SET user_id = (
                    SELECT w.user_id FROM workspaces w
                    WHERE w.workspace_id = sessions.workspace_id
                )
                WHERE user_id IS NULL;
                "#,
            )
            .execute(&self.pool)
            .await;

            info!("Added user_id column to sessions table");
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database("run_migrations", e))?;

        Ok(())
    }
}

// Row decoding helpers shared by the impl blocks.

pub(crate) fn parse_decimal(row: &SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.try_get(column).map_err(|e| Error::database(column, e))?;
    Decimal::from_str(&raw).map_err(|e| Error::database(column, e))
}

pub(crate) fn parse_decimal_opt(row: &SqliteRow, column: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column).map_err(|e| Error::database(column, e))?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| Error::database(column, e)))
        .transpose()
}

pub(crate) fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column).map_err(|e| Error::database(column, e))?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::database(column, e))
}

pub(crate) fn parse_timestamp_opt(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column).map_err(|e| Error::database(column, e))?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| Error::database(column, e))
    })
    .transpose()
}

/// Map a sqlx error to the core taxonomy, distinguishing unique and
/// foreign-key violations from plain backend failures.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db_err) = err {
        let message = db_err.message().to_string();
        if message.contains("UNIQUE constraint failed") {
            return Error::Conflict { message };
        }
        if message.contains("FOREIGN KEY constraint failed")
            || message.contains("CHECK constraint failed")
        {
            return Error::ConstraintViolation { message };
        }
    }
    Error::database(operation.to_string(), err)
}
