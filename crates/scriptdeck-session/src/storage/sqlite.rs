//! SQLite script and history storage (feature-gated).

use std::{path::PathBuf, str::FromStr};

use async_trait::async_trait;
use scriptdeck_core::{HistoryEntry, HistoryStore, ScriptDefinition, ScriptStore, StorageError};
use sqlx::{SqliteConnection, SqlitePool, sqlite::SqliteConnectOptions};

use super::DEFAULT_HISTORY_LIMIT;

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS scripts (
        name TEXT PRIMARY KEY NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        body TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'Uncategorized',
        working_dir TEXT
    )",
    r"CREATE TABLE IF NOT EXISTS script_args (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        script_name TEXT NOT NULL,
        args TEXT NOT NULL,
        working_dir TEXT NOT NULL,
        used_at INTEGER NOT NULL,
        UNIQUE(script_name, args, working_dir)
    )",
    r"CREATE INDEX IF NOT EXISTS script_args_by_name ON script_args (script_name, used_at)",
];

type ScriptRow = (String, String, String, String, Option<String>);

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn from_row((name, description, body, category, working_dir): ScriptRow) -> ScriptDefinition {
    ScriptDefinition {
        name,
        description,
        body,
        category,
        working_directory: working_dir.map(PathBuf::from),
    }
}

fn path_text(path: Option<&std::path::Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

/// Keep the newest `limit` history rows for `script_name`.
async fn prune_history(
    conn: &mut SqliteConnection,
    script_name: &str,
    limit: i64,
) -> Result<(), StorageError> {
    sqlx::query(
        "DELETE FROM script_args WHERE script_name = ? AND id NOT IN ( \
            SELECT id FROM script_args WHERE script_name = ? \
            ORDER BY used_at DESC, id DESC LIMIT ?)",
    )
    .bind(script_name)
    .bind(script_name)
    .bind(limit)
    .execute(conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Move history rows from `from` to `to`. Where both names hold the same
/// invocation, the more recent row survives.
async fn merge_history(
    conn: &mut SqliteConnection,
    from: &str,
    to: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "DELETE FROM script_args WHERE script_name = ? AND EXISTS ( \
            SELECT 1 FROM script_args t WHERE t.script_name = ? \
            AND t.args = script_args.args AND t.working_dir = script_args.working_dir \
            AND t.used_at >= script_args.used_at)",
    )
    .bind(from)
    .bind(to)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    sqlx::query(
        "DELETE FROM script_args WHERE script_name = ? AND EXISTS ( \
            SELECT 1 FROM script_args o WHERE o.script_name = ? \
            AND o.args = script_args.args AND o.working_dir = script_args.working_dir)",
    )
    .bind(to)
    .bind(from)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    sqlx::query("UPDATE script_args SET script_name = ? WHERE script_name = ?")
        .bind(to)
        .bind(from)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

/// SQLite storage implementation.
pub struct SqliteStorage {
    pool: SqlitePool,
    history_limit: usize,
}

impl SqliteStorage {
    /// Connect to `database_url`, creating the file and schema if needed.
    ///
    /// # Errors
    /// Returns error if database connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_error)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.map_err(db_error)?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool, creating the schema if needed.
    ///
    /// # Errors
    /// Returns error if the schema can't be created.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_error)?;
        }
        Ok(Self {
            pool,
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    /// Keep at most `limit` history entries per script.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn limit(&self) -> i64 {
        i64::try_from(self.history_limit).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl ScriptStore for SqliteStorage {
    async fn get_script(&self, name: &str) -> Result<Option<ScriptDefinition>, StorageError> {
        let row: Option<ScriptRow> = sqlx::query_as(
            "SELECT name, description, body, category, working_dir FROM scripts WHERE name = ?",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.map(from_row))
    }

    async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>, StorageError> {
        let rows: Vec<ScriptRow> = sqlx::query_as(
            "SELECT name, description, body, category, working_dir FROM scripts \
             ORDER BY category, name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    async fn save_script(&self, script: ScriptDefinition) -> Result<(), StorageError> {
        let script = script.normalized();
        sqlx::query(
            "INSERT INTO scripts (name, description, body, category, working_dir) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                description = excluded.description, \
                body = excluded.body, \
                category = excluded.category, \
                working_dir = excluded.working_dir",
        )
        .bind(&script.name)
        .bind(&script.description)
        .bind(&script.body)
        .bind(&script.category)
        .bind(path_text(script.working_directory.as_deref()))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn delete_script(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.trim();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let deleted = sqlx::query("DELETE FROM scripts WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();
        if deleted > 0 {
            sqlx::query("DELETE FROM script_args WHERE script_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;
        Ok(deleted > 0)
    }

    async fn rename_script(
        &self,
        old_name: &str,
        updated: ScriptDefinition,
    ) -> Result<(), StorageError> {
        let old_name = old_name.trim();
        let updated = updated.normalized();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM scripts WHERE name IN (?, ?)")
            .bind(old_name)
            .bind(&updated.name)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;
        if !names.iter().any(|(n,)| n == old_name) {
            return Err(StorageError::NotFound(old_name.to_string()));
        }
        if updated.name != old_name && names.iter().any(|(n,)| *n == updated.name) {
            return Err(StorageError::Conflict(updated.name));
        }

        sqlx::query(
            "UPDATE scripts SET name = ?, description = ?, body = ?, category = ?, \
             working_dir = ? WHERE name = ?",
        )
        .bind(&updated.name)
        .bind(&updated.description)
        .bind(&updated.body)
        .bind(&updated.category)
        .bind(path_text(updated.working_directory.as_deref()))
        .bind(old_name)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if updated.name != old_name {
            merge_history(&mut *tx, old_name, &updated.name).await?;
            prune_history(&mut *tx, &updated.name, self.limit()).await?;
        }

        tx.commit().await.map_err(db_error)
    }

    async fn categories(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT category FROM scripts ORDER BY category")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }
}

#[async_trait]
impl HistoryStore for SqliteStorage {
    async fn append_history(
        &self,
        script_name: &str,
        entry: HistoryEntry,
    ) -> Result<(), StorageError> {
        let script_name = script_name.trim();
        let working_dir = entry.working_directory.to_string_lossy().into_owned();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            "INSERT INTO script_args (script_name, args, working_dir, used_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(script_name, args, working_dir) DO UPDATE SET \
                used_at = excluded.used_at",
        )
        .bind(script_name)
        .bind(&entry.arguments)
        .bind(&working_dir)
        .bind(entry.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        prune_history(&mut *tx, script_name, self.limit()).await?;
        tx.commit().await.map_err(db_error)
    }

    async fn history(&self, script_name: &str) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT args, working_dir, used_at FROM script_args WHERE script_name = ? \
             ORDER BY used_at DESC, id DESC LIMIT ?",
        )
        .bind(script_name.trim())
        .bind(self.limit())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .into_iter()
            .map(|(arguments, working_dir, timestamp)| HistoryEntry {
                arguments,
                working_directory: PathBuf::from(working_dir),
                timestamp,
            })
            .collect())
    }
}
