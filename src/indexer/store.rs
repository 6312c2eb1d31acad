//! Workspace state store for the indexer.
//!
//! SQLite-backed, arena-style: workspaces are owned by the store and
//! referenced by id everywhere; index status and per-channel watermarks
//! refer back by id, never by pointer. All reads go through the store.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row as SqlxRow;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::{GatewayError, Result};

/// Lease considered stuck after this long without a heartbeat.
pub const STUCK_LEASE_HOURS: i64 = 1;

/// A Slack workspace known to the gateway.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: i64,
    pub team_id: String,
    pub name: String,
    /// Ciphertext; decrypted per-operation by the credential store.
    pub bot_token_enc: String,
    pub user_token_enc: Option<String>,
    pub granted_scopes: Vec<String>,
}

/// Per-workspace indexing status.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub workspace_id: i64,
    pub collection_name: String,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub is_indexing: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub total_messages: i64,
    pub indexed_messages: i64,
    pub oldest_ts: Option<f64>,
    pub newest_ts: Option<f64>,
    pub history_days: i64,
    pub update_frequency_hours: i64,
    pub embedding_model: String,
}

/// Per-workspace, per-channel watermark.
#[derive(Debug, Clone)]
pub struct IndexedChannel {
    pub workspace_id: i64,
    pub channel_id: String,
    pub channel_name: String,
    pub last_indexed_ts: Option<f64>,
    pub message_count: i64,
}

/// SQLite-backed store for workspaces, status, and watermarks.
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    /// Opens (or creates) the store at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::config(format!("cannot create state directory: {e}"))
            })?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| GatewayError::config(format!("bad state db path: {e}")))?
            .create_if_missing(true);
        Self::with_options(options).await
    }

    /// Opens an in-memory store. Primarily for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| GatewayError::config(format!("bad sqlite options: {e}")))?;
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::config(format!("cannot open state db: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                bot_token_enc TEXT NOT NULL,
                user_token_enc TEXT,
                granted_scopes TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS index_status (
                workspace_id INTEGER PRIMARY KEY REFERENCES workspaces(id),
                collection_name TEXT NOT NULL,
                last_indexed_at TEXT,
                last_completed_at TEXT,
                is_indexing INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT,
                total_messages INTEGER NOT NULL DEFAULT 0,
                indexed_messages INTEGER NOT NULL DEFAULT 0,
                oldest_ts REAL,
                newest_ts REAL,
                history_days INTEGER NOT NULL DEFAULT 30,
                update_frequency_hours INTEGER NOT NULL DEFAULT 1,
                embedding_model TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS indexed_channels (
                workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
                channel_id TEXT NOT NULL,
                channel_name TEXT NOT NULL,
                last_indexed_ts REAL,
                message_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (workspace_id, channel_id)
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| GatewayError::config(format!("state db migration failed: {e}")))?;
        }
        Ok(())
    }

    /// Inserts or updates a workspace by team id; returns its id.
    pub async fn upsert_workspace(
        &self,
        team_id: &str,
        name: &str,
        bot_token_enc: &str,
        user_token_enc: Option<&str>,
        granted_scopes: &[String],
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (team_id, name, bot_token_enc, user_token_enc, granted_scopes, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(team_id) DO UPDATE SET
                name = excluded.name,
                bot_token_enc = excluded.bot_token_enc,
                user_token_enc = excluded.user_token_enc,
                granted_scopes = excluded.granted_scopes
            "#,
        )
        .bind(team_id)
        .bind(name)
        .bind(bot_token_enc)
        .bind(user_token_enc)
        .bind(granted_scopes.join(","))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::internal(format!("workspace upsert failed: {e}")))?;

        let row = sqlx::query("SELECT id FROM workspaces WHERE team_id = ?")
            .bind(team_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewayError::internal(format!("workspace lookup failed: {e}")))?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Fetches a workspace by id.
    pub async fn get_workspace(&self, id: i64) -> Result<Option<Workspace>> {
        let row = sqlx::query(
            "SELECT id, team_id, name, bot_token_enc, user_token_enc, granted_scopes FROM workspaces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::internal(format!("workspace fetch failed: {e}")))?;

        Ok(row.map(|row| Workspace {
            id: row.get("id"),
            team_id: row.get("team_id"),
            name: row.get("name"),
            bot_token_enc: row.get("bot_token_enc"),
            user_token_enc: row.get("user_token_enc"),
            granted_scopes: split_scopes(row.get::<String, _>("granted_scopes")),
        }))
    }

    /// Lists all workspace ids.
    pub async fn list_workspace_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM workspaces ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::internal(format!("workspace list failed: {e}")))?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    /// Ensures an index-status row exists for the workspace.
    pub async fn ensure_index_status(
        &self,
        workspace_id: i64,
        collection_name: &str,
        history_days: i64,
        update_frequency_hours: i64,
        embedding_model: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_status
                (workspace_id, collection_name, history_days, update_frequency_hours, embedding_model)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(collection_name)
        .bind(history_days)
        .bind(update_frequency_hours)
        .bind(embedding_model)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::internal(format!("index status init failed: {e}")))?;
        Ok(())
    }

    /// Fetches the index status for a workspace.
    pub async fn get_index_status(&self, workspace_id: i64) -> Result<Option<IndexStatus>> {
        let row = sqlx::query("SELECT * FROM index_status WHERE workspace_id = ?")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::internal(format!("index status fetch failed: {e}")))?;

        Ok(row.map(|row| IndexStatus {
            workspace_id: row.get("workspace_id"),
            collection_name: row.get("collection_name"),
            last_indexed_at: parse_ts(row.get::<Option<String>, _>("last_indexed_at")),
            last_completed_at: parse_ts(row.get::<Option<String>, _>("last_completed_at")),
            is_indexing: row.get::<i64, _>("is_indexing") != 0,
            updated_at: parse_ts(row.get::<Option<String>, _>("updated_at")),
            total_messages: row.get("total_messages"),
            indexed_messages: row.get("indexed_messages"),
            oldest_ts: row.get("oldest_ts"),
            newest_ts: row.get("newest_ts"),
            history_days: row.get("history_days"),
            update_frequency_hours: row.get("update_frequency_hours"),
            embedding_model: row.get("embedding_model"),
        }))
    }

    /// Attempts to take the indexing lease for a workspace.
    ///
    /// Succeeds when no worker holds the lease, or when the holder's
    /// heartbeat is older than the stuck timeout (stale-lease
    /// reclamation). Returns false when another live worker holds it.
    pub async fn try_acquire_lease(&self, workspace_id: i64) -> Result<bool> {
        let now = Utc::now();
        let stale_before = (now - Duration::hours(STUCK_LEASE_HOURS)).to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE index_status
            SET is_indexing = 1, last_indexed_at = ?, updated_at = ?
            WHERE workspace_id = ?
              AND (is_indexing = 0 OR updated_at IS NULL OR updated_at < ?)
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(workspace_id)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::internal(format!("lease acquire failed: {e}")))?;

        let acquired = result.rows_affected() == 1;
        if acquired {
            info!("acquired indexing lease for workspace {}", workspace_id);
        }
        Ok(acquired)
    }

    /// Heartbeats the lease so a long run is not reclaimed as stuck.
    pub async fn touch_lease(&self, workspace_id: i64) -> Result<()> {
        sqlx::query("UPDATE index_status SET updated_at = ? WHERE workspace_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(workspace_id)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::internal(format!("lease heartbeat failed: {e}")))?;
        Ok(())
    }

    /// Releases the lease and finalizes run bookkeeping.
    pub async fn finish_run(
        &self,
        workspace_id: i64,
        indexed_delta: i64,
        oldest_ts: Option<f64>,
        newest_ts: Option<f64>,
        completed: bool,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        if completed {
            sqlx::query(
                r#"
                UPDATE index_status
                SET is_indexing = 0,
                    updated_at = ?,
                    last_completed_at = ?,
                    indexed_messages = indexed_messages + ?,
                    total_messages = total_messages + ?,
                    oldest_ts = COALESCE(?, oldest_ts),
                    newest_ts = COALESCE(?, newest_ts)
                WHERE workspace_id = ?
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(indexed_delta)
            .bind(indexed_delta)
            .bind(oldest_ts)
            .bind(newest_ts)
            .bind(workspace_id)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE index_status SET is_indexing = 0, updated_at = ? WHERE workspace_id = ?",
            )
            .bind(&now)
            .bind(workspace_id)
            .execute(&self.pool)
            .await
        }
        .map_err(|e| GatewayError::internal(format!("run finalize failed: {e}")))?;
        Ok(())
    }

    /// Fetches one channel's watermark record.
    pub async fn get_channel(
        &self,
        workspace_id: i64,
        channel_id: &str,
    ) -> Result<Option<IndexedChannel>> {
        let row = sqlx::query(
            "SELECT * FROM indexed_channels WHERE workspace_id = ? AND channel_id = ?",
        )
        .bind(workspace_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| GatewayError::internal(format!("channel fetch failed: {e}")))?;

        Ok(row.map(|row| IndexedChannel {
            workspace_id: row.get("workspace_id"),
            channel_id: row.get("channel_id"),
            channel_name: row.get("channel_name"),
            last_indexed_ts: row.get("last_indexed_ts"),
            message_count: row.get("message_count"),
        }))
    }

    /// Advances a channel watermark after a successful upsert.
    ///
    /// The watermark only moves forward; a lower value is ignored.
    pub async fn advance_channel_watermark(
        &self,
        workspace_id: i64,
        channel_id: &str,
        channel_name: &str,
        new_ts: f64,
        indexed_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO indexed_channels
                (workspace_id, channel_id, channel_name, last_indexed_ts, message_count)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, channel_id) DO UPDATE SET
                channel_name = excluded.channel_name,
                last_indexed_ts = MAX(COALESCE(indexed_channels.last_indexed_ts, 0), excluded.last_indexed_ts),
                message_count = indexed_channels.message_count + ?
            "#,
        )
        .bind(workspace_id)
        .bind(channel_id)
        .bind(channel_name)
        .bind(new_ts)
        .bind(indexed_count)
        .bind(indexed_count)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::internal(format!("watermark update failed: {e}")))?;
        Ok(())
    }

    /// All channel records for a workspace.
    pub async fn list_channels(&self, workspace_id: i64) -> Result<Vec<IndexedChannel>> {
        let rows = sqlx::query("SELECT * FROM indexed_channels WHERE workspace_id = ? ORDER BY channel_id")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::internal(format!("channel list failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| IndexedChannel {
                workspace_id: row.get("workspace_id"),
                channel_id: row.get("channel_id"),
                channel_name: row.get("channel_name"),
                last_indexed_ts: row.get("last_indexed_ts"),
                message_count: row.get("message_count"),
            })
            .collect())
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn split_scopes(raw: String) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_workspace() -> (WorkspaceStore, i64) {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        let id = store
            .upsert_workspace("T01", "acme", "enc-bot-token", None, &["channels:history".to_string()])
            .await
            .unwrap();
        store
            .ensure_index_status(id, "slack_messages_T01", 30, 1, "text-embedding-3-small")
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_workspace_upsert_is_stable() {
        let (store, id) = store_with_workspace().await;
        let again = store
            .upsert_workspace("T01", "acme-renamed", "enc-2", None, &[])
            .await
            .unwrap();
        assert_eq!(id, again);
        let workspace = store.get_workspace(id).await.unwrap().unwrap();
        assert_eq!(workspace.name, "acme-renamed");
        assert_eq!(workspace.bot_token_enc, "enc-2");
    }

    #[tokio::test]
    async fn test_lease_exclusivity() {
        let (store, id) = store_with_workspace().await;
        assert!(store.try_acquire_lease(id).await.unwrap());
        // Second worker cannot take a live lease.
        assert!(!store.try_acquire_lease(id).await.unwrap());

        store.finish_run(id, 0, None, None, true).await.unwrap();
        assert!(store.try_acquire_lease(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_lease_reclaimed() {
        let (store, id) = store_with_workspace().await;
        assert!(store.try_acquire_lease(id).await.unwrap());

        // Backdate the heartbeat past the stuck timeout.
        let stale = (Utc::now() - Duration::hours(STUCK_LEASE_HOURS + 1)).to_rfc3339();
        sqlx::query("UPDATE index_status SET updated_at = ? WHERE workspace_id = ?")
            .bind(stale)
            .bind(id)
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.try_acquire_lease(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_watermark_monotonic() {
        let (store, id) = store_with_workspace().await;
        store
            .advance_channel_watermark(id, "C01", "general", 1700000000.0, 10)
            .await
            .unwrap();
        // A lower ts must not move the watermark backwards.
        store
            .advance_channel_watermark(id, "C01", "general", 1600000000.0, 5)
            .await
            .unwrap();

        let channel = store.get_channel(id, "C01").await.unwrap().unwrap();
        assert_eq!(channel.last_indexed_ts, Some(1700000000.0));
        assert_eq!(channel.message_count, 15);
    }

    #[tokio::test]
    async fn test_finish_run_updates_status() {
        let (store, id) = store_with_workspace().await;
        store.try_acquire_lease(id).await.unwrap();
        store
            .finish_run(id, 42, Some(1690000000.0), Some(1700000000.0), true)
            .await
            .unwrap();

        let status = store.get_index_status(id).await.unwrap().unwrap();
        assert!(!status.is_indexing);
        assert!(status.last_completed_at.is_some());
        assert_eq!(status.indexed_messages, 42);
        assert_eq!(status.newest_ts, Some(1700000000.0));
    }

    #[tokio::test]
    async fn test_missing_status_rows() {
        let store = WorkspaceStore::open_in_memory().await.unwrap();
        assert!(store.get_index_status(999).await.unwrap().is_none());
        assert!(store.get_workspace(999).await.unwrap().is_none());
    }
}
