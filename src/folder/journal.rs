use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use super::SyncFolder;
use crate::util::BoxFuture;

/// Per-folder bookkeeping stored next to the blacklist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderState {
    pub sync_running: bool,
    pub resync_requested_at: Option<String>,
    pub last_aborted_at: Option<String>,
}

/// Load a folder's blacklist in stored order.
pub async fn load_blacklist(pool: &SqlitePool, folder: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT path FROM selective_sync_blacklist WHERE folder = ? ORDER BY position",
    )
    .bind(folder)
    .fetch_all(pool)
    .await
    .context("Failed to load selective sync blacklist")?;

    Ok(rows.iter().map(|r| r.get("path")).collect())
}

/// Replace a folder's blacklist atomically.
pub async fn save_blacklist(pool: &SqlitePool, folder: &str, blacklist: &[String]) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to start transaction")?;

    sqlx::query("DELETE FROM selective_sync_blacklist WHERE folder = ?")
        .bind(folder)
        .execute(&mut *tx)
        .await
        .context("Failed to clear selective sync blacklist")?;

    for (position, path) in blacklist.iter().enumerate() {
        sqlx::query(
            "INSERT INTO selective_sync_blacklist (folder, position, path) VALUES (?, ?, ?)",
        )
        .bind(folder)
        .bind(position as i64)
        .bind(path)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to store blacklist entry {path}"))?;
    }

    tx.commit()
        .await
        .context("Failed to commit selective sync blacklist")?;
    Ok(())
}

/// Record that the next sync must not trust cached metadata for `path`.
pub async fn avoid_read_on_next_sync(pool: &SqlitePool, folder: &str, path: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO avoid_read_from_db (folder, path, created_at) VALUES (?, ?, ?) \
         ON CONFLICT(folder, path) DO UPDATE SET created_at = excluded.created_at",
    )
    .bind(folder)
    .bind(path)
    .bind(&now)
    .execute(pool)
    .await
    .context("Failed to record path for re-discovery")?;
    Ok(())
}

pub async fn avoided_paths(pool: &SqlitePool, folder: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT path FROM avoid_read_from_db WHERE folder = ? ORDER BY path")
        .bind(folder)
        .fetch_all(pool)
        .await
        .context("Failed to load paths pending re-discovery")?;
    Ok(rows.iter().map(|r| r.get("path")).collect())
}

pub async fn get_state(pool: &SqlitePool, folder: &str) -> Result<FolderState> {
    let row = sqlx::query(
        "SELECT sync_running, resync_requested_at, last_aborted_at \
         FROM folder_state WHERE folder = ?",
    )
    .bind(folder)
    .fetch_optional(pool)
    .await
    .context("Failed to load folder state")?;

    Ok(row
        .map(|r| FolderState {
            sync_running: r.get::<i64, _>("sync_running") != 0,
            resync_requested_at: r.get("resync_requested_at"),
            last_aborted_at: r.get("last_aborted_at"),
        })
        .unwrap_or_default())
}

async fn record_abort(pool: &SqlitePool, folder: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO folder_state (folder, sync_running, last_aborted_at) VALUES (?, 0, ?) \
         ON CONFLICT(folder) DO UPDATE SET sync_running = 0, last_aborted_at = excluded.last_aborted_at",
    )
    .bind(folder)
    .bind(&now)
    .execute(pool)
    .await
    .context("Failed to record sync abort")?;
    Ok(())
}

async fn request_resync(pool: &SqlitePool, folder: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO folder_state (folder, resync_requested_at) VALUES (?, ?) \
         ON CONFLICT(folder) DO UPDATE SET resync_requested_at = excluded.resync_requested_at",
    )
    .bind(folder)
    .bind(&now)
    .execute(pool)
    .await
    .context("Failed to schedule resync")?;
    Ok(())
}

/// A sync folder whose selective-sync state lives in the SQLite journal.
///
/// The blacklist and running flag are cached so the tree can read them
/// without touching the database.
pub struct JournalFolder {
    pool: SqlitePool,
    alias: String,
    remote_base_url: String,
    blacklist: Mutex<Vec<String>>,
    running: AtomicBool,
}

impl JournalFolder {
    pub async fn open(pool: SqlitePool, alias: &str, remote_base_url: String) -> Result<Self> {
        let blacklist = load_blacklist(&pool, alias).await?;
        let state = get_state(&pool, alias).await?;
        tracing::debug!(
            folder = alias,
            entries = blacklist.len(),
            running = state.sync_running,
            "opened folder journal"
        );

        Ok(Self {
            pool,
            alias: alias.to_string(),
            remote_base_url,
            blacklist: Mutex::new(blacklist),
            running: AtomicBool::new(state.sync_running),
        })
    }
}

impl SyncFolder for JournalFolder {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn remote_base_url(&self) -> &str {
        &self.remote_base_url
    }

    fn current_blacklist(&self) -> Vec<String> {
        self.blacklist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_sync_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_blacklist<'a>(&'a self, blacklist: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            save_blacklist(&self.pool, &self.alias, blacklist).await?;
            *self.blacklist.lock().unwrap_or_else(PoisonError::into_inner) = blacklist.to_vec();
            tracing::info!(folder = %self.alias, entries = blacklist.len(), "selective sync blacklist saved");
            Ok(())
        })
    }

    fn abort_sync(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            record_abort(&self.pool, &self.alias).await?;
            self.running.store(false, Ordering::SeqCst);
            tracing::info!(folder = %self.alias, "sync run terminated");
            Ok(())
        })
    }

    fn invalidate_cached_metadata<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            avoid_read_on_next_sync(&self.pool, &self.alias, path).await?;
            tracing::debug!(folder = %self.alias, path, "cached metadata invalidated");
            Ok(())
        })
    }

    fn schedule_resync(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            request_resync(&self.pool, &self.alias).await?;
            tracing::info!(folder = %self.alias, "resync scheduled");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    async fn set_sync_running(pool: &SqlitePool, folder: &str, running: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO folder_state (folder, sync_running) VALUES (?, ?) \
             ON CONFLICT(folder) DO UPDATE SET sync_running = excluded.sync_running",
        )
        .bind(folder)
        .bind(running as i64)
        .execute(pool)
        .await
        .context("Failed to update sync running flag")?;
        Ok(())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn blacklist_round_trip_keeps_order() {
        let pool = init_memory_db().await.unwrap();
        save_blacklist(&pool, "Docs", &strings(&["z/", "a/", "m/n/"]))
            .await
            .unwrap();
        save_blacklist(&pool, "Other", &strings(&["x/"]))
            .await
            .unwrap();

        assert_eq!(
            load_blacklist(&pool, "Docs").await.unwrap(),
            strings(&["z/", "a/", "m/n/"])
        );

        save_blacklist(&pool, "Docs", &[]).await.unwrap();
        assert!(load_blacklist(&pool, "Docs").await.unwrap().is_empty());
        assert_eq!(load_blacklist(&pool, "Other").await.unwrap(), strings(&["x/"]));
    }

    #[tokio::test]
    async fn journal_folder_caches_blacklist() {
        let pool = init_memory_db().await.unwrap();
        save_blacklist(&pool, "Docs", &strings(&["a/"])).await.unwrap();

        let folder = JournalFolder::open(pool.clone(), "Docs", "https://h/dav/Docs".into())
            .await
            .unwrap();
        assert_eq!(folder.current_blacklist(), strings(&["a/"]));
        assert_eq!(folder.remote_base_url(), "https://h/dav/Docs");

        folder.set_blacklist(&strings(&["b/"])).await.unwrap();
        assert_eq!(folder.current_blacklist(), strings(&["b/"]));
        assert_eq!(load_blacklist(&pool, "Docs").await.unwrap(), strings(&["b/"]));
    }

    #[tokio::test]
    async fn effects_are_recorded() {
        let pool = init_memory_db().await.unwrap();
        set_sync_running(&pool, "Docs", true).await.unwrap();

        let folder = JournalFolder::open(pool.clone(), "Docs", "https://h/dav/Docs".into())
            .await
            .unwrap();
        assert!(folder.is_sync_running());

        folder.abort_sync().await.unwrap();
        folder.invalidate_cached_metadata("b/").await.unwrap();
        folder.invalidate_cached_metadata("a/").await.unwrap();
        folder.invalidate_cached_metadata("b/").await.unwrap();
        folder.schedule_resync().await.unwrap();

        assert!(!folder.is_sync_running());
        assert_eq!(avoided_paths(&pool, "Docs").await.unwrap(), strings(&["a/", "b/"]));

        let state = get_state(&pool, "Docs").await.unwrap();
        assert!(!state.sync_running);
        assert!(state.last_aborted_at.is_some());
        assert!(state.resync_requested_at.is_some());
    }

    #[tokio::test]
    async fn unknown_folder_has_default_state() {
        let pool = init_memory_db().await.unwrap();
        assert_eq!(get_state(&pool, "Nope").await.unwrap(), FolderState::default());
        assert!(avoided_paths(&pool, "Nope").await.unwrap().is_empty());
    }
}
