use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Resolve the journal file path: use the custom path if provided,
/// otherwise fall back to `$XDG_DATA_HOME/selsync/journal.db`.
pub fn resolve_db_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let dir = dirs::data_dir().context("Could not determine data directory")?;
            Ok(dir.join("selsync").join("journal.db"))
        }
    }
}

pub async fn init_db(custom: Option<&Path>) -> Result<SqlitePool> {
    let db_path = resolve_db_path(custom)?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    tracing::debug!(path = %db_path.display(), "opening journal");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&db_url)
        .await
        .with_context(|| format!("Failed to open journal: {}", db_path.display()))?;

    migrate(&pool).await?;

    tracing::debug!(path = %db_path.display(), "journal initialized");
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run journal migrations")
}

/// A private in-memory journal (single connection, so every query sees the
/// same database).
#[cfg(test)]
pub async fn init_memory_db() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory journal")?;
    migrate(&pool).await?;
    Ok(pool)
}
