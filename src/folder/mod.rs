pub mod journal;

pub use journal::JournalFolder;

use anyhow::Result;

use crate::util::BoxFuture;

/// A configured sync folder as seen by the selective-sync tree.
///
/// Reads are synchronous snapshots; everything that touches the sync engine
/// is async and fallible.
pub trait SyncFolder: Send + Sync {
    /// Display name of the folder (root label in the tree).
    fn alias(&self) -> &str;

    /// Remote URL of the folder's top directory.
    fn remote_base_url(&self) -> &str;

    /// Relative paths currently excluded from sync.
    fn current_blacklist(&self) -> Vec<String>;

    fn is_sync_running(&self) -> bool;

    /// Persist a new blacklist.
    fn set_blacklist<'a>(&'a self, blacklist: &'a [String]) -> BoxFuture<'a, Result<()>>;

    /// Terminate the sync run in progress, if any.
    fn abort_sync(&self) -> BoxFuture<'_, Result<()>>;

    /// Make the next sync re-discover `path` instead of trusting the journal.
    fn invalidate_cached_metadata<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    fn schedule_resync(&self) -> BoxFuture<'_, Result<()>>;
}
