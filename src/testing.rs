//! Fakes for the tree's collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::folder::SyncFolder;
use crate::listing::{ListedEntry, ListingService};
use crate::tree::{Address, Tree};
use crate::util::BoxFuture;
use crate::util::path::join_remote;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderCall {
    SetBlacklist(Vec<String>),
    Abort,
    Invalidate(String),
    ScheduleResync,
}

pub struct FakeFolder {
    alias: String,
    base_url: String,
    blacklist: Mutex<Vec<String>>,
    running: AtomicBool,
    calls: Mutex<Vec<FolderCall>>,
    invalidate_error: Option<String>,
}

impl FakeFolder {
    pub fn new(alias: &str, base_url: &str, blacklist: &[&str]) -> Self {
        Self {
            alias: alias.to_string(),
            base_url: base_url.to_string(),
            blacklist: Mutex::new(blacklist.iter().map(|s| s.to_string()).collect()),
            running: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            invalidate_error: None,
        }
    }

    pub fn shared(alias: &str, base_url: &str, blacklist: &[&str]) -> Arc<dyn SyncFolder> {
        Arc::new(Self::new(alias, base_url, blacklist))
    }

    pub fn running(self) -> Self {
        self.running.store(true, Ordering::SeqCst);
        self
    }

    /// Make every `invalidate_cached_metadata` call fail with `message`.
    pub fn failing_invalidation(mut self, message: &str) -> Self {
        self.invalidate_error = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<FolderCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: FolderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl SyncFolder for FakeFolder {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn remote_base_url(&self) -> &str {
        &self.base_url
    }

    fn current_blacklist(&self) -> Vec<String> {
        self.blacklist.lock().unwrap().clone()
    }

    fn is_sync_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_blacklist<'a>(&'a self, blacklist: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            *self.blacklist.lock().unwrap() = blacklist.to_vec();
            self.record(FolderCall::SetBlacklist(blacklist.to_vec()));
            Ok(())
        })
    }

    fn abort_sync(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.running.store(false, Ordering::SeqCst);
            self.record(FolderCall::Abort);
            Ok(())
        })
    }

    fn invalidate_cached_metadata<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(ref message) = self.invalidate_error {
                anyhow::bail!("{message}");
            }
            self.record(FolderCall::Invalidate(path.to_string()));
            Ok(())
        })
    }

    fn schedule_resync(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record(FolderCall::ScheduleResync);
            Ok(())
        })
    }
}

/// Serves canned listings keyed by directory URL.
#[derive(Default)]
pub struct FakeListing {
    listings: HashMap<String, Result<Vec<ListedEntry>, String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeListing {
    pub fn with(mut self, url: &str, paths: &[&str]) -> Self {
        self.listings.insert(url.to_string(), Ok(entries(paths)));
        self
    }

    pub fn failing(mut self, url: &str, message: &str) -> Self {
        self.listings.insert(url.to_string(), Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl ListingService for FakeListing {
    fn list<'a>(
        &'a self,
        base_url: &'a str,
        relative_path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ListedEntry>>> {
        Box::pin(async move {
            let url = join_remote(base_url, relative_path);
            self.requests.lock().unwrap().push(url.clone());
            // Let the caller observe the request as in flight.
            tokio::task::yield_now().await;
            match self.listings.get(&url) {
                Some(Ok(entries)) => Ok(entries.clone()),
                Some(Err(message)) => anyhow::bail!("{message}"),
                None => anyhow::bail!("404 Not Found: {url}"),
            }
        })
    }
}

pub fn entries(paths: &[&str]) -> Vec<ListedEntry> {
    paths.iter().map(|p| ListedEntry::new(*p, 0)).collect()
}

/// A single-root tree ("Docs" at `base`) whose root is already listed with
/// `children` (paths relative to `base/`).
pub fn listed_tree(blacklist: &[&str], children: &[&str]) -> Tree {
    let mut tree = Tree::new(vec![FakeFolder::shared("Docs", "base", blacklist)]);
    let root = Address::root(0);
    let request = tree
        .fetch_children(&root)
        .unwrap()
        .expect("fresh root must be fetchable");

    let mut paths = vec!["base/".to_string()];
    paths.extend(children.iter().map(|c| format!("base/{c}")));
    let listing: Vec<&str> = paths.iter().map(String::as_str).collect();
    tree.complete_fetch(&request, Ok(entries(&listing))).unwrap();
    tree.take_events();
    tree
}
