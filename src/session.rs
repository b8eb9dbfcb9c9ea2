use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::folder::SyncFolder;
use crate::listing::{ListedEntry, ListingService};
use crate::tree::blacklist::{self, Reconciliation};
use crate::tree::{Address, ChildCount, FetchRequest, Selection, Tree, TreeError, TreeEvent, TreeNode};

/// A finished listing on its way back to the tree.
struct Completion {
    request: FetchRequest,
    result: Result<Vec<ListedEntry>>,
}

/// What applying the selection did to one sync folder.
#[derive(Debug, Clone, Serialize)]
pub struct FolderOutcome {
    pub folder: String,
    pub blacklist: Vec<String>,
    pub changed: BTreeSet<String>,
    pub aborted_sync: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub folders: Vec<FolderOutcome>,
}

/// Drives a selective-sync tree: issues listings on the runtime, feeds the
/// results back in, and pushes applied selections to the sync folders.
///
/// All tree access stays on the task that owns the session; only the
/// listing calls run elsewhere.
pub struct SelectiveSync {
    tree: Tree,
    listing: Arc<dyn ListingService>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: usize,
    cancel: CancellationToken,
}

impl SelectiveSync {
    pub fn new(folders: Vec<Arc<dyn SyncFolder>>, listing: Arc<dyn ListingService>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tree: Tree::new(folders),
            listing,
            tx,
            rx,
            in_flight: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn child_count(&self, address: &Address) -> Result<ChildCount, TreeError> {
        self.tree.child_count(address)
    }

    pub fn child_at(&self, address: &Address, index: usize) -> Option<&TreeNode> {
        self.tree.child_at(address, index)
    }

    pub fn can_expand(&self, address: &Address) -> bool {
        self.tree.can_fetch_more(address)
    }

    pub fn toggle(&mut self, address: &Address, state: Selection) -> Result<bool, TreeError> {
        self.tree.toggle(address, state)
    }

    pub fn is_dirty(&self) -> bool {
        self.tree.is_dirty()
    }

    pub fn take_events(&mut self) -> Vec<TreeEvent> {
        self.tree.take_events()
    }

    /// Start listing a node's children. Returns whether a request was issued.
    pub fn request_expand(&mut self, address: &Address) -> Result<bool, TreeError> {
        match self.tree.fetch_children(address)? {
            Some(request) => {
                self.issue(request);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn issue(&mut self, request: FetchRequest) {
        let listing = self.listing.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        self.in_flight += 1;

        tokio::spawn(async move {
            let base_url = request.base_url.clone();
            let relative_path = request.relative_path.clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(address = %request.address, "listing cancelled");
                    return;
                }
                r = listing.list(&base_url, &relative_path) => r,
            };
            // The session may have been reset or dropped meanwhile.
            let _ = tx.send(Completion { request, result });
        });
    }

    /// Wait for the next listing and apply it to the tree.
    ///
    /// Returns `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<Result<usize, TreeError>> {
        if self.in_flight == 0 {
            return None;
        }
        let completion = self.rx.recv().await?;
        self.in_flight -= 1;
        Some(
            self.tree
                .complete_fetch(&completion.request, completion.result),
        )
    }

    /// Apply every outstanding listing. Stale responses are dropped; listing
    /// failures are returned for display.
    pub async fn settle(&mut self) -> Vec<TreeError> {
        let mut failures = Vec::new();
        while let Some(outcome) = self.next_completion().await {
            match outcome {
                Ok(_) => {}
                Err(TreeError::StaleResponse { address }) => {
                    tracing::debug!(%address, "discarding stale listing response");
                }
                Err(e) => failures.push(e),
            }
        }
        failures
    }

    /// List `address` if needed and wait for the result.
    async fn ensure_listed(&mut self, address: &Address) -> Result<()> {
        self.request_expand(address)?;
        let failures = self.settle().await;
        if self.tree.node(address).is_some_and(TreeNode::is_fetched) {
            return Ok(());
        }
        match failures.into_iter().next() {
            Some(e) => Err(e.into()),
            None => anyhow::bail!("{address} could not be listed"),
        }
    }

    /// Fetch every level from a root down to the folder at `path` and
    /// return its address. An empty path is the root itself.
    pub async fn expand_path(&mut self, root: usize, path: &str) -> Result<Address> {
        let alias = self
            .tree
            .folder(root)
            .map(|f| f.alias().to_string())
            .with_context(|| format!("No sync folder #{root}"))?;

        let mut current = Address::root(root);
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            self.ensure_listed(&current).await?;
            current = self
                .tree
                .find_child_by_path(&current, &prefix)
                .with_context(|| format!("No folder '{prefix}' in {alias}"))?;
        }
        Ok(current)
    }

    /// Breadth-first expansion of `depth` levels below `address`.
    pub async fn expand_to_depth(&mut self, address: &Address, depth: usize) -> Vec<TreeError> {
        let mut failures = Vec::new();
        let mut frontier = vec![address.clone()];

        for _ in 0..depth {
            for addr in &frontier {
                if let Err(e) = self.request_expand(addr) {
                    failures.push(e);
                }
            }
            failures.extend(self.settle().await);

            frontier = frontier
                .iter()
                .filter_map(|a| self.tree.node(a))
                .flat_map(|n| n.children().iter().map(|c| c.address().clone()))
                .collect();
            if frontier.is_empty() {
                break;
            }
        }
        failures
    }

    /// What applying would do, without touching the sync folders.
    pub fn preview(&self) -> Vec<(String, Reconciliation)> {
        self.tree
            .roots_to_apply()
            .into_iter()
            .filter_map(|i| {
                let root = self.tree.root(i)?;
                let folder = self.tree.folder(i)?;
                let previous = folder.current_blacklist();
                Some((folder.alias().to_string(), blacklist::reconcile(root, &previous)))
            })
            .collect()
    }

    /// Push the pending selection to every sync folder the user expanded,
    /// then start over from an unfetched tree.
    pub async fn apply_pending_changes(&mut self) -> ApplyReport {
        let mut report = ApplyReport::default();
        if !self.tree.is_dirty() {
            tracing::debug!("no pending selective sync changes");
            return report;
        }

        for index in self.tree.roots_to_apply() {
            let (Some(root), Some(folder)) = (self.tree.root(index), self.tree.folder(index))
            else {
                continue;
            };
            let folder = folder.clone();
            let reconciliation = blacklist::reconcile(root, &folder.current_blacklist());
            report
                .folders
                .push(apply_to_folder(folder.as_ref(), reconciliation).await);
        }

        self.reset();
        report
    }

    /// Drop every node and cancel outstanding listings.
    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = tx;
        self.rx = rx;
        self.in_flight = 0;

        let folders = self.tree.folders();
        self.tree.reset(folders);
    }
}

async fn apply_to_folder(folder: &dyn SyncFolder, reconciliation: Reconciliation) -> FolderOutcome {
    let mut outcome = FolderOutcome {
        folder: folder.alias().to_string(),
        blacklist: reconciliation.blacklist.clone(),
        changed: reconciliation.changed.clone(),
        aborted_sync: false,
        error: None,
    };

    if let Err(e) = commit(folder, &reconciliation, &mut outcome).await {
        tracing::error!(folder = folder.alias(), error = %e, "applying selective sync failed");
        outcome.error = Some(format!("{e:#}"));
    }
    outcome
}

async fn commit(
    folder: &dyn SyncFolder,
    reconciliation: &Reconciliation,
    outcome: &mut FolderOutcome,
) -> Result<()> {
    if reconciliation.has_changes() {
        if folder.is_sync_running() {
            folder.abort_sync().await?;
            outcome.aborted_sync = true;
        }
        // New folders may appear below paths that left the blacklist, so the
        // journal must not be trusted for any changed path.
        for path in &reconciliation.changed {
            folder.invalidate_cached_metadata(path).await?;
        }
        folder.schedule_resync().await?;
    }

    // Stored last: after a failure above the old blacklist remains and the
    // next apply recomputes the same change set.
    folder.set_blacklist(&reconciliation.blacklist).await?;

    if reconciliation.has_changes() {
        tracing::info!(
            folder = folder.alias(),
            changed = reconciliation.changed.len(),
            entries = reconciliation.blacklist.len(),
            "selective sync applied"
        );
    } else {
        tracing::debug!(folder = folder.alias(), "blacklist unchanged");
    }
    Ok(())
}
