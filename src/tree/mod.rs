//! The selective-sync folder tree.
//!
//! One root per configured sync folder. Sub-folders are materialized lazily
//! from remote listings; every node carries a tri-state selection that the
//! propagator keeps consistent with its children, and the reconciler turns
//! into a per-folder blacklist.

pub mod blacklist;
pub mod node;
mod propagate;

use std::sync::Arc;

use crate::folder::SyncFolder;
use crate::listing::ListedEntry;
use crate::util::path::{self as remote_path, ROOT_SENTINEL};

pub use node::{Address, ChildCount, NodeRef, Selection, TreeNode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// The listing for a node failed; the node stays unfetched and can be
    /// expanded again.
    #[error("listing {address} failed: {message}")]
    ListingFailed { address: Address, message: String },
    /// A listing completed for a node that was discarded or re-requested in
    /// the meantime.
    #[error("stale listing response for {address}")]
    StaleResponse { address: Address },
    #[error("cannot change {address}: {reason}")]
    InvalidState {
        address: Address,
        reason: &'static str,
    },
    #[error("no node at {address}")]
    NodeNotFound { address: Address },
}

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    NodeChanged(Address),
    ChildrenInserted { parent: Address, count: usize },
    ListingFailed { address: Address, message: String },
    DirtyChanged(bool),
    Reset,
}

/// A listing the caller has to issue on behalf of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub address: Address,
    /// Validity token; a completion carrying another token is stale.
    pub token: u64,
    pub base_url: String,
    pub relative_path: String,
}

struct RootBinding {
    node: TreeNode,
    folder: Arc<dyn SyncFolder>,
}

pub struct Tree {
    roots: Vec<RootBinding>,
    dirty: bool,
    next_token: u64,
    events: Vec<TreeEvent>,
}

impl Tree {
    pub fn new(folders: Vec<Arc<dyn SyncFolder>>) -> Self {
        Self {
            roots: bind_roots(folders),
            dirty: false,
            next_token: 0,
            events: Vec::new(),
        }
    }

    /// Discard every node and rebuild the unfetched roots.
    ///
    /// Tokens keep counting so responses for the old tree stay stale.
    pub fn reset(&mut self, folders: Vec<Arc<dyn SyncFolder>>) {
        tracing::debug!(folders = folders.len(), "resetting selective sync tree");
        self.roots = bind_roots(folders);
        self.events.clear();
        self.events.push(TreeEvent::Reset);
        self.set_dirty(false);
    }

    pub fn folders(&self) -> Vec<Arc<dyn SyncFolder>> {
        self.roots.iter().map(|r| r.folder.clone()).collect()
    }

    pub fn root(&self, index: usize) -> Option<&TreeNode> {
        self.roots.get(index).map(|r| &r.node)
    }

    pub fn folder(&self, index: usize) -> Option<&Arc<dyn SyncFolder>> {
        self.roots.get(index).map(|r| &r.folder)
    }

    pub fn node(&self, address: &Address) -> Option<&TreeNode> {
        let (root, rest) = address.indices().split_first()?;
        self.roots.get(*root)?.node.descendant(rest)
    }

    pub(crate) fn node_mut(&mut self, address: &Address) -> Option<&mut TreeNode> {
        let (root, rest) = address.indices().split_first()?;
        self.roots.get_mut(*root)?.node.descendant_mut(rest)
    }

    /// Parent lookup by walking the address prefix from the owning root.
    pub fn parent_of(&self, address: &Address) -> Option<&TreeNode> {
        self.node(&address.parent()?)
    }

    pub fn child_count(&self, address: &Address) -> Result<ChildCount, TreeError> {
        if address.is_virtual_root() {
            return Ok(ChildCount::Known(self.roots.len()));
        }
        self.lookup(address).map(TreeNode::child_count)
    }

    pub fn child_at(&self, address: &Address, index: usize) -> Option<&TreeNode> {
        if address.is_virtual_root() {
            return self.root(index);
        }
        self.node(address)?.children.get(index)
    }

    pub fn can_fetch_more(&self, address: &Address) -> bool {
        self.node(address).is_some_and(TreeNode::can_fetch_more)
    }

    /// Find the direct child of `address` whose relative path is `path`,
    /// ignoring trailing slashes.
    pub fn find_child_by_path(&self, address: &Address, path: &str) -> Option<Address> {
        let wanted = path.trim_matches('/');
        self.node(address)?
            .children
            .iter()
            .find(|c| c.relative_path.trim_matches('/') == wanted)
            .map(|c| c.address.clone())
    }

    /// Mark a node as being listed and describe the request to issue.
    ///
    /// Returns `None` when the node is already listed or a request is in
    /// flight, so at most one listing per node is outstanding.
    pub fn fetch_children(&mut self, address: &Address) -> Result<Option<FetchRequest>, TreeError> {
        let root_index = address
            .root_index()
            .ok_or_else(|| TreeError::NodeNotFound {
                address: address.clone(),
            })?;
        let base_url = match self.roots.get(root_index) {
            Some(r) => r.folder.remote_base_url().to_string(),
            None => {
                return Err(TreeError::NodeNotFound {
                    address: address.clone(),
                });
            }
        };

        let token = self.next_token;
        let node = self.node_mut(address).ok_or_else(|| TreeError::NodeNotFound {
            address: address.clone(),
        })?;
        if !node.can_fetch_more() {
            return Ok(None);
        }
        node.pending = Some(token);
        let relative_path = node.relative_path.clone();
        self.next_token += 1;

        tracing::debug!(%address, path = %relative_path, token, "requesting folder listing");
        Ok(Some(FetchRequest {
            address: address.clone(),
            token,
            base_url,
            relative_path,
        }))
    }

    /// Apply the outcome of a listing issued for `request`.
    ///
    /// Returns the number of children inserted.
    pub fn complete_fetch(
        &mut self,
        request: &FetchRequest,
        result: anyhow::Result<Vec<ListedEntry>>,
    ) -> Result<usize, TreeError> {
        let address = &request.address;
        let stale = || TreeError::StaleResponse {
            address: address.clone(),
        };

        let blacklist = match address.root_index().and_then(|i| self.roots.get(i)) {
            Some(r) => r.folder.current_blacklist(),
            None => return Err(stale()),
        };
        let node = match self.node_mut(address) {
            Some(n) if n.pending == Some(request.token) => n,
            _ => return Err(stale()),
        };
        node.pending = None;

        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                let message = format!("{e:#}");
                tracing::warn!(%address, path = %request.relative_path, error = %message, "folder listing failed");
                self.events.push(TreeEvent::ListingFailed {
                    address: address.clone(),
                    message: message.clone(),
                });
                return Err(TreeError::ListingFailed {
                    address: address.clone(),
                    message,
                });
            }
        };

        let prefix = remote_path::base_prefix(&request.base_url);
        let parent_selection = node.selection;
        let mut children = Vec::with_capacity(entries.len().saturating_sub(1));
        // The first entry is the listed directory itself.
        for entry in entries.iter().skip(1) {
            let rel = remote_path::relative_to_base(&entry.path, &prefix);
            if rel.is_empty() {
                tracing::debug!(path = %entry.path, prefix = %prefix, "dropping entry outside the folder");
                continue;
            }
            let selection = initial_selection(parent_selection, rel, &blacklist);
            children.push(TreeNode::child(
                address.child(children.len()),
                remote_path::leaf_name(rel),
                rel,
                selection,
                entry.size,
            ));
        }

        let count = children.len();
        node.children = children;
        node.fetched = true;

        tracing::debug!(%address, count, "folder listed");
        self.events.push(TreeEvent::ChildrenInserted {
            parent: address.clone(),
            count,
        });
        self.normalize_upward(address);
        Ok(count)
    }

    /// Roots the user actually expanded; only these get their blacklist
    /// recomputed on apply.
    pub fn roots_to_apply(&self) -> Vec<usize> {
        self.roots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.node.fetched)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        if self.dirty != dirty {
            self.dirty = dirty;
            self.events.push(TreeEvent::DirtyChanged(dirty));
        }
    }

    /// Drain queued change notifications.
    pub fn take_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    fn lookup(&self, address: &Address) -> Result<&TreeNode, TreeError> {
        self.node(address).ok_or_else(|| TreeError::NodeNotFound {
            address: address.clone(),
        })
    }

    /// Bring a freshly listed node and its ancestors in line with their
    /// children. Does not mark the tree dirty.
    fn normalize_upward(&mut self, address: &Address) {
        let mut current = Some(address.clone());
        while let Some(addr) = current {
            let Some(node) = self.node_mut(&addr) else {
                break;
            };
            let Some(derived) = derived_selection(node) else {
                break;
            };
            if derived == node.selection {
                break;
            }
            tracing::debug!(address = %addr, from = ?node.selection, to = ?derived, "normalizing selection after listing");
            node.selection = derived;
            self.events.push(TreeEvent::NodeChanged(addr.clone()));
            current = addr.parent();
        }
    }
}

fn bind_roots(folders: Vec<Arc<dyn SyncFolder>>) -> Vec<RootBinding> {
    folders
        .into_iter()
        .enumerate()
        .map(|(i, folder)| {
            let selection = root_selection(&folder.current_blacklist());
            RootBinding {
                node: TreeNode::root(i, folder.alias(), selection),
                folder,
            }
        })
        .collect()
}

/// The state a node's children imply for it.
///
/// A root never becomes Excluded this way: only a stored `/` disables a
/// whole sync folder, so a root whose children are all excluded stays
/// partially included and keeps its top-level files.
pub(crate) fn derived_selection(node: &TreeNode) -> Option<Selection> {
    let derived = Selection::from_children(node.children.iter().map(|c| &c.selection))?;
    if node.is_root() && derived == Selection::Excluded && node.selection != Selection::Excluded {
        return Some(Selection::PartiallyIncluded);
    }
    Some(derived)
}

/// Initial state of a root, derived from its folder's blacklist.
fn root_selection(blacklist: &[String]) -> Selection {
    if blacklist.iter().any(|e| e == ROOT_SENTINEL) {
        Selection::Excluded
    } else if blacklist.iter().all(|e| e.is_empty()) {
        Selection::Included
    } else {
        Selection::PartiallyIncluded
    }
}

/// Initial state of a freshly listed child.
///
/// An exact blacklist match (or the `/` sentinel) wins over an entry that
/// only lies beneath the child. Entries match with or without their
/// trailing `/`.
fn initial_selection(parent: Selection, path: &str, blacklist: &[String]) -> Selection {
    if parent == Selection::Excluded {
        return Selection::Excluded;
    }
    let mut selection = Selection::Included;
    for entry in blacklist {
        if entry == ROOT_SENTINEL || remote_path::folder_key(entry) == remote_path::folder_key(path) {
            return Selection::Excluded;
        }
        if remote_path::is_beneath(entry, path) {
            selection = Selection::PartiallyIncluded;
        }
    }
    selection
}
