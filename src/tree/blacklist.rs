use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::{Selection, TreeNode};
use crate::util::path::{folder_key, is_beneath};

/// Outcome of comparing a recomputed blacklist with the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub blacklist: Vec<String>,
    /// Paths whose exclusion status flipped, in either direction.
    pub changed: BTreeSet<String>,
}

impl Reconciliation {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Serialize a subtree into the list of excluded relative paths.
///
/// A partially included node that was never listed reuses the entries of
/// `previous` below its path verbatim.
pub fn compute_blacklist(node: &TreeNode, previous: &[String]) -> Vec<String> {
    match node.selection {
        Selection::Excluded => vec![node.blacklist_entry().to_string()],
        Selection::Included => Vec::new(),
        Selection::PartiallyIncluded if node.fetched => node
            .children
            .iter()
            .flat_map(|child| compute_blacklist(child, previous))
            .collect(),
        Selection::PartiallyIncluded => previous
            .iter()
            .filter(|entry| is_beneath(entry, &node.relative_path))
            .cloned()
            .collect(),
    }
}

pub fn reconcile(root: &TreeNode, previous: &[String]) -> Reconciliation {
    let blacklist = compute_blacklist(root, previous);

    // Entries differing only in a trailing `/` name the same folder.
    let old: BTreeMap<&str, &str> = previous.iter().map(|e| (folder_key(e), e.as_str())).collect();
    let new: BTreeMap<&str, &str> = blacklist.iter().map(|e| (folder_key(e), e.as_str())).collect();
    let changed = old
        .iter()
        .filter(|(key, _)| !new.contains_key(*key))
        .chain(new.iter().filter(|(key, _)| !old.contains_key(*key)))
        .map(|(_, entry)| entry.to_string())
        .collect();

    Reconciliation { blacklist, changed }
}
