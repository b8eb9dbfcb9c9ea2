use std::fmt;

use serde::Serialize;

/// Tri-state selection flag of a folder node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// The folder and everything below it is synced.
    Included,
    /// Nothing at or below the folder is synced.
    Excluded,
    /// Some descendants are excluded.
    PartiallyIncluded,
}

impl Selection {
    /// Derive a node's state from its children's states.
    ///
    /// Returns `None` for an empty child list, which carries no information.
    pub fn from_children<'a>(mut states: impl Iterator<Item = &'a Selection>) -> Option<Self> {
        let first = *states.next()?;
        if first == Selection::PartiallyIncluded {
            return Some(Selection::PartiallyIncluded);
        }
        for s in states {
            if *s != first {
                return Some(Selection::PartiallyIncluded);
            }
        }
        Some(first)
    }

    /// Checkbox-style marker used by the CLI tree printer.
    pub fn marker(self) -> &'static str {
        match self {
            Selection::Included => "[x]",
            Selection::Excluded => "[ ]",
            Selection::PartiallyIncluded => "[~]",
        }
    }
}

/// Position of a node as the chain of child indices from the forest,
/// root index first.
///
/// The empty address is the virtual tree root, which is never a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize)]
pub struct Address(Vec<usize>);

impl Address {
    pub fn root(index: usize) -> Self {
        Self(vec![index])
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn is_virtual_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the sync folder this address belongs to.
    pub fn root_index(&self) -> Option<usize> {
        self.0.first().copied()
    }

    /// Levels below the owning root (0 for the root itself).
    pub fn depth(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// Address of the parent node. Roots and the virtual root have none.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }
}

impl From<Vec<usize>> for Address {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        write!(f, "[{}]", parts.join("/"))
    }
}

/// A node handle classified once, at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    /// A configured sync folder.
    Root(usize),
    /// A remote sub-folder somewhere below a root.
    Child(Address),
}

impl NodeRef {
    /// Classify an address. The virtual root yields `None`.
    pub fn classify(address: &Address) -> Option<Self> {
        match address.indices() {
            [] => None,
            [root] => Some(NodeRef::Root(*root)),
            _ => Some(NodeRef::Child(address.clone())),
        }
    }
}

/// Number of children as known to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildCount {
    Known(usize),
    /// Not listed yet; show an expandable placeholder.
    Unknown,
}

/// A single remote folder in the selective-sync tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub(crate) name: String,
    pub(crate) relative_path: String,
    pub(crate) address: Address,
    pub(crate) selection: Selection,
    pub(crate) children: Vec<TreeNode>,
    pub(crate) fetched: bool,
    /// Token of the outstanding listing request, if any.
    pub(crate) pending: Option<u64>,
    pub(crate) remote_size: u64,
}

impl TreeNode {
    pub(crate) fn root(index: usize, name: &str, selection: Selection) -> Self {
        Self {
            name: name.to_string(),
            relative_path: String::new(),
            address: Address::root(index),
            selection,
            children: Vec::new(),
            fetched: false,
            pending: None,
            remote_size: 0,
        }
    }

    pub(crate) fn child(
        address: Address,
        name: &str,
        relative_path: &str,
        selection: Selection,
        remote_size: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            relative_path: relative_path.to_string(),
            address,
            selection,
            children: Vec::new(),
            fetched: false,
            pending: None,
            remote_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to the sync folder's remote base; empty for roots.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn children(&self) -> &[TreeNode] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.address.depth() == 0
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn remote_size(&self) -> u64 {
        self.remote_size
    }

    pub fn child_count(&self) -> ChildCount {
        if self.fetched {
            ChildCount::Known(self.children.len())
        } else {
            ChildCount::Unknown
        }
    }

    /// Whether a listing request may be issued for this node now.
    pub fn can_fetch_more(&self) -> bool {
        !self.fetched && self.pending.is_none()
    }

    /// The blacklist entry that excludes this node's whole subtree.
    pub fn blacklist_entry(&self) -> &str {
        if self.is_root() {
            crate::util::path::ROOT_SENTINEL
        } else {
            &self.relative_path
        }
    }

    pub(crate) fn descendant(&self, rest: &[usize]) -> Option<&TreeNode> {
        match rest.split_first() {
            None => Some(self),
            Some((i, tail)) => self.children.get(*i)?.descendant(tail),
        }
    }

    pub(crate) fn descendant_mut(&mut self, rest: &[usize]) -> Option<&mut TreeNode> {
        match rest.split_first() {
            None => Some(self),
            Some((i, tail)) => self.children.get_mut(*i)?.descendant_mut(tail),
        }
    }
}
