use super::{Address, NodeRef, Selection, Tree, TreeError, TreeEvent, TreeNode, derived_selection};

impl Tree {
    /// User-facing toggle of a sub-folder.
    ///
    /// Roots stand for whole sync folders and cannot be toggled here.
    /// Returns whether anything changed.
    pub fn toggle(&mut self, address: &Address, state: Selection) -> Result<bool, TreeError> {
        let address = match NodeRef::classify(address) {
            None => {
                return Err(TreeError::InvalidState {
                    address: address.clone(),
                    reason: "the tree root has no selection",
                });
            }
            Some(NodeRef::Root(_)) => {
                return Err(TreeError::InvalidState {
                    address: address.clone(),
                    reason: "sync folders are enabled and disabled as a whole",
                });
            }
            Some(NodeRef::Child(address)) => address,
        };
        if self.node(&address).is_none() {
            return Err(TreeError::NodeNotFound { address });
        }

        let changed = self.set_selection(&address, state);
        if changed {
            tracing::debug!(%address, ?state, "selection changed");
            self.set_dirty(true);
        }
        Ok(changed)
    }

    /// Assign `state` to a node and restore consistency around it: fetched
    /// descendants follow an Included/Excluded state, ancestors are derived
    /// from their children.
    ///
    /// A no-op when the node already has `state`.
    pub(crate) fn set_selection(&mut self, address: &Address, state: Selection) -> bool {
        let Some(node) = self.node_mut(address) else {
            return false;
        };
        if node.selection == state {
            return false;
        }
        node.selection = state;

        let mut changed = vec![address.clone()];
        if state != Selection::PartiallyIncluded {
            cascade_down(node, state, &mut changed);
        }
        self.events
            .extend(changed.into_iter().map(TreeEvent::NodeChanged));

        self.propagate_up(address);
        true
    }

    fn propagate_up(&mut self, address: &Address) {
        let Some(parent_address) = address.parent() else {
            return;
        };
        let Some(parent) = self.node(&parent_address) else {
            return;
        };
        let Some(derived) = derived_selection(parent) else {
            return;
        };
        if derived != parent.selection {
            self.set_selection(&parent_address, derived);
        }
    }
}

/// Unfetched subtrees have no children and are resolved at listing time.
fn cascade_down(node: &mut TreeNode, state: Selection, changed: &mut Vec<Address>) {
    for child in &mut node.children {
        if child.selection != state {
            child.selection = state;
            changed.push(child.address.clone());
        }
        cascade_down(child, state, changed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{entries, listed_tree};

    fn addr(indices: &[usize]) -> Address {
        Address::from(indices.to_vec())
    }

    fn state(tree: &Tree, indices: &[usize]) -> Selection {
        tree.node(&addr(indices)).unwrap().selection()
    }

    /// Docs
    /// ├── a/
    /// │   ├── a/x/
    /// │   └── a/y/
    /// └── b/
    fn two_level_tree() -> Tree {
        let mut tree = listed_tree(&[], &["a/", "b/"]);
        let req = tree.fetch_children(&addr(&[0, 0])).unwrap().unwrap();
        tree.complete_fetch(&req, Ok(entries(&["base/a/", "base/a/x/", "base/a/y/"])))
            .unwrap();
        tree.take_events();
        tree
    }

    /// Every fetched node with children matches what its children imply.
    fn assert_consistent(node: &TreeNode) {
        if let Some(derived) = derived_selection(node) {
            assert_eq!(
                node.selection(),
                derived,
                "{} inconsistent with its children",
                node.address()
            );
        }
        for child in node.children() {
            assert_consistent(child);
        }
    }

    #[test]
    fn test_toggle_same_state_is_noop() {
        let mut tree = two_level_tree();
        assert!(!tree.toggle(&addr(&[0, 1]), Selection::Included).unwrap());
        assert!(!tree.is_dirty());
        assert!(tree.take_events().is_empty());
    }

    #[test]
    fn test_exclude_cascades_down() {
        let mut tree = two_level_tree();
        assert!(tree.toggle(&addr(&[0, 0]), Selection::Excluded).unwrap());
        assert_eq!(state(&tree, &[0, 0]), Selection::Excluded);
        assert_eq!(state(&tree, &[0, 0, 0]), Selection::Excluded);
        assert_eq!(state(&tree, &[0, 0, 1]), Selection::Excluded);
        assert_eq!(state(&tree, &[0]), Selection::PartiallyIncluded);
        assert!(tree.is_dirty());
        assert_consistent(tree.root(0).unwrap());
    }

    #[test]
    fn test_upward_cascade() {
        let mut tree = two_level_tree();
        tree.toggle(&addr(&[0, 0]), Selection::Excluded).unwrap();
        assert_eq!(state(&tree, &[0, 0]), Selection::Excluded);

        // B back in while A stays out.
        tree.toggle(&addr(&[0, 0, 1]), Selection::Included).unwrap();
        assert_eq!(state(&tree, &[0, 0]), Selection::PartiallyIncluded);

        tree.toggle(&addr(&[0, 0, 0]), Selection::Included).unwrap();
        assert_eq!(state(&tree, &[0, 0]), Selection::Included);
        assert_eq!(state(&tree, &[0]), Selection::Included);
        assert_consistent(tree.root(0).unwrap());
    }

    #[test]
    fn test_excluding_last_child_excludes_parent() {
        let mut tree = two_level_tree();
        tree.toggle(&addr(&[0, 0, 0]), Selection::Excluded).unwrap();
        assert_eq!(state(&tree, &[0, 0]), Selection::PartiallyIncluded);
        assert_eq!(state(&tree, &[0]), Selection::PartiallyIncluded);

        tree.toggle(&addr(&[0, 0, 1]), Selection::Excluded).unwrap();
        assert_eq!(state(&tree, &[0, 0]), Selection::Excluded);
        assert_eq!(state(&tree, &[0]), Selection::PartiallyIncluded);
        assert_consistent(tree.root(0).unwrap());
    }

    #[test]
    fn test_root_never_becomes_excluded() {
        let mut tree = two_level_tree();
        tree.toggle(&addr(&[0, 0]), Selection::Excluded).unwrap();
        tree.toggle(&addr(&[0, 1]), Selection::Excluded).unwrap();
        assert_eq!(state(&tree, &[0]), Selection::PartiallyIncluded);

        tree.toggle(&addr(&[0, 1]), Selection::Included).unwrap();
        assert_eq!(state(&tree, &[0]), Selection::PartiallyIncluded);
        tree.toggle(&addr(&[0, 0]), Selection::Included).unwrap();
        assert_eq!(state(&tree, &[0]), Selection::Included);
    }

    #[test]
    fn test_partial_propagates_to_ancestors() {
        let mut tree = two_level_tree();
        assert!(tree.set_selection(&addr(&[0, 0]), Selection::PartiallyIncluded));
        // Children untouched by a partial state.
        assert_eq!(state(&tree, &[0, 0, 0]), Selection::Included);
        assert_eq!(state(&tree, &[0]), Selection::PartiallyIncluded);
    }

    #[test]
    fn test_unfetched_subtree_resolves_at_listing_time() {
        let mut tree = two_level_tree();
        tree.toggle(&addr(&[0, 1]), Selection::Excluded).unwrap();
        let req = tree.fetch_children(&addr(&[0, 1])).unwrap().unwrap();
        tree.complete_fetch(&req, Ok(entries(&["base/b/", "base/b/z/"])))
            .unwrap();
        assert_eq!(state(&tree, &[0, 1, 0]), Selection::Excluded);
    }

    #[test]
    fn test_toggle_rejects_roots() {
        let mut tree = two_level_tree();
        let err = tree.toggle(&addr(&[0]), Selection::Excluded).unwrap_err();
        assert!(matches!(err, TreeError::InvalidState { .. }));
        let err = tree
            .toggle(&Address::default(), Selection::Excluded)
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidState { .. }));
        assert_eq!(state(&tree, &[0]), Selection::Included);
        assert!(!tree.is_dirty());
    }

    #[test]
    fn test_toggle_unknown_node() {
        let mut tree = two_level_tree();
        let err = tree.toggle(&addr(&[0, 9]), Selection::Excluded).unwrap_err();
        assert!(matches!(err, TreeError::NodeNotFound { .. }));
    }

    #[test]
    fn test_events_cover_changed_nodes() {
        let mut tree = two_level_tree();
        tree.toggle(&addr(&[0, 0]), Selection::Excluded).unwrap();
        let events = tree.take_events();
        for changed in [addr(&[0, 0]), addr(&[0, 0, 0]), addr(&[0, 0, 1]), addr(&[0])] {
            assert!(
                events.contains(&TreeEvent::NodeChanged(changed.clone())),
                "missing change event for {changed}"
            );
        }
        assert!(events.contains(&TreeEvent::DirtyChanged(true)));
    }

    #[test]
    fn test_random_walk_keeps_invariant() {
        let mut tree = two_level_tree();
        let targets = [
            addr(&[0, 0]),
            addr(&[0, 0, 0]),
            addr(&[0, 0, 1]),
            addr(&[0, 1]),
        ];
        let states = [Selection::Excluded, Selection::Included];
        for step in 0..64usize {
            let target = &targets[(step * 7 + step / 3) % targets.len()];
            let s = states[(step / 2 + step % 3) % states.len()];
            tree.toggle(target, s).unwrap();
            assert_consistent(tree.root(0).unwrap());
        }
    }
}
