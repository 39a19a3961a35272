//! Structural invariant checker, for tests and debugging. Run with all
//! writers quiesced.

use crate::tagged::TaggedRef;

use super::layout::JA_TYPES;
use super::{JudyTrie, TrieEntry, node};

impl<T: TrieEntry> JudyTrie<T> {
    /// Check every steady-state invariant, panicking on violation:
    ///
    /// - each internal node's live child count matches its shadow
    ///   record;
    /// - no node exceeds its class capacity;
    /// - every non-root internal node has at least one live child;
    /// - the shadow directory holds exactly one record per reachable
    ///   internal node.
    ///
    /// Returns the number of populated keys (duplicate chains).
    pub fn validate(&self) -> usize {
        let mut internal_nodes = 0;
        let mut keys = 0;
        self.validate_subtree(self.root_word(), 0, &mut internal_nodes, &mut keys);
        assert_eq!(
            self.shadow().len(),
            internal_nodes,
            "shadow directory out of sync with the reachable trie"
        );
        keys
    }

    fn validate_subtree(
        &self,
        word: TaggedRef,
        level: usize,
        internal_nodes: &mut usize,
        keys: &mut usize,
    ) {
        *internal_nodes += 1;

        // SAFETY: quiesced; the node is reachable.
        let children = unsafe { node::children_of(word) };
        let ty = &JA_TYPES[word.type_index()];
        assert!(
            children.len() <= ty.max_child as usize,
            "node exceeds its class capacity"
        );
        if level > 0 {
            assert!(!children.is_empty(), "childless non-root node left behind");
        }

        let (shadow_count, _) = self
            .shadow()
            .peek_counts(word)
            .expect("reachable node missing its shadow record");
        assert_eq!(
            shadow_count as usize,
            children.len(),
            "shadow child count diverged from the node"
        );
        assert_eq!(
            self.shadow().level_of(word),
            Some(level),
            "shadow record at the wrong level"
        );

        if level == self.depth() - 1 {
            *keys += children.len();
            return;
        }
        for (_, child) in children {
            self.validate_subtree(TaggedRef::from_raw(child), level + 1, internal_nodes, keys);
        }
    }
}
