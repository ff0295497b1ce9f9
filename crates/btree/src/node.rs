//! B+Tree node definitions.

use common::{EntryRef, PageId};
use serde::{Deserialize, Serialize};

/// A B+Tree node, either internal or leaf.
///
/// Keys are opaque byte strings; duplicate keys are stored as separate leaf
/// entries so one key can carry many postings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BTreeNode {
    /// Internal node with separator keys (n keys for n+1 children).
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<PageId>,
    },
    /// Leaf node with key → entry-reference postings, sorted by key.
    Leaf {
        entries: Vec<(Vec<u8>, EntryRef)>,
        next_leaf: Option<PageId>,
    },
}

impl BTreeNode {
    pub fn new_leaf() -> Self {
        Self::Leaf {
            entries: Vec::new(),
            next_leaf: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Internal { keys, .. } => keys.len(),
            Self::Leaf { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
