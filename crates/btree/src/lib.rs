//! Page-backed B+Tree mapping byte keys to entry references.
//!
//! This is the tree every secondary index is built on. All page I/O goes
//! through the shared [`PageManager`] (nodes live in `AttrIndex`-typed
//! pages); the tree itself holds nothing but its root page id, so a tree
//! can be reopened from the id recorded in the index metadata page.
//!
//! The root never moves: when it splits, its halves are copied into two
//! fresh pages and the root page is rewritten as their parent. Metadata
//! that records a root page id therefore stays valid for the life of the
//! index.

mod node;

pub use node::BTreeNode;

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{DbError, DbResult, EntryRef, PageId};
use std::sync::Arc;
use storage::{flags, Page, PageManager, PageType, PAGE_PAYLOAD_SIZE};

fn bincode_config() -> impl Config {
    config::legacy()
}

/// Count-based split thresholds; an encoded-size check splits earlier for
/// long keys.
const MAX_LEAF_ENTRIES: usize = 32;
const MAX_INTERNAL_KEYS: usize = 32;

/// A persistent B+Tree rooted at a fixed page.
#[derive(Debug)]
pub struct BTree {
    pages: Arc<PageManager>,
    root: PageId,
}

impl BTree {
    /// Allocate a root page holding an empty leaf.
    pub fn create(pages: Arc<PageManager>) -> DbResult<Self> {
        let root = pages.allocate_page(PageType::AttrIndex)?;
        let tree = Self { pages, root };
        tree.write_node(root, &BTreeNode::new_leaf())?;
        Ok(tree)
    }

    /// Open a tree at a previously recorded root page.
    pub fn open(pages: Arc<PageManager>, root: PageId) -> DbResult<Self> {
        if root.0 == 0 {
            return Err(DbError::InvalidPageId(0));
        }
        let tree = Self { pages, root };
        // Validate the root parses as a node before handing the tree out.
        tree.read_node(root)?;
        Ok(tree)
    }

    /// The page id the tree is rooted at; never changes after `create`.
    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    /// All postings recorded under a key.
    pub fn search(&self, key: &[u8]) -> DbResult<Vec<EntryRef>> {
        self.scan_range(Some(key), Some(key))
    }

    /// Postings for every key in `[low, high]` (both bounds inclusive,
    /// `None` meaning unbounded).
    pub fn scan_range(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> DbResult<Vec<EntryRef>> {
        let mut results = Vec::new();
        let mut page_id = self.find_leaf(low.unwrap_or(&[]))?;

        loop {
            let node = self.read_node(page_id)?;
            let BTreeNode::Leaf { entries, next_leaf } = node else {
                return Err(DbError::FileCorrupted(
                    "btree descent ended on an internal node".into(),
                ));
            };
            for (k, eref) in &entries {
                if let Some(lo) = low {
                    if k.as_slice() < lo {
                        continue;
                    }
                }
                if let Some(hi) = high {
                    if k.as_slice() > hi {
                        return Ok(results);
                    }
                }
                results.push(*eref);
            }
            match next_leaf {
                Some(next) => page_id = next,
                None => break,
            }
        }
        Ok(results)
    }

    /// Every `(key, posting)` pair in key order.
    pub fn scan_all(&self) -> DbResult<Vec<(Vec<u8>, EntryRef)>> {
        let mut page_id = self.root;
        loop {
            match self.read_node(page_id)? {
                BTreeNode::Internal { children, .. } => {
                    page_id = *children.first().ok_or_else(|| {
                        DbError::FileCorrupted("internal btree node has no children".into())
                    })?;
                }
                BTreeNode::Leaf { .. } => break,
            }
        }

        let mut results = Vec::new();
        loop {
            let BTreeNode::Leaf { entries, next_leaf } = self.read_node(page_id)? else {
                return Err(DbError::FileCorrupted("leaf chain reached an internal node".into()));
            };
            results.extend(entries);
            match next_leaf {
                Some(next) => page_id = next,
                None => break,
            }
        }
        Ok(results)
    }

    /// Insert one posting under a key. Duplicate `(key, posting)` pairs are
    /// stored as written.
    pub fn insert(&self, key: Vec<u8>, eref: EntryRef) -> DbResult<()> {
        if let Some((split_key, right_page)) = self.insert_recursive(self.root, key, eref)? {
            // Root split: copy the overflowing root into a fresh page and
            // rewrite the root as the parent of the two halves.
            let old_root = self.read_node(self.root)?;
            let left_page = self.pages.allocate_page(PageType::AttrIndex)?;
            self.write_node(left_page, &old_root)?;
            let new_root = BTreeNode::Internal {
                keys: vec![split_key],
                children: vec![left_page, right_page],
            };
            self.write_node(self.root, &new_root)?;
        }
        Ok(())
    }

    /// Remove one `(key, posting)` pair. Returns whether anything matched;
    /// deleting an absent pair is not an error.
    pub fn delete(&self, key: &[u8], eref: EntryRef) -> DbResult<bool> {
        let leaf_page = self.find_leaf(key)?;
        let mut node = self.read_node(leaf_page)?;
        let BTreeNode::Leaf { entries, .. } = &mut node else {
            return Err(DbError::FileCorrupted(
                "btree descent ended on an internal node".into(),
            ));
        };

        let before = entries.len();
        // Duplicates can spill into the next leaf; walk the chain until the
        // key range is behind us.
        entries.retain(|(k, r)| !(k == key && *r == eref));
        let mut deleted = entries.len() < before;
        if deleted {
            self.write_node(leaf_page, &node)?;
        } else {
            let mut cursor = match &node {
                BTreeNode::Leaf { next_leaf, .. } => *next_leaf,
                BTreeNode::Internal { .. } => None,
            };
            while let Some(page_id) = cursor {
                let mut chained = self.read_node(page_id)?;
                let BTreeNode::Leaf { entries, next_leaf } = &mut chained else {
                    break;
                };
                if entries.first().map(|(k, _)| k.as_slice() > key).unwrap_or(false) {
                    break;
                }
                let before = entries.len();
                entries.retain(|(k, r)| !(k == key && *r == eref));
                if entries.len() < before {
                    deleted = true;
                    self.write_node(page_id, &chained)?;
                    break;
                }
                cursor = *next_leaf;
            }
        }
        Ok(deleted)
    }

    /// Every page id reachable from the root, the root included.
    ///
    /// Used to free an index wholesale when it is dropped.
    pub fn collect_pages(&self) -> DbResult<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            pages.push(page_id);
            if let BTreeNode::Internal { children, .. } = self.read_node(page_id)? {
                stack.extend(children);
            }
        }
        Ok(pages)
    }

    // ---- Private helpers ----

    /// Descend to the leftmost leaf that can contain `key`.
    ///
    /// Uses a strict comparison so duplicates equal to a separator key
    /// (which stay in the left sibling after a split) are not skipped;
    /// readers then follow the leaf chain rightward.
    fn find_leaf(&self, key: &[u8]) -> DbResult<PageId> {
        let mut current = self.root;
        loop {
            match self.read_node(current)? {
                BTreeNode::Internal { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() < key);
                    current = *children.get(idx).ok_or_else(|| {
                        DbError::FileCorrupted("btree child index out of bounds".into())
                    })?;
                }
                BTreeNode::Leaf { .. } => return Ok(current),
            }
        }
    }

    fn insert_recursive(
        &self,
        page_id: PageId,
        key: Vec<u8>,
        eref: EntryRef,
    ) -> DbResult<Option<(Vec<u8>, PageId)>> {
        match self.read_node(page_id)? {
            BTreeNode::Internal { mut keys, mut children } => {
                let idx = keys.partition_point(|k| k.as_slice() <= key.as_slice());
                let child = *children.get(idx).ok_or_else(|| {
                    DbError::FileCorrupted("btree child index out of bounds".into())
                })?;

                let Some((split_key, new_child)) = self.insert_recursive(child, key, eref)? else {
                    return Ok(None);
                };

                keys.insert(idx, split_key);
                children.insert(idx + 1, new_child);
                let node = BTreeNode::Internal { keys, children };

                if self.node_overflows(&node)? {
                    let (left, promoted, right) = split_internal(node)?;
                    self.write_node(page_id, &left)?;
                    let right_page = self.pages.allocate_page(PageType::AttrIndex)?;
                    self.write_node(right_page, &right)?;
                    Ok(Some((promoted, right_page)))
                } else {
                    self.write_node(page_id, &node)?;
                    Ok(None)
                }
            }
            BTreeNode::Leaf { mut entries, next_leaf } => {
                let idx = entries.partition_point(|(k, _)| k.as_slice() <= key.as_slice());
                entries.insert(idx, (key, eref));
                let node = BTreeNode::Leaf { entries, next_leaf };

                if self.node_overflows(&node)? {
                    let BTreeNode::Leaf { entries, next_leaf } = node else {
                        unreachable!("leaf constructed above");
                    };
                    let (left_entries, right_entries, split_key) = split_leaf_entries(entries)?;
                    let right_page = self.pages.allocate_page(PageType::AttrIndex)?;
                    self.write_node(
                        right_page,
                        &BTreeNode::Leaf {
                            entries: right_entries,
                            next_leaf,
                        },
                    )?;
                    self.write_node(
                        page_id,
                        &BTreeNode::Leaf {
                            entries: left_entries,
                            next_leaf: Some(right_page),
                        },
                    )?;
                    Ok(Some((split_key, right_page)))
                } else {
                    self.write_node(page_id, &node)?;
                    Ok(None)
                }
            }
        }
    }

    fn node_overflows(&self, node: &BTreeNode) -> DbResult<bool> {
        let over_count = match node {
            BTreeNode::Internal { keys, .. } => keys.len() > MAX_INTERNAL_KEYS,
            BTreeNode::Leaf { entries, .. } => entries.len() > MAX_LEAF_ENTRIES,
        };
        if over_count {
            return Ok(true);
        }
        Ok(encoded_len(node)? > PAGE_PAYLOAD_SIZE)
    }

    fn read_node(&self, page_id: PageId) -> DbResult<BTreeNode> {
        let page = self.pages.read_page_validated(page_id)?;
        if page.page_type != PageType::AttrIndex {
            return Err(DbError::FileCorrupted(format!(
                "expected an index page at {}, found {:?}",
                page_id.0, page.page_type
            )));
        }
        let (node, _) = decode_from_slice(&page.payload, bincode_config())
            .map_err(|e| DbError::Serialization(format!("btree node decode failed: {e}")))?;
        Ok(node)
    }

    fn write_node(&self, page_id: PageId, node: &BTreeNode) -> DbResult<()> {
        let bytes = encode_to_vec(node, bincode_config())
            .map_err(|e| DbError::Serialization(format!("btree node encode failed: {e}")))?;
        if bytes.len() > PAGE_PAYLOAD_SIZE {
            return Err(DbError::PageOverflow(bytes.len()));
        }

        let mut page = Page::new(page_id, PageType::AttrIndex);
        page.payload[..bytes.len()].copy_from_slice(&bytes);
        page.item_count = node.len() as u16;
        page.free_space = (PAGE_PAYLOAD_SIZE - bytes.len()) as u16;
        if node.is_leaf() {
            page.set_flag(flags::LEAF);
        }
        self.pages.write_page(&page)
    }
}

fn encoded_len(node: &BTreeNode) -> DbResult<usize> {
    encode_to_vec(node, bincode_config())
        .map(|b| b.len())
        .map_err(|e| DbError::Serialization(format!("btree node encode failed: {e}")))
}

fn split_leaf_entries(
    entries: Vec<(Vec<u8>, EntryRef)>,
) -> DbResult<(Vec<(Vec<u8>, EntryRef)>, Vec<(Vec<u8>, EntryRef)>, Vec<u8>)> {
    let mid = entries.len() / 2;
    let right: Vec<_> = entries[mid..].to_vec();
    let left: Vec<_> = entries[..mid].to_vec();
    let split_key = right
        .first()
        .map(|(k, _)| k.clone())
        .ok_or_else(|| DbError::FileCorrupted("split produced an empty right leaf".into()))?;
    Ok((left, right, split_key))
}

fn split_internal(node: BTreeNode) -> DbResult<(BTreeNode, Vec<u8>, BTreeNode)> {
    let BTreeNode::Internal { keys, children } = node else {
        return Err(DbError::FileCorrupted("split_internal on a leaf".into()));
    };
    let mid = keys.len() / 2;

    let left = BTreeNode::Internal {
        keys: keys[..mid].to_vec(),
        children: children[..=mid].to_vec(),
    };
    let promoted = keys[mid].clone();
    let right = BTreeNode::Internal {
        keys: keys[mid + 1..].to_vec(),
        children: children[mid + 1..].to_vec(),
    };
    Ok((left, promoted, right))
}

#[cfg(test)]
mod tests;
