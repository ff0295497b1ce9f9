//! DN-keyed radix tree: the primary index of the directory.
//!
//! Nodes are keyed by normalized DN components in root-first order, so
//! `uid=alice,ou=users,dc=example,dc=com` is the path
//! `dc=com → dc=example → ou=users → uid=alice` from the root. Every node
//! carries a subtree count (its own entry plus all descendants'), kept
//! exact by every mutation, which makes subtree size queries O(depth).
//!
//! The node graph lives in an arena (`u32` indices, parent links by index)
//! rather than in linked pointers; serialization to the root page and the
//! cache file reuses the same indexed form.
//!
//! Normal operation stores one component per edge. The explicit
//! [`RadixTree::compress`] / [`RadixTree::split`] helpers merge and re-split
//! single-child chains after the fact; lookups understand both forms.

#[cfg(test)]
mod tests;

mod cache;
mod iter;
mod node;
mod page_image;

pub use cache::CacheLoad;
pub use iter::{RadixIterator, Scope};

use common::dn::{self, parse_dn};
use common::{DbError, DbResult, EntryRef, PageId};
use node::{flatten, Arena, NodeIdx, RadixNode, ROOT};
use parking_lot::RwLock;
use storage::{Page, PageManager, PageType};

/// Thread-safe DN radix tree.
///
/// A single reader-writer lock guards the node graph; iteration snapshots
/// its matches under the read lock and then releases it.
pub struct RadixTree {
    arena: RwLock<Arena>,
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RadixTree {
    /// An empty tree (just the root).
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena::with_root()),
        }
    }

    /// Record an entry location under a DN, creating intermediate nodes.
    ///
    /// # Errors
    ///
    /// `EntryExists` if the DN already holds an entry; DN parse errors for
    /// malformed names.
    pub fn insert(&self, dn_str: &str, entry: EntryRef) -> DbResult<()> {
        let components = parse_dn(dn_str)?;
        let mut arena = self.arena.write();

        let mut cur = ROOT;
        let mut pos = 0;
        while pos < components.len() {
            if let Some(next) = arena.child_by_key(cur, &components[pos]) {
                cur = next;
                pos += 1;
                continue;
            }
            if let Some(edge) = compressed_edge_starting_with(&arena, cur, &components[pos]) {
                // A merged edge is in the way; expand it and retry this
                // component.
                split_edge(&mut arena, cur, edge);
                continue;
            }
            let child = arena.alloc(RadixNode::new(components[pos].clone(), Some(cur)));
            arena.link_child(cur, child);
            cur = child;
            pos += 1;
        }

        let target = arena.get_mut(cur);
        if target.has_entry {
            return Err(DbError::EntryExists(dn::normalize_dn(dn_str)?));
        }
        target.has_entry = true;
        target.entry = entry;

        // One new entry below every node on the path, the target included.
        let mut walk = Some(cur);
        while let Some(idx) = walk {
            let node = arena.get_mut(idx);
            node.subtree_count += 1;
            walk = node.parent;
        }
        Ok(())
    }

    /// Remove the entry at a DN, pruning nodes left empty and childless.
    pub fn delete(&self, dn_str: &str) -> DbResult<()> {
        let components = parse_dn(dn_str)?;
        let mut arena = self.arena.write();

        let target = find_node(&arena, &components)
            .filter(|&idx| arena.get(idx).has_entry)
            .ok_or_else(|| DbError::EntryNotFound(dn_str.to_string()))?;

        {
            let node = arena.get_mut(target);
            node.has_entry = false;
            node.entry = EntryRef {
                page_id: PageId(0),
                slot: 0,
            };
        }

        let mut walk = Some(target);
        while let Some(idx) = walk {
            let node = arena.get_mut(idx);
            node.subtree_count -= 1;
            walk = node.parent;
        }

        // Cascade removal of empty leaves toward the root.
        let mut cur = target;
        while cur != ROOT {
            let node = arena.get(cur);
            if node.has_entry || !node.is_leaf() {
                break;
            }
            let parent = node.parent.unwrap_or(ROOT);
            arena.unlink_child(parent, cur);
            arena.release(cur);
            cur = parent;
        }
        Ok(())
    }

    /// The entry location recorded at a DN, if one exists.
    pub fn lookup(&self, dn_str: &str) -> DbResult<Option<EntryRef>> {
        let components = parse_dn(dn_str)?;
        let arena = self.arena.read();
        Ok(find_node(&arena, &components)
            .map(|idx| arena.get(idx))
            .filter(|node| node.has_entry)
            .map(|node| node.entry))
    }

    /// Replace the entry location at a DN. Subtree counts do not change.
    pub fn update(&self, dn_str: &str, entry: EntryRef) -> DbResult<()> {
        let components = parse_dn(dn_str)?;
        let mut arena = self.arena.write();
        let idx = find_node(&arena, &components)
            .filter(|&idx| arena.get(idx).has_entry)
            .ok_or_else(|| DbError::EntryNotFound(dn_str.to_string()))?;
        arena.get_mut(idx).entry = entry;
        Ok(())
    }

    /// Whether the node at a DN has any children.
    pub fn has_children(&self, dn_str: &str) -> DbResult<bool> {
        let components = parse_dn(dn_str)?;
        let arena = self.arena.read();
        let idx = find_node(&arena, &components)
            .ok_or_else(|| DbError::EntryNotFound(dn_str.to_string()))?;
        Ok(!arena.get(idx).is_leaf())
    }

    /// The DN of the parent node, or `None` directly below the root.
    pub fn get_parent(&self, dn_str: &str) -> DbResult<Option<String>> {
        let components = parse_dn(dn_str)?;
        let arena = self.arena.read();
        let idx = find_node(&arena, &components)
            .ok_or_else(|| DbError::EntryNotFound(dn_str.to_string()))?;
        match arena.get(idx).parent {
            None | Some(ROOT) => Ok(None),
            Some(parent) => Ok(Some(node_dn(&arena, parent))),
        }
    }

    /// Entries at or below a DN (the subtree count of its node).
    pub fn get_subtree_count(&self, dn_str: &str) -> DbResult<u32> {
        let components = parse_dn(dn_str)?;
        let arena = self.arena.read();
        let idx = find_node(&arena, &components)
            .ok_or_else(|| DbError::EntryNotFound(dn_str.to_string()))?;
        Ok(arena.get(idx).subtree_count)
    }

    /// Total entries in the tree.
    pub fn len(&self) -> usize {
        self.arena.read().get(ROOT).subtree_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.arena.read().len()
    }

    /// Snapshot matching entries for a search scope.
    pub fn iterate(&self, base_dn: &str, scope: Scope) -> DbResult<RadixIterator> {
        iter::collect(self, base_dn, scope)
    }

    /// Merge every entry-less single-child node into its child.
    ///
    /// The merged edge key joins the components root-first; lookups match
    /// merged edges, and mutations re-split them on demand.
    pub fn compress(&self) {
        let mut arena = self.arena.write();
        loop {
            let candidate = live_indices(&arena).into_iter().find(|&idx| {
                idx != ROOT && {
                    let node = arena.get(idx);
                    !node.has_entry && node.children_by_key.len() == 1
                }
            });
            let Some(idx) = candidate else { break };
            merge_into_child(&mut arena, idx);
        }
    }

    /// Re-expand every merged edge into one node per component.
    pub fn split(&self) {
        let mut arena = self.arena.write();
        loop {
            let candidate = live_indices(&arena).into_iter().find(|&idx| {
                idx != ROOT && dn::split_components(&arena.get(idx).key).len() > 1
            });
            let Some(idx) = candidate else { break };
            let parent = arena.get(idx).parent.unwrap_or(ROOT);
            split_edge(&mut arena, parent, idx);
        }
    }

    /// Verify the subtree-count invariant over the whole tree (test aid).
    pub fn verify_counts(&self) -> bool {
        let arena = self.arena.read();
        live_indices(&arena).into_iter().all(|idx| {
            let node = arena.get(idx);
            let children_sum: u32 = node
                .children_by_key
                .values()
                .map(|&c| arena.get(c).subtree_count)
                .sum();
            node.subtree_count == u32::from(node.has_entry) + children_sum
        })
    }

    /// Serialize the tree into its root page.
    ///
    /// # Errors
    ///
    /// `PageOverflow` when the image does not fit one page; callers fall
    /// back to the cache file.
    pub fn persist_root(&self, pages: &PageManager, root_page: PageId) -> DbResult<()> {
        let flat = flatten(&self.arena.read());
        let mut page = Page::new(root_page, PageType::DnIndex);
        page_image::encode_into(&flat, &mut page)?;
        pages.write_page(&page)
    }

    /// Rebuild a tree from its root page.
    pub fn load_root(pages: &PageManager, root_page: PageId) -> DbResult<Self> {
        let page = pages.read_page_validated(root_page)?;
        if page.page_type != PageType::DnIndex {
            return Err(DbError::FileCorrupted(format!(
                "expected a dn-index page at {}, found {:?}",
                root_page.0, page.page_type
            )));
        }
        let flat = page_image::decode_from(&page)?;
        Ok(Self {
            arena: RwLock::new(node::rebuild(&flat)),
        })
    }
}

/// Indices of every live node.
fn live_indices(arena: &Arena) -> Vec<NodeIdx> {
    let mut order = vec![ROOT];
    let mut stack = vec![ROOT];
    while let Some(idx) = stack.pop() {
        for &child in arena.get(idx).children_by_key.values() {
            order.push(child);
            stack.push(child);
        }
    }
    order
}

/// Walk components root-first from the root, following single-component
/// children and merged edges alike.
fn find_node(arena: &Arena, components: &[String]) -> Option<NodeIdx> {
    let mut cur = ROOT;
    let mut pos = 0;
    while pos < components.len() {
        if let Some(next) = arena.child_by_key(cur, &components[pos]) {
            cur = next;
            pos += 1;
            continue;
        }
        let node = arena.get(cur);
        let mut matched = None;
        for (key, &idx) in &node.children_by_key {
            let parts = dn::split_components(key);
            if parts.len() <= 1 {
                continue;
            }
            if pos + parts.len() <= components.len() && components[pos..pos + parts.len()] == parts[..]
            {
                matched = Some((idx, parts.len()));
                break;
            }
        }
        let (idx, consumed) = matched?;
        cur = idx;
        pos += consumed;
    }
    Some(cur)
}

/// A merged child edge of `parent` whose first component equals `component`.
fn compressed_edge_starting_with(
    arena: &Arena,
    parent: NodeIdx,
    component: &str,
) -> Option<NodeIdx> {
    arena
        .get(parent)
        .children_by_key
        .iter()
        .find(|(key, _)| {
            let parts = dn::split_components(key);
            parts.len() > 1 && parts[0] == component
        })
        .map(|(_, &idx)| idx)
}

/// Expand a merged edge into one node per component; the original node
/// survives as the deepest link and keeps its entry and children.
fn split_edge(arena: &mut Arena, parent: NodeIdx, child: NodeIdx) {
    let parts = dn::split_components(&arena.get(child).key);
    if parts.len() <= 1 {
        return;
    }
    let count = arena.get(child).subtree_count;
    arena.unlink_child(parent, child);

    let mut prev = parent;
    for part in &parts[..parts.len() - 1] {
        let idx = arena.alloc(RadixNode::new(part.clone(), Some(prev)));
        // Entry-less pass-through: its subtree is exactly the edge's.
        arena.get_mut(idx).subtree_count = count;
        arena.link_child(prev, idx);
        prev = idx;
    }

    let last = parts[parts.len() - 1].clone();
    {
        let node = arena.get_mut(child);
        node.key = last;
        node.parent = Some(prev);
    }
    arena.link_child(prev, child);
}

/// Merge an entry-less single-child node into its only child.
fn merge_into_child(arena: &mut Arena, idx: NodeIdx) {
    let parent = arena.get(idx).parent.unwrap_or(ROOT);
    let child = *arena
        .get(idx)
        .children_by_key
        .values()
        .next()
        .expect("caller checked for one child");

    arena.unlink_child(idx, child);
    arena.unlink_child(parent, idx);

    let prefix = arena.get(idx).key.clone();
    {
        let node = arena.get_mut(child);
        node.key = format!("{prefix},{}", node.key);
        node.parent = Some(parent);
    }
    arena.link_child(parent, child);
    arena.release(idx);
}

/// The full DN of a node, leaf-first, expanding merged edges.
fn node_dn(arena: &Arena, mut idx: NodeIdx) -> String {
    let mut chain = Vec::new();
    while idx != ROOT {
        chain.push(idx);
        idx = arena.get(idx).parent.unwrap_or(ROOT);
    }
    let mut root_first = Vec::new();
    for &i in chain.iter().rev() {
        root_first.extend(dn::split_components(&arena.get(i).key));
    }
    root_first.reverse();
    root_first.join(",")
}
