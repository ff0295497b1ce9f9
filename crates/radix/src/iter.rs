//! Scoped iteration over tree entries.

use crate::node::{Arena, NodeIdx};
use crate::{find_node, node_dn, RadixTree};
use common::dn::{self, parse_dn};
use common::{DbResult, EntryRef};

/// LDAP-style search scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Just the base object.
    Base,
    /// Direct children of the base, not the base itself.
    OneLevel,
    /// The base and everything below it.
    Subtree,
}

/// Pull-based cursor over `(dn, entry)` pairs.
///
/// Matches are snapshotted under the tree's read lock at construction;
/// `next` advances the cursor and `value` reads the current match. Within a
/// parent, children are visited in key order.
pub struct RadixIterator {
    items: Vec<(String, EntryRef)>,
    pos: Option<usize>,
}

impl RadixIterator {
    /// Advance to the next match; `false` once the cursor is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        let next = match self.pos {
            None => 0,
            Some(pos) => pos + 1,
        };
        if next < self.items.len() {
            self.pos = Some(next);
            true
        } else {
            self.pos = Some(self.items.len());
            false
        }
    }

    /// The current match.
    pub fn value(&self) -> Option<(&str, EntryRef)> {
        let pos = self.pos?;
        self.items.get(pos).map(|(dn, entry)| (dn.as_str(), *entry))
    }

    pub fn dn(&self) -> Option<&str> {
        self.value().map(|(dn, _)| dn)
    }

    pub fn entry_ref(&self) -> Option<EntryRef> {
        self.value().map(|(_, entry)| entry)
    }

    /// Matches remaining including the current one.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub(crate) fn collect(tree: &RadixTree, base_dn: &str, scope: Scope) -> DbResult<RadixIterator> {
    let components = parse_dn(base_dn)?;
    let arena = tree.arena.read();

    let mut items = Vec::new();
    if let Some(base) = find_node(&arena, &components) {
        match scope {
            Scope::Base => {
                push_if_entry(&arena, base, &mut items);
            }
            Scope::OneLevel => {
                for child in sorted_children(&arena, base) {
                    // A merged edge spans several DN levels; its node is
                    // not a direct child of the base.
                    if dn::split_components(&arena.get(child).key).len() == 1 {
                        push_if_entry(&arena, child, &mut items);
                    }
                }
            }
            Scope::Subtree => {
                let mut stack = vec![base];
                while let Some(idx) = stack.pop() {
                    push_if_entry(&arena, idx, &mut items);
                    // Reverse so the smallest key is popped first.
                    for &child in sorted_children(&arena, idx).iter().rev() {
                        stack.push(child);
                    }
                }
            }
        }
    }

    Ok(RadixIterator { items, pos: None })
}

fn push_if_entry(arena: &Arena, idx: NodeIdx, items: &mut Vec<(String, EntryRef)>) {
    let node = arena.get(idx);
    if node.has_entry {
        items.push((node_dn(arena, idx), node.entry));
    }
}

fn sorted_children(arena: &Arena, idx: NodeIdx) -> Vec<NodeIdx> {
    let node = arena.get(idx);
    let mut keys: Vec<&String> = node.children_by_key.keys().collect();
    keys.sort();
    keys.iter().map(|k| node.children_by_key[*k]).collect()
}
