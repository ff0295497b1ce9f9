//! Single-page BFS image of the tree.
//!
//! Payload layout: a u16 node count, then one 22-byte header per node in
//! BFS order, then a variable area holding all key bytes followed by
//! per-child `{first_byte u8, child_index u16}` triples (grouped by parent,
//! in the same BFS order).
//!
//! Header fields (little-endian): key offset u16 (into the variable area),
//! key length u16, child count u8, flags u8 (bit 0 = has entry), page id
//! u64, slot u16, subtree count u32, parent index u16 (0xFFFF for the
//! root).

use crate::node::FlatNode;
use common::{DbError, DbResult, EntryRef, PageId};
use storage::{Page, PAGE_PAYLOAD_SIZE};

const NODE_HEADER_SIZE: usize = 22;
const NO_PARENT: u16 = u16::MAX;
const FLAG_HAS_ENTRY: u8 = 0x01;

pub(crate) fn encode_into(flat: &[FlatNode], page: &mut Page) -> DbResult<()> {
    if flat.len() >= NO_PARENT as usize {
        return Err(DbError::PageOverflow(flat.len() * NODE_HEADER_SIZE));
    }

    let key_bytes: usize = flat.iter().map(|n| n.key.len()).sum();
    let child_slots: usize = flat.iter().map(|n| n.children.len()).sum();
    let total = 2 + flat.len() * NODE_HEADER_SIZE + key_bytes + 3 * child_slots;
    if total > PAGE_PAYLOAD_SIZE {
        return Err(DbError::PageOverflow(total));
    }
    for node in flat {
        if node.key.len() > u16::MAX as usize || node.children.len() > u8::MAX as usize {
            return Err(DbError::PageOverflow(total));
        }
    }

    let payload = &mut page.payload;
    payload.fill(0);
    payload[0..2].copy_from_slice(&(flat.len() as u16).to_le_bytes());

    let var_start = 2 + flat.len() * NODE_HEADER_SIZE;
    let mut key_cursor = 0usize;

    // Key bytes first, then the child triples.
    for (i, node) in flat.iter().enumerate() {
        let header = 2 + i * NODE_HEADER_SIZE;
        let flags = if node.has_entry { FLAG_HAS_ENTRY } else { 0 };
        let parent = node.parent.map(|p| p as u16).unwrap_or(NO_PARENT);

        payload[header..header + 2].copy_from_slice(&(key_cursor as u16).to_le_bytes());
        payload[header + 2..header + 4].copy_from_slice(&(node.key.len() as u16).to_le_bytes());
        payload[header + 4] = node.children.len() as u8;
        payload[header + 5] = flags;
        payload[header + 6..header + 14].copy_from_slice(&node.entry.page_id.0.to_le_bytes());
        payload[header + 14..header + 16].copy_from_slice(&node.entry.slot.to_le_bytes());
        payload[header + 16..header + 20].copy_from_slice(&node.subtree_count.to_le_bytes());
        payload[header + 20..header + 22].copy_from_slice(&parent.to_le_bytes());

        let at = var_start + key_cursor;
        payload[at..at + node.key.len()].copy_from_slice(node.key.as_bytes());
        key_cursor += node.key.len();
    }

    let mut triple_cursor = var_start + key_bytes;
    for node in flat {
        for &child in &node.children {
            let first = flat[child].key.as_bytes().first().copied().unwrap_or(0);
            payload[triple_cursor] = first;
            payload[triple_cursor + 1..triple_cursor + 3]
                .copy_from_slice(&(child as u16).to_le_bytes());
            triple_cursor += 3;
        }
    }

    page.item_count = flat.len() as u16;
    page.free_space = (PAGE_PAYLOAD_SIZE - total) as u16;
    Ok(())
}

pub(crate) fn decode_from(page: &Page) -> DbResult<Vec<FlatNode>> {
    let payload = &page.payload;
    let corrupt = |what: &str| DbError::FileCorrupted(format!("radix page image: {what}"));

    let count = u16::from_le_bytes(payload[0..2].try_into().expect("2 bytes")) as usize;
    let var_start = 2 + count * NODE_HEADER_SIZE;
    if var_start > PAGE_PAYLOAD_SIZE {
        return Err(corrupt("node headers exceed the payload"));
    }

    let mut nodes = Vec::with_capacity(count);
    let mut key_bytes = 0usize;
    let mut child_slots = 0usize;

    for i in 0..count {
        let header = 2 + i * NODE_HEADER_SIZE;
        let key_off = u16::from_le_bytes(payload[header..header + 2].try_into().expect("2 bytes"))
            as usize;
        let key_len =
            u16::from_le_bytes(payload[header + 2..header + 4].try_into().expect("2 bytes"))
                as usize;
        let child_count = payload[header + 4] as usize;
        let flags = payload[header + 5];
        let entry = EntryRef {
            page_id: PageId(u64::from_le_bytes(
                payload[header + 6..header + 14].try_into().expect("8 bytes"),
            )),
            slot: u16::from_le_bytes(payload[header + 14..header + 16].try_into().expect("2 bytes")),
        };
        let subtree_count =
            u32::from_le_bytes(payload[header + 16..header + 20].try_into().expect("4 bytes"));
        let parent_raw =
            u16::from_le_bytes(payload[header + 20..header + 22].try_into().expect("2 bytes"));

        let key_at = var_start + key_off;
        let key_end = key_at + key_len;
        if key_end > PAGE_PAYLOAD_SIZE {
            return Err(corrupt("key escapes the payload"));
        }
        let key = std::str::from_utf8(&payload[key_at..key_end])
            .map_err(|_| corrupt("key is not utf-8"))?
            .to_string();

        key_bytes += key_len;
        child_slots += child_count;
        nodes.push(FlatNode {
            key,
            has_entry: flags & FLAG_HAS_ENTRY != 0,
            entry,
            subtree_count,
            parent: (parent_raw != NO_PARENT).then_some(parent_raw as usize),
            children: Vec::with_capacity(child_count),
        });
    }

    // Child triples follow the key bytes; counts were read above.
    let mut triple_cursor = var_start + key_bytes;
    if triple_cursor + 3 * child_slots > PAGE_PAYLOAD_SIZE {
        return Err(corrupt("child triples escape the payload"));
    }
    let counts: Vec<usize> = {
        let mut counts = Vec::with_capacity(count);
        for i in 0..count {
            counts.push(payload[2 + i * NODE_HEADER_SIZE + 4] as usize);
        }
        counts
    };
    for (i, &child_count) in counts.iter().enumerate() {
        for _ in 0..child_count {
            let child = u16::from_le_bytes(
                payload[triple_cursor + 1..triple_cursor + 3]
                    .try_into()
                    .expect("2 bytes"),
            ) as usize;
            if child >= count {
                return Err(corrupt("child index out of range"));
            }
            nodes[i].children.push(child);
            triple_cursor += 3;
        }
    }

    // Sanity: every non-root node needs a parent inside the image.
    for (i, node) in nodes.iter().enumerate().skip(1) {
        match node.parent {
            Some(p) if p < count => {}
            _ => return Err(corrupt(&format!("node {i} has no valid parent"))),
        }
    }
    Ok(nodes)
}
