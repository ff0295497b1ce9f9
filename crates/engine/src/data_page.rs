//! Slotted layout for `Data` pages.
//!
//! The payload holds a slot table growing from the front (4 bytes per slot:
//! offset u16, length u16) and entry bytes growing down from the back.
//! Deleting tombstones the slot (length 0); space is not compacted.

use common::{DbError, DbResult};
use storage::{Page, PAGE_PAYLOAD_SIZE};

const SLOT_SIZE: usize = 4;

fn slot_bounds(page: &Page, slot: u16) -> (usize, usize) {
    let at = slot as usize * SLOT_SIZE;
    let offset = u16::from_le_bytes(page.payload[at..at + 2].try_into().expect("2 bytes")) as usize;
    let len = u16::from_le_bytes(page.payload[at + 2..at + 4].try_into().expect("2 bytes")) as usize;
    (offset, len)
}

fn write_slot(page: &mut Page, slot: u16, offset: u16, len: u16) {
    let at = slot as usize * SLOT_SIZE;
    page.payload[at..at + 2].copy_from_slice(&offset.to_le_bytes());
    page.payload[at + 2..at + 4].copy_from_slice(&len.to_le_bytes());
}

/// Lowest payload offset still holding live entry bytes.
fn data_start(page: &Page) -> usize {
    (0..page.item_count)
        .filter_map(|slot| {
            let (offset, len) = slot_bounds(page, slot);
            (len > 0).then_some(offset)
        })
        .min()
        .unwrap_or(PAGE_PAYLOAD_SIZE)
}

/// Whether `bytes` (plus its slot) still fits.
pub fn fits(page: &Page, bytes: &[u8]) -> bool {
    let table_end = (page.item_count as usize + 1) * SLOT_SIZE;
    bytes.len() + table_end <= data_start(page)
}

/// Append an entry, returning its slot.
pub fn insert(page: &mut Page, bytes: &[u8]) -> DbResult<u16> {
    if bytes.len() > u16::MAX as usize {
        return Err(DbError::PageOverflow(bytes.len()));
    }
    if page.item_count == u16::MAX {
        return Err(DbError::PageOverflow(PAGE_PAYLOAD_SIZE));
    }
    if !fits(page, bytes) {
        return Err(DbError::PageOverflow(bytes.len()));
    }

    let slot = page.item_count;
    let new_start = data_start(page) - bytes.len();
    page.payload[new_start..new_start + bytes.len()].copy_from_slice(bytes);
    write_slot(page, slot, new_start as u16, bytes.len() as u16);
    page.item_count += 1;
    page.free_space = (data_start(page) - page.item_count as usize * SLOT_SIZE) as u16;
    Ok(slot)
}

/// The bytes stored in a slot; `None` for tombstoned or out-of-range slots.
pub fn read(page: &Page, slot: u16) -> Option<&[u8]> {
    if slot >= page.item_count {
        return None;
    }
    let (offset, len) = slot_bounds(page, slot);
    if len == 0 {
        return None;
    }
    page.payload.get(offset..offset + len)
}

/// Tombstone a slot. Returns whether it held live bytes.
pub fn delete(page: &mut Page, slot: u16) -> bool {
    if slot >= page.item_count {
        return false;
    }
    let (offset, len) = slot_bounds(page, slot);
    if len == 0 {
        return false;
    }
    write_slot(page, slot, offset as u16, 0);
    true
}

/// Slots currently holding live bytes.
pub fn live_slots(page: &Page) -> Vec<u16> {
    (0..page.item_count)
        .filter(|&slot| {
            let (_, len) = slot_bounds(page, slot);
            len > 0
        })
        .collect()
}
