//! Rebuildable cache file for trees too large for the root page.
//!
//! File layout: a 37-byte header `{magic "OBRC", cache type u8, entry count
//! u64, last tx id u64, data length u64, header CRC u32, data CRC u32}`
//! followed by the data section: a u32 node count and per-node records in
//! BFS order. Writes go to a temp file that is fsynced and renamed into
//! place, so a crash never leaves a half-written cache.
//!
//! The cache is a hint: a transaction-id mismatch on load reports
//! [`CacheLoad::Stale`] so the caller rebuilds from pages instead.

use crate::node::{flatten, rebuild, FlatNode};
use crate::RadixTree;
use common::{DbError, DbResult, EntryRef, PageId, TxId};
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

const CACHE_MAGIC: [u8; 4] = *b"OBRC";
const CACHE_TYPE_DN_INDEX: u8 = 1;
const HEADER_SIZE: usize = 37;
const FLAG_HAS_ENTRY: u8 = 0x01;

/// Outcome of [`RadixTree::load_cache`].
pub enum CacheLoad {
    /// The cache matched the expected transaction id.
    Loaded(RadixTree),
    /// The cache is from another point in time; rebuild from pages.
    Stale,
}

impl RadixTree {
    /// Write the tree to a cache file via an atomic temp-file rename.
    pub fn save_cache(&self, path: impl AsRef<Path>, last_tx_id: TxId) -> DbResult<()> {
        let path = path.as_ref();
        let flat = flatten(&self.arena.read());
        let data = encode_nodes(&flat);
        let entry_count = flat.first().map(|root| root.subtree_count).unwrap_or(0);

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&CACHE_MAGIC);
        header[4] = CACHE_TYPE_DN_INDEX;
        header[5..13].copy_from_slice(&u64::from(entry_count).to_le_bytes());
        header[13..21].copy_from_slice(&last_tx_id.to_le_bytes());
        header[21..29].copy_from_slice(&(data.len() as u64).to_le_bytes());
        let header_crc = crc32fast::hash(&header[0..29]);
        header[29..33].copy_from_slice(&header_crc.to_le_bytes());
        header[33..37].copy_from_slice(&crc32fast::hash(&data).to_le_bytes());

        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&header)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            // Make the rename itself durable.
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        debug!(path = %path.display(), nodes = flat.len(), "saved radix cache");
        Ok(())
    }

    /// Load a tree from a cache file, validating CRCs and the tx id.
    ///
    /// # Errors
    ///
    /// `FileCorrupted` for a damaged file; a tx-id mismatch is not an error
    /// but [`CacheLoad::Stale`].
    pub fn load_cache(path: impl AsRef<Path>, expected_tx_id: TxId) -> DbResult<CacheLoad> {
        let path = path.as_ref();
        let raw = fs::read(path)?;
        if raw.len() < HEADER_SIZE {
            return Err(DbError::FileCorrupted("radix cache: short header".into()));
        }
        if raw[0..4] != CACHE_MAGIC {
            return Err(DbError::FileCorrupted("radix cache: bad magic".into()));
        }
        if raw[4] != CACHE_TYPE_DN_INDEX {
            return Err(DbError::FileCorrupted(format!(
                "radix cache: unknown cache type {}",
                raw[4]
            )));
        }

        let stored_header_crc =
            u32::from_le_bytes(raw[29..33].try_into().expect("4 bytes"));
        if crc32fast::hash(&raw[0..29]) != stored_header_crc {
            return Err(DbError::FileCorrupted("radix cache: header crc mismatch".into()));
        }

        let last_tx_id = u64::from_le_bytes(raw[13..21].try_into().expect("8 bytes"));
        let data_len = u64::from_le_bytes(raw[21..29].try_into().expect("8 bytes")) as usize;
        let data = raw
            .get(HEADER_SIZE..HEADER_SIZE + data_len)
            .ok_or_else(|| DbError::FileCorrupted("radix cache: truncated data".into()))?;

        let stored_data_crc = u32::from_le_bytes(raw[33..37].try_into().expect("4 bytes"));
        if crc32fast::hash(data) != stored_data_crc {
            return Err(DbError::FileCorrupted("radix cache: data crc mismatch".into()));
        }

        if last_tx_id != expected_tx_id {
            debug!(
                cached = last_tx_id,
                expected = expected_tx_id,
                "radix cache is stale"
            );
            return Ok(CacheLoad::Stale);
        }

        let flat = decode_nodes(data)?;
        Ok(CacheLoad::Loaded(RadixTree {
            arena: RwLock::new(rebuild(&flat)),
        }))
    }
}

fn encode_nodes(flat: &[FlatNode]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&(flat.len() as u32).to_le_bytes());
    for node in flat {
        data.extend_from_slice(&(node.key.len() as u16).to_le_bytes());
        data.extend_from_slice(node.key.as_bytes());
        data.push(if node.has_entry { FLAG_HAS_ENTRY } else { 0 });
        data.extend_from_slice(&node.entry.page_id.0.to_le_bytes());
        data.extend_from_slice(&node.entry.slot.to_le_bytes());
        data.extend_from_slice(&node.subtree_count.to_le_bytes());
        let parent = node.parent.map(|p| p as i32).unwrap_or(-1);
        data.extend_from_slice(&parent.to_le_bytes());
        data.extend_from_slice(&(node.children.len() as u16).to_le_bytes());
        for &child in &node.children {
            data.extend_from_slice(&(child as i32).to_le_bytes());
        }
    }
    data
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> DbResult<&'a [u8]> {
    let slice = data
        .get(*pos..*pos + len)
        .ok_or_else(|| DbError::FileCorrupted("radix cache: truncated node data".into()))?;
    *pos += len;
    Ok(slice)
}

fn decode_nodes(data: &[u8]) -> DbResult<Vec<FlatNode>> {
    let mut pos = 0usize;

    let count =
        u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().expect("4 bytes")) as usize;
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len =
            u16::from_le_bytes(take(data, &mut pos, 2)?.try_into().expect("2 bytes")) as usize;
        let key = std::str::from_utf8(take(data, &mut pos, key_len)?)
            .map_err(|_| DbError::FileCorrupted("radix cache: key is not utf-8".into()))?
            .to_string();
        let flags = take(data, &mut pos, 1)?[0];
        let entry = EntryRef {
            page_id: PageId(u64::from_le_bytes(
                take(data, &mut pos, 8)?.try_into().expect("8 bytes"),
            )),
            slot: u16::from_le_bytes(take(data, &mut pos, 2)?.try_into().expect("2 bytes")),
        };
        let subtree_count =
            u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().expect("4 bytes"));
        let parent_raw =
            i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().expect("4 bytes"));
        let child_count =
            u16::from_le_bytes(take(data, &mut pos, 2)?.try_into().expect("2 bytes")) as usize;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let child =
                i32::from_le_bytes(take(data, &mut pos, 4)?.try_into().expect("4 bytes"));
            if child < 0 || child as usize >= count {
                return Err(DbError::FileCorrupted(
                    "radix cache: child index out of range".into(),
                ));
            }
            children.push(child as usize);
        }

        nodes.push(FlatNode {
            key,
            has_entry: flags & FLAG_HAS_ENTRY != 0,
            entry,
            subtree_count,
            parent: (parent_raw >= 0).then_some(parent_raw as usize),
            children,
        });
    }
    Ok(nodes)
}
