//! Fixed-size page frames and their on-disk header layout.

use common::{DbError, DbResult, PageId};

/// Size of every page in the data file.
pub const PAGE_SIZE: usize = 4096;
/// Size of the typed page header at the front of each page.
pub const PAGE_HEADER_SIZE: usize = 16;
/// Usable payload bytes per page.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// In-memory hint bits carried in the page header's flags byte.
///
/// Persisted alongside the page but never authoritative; the buffer pool
/// and free list own the real dirty/pinned/free state.
pub mod flags {
    pub const DIRTY: u8 = 0x01;
    pub const PINNED: u8 = 0x02;
    pub const LEAF: u8 = 0x04;
}

/// What a page holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Data = 1,
    DnIndex = 2,
    AttrIndex = 3,
    Overflow = 4,
    Wal = 5,
}

impl TryFrom<u8> for PageType {
    type Error = DbError;

    fn try_from(value: u8) -> DbResult<Self> {
        match value {
            0 => Ok(PageType::Free),
            1 => Ok(PageType::Data),
            2 => Ok(PageType::DnIndex),
            3 => Ok(PageType::AttrIndex),
            4 => Ok(PageType::Overflow),
            5 => Ok(PageType::Wal),
            other => Err(DbError::FileCorrupted(format!(
                "unknown page type byte {other:#04x}"
            ))),
        }
    }
}

/// A typed page frame.
///
/// Header layout (16 bytes, little-endian):
/// `0..8` page id, `8` type, `9` flags, `10..12` item count,
/// `12..14` free space, `14..16` checksum (low 16 bits of the
/// CRC-32-IEEE of the payload).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub id: PageId,
    pub page_type: PageType,
    pub flags: u8,
    pub item_count: u16,
    pub free_space: u16,
    pub payload: Vec<u8>,
}

impl Page {
    /// A zeroed page of the given type.
    pub fn new(id: PageId, page_type: PageType) -> Self {
        Self {
            id,
            page_type,
            flags: 0,
            item_count: 0,
            free_space: PAGE_PAYLOAD_SIZE as u16,
            payload: vec![0u8; PAGE_PAYLOAD_SIZE],
        }
    }

    /// Current payload checksum: low 16 bits of CRC-32-IEEE.
    pub fn checksum(&self) -> u16 {
        (crc32fast::hash(&self.payload) & 0xFFFF) as u16
    }

    /// Serialize to a full page image, refreshing the stored checksum.
    pub fn serialize(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..8].copy_from_slice(&self.id.0.to_le_bytes());
        buf[8] = self.page_type as u8;
        buf[9] = self.flags;
        buf[10..12].copy_from_slice(&self.item_count.to_le_bytes());
        buf[12..14].copy_from_slice(&self.free_space.to_le_bytes());
        buf[14..16].copy_from_slice(&self.checksum().to_le_bytes());
        buf[PAGE_HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse a page image without verifying the payload checksum.
    pub fn deserialize(buf: &[u8]) -> DbResult<Self> {
        if buf.len() != PAGE_SIZE {
            return Err(DbError::FileCorrupted(format!(
                "page image is {} bytes, expected {PAGE_SIZE}",
                buf.len()
            )));
        }
        let id = PageId(u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes")));
        let page_type = PageType::try_from(buf[8])?;
        Ok(Self {
            id,
            page_type,
            flags: buf[9],
            item_count: u16::from_le_bytes(buf[10..12].try_into().expect("2 bytes")),
            free_space: u16::from_le_bytes(buf[12..14].try_into().expect("2 bytes")),
            payload: buf[PAGE_HEADER_SIZE..].to_vec(),
        })
    }

    /// Parse a page image and verify the payload checksum.
    pub fn deserialize_validated(buf: &[u8]) -> DbResult<Self> {
        let stored = u16::from_le_bytes(
            buf.get(14..16)
                .ok_or_else(|| DbError::FileCorrupted("short page image".into()))?
                .try_into()
                .expect("2 bytes"),
        );
        let page = Self::deserialize(buf)?;
        if page.checksum() != stored {
            return Err(DbError::InvalidChecksum(page.id.0));
        }
        Ok(page)
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}
