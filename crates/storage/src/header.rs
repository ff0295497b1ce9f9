//! The file header stored in page 0.

use crate::page::PAGE_SIZE;
use common::{DbError, DbResult, PageId};

/// Magic bytes at the start of every ObaDB data file.
pub const MAGIC: [u8; 4] = *b"OBA\0";
/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

const CRC_OFFSET: usize = 44;

/// Page 0 of the data file.
///
/// Byte layout (little-endian): `0..4` magic, `4..8` version, `8..12` page
/// size, `12..20` total pages, `20..28` free-list head, `28..36` DN-index
/// root, `36..44` data root, `44..48` CRC-32-IEEE over bytes `0..44`.
/// The remainder of the page is reserved and zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub page_size: u32,
    pub total_pages: u64,
    pub free_list_head: PageId,
    pub dn_index_root: PageId,
    pub data_root: PageId,
}

impl FileHeader {
    /// Header for a freshly created file.
    pub fn new(total_pages: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            page_size: PAGE_SIZE as u32,
            total_pages,
            free_list_head: PageId(0),
            dn_index_root: PageId(0),
            data_root: PageId(0),
        }
    }

    pub fn magic_valid(buf: &[u8]) -> bool {
        buf.len() >= 4 && buf[0..4] == MAGIC
    }

    pub fn version_supported(&self) -> bool {
        self.version <= FORMAT_VERSION
    }

    /// Serialize to a full page image, refreshing the CRC.
    pub fn serialize(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.total_pages.to_le_bytes());
        buf[20..28].copy_from_slice(&self.free_list_head.0.to_le_bytes());
        buf[28..36].copy_from_slice(&self.dn_index_root.0.to_le_bytes());
        buf[36..44].copy_from_slice(&self.data_root.0.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..CRC_OFFSET]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate a header image.
    ///
    /// # Errors
    ///
    /// `InvalidMagic`, `UnsupportedVersion`, `HeaderChecksum`, or
    /// `FileCorrupted` when the recorded page size disagrees with the
    /// compile-time constant.
    pub fn deserialize_validated(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < CRC_OFFSET + 4 {
            return Err(DbError::FileCorrupted("short file header".into()));
        }
        if !Self::magic_valid(buf) {
            return Err(DbError::InvalidMagic);
        }
        let stored_crc = u32::from_le_bytes(buf[CRC_OFFSET..CRC_OFFSET + 4].try_into().expect("4 bytes"));
        if crc32fast::hash(&buf[0..CRC_OFFSET]) != stored_crc {
            return Err(DbError::HeaderChecksum);
        }
        let header = Self {
            version: u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")),
            page_size: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            total_pages: u64::from_le_bytes(buf[12..20].try_into().expect("8 bytes")),
            free_list_head: PageId(u64::from_le_bytes(buf[20..28].try_into().expect("8 bytes"))),
            dn_index_root: PageId(u64::from_le_bytes(buf[28..36].try_into().expect("8 bytes"))),
            data_root: PageId(u64::from_le_bytes(buf[36..44].try_into().expect("8 bytes"))),
        };
        if !header.version_supported() {
            return Err(DbError::UnsupportedVersion(header.version));
        }
        if header.page_size as usize != PAGE_SIZE {
            return Err(DbError::FileCorrupted(format!(
                "file was created with page size {}, this build uses {PAGE_SIZE}",
                header.page_size
            )));
        }
        Ok(header)
    }
}
