//! Shared identifiers, error taxonomy, and configuration for ObaDB.
//!
//! Every other crate in the workspace depends on this one. It deliberately
//! contains no I/O: just the types that cross crate boundaries (page and
//! entry identifiers, directory entries, the canonical error enum) and the
//! engine-wide option block.

#[cfg(test)]
mod tests;

pub mod dn;

use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Log sequence number of a WAL record. Strictly monotonic, first is 1.
pub type Lsn = u64;

/// Transaction identifier carried by WAL records.
pub type TxId = u64;

/// Logical identifier for a page in the data file.
///
/// Page 0 is reserved for the file header; the byte offset of a page is
/// `id * PAGE_SIZE`.
///
/// Examples:
/// - `let header = PageId(0);`
/// - `let first_data_page = PageId(1);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

/// Physical location of a directory entry inside a data page.
///
/// Examples:
/// - `let eref = EntryRef { page_id: PageId(42), slot: 5 };`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    pub page_id: PageId,
    pub slot: u16,
}

/// A directory entry: a distinguished name plus its attribute values.
///
/// Attribute names are stored lowercased; values keep their original case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    /// Add an attribute value, merging into an existing attribute if present.
    pub fn add_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.trim().to_ascii_lowercase();
        let value = value.into();
        match self.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.attributes.push((name, vec![value])),
        }
        self
    }

    /// All values of an attribute, if the entry carries it.
    pub fn values(&self, name: &str) -> Option<&[String]> {
        let name = name.trim().to_ascii_lowercase();
        self.attributes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// First value of an attribute.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.values(name).and_then(|v| v.first()).map(|s| s.as_str())
    }
}

/// Canonical error type shared across ObaDB subsystems.
///
/// Variants are grouped by the layer that raises them; none are used for
/// internal control flow.
#[derive(Error, Debug)]
pub enum DbError {
    // Configuration
    #[error("config: {0}")]
    Config(String),

    // File lifecycle
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("file not open")]
    FileNotOpen,
    #[error("file closed")]
    FileClosed,
    #[error("file exists: {0}")]
    FileExists(String),
    #[error("database is read-only")]
    ReadOnly,

    // Page argument misuse
    #[error("invalid page id {0}")]
    InvalidPageId(u64),
    #[error("page {0} out of range")]
    PageOutOfRange(u64),
    #[error("page 0 holds the file header and cannot be freed")]
    CannotFreeHeader,
    #[error("page {0} is already free")]
    PageAlreadyFree(u64),

    // Integrity
    #[error("checksum mismatch on page {0}")]
    InvalidChecksum(u64),
    #[error("file corrupted: {0}")]
    FileCorrupted(String),
    #[error("file header checksum mismatch")]
    HeaderChecksum,
    #[error("wal record checksum mismatch at lsn {0}")]
    WalRecordChecksum(u64),
    #[error("index metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // File recognition
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid magic bytes")]
    InvalidMagic,

    // Buffer pool
    #[error("buffer pool full: every frame is pinned")]
    BufferPoolFull,
    #[error("page {0} is pinned")]
    PagePinned(u64),
    #[error("page {0} not found")]
    PageNotFound(u64),
    #[error("pin count for page {0} would go negative")]
    NegativePinCount(u64),

    // WAL
    #[error("wal closed")]
    WalClosed,
    #[error("invalid lsn {0}")]
    WalInvalidLsn(u64),
    #[error("wal record data too large: {0} bytes")]
    WalRecordLength(usize),

    // Recovery / checkpoints
    #[error("no wal attached")]
    NoWal,
    #[error("no page manager attached")]
    NoPageManager,
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
    #[error("recovery already in progress")]
    RecoveryInProgress,
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
    #[error("checkpoint already in progress")]
    CheckpointInProgress,
    #[error("no checkpoint has been taken")]
    NoActiveCheckpoint,

    // Index manager
    #[error("invalid attribute name: {0:?}")]
    InvalidAttribute(String),
    #[error("index already exists for attribute {0}")]
    IndexExists(String),
    #[error("no index for attribute {0}")]
    IndexNotFound(String),
    #[error("index manager closed")]
    ManagerClosed,
    #[error("empty value")]
    EmptyValue,
    #[error("empty pattern")]
    EmptyPattern,

    // Radix tree / DN parsing
    #[error("entry already exists: {0}")]
    EntryExists(String),
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    #[error("invalid dn: {0}")]
    InvalidDn(String),
    #[error("invalid rdn: {0}")]
    InvalidRdn(String),
    #[error("empty dn")]
    EmptyDn,

    // Cross-cutting
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("encryption: {0}")]
    Encryption(String),
    #[error("serialized image exceeds page payload: {0} bytes")]
    PageOverflow(usize),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Engine-wide configuration.
///
/// # Example
/// ```
/// use common::EngineOptions;
/// use std::path::PathBuf;
///
/// let opts = EngineOptions::builder()
///     .data_dir(PathBuf::from("./directory_db"))
///     .buffer_pool_size(512)
///     .sync_on_write(true)
///     .build();
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct EngineOptions {
    /// Directory holding `data.oba`, `wal.oba` and the optional radix cache.
    #[builder(default = PathBuf::from("./obadb"))]
    pub data_dir: PathBuf,
    /// Fixed page size in bytes. Only 4096 is supported.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Number of frames the buffer pool keeps resident.
    #[builder(default = 256)]
    pub buffer_pool_size: usize,
    /// Size of the WAL append buffer in bytes.
    #[builder(default = 64 * 1024)]
    pub wal_buffer_size: usize,
    /// Fsync the data file after every page write.
    #[builder(default = false)]
    pub sync_on_write: bool,
    /// Open without write access; mutators fail with `DbError::ReadOnly`.
    #[builder(default = false)]
    pub read_only: bool,
    /// Create the database files when they do not exist.
    #[builder(default = true)]
    pub create_if_not_exists: bool,
    /// Minimum interval between automatic checkpoints.
    #[builder(default = Duration::from_secs(300))]
    pub checkpoint_interval: Duration,
    /// Interval between garbage-collection sweeps.
    #[builder(default = Duration::from_secs(30))]
    pub gc_interval: Duration,
    /// Whether background garbage collection runs at all.
    #[builder(default = true)]
    pub gc_enabled: bool,
    /// Advisory cap on simultaneously open file handles.
    #[builder(default = 1000)]
    pub max_open_files: usize,
    /// Pages pre-allocated when creating a fresh data file.
    #[builder(default = 16)]
    pub initial_pages: u64,
    /// Path to a hex-encoded 32-byte WAL encryption key.
    pub encryption_key_file: Option<PathBuf>,
    /// In-memory WAL encryption key; takes precedence over the key file.
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions::builder().build()
    }
}

impl EngineOptions {
    /// Check the options for values the engine cannot honor.
    pub fn validate(&self) -> DbResult<()> {
        if self.page_size != 4096 {
            return Err(DbError::Config(format!(
                "unsupported page size {} (only 4096 is supported)",
                self.page_size
            )));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(DbError::Config("data_dir must not be empty".into()));
        }
        if self.buffer_pool_size == 0 {
            return Err(DbError::Config("buffer_pool_size must be > 0".into()));
        }
        if self.initial_pages == 0 {
            return Err(DbError::Config("initial_pages must be > 0".into()));
        }
        Ok(())
    }
}
