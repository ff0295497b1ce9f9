//! Write-ahead log for crash recovery and durability.
//!
//! The log is a single append-only file of framed records: a `u32` length
//! prefix followed by the serialized record (optionally sealed with
//! AES-256-GCM). Appends go through an in-memory buffer that is written
//! with one syscall when full or on `sync`; every record carries a CRC and
//! an LSN assigned at append time. Opening the log scans it from the start,
//! builds an LSN → offset index, and silently trims any torn or corrupt
//! tail back to the last valid record boundary.
//!
//! # Example
//!
//! ```no_run
//! use wal::{Wal, WalOptions, WalRecord};
//! use common::PageId;
//!
//! let wal = Wal::open("wal.oba", WalOptions::default()).unwrap();
//! let lsn = wal
//!     .append(WalRecord::update(1, PageId(4), 0, b"old".to_vec(), b"new".to_vec()))
//!     .unwrap();
//! wal.sync().unwrap();
//!
//! let mut iter = wal.iter(1).unwrap();
//! while let Some(record) = iter.next().unwrap() {
//!     assert!(record.lsn >= 1 && record.lsn <= lsn);
//! }
//! ```


mod record;

pub use record::{CheckpointData, WalRecord, WalRecordType, RECORD_HEADER_SIZE};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use common::{DbError, DbResult, Lsn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, warn};

const FRAME_PREFIX: usize = 4;
const NONCE_SIZE: usize = 12;

/// Options for [`Wal::open`].
#[derive(Clone, Default)]
pub struct WalOptions {
    /// Append-buffer size in bytes; 0 uses the 64 KiB default.
    pub buffer_size: usize,
    /// When set, every record is AEAD-sealed before framing.
    pub encryption_key: Option<[u8; 32]>,
}

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    fn new(key: &[u8; 32]) -> DbResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| DbError::Encryption(format!("bad wal key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Seal a frame: random 96-bit nonce prepended to the ciphertext.
    fn seal(&self, plain: &[u8]) -> DbResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|e| DbError::Encryption(format!("wal record encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8]) -> DbResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(DbError::Encryption("sealed wal frame too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DbError::Encryption("wal record decryption failed".into()))
    }
}

struct WalInner {
    file: File,
    /// Bytes durably laid out in the file (buffered appends not included).
    file_len: u64,
    buffer: Vec<u8>,
    index: BTreeMap<Lsn, u64>,
    current_lsn: Lsn,
    closed: bool,
}

/// Append-only, CRC-checked, optionally encrypted log.
///
/// A single mutex serializes all operations; the iterator re-acquires it on
/// every `next` call.
pub struct Wal {
    inner: Mutex<WalInner>,
    buffer_size: usize,
    sealer: Option<Sealer>,
}

impl Wal {
    /// Open or create a log file, scanning it and trimming any torn tail.
    pub fn open(path: impl AsRef<Path>, options: WalOptions) -> DbResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let sealer = match &options.encryption_key {
            Some(key) => Some(Sealer::new(key)?),
            None => None,
        };

        let mut raw = Vec::new();
        {
            use std::io::Read;
            let mut reader = &file;
            reader.read_to_end(&mut raw)?;
        }

        let (index, valid_end, max_lsn) = Self::scan(&raw, sealer.as_ref());
        if (valid_end as usize) < raw.len() {
            warn!(
                path = %path.display(),
                discarded = raw.len() - valid_end as usize,
                "discarding torn wal tail"
            );
            file.set_len(valid_end)?;
            file.sync_data()?;
        }
        debug!(
            path = %path.display(),
            records = index.len(),
            next_lsn = max_lsn + 1,
            "opened wal"
        );

        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                file_len: valid_end,
                buffer: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
                index,
                current_lsn: max_lsn + 1,
                closed: false,
            }),
            buffer_size: if options.buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                options.buffer_size
            },
            sealer,
        })
    }

    /// Walk framed records from offset 0, stopping at the first invalid one.
    fn scan(raw: &[u8], sealer: Option<&Sealer>) -> (BTreeMap<Lsn, u64>, u64, Lsn) {
        let mut index = BTreeMap::new();
        let mut offset = 0usize;
        let mut max_lsn = 0;

        while offset + FRAME_PREFIX <= raw.len() {
            let len = u32::from_le_bytes(raw[offset..offset + FRAME_PREFIX].try_into().expect("4 bytes"))
                as usize;
            let start = offset + FRAME_PREFIX;
            let Some(frame) = raw.get(start..start + len) else {
                break;
            };
            let record = match Self::open_frame(frame, sealer) {
                Ok(record) => record,
                Err(_) => break,
            };
            index.insert(record.lsn, offset as u64);
            max_lsn = max_lsn.max(record.lsn);
            offset = start + len;
        }

        (index, offset as u64, max_lsn)
    }

    fn open_frame(frame: &[u8], sealer: Option<&Sealer>) -> DbResult<WalRecord> {
        match sealer {
            Some(sealer) => WalRecord::decode(&sealer.unseal(frame)?),
            None => WalRecord::decode(frame),
        }
    }

    /// Append a record, assigning it the next LSN.
    ///
    /// The frame lands in the append buffer; durability requires `sync`.
    pub fn append(&self, mut record: WalRecord) -> DbResult<Lsn> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }

        let lsn = inner.current_lsn;
        record.lsn = lsn;

        let mut frame = record.encode()?;
        if let Some(sealer) = &self.sealer {
            frame = sealer.seal(&frame)?;
        }

        let framed_len = FRAME_PREFIX + frame.len();
        if !inner.buffer.is_empty() && inner.buffer.len() + framed_len > self.buffer_size {
            Self::flush_locked(&mut inner)?;
        }

        let offset = inner.file_len + inner.buffer.len() as u64;
        inner
            .buffer
            .extend_from_slice(&(frame.len() as u32).to_le_bytes());
        inner.buffer.extend_from_slice(&frame);
        inner.index.insert(lsn, offset);
        inner.current_lsn += 1;
        Ok(lsn)
    }

    /// Write out the append buffer (single syscall) without fsyncing.
    pub fn flush_buffer(&self) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        Self::flush_locked(&mut inner)
    }

    /// Flush the buffer and fsync.
    pub fn sync(&self) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        Self::flush_locked(&mut inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn flush_locked(inner: &mut WalInner) -> DbResult<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        let at = inner.file_len;
        inner.file.write_all_at(&inner.buffer, at)?;
        inner.file_len += inner.buffer.len() as u64;
        inner.buffer.clear();
        Ok(())
    }

    /// Drop every record with an LSN ≤ `lsn`.
    ///
    /// The LSN counter is not reset; future appends continue past the
    /// highest LSN ever assigned.
    pub fn truncate(&self, lsn: Lsn) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        Self::flush_locked(&mut inner)?;

        let first_kept = inner.index.range(lsn + 1..).next().map(|(_, &off)| off);
        match first_kept {
            None => {
                inner.file.set_len(0)?;
                inner.file_len = 0;
                inner.index.clear();
            }
            Some(keep_from) => {
                let tail_len = (inner.file_len - keep_from) as usize;
                let mut tail = vec![0u8; tail_len];
                inner.file.read_exact_at(&mut tail, keep_from)?;
                inner.file.write_all_at(&tail, 0)?;
                inner.file.set_len(tail_len as u64)?;
                inner.file_len = tail_len as u64;
                // Rebuild the index by rescanning the rewritten file.
                let (index, valid_end, _) = Self::scan(&tail, self.sealer.as_ref());
                if valid_end != inner.file_len {
                    return Err(DbError::FileCorrupted(
                        "wal tail failed revalidation after truncate".into(),
                    ));
                }
                inner.index = index;
            }
        }
        inner.file.sync_data()?;
        debug!(truncated_through = lsn, remaining = inner.index.len(), "truncated wal");
        Ok(())
    }

    /// Records currently reachable by iteration.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// The LSN the next append will receive.
    pub fn current_lsn(&self) -> Lsn {
        self.inner.lock().current_lsn
    }

    /// Highest LSN on record, if any.
    pub fn max_lsn(&self) -> Option<Lsn> {
        self.inner.lock().index.keys().next_back().copied()
    }

    /// Cursor over records with LSN ≥ `start_lsn`, in ascending order.
    ///
    /// Creation flushes the append buffer so every indexed record can be
    /// read back from the file.
    pub fn iter(&self, start_lsn: Lsn) -> DbResult<WalIterator<'_>> {
        self.flush_buffer()?;
        Ok(WalIterator {
            wal: self,
            cursor: start_lsn,
        })
    }

    /// Flush, fsync, and mark the log closed.
    pub fn close(&self) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        Self::flush_locked(&mut inner)?;
        inner.file.sync_data()?;
        inner.closed = true;
        Ok(())
    }

    /// Read and decode the record at a known file offset.
    fn read_at(&self, inner: &WalInner, offset: u64) -> DbResult<WalRecord> {
        let mut len_buf = [0u8; FRAME_PREFIX];
        inner.file.read_exact_at(&mut len_buf, offset)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        inner.file.read_exact_at(&mut frame, offset + FRAME_PREFIX as u64)?;
        Self::open_frame(&frame, self.sealer.as_ref())
    }
}

/// Pull-based cursor over WAL records in ascending LSN order.
pub struct WalIterator<'a> {
    wal: &'a Wal,
    cursor: Lsn,
}

impl WalIterator<'_> {
    /// The next record with LSN ≥ the cursor, or `None` at the end.
    ///
    /// Gaps left by truncation are skipped: the smallest indexed LSN at or
    /// past the cursor is returned.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> DbResult<Option<WalRecord>> {
        let inner = self.wal.inner.lock();
        if inner.closed {
            return Err(DbError::WalClosed);
        }
        let Some((&lsn, &offset)) = inner.index.range(self.cursor..).next() else {
            return Ok(None);
        };
        let record = self.wal.read_at(&inner, offset)?;
        if record.lsn != lsn {
            return Err(DbError::WalInvalidLsn(record.lsn));
        }
        self.cursor = lsn + 1;
        Ok(Some(record))
    }
}
