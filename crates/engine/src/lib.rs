//! ObaDB: the assembled storage engine.
//!
//! `ObaDb::open` wires the layers together: the page manager over
//! `<dir>/data.oba`, the WAL over `<dir>/wal.oba`, a buffer pool whose
//! flush callback writes back through the page manager, crash recovery on
//! open, the attribute index manager, and the DN radix tree (loaded from
//! its root page, the cache file, or rebuilt by scanning data pages).
//!
//! Entry mutations are auto-committed transactions: each one logs
//! `Begin` / `Update` / `Commit`, fsyncs the WAL, and only then updates the
//! cached page, the DN tree, and the secondary indexes.
//!
//! # Example
//!
//! ```no_run
//! use common::{EngineOptions, Entry};
//! use engine::ObaDb;
//!
//! let db = ObaDb::open(EngineOptions::builder().data_dir("./dir-db".into()).build()).unwrap();
//! let entry = Entry::new("uid=alice,ou=users,dc=example,dc=com")
//!     .add_attribute("uid", "alice")
//!     .add_attribute("objectclass", "inetOrgPerson");
//! db.add_entry(&entry).unwrap();
//! assert!(db.get_entry("uid=alice,ou=users,dc=example,dc=com").unwrap().is_some());
//! db.close().unwrap();
//! ```


mod data_page;

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use buffer::BufferPool;
use common::dn::normalize_dn;
use common::{DbError, DbResult, EngineOptions, Entry, EntryRef, Lsn, PageId, TxId};
use index::IndexManager;
use radix::{CacheLoad, RadixIterator, RadixTree, Scope};
use recovery::{CheckpointManager, RecoveryManager};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use storage::{Page, PageManager, PageManagerOptions, PageType, PAGE_PAYLOAD_SIZE};
use tracing::{debug, info, warn};
use wal::{Wal, WalOptions, WalRecord};

fn bincode_config() -> impl Config {
    config::legacy()
}

/// An open ObaDB database.
pub struct ObaDb {
    pages: Arc<PageManager>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    checkpoints: CheckpointManager,
    indexes: IndexManager,
    dn_index: RadixTree,
    cache_path: PathBuf,
    next_tx: AtomicU64,
    read_only: bool,
    closed: AtomicBool,
}

impl ObaDb {
    /// Open or create a database under `options.data_dir`.
    pub fn open(options: EngineOptions) -> DbResult<Self> {
        options.validate()?;
        if !options.data_dir.exists() {
            if !options.create_if_not_exists || options.read_only {
                return Err(DbError::Config(format!(
                    "data dir does not exist: {}",
                    options.data_dir.display()
                )));
            }
            fs::create_dir_all(&options.data_dir)?;
        }

        let data_path = options.data_dir.join("data.oba");
        let wal_path = options.data_dir.join("wal.oba");
        let cache_path = options.data_dir.join("radix.cache");

        let pages = Arc::new(PageManager::open(
            &data_path,
            PageManagerOptions {
                page_size: options.page_size,
                initial_pages: options.initial_pages,
                create_if_new: options.create_if_not_exists,
                read_only: options.read_only,
                sync_on_write: options.sync_on_write,
            },
        )?);

        let wal = Arc::new(Wal::open(
            &wal_path,
            WalOptions {
                buffer_size: options.wal_buffer_size,
                encryption_key: resolve_key(&options)?,
            },
        )?);

        let pool = if options.read_only {
            Arc::new(BufferPool::new(options.buffer_pool_size, options.page_size))
        } else {
            let sink = pages.clone();
            Arc::new(BufferPool::with_flush(
                options.buffer_pool_size,
                options.page_size,
                Box::new(move |_, data| sink.write_page(&Page::deserialize(data)?)),
            ))
        };

        if !options.read_only {
            let stats = RecoveryManager::new(wal.clone(), pages.clone())
                .with_buffer_pool(pool.clone())
                .recover()?;
            if stats.updates_redone + stats.updates_undone > 0 {
                info!(?stats, "recovered from wal");
            }
        }

        let checkpoints = CheckpointManager::new(wal.clone(), pages.clone())
            .with_buffer_pool(pool.clone())
            .with_min_interval(options.checkpoint_interval);

        let indexes = IndexManager::new(pages.clone())?;

        let dn_root = pages.dn_index_root();
        let dn_index = if dn_root.0 != 0 {
            RadixTree::load_root(&pages, dn_root)?
        } else if cache_path.exists() {
            match RadixTree::load_cache(&cache_path, wal.current_lsn())? {
                CacheLoad::Loaded(tree) => tree,
                CacheLoad::Stale => {
                    debug!("radix cache stale; rebuilding from data pages");
                    rebuild_dn_index(&pages)?
                }
            }
        } else {
            rebuild_dn_index(&pages)?
        };

        let next_tx = highest_tx_id(&wal)? + 1;
        debug!(
            path = %options.data_dir.display(),
            entries = dn_index.len(),
            indexes = indexes.index_count(),
            "database open"
        );

        Ok(Self {
            pages,
            pool,
            wal,
            checkpoints,
            indexes,
            dn_index,
            cache_path,
            next_tx: AtomicU64::new(next_tx),
            read_only: options.read_only,
            closed: AtomicBool::new(false),
        })
    }

    /// Store a new entry, returning its physical location.
    pub fn add_entry(&self, entry: &Entry) -> DbResult<EntryRef> {
        self.check_writable()?;
        let dn = normalize_dn(&entry.dn)?;
        if self.dn_index.lookup(&dn)?.is_some() {
            return Err(DbError::EntryExists(dn));
        }

        let mut stored = entry.clone();
        stored.dn = dn.clone();
        let bytes = encode_to_vec(&stored, bincode_config())
            .map_err(|e| DbError::Serialization(format!("entry encode failed: {e}")))?;

        let (mut page, fresh) = self.page_for_insert(&bytes)?;
        let tx = self.begin_tx()?;
        // A fresh page's before-image is all zeros, so undoing an
        // uncommitted insert leaves no resurrectable slot behind.
        let old_payload = if fresh {
            vec![0u8; PAGE_PAYLOAD_SIZE]
        } else {
            page.payload.clone()
        };
        let slot = data_page::insert(&mut page, &bytes)?;
        self.wal.append(WalRecord::update(
            tx,
            page.id,
            0,
            old_payload,
            page.payload.clone(),
        ))?;
        self.commit_tx(tx)?;
        self.write_page_cached(&page)?;

        let eref = EntryRef {
            page_id: page.id,
            slot,
        };
        self.dn_index.insert(&dn, eref)?;
        self.indexes.update_indexes(None, Some(&stored), eref)?;
        Ok(eref)
    }

    /// Remove an entry by DN.
    pub fn delete_entry(&self, dn_str: &str) -> DbResult<()> {
        self.check_writable()?;
        let dn = normalize_dn(dn_str)?;
        let eref = self
            .dn_index
            .lookup(&dn)?
            .ok_or_else(|| DbError::EntryNotFound(dn.clone()))?;
        let old_entry = self.load_entry(eref)?;

        let mut page = self.read_page_cached(eref.page_id)?;
        let tx = self.begin_tx()?;
        let old_payload = page.payload.clone();
        if !data_page::delete(&mut page, eref.slot) {
            return Err(DbError::FileCorrupted(format!(
                "entry slot {}/{} already empty",
                eref.page_id.0, eref.slot
            )));
        }
        self.wal.append(WalRecord::update(
            tx,
            page.id,
            0,
            old_payload,
            page.payload.clone(),
        ))?;
        self.commit_tx(tx)?;
        self.write_page_cached(&page)?;

        self.dn_index.delete(&dn)?;
        self.indexes.update_indexes(Some(&old_entry), None, eref)?;
        Ok(())
    }

    /// Replace an entry's attributes (same DN).
    pub fn modify_entry(&self, entry: &Entry) -> DbResult<EntryRef> {
        self.check_writable()?;
        let dn = normalize_dn(&entry.dn)?;
        let old_ref = self
            .dn_index
            .lookup(&dn)?
            .ok_or_else(|| DbError::EntryNotFound(dn.clone()))?;
        let old_entry = self.load_entry(old_ref)?;

        let mut stored = entry.clone();
        stored.dn = dn.clone();
        let bytes = encode_to_vec(&stored, bincode_config())
            .map_err(|e| DbError::Serialization(format!("entry encode failed: {e}")))?;

        let tx = self.begin_tx()?;

        // Tombstone the old slot; reuse the same page when the new image
        // fits, otherwise place it like a fresh insert.
        let mut old_page = self.read_page_cached(old_ref.page_id)?;
        let before = old_page.payload.clone();
        data_page::delete(&mut old_page, old_ref.slot);

        let new_ref = if data_page::fits(&old_page, &bytes) {
            let slot = data_page::insert(&mut old_page, &bytes)?;
            self.wal.append(WalRecord::update(
                tx,
                old_page.id,
                0,
                before,
                old_page.payload.clone(),
            ))?;
            self.commit_tx(tx)?;
            self.write_page_cached(&old_page)?;
            EntryRef {
                page_id: old_page.id,
                slot,
            }
        } else {
            self.wal.append(WalRecord::update(
                tx,
                old_page.id,
                0,
                before,
                old_page.payload.clone(),
            ))?;
            let (mut target, fresh) = self.page_for_insert(&bytes)?;
            let target_before = if fresh {
                vec![0u8; PAGE_PAYLOAD_SIZE]
            } else {
                target.payload.clone()
            };
            let slot = data_page::insert(&mut target, &bytes)?;
            self.wal.append(WalRecord::update(
                tx,
                target.id,
                0,
                target_before,
                target.payload.clone(),
            ))?;
            self.commit_tx(tx)?;
            self.write_page_cached(&old_page)?;
            self.write_page_cached(&target)?;
            EntryRef {
                page_id: target.id,
                slot,
            }
        };

        self.dn_index.update(&dn, new_ref)?;
        self.indexes.update_indexes(Some(&old_entry), None, old_ref)?;
        self.indexes.update_indexes(None, Some(&stored), new_ref)?;
        Ok(new_ref)
    }

    /// Fetch an entry by DN.
    pub fn get_entry(&self, dn_str: &str) -> DbResult<Option<Entry>> {
        self.check_open()?;
        let dn = normalize_dn(dn_str)?;
        match self.dn_index.lookup(&dn)? {
            Some(eref) => Ok(Some(self.load_entry(eref)?)),
            None => Ok(None),
        }
    }

    /// Equality search over an indexed attribute, materializing entries.
    pub fn search(&self, attribute: &str, value: &str) -> DbResult<Vec<Entry>> {
        self.check_open()?;
        self.indexes
            .search(attribute, value)?
            .into_iter()
            .map(|eref| self.load_entry(eref))
            .collect()
    }

    /// Scoped DN search, materializing entries in iteration order.
    pub fn search_scope(&self, base_dn: &str, scope: Scope) -> DbResult<Vec<(String, Entry)>> {
        self.check_open()?;
        let mut iter: RadixIterator = self.dn_index.iterate(base_dn, scope)?;
        let mut results = Vec::new();
        while iter.next() {
            let (dn, eref) = iter.value().expect("cursor advanced");
            results.push((dn.to_string(), self.load_entry(eref)?));
        }
        Ok(results)
    }

    /// Take a checkpoint now.
    pub fn checkpoint(&self) -> DbResult<Lsn> {
        self.check_writable()?;
        self.checkpoints.checkpoint()
    }

    /// Checkpoint if the configured interval has elapsed.
    pub fn maybe_checkpoint(&self) -> DbResult<Option<Lsn>> {
        self.check_writable()?;
        if self.checkpoints.should_checkpoint() {
            return self.checkpoints.checkpoint().map(Some);
        }
        Ok(None)
    }

    /// Checkpoint, persist the DN tree, and close every layer.
    ///
    /// A second call returns `FileClosed`.
    pub fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::FileClosed);
        }
        if self.read_only {
            return self.pages.close();
        }

        self.pool.flush_all()?;
        self.checkpoints.checkpoint()?;
        self.checkpoints.truncate_wal()?;
        self.persist_dn_index()?;
        self.indexes.close()?;
        self.wal.close()?;
        self.pages.close()
    }

    pub fn page_manager(&self) -> &Arc<PageManager> {
        &self.pages
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn dn_index(&self) -> &RadixTree {
        &self.dn_index
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    // ---- Internals ----

    fn check_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::FileClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> DbResult<()> {
        self.check_open()?;
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }

    fn begin_tx(&self) -> DbResult<TxId> {
        let tx = self.next_tx.fetch_add(1, Ordering::SeqCst);
        self.wal.append(WalRecord::begin(tx))?;
        Ok(tx)
    }

    fn commit_tx(&self, tx: TxId) -> DbResult<()> {
        self.wal.append(WalRecord::commit(tx))?;
        self.wal.sync()
    }

    /// Read a page through the buffer pool.
    fn read_page_cached(&self, id: PageId) -> DbResult<Page> {
        if let Some(frame) = self.pool.get(id) {
            return Page::deserialize(&frame.data);
        }
        let page = self.pages.read_page(id)?;
        self.pool.put(id, &page.serialize())?;
        Ok(page)
    }

    /// Install a mutated page in the pool and mark it dirty.
    fn write_page_cached(&self, page: &Page) -> DbResult<()> {
        self.pool.put(page.id, &page.serialize())?;
        self.pool.mark_dirty(page.id)
    }

    /// The page an insert of `bytes` should land in: the current data page
    /// if it fits, else a freshly allocated one that becomes current.
    fn page_for_insert(&self, bytes: &[u8]) -> DbResult<(Page, bool)> {
        let current = self.pages.data_root();
        if current.0 != 0 {
            let page = self.read_page_cached(current)?;
            if data_page::fits(&page, bytes) {
                return Ok((page, false));
            }
        }
        let id = self.pages.allocate_page(PageType::Data)?;
        self.pages.set_data_root(id)?;
        Ok((Page::new(id, PageType::Data), true))
    }

    fn load_entry(&self, eref: EntryRef) -> DbResult<Entry> {
        let page = self.read_page_cached(eref.page_id)?;
        let bytes = data_page::read(&page, eref.slot).ok_or_else(|| {
            DbError::FileCorrupted(format!(
                "dangling entry reference {}/{}",
                eref.page_id.0, eref.slot
            ))
        })?;
        let (entry, _) = decode_from_slice(bytes, bincode_config())
            .map_err(|e| DbError::Serialization(format!("entry decode failed: {e}")))?;
        Ok(entry)
    }

    /// Write the DN tree into its root page, falling back to the cache
    /// file when the tree no longer fits a single page.
    fn persist_dn_index(&self) -> DbResult<()> {
        let mut root = self.pages.dn_index_root();
        if root.0 == 0 {
            root = self.pages.allocate_page(PageType::DnIndex)?;
            self.pages.set_dn_index_root(root)?;
        }
        match self.dn_index.persist_root(&self.pages, root) {
            Ok(()) => {
                if self.cache_path.exists() {
                    let _ = fs::remove_file(&self.cache_path);
                }
                Ok(())
            }
            Err(DbError::PageOverflow(size)) => {
                debug!(size, "dn tree outgrew its root page; using the cache file");
                self.dn_index
                    .save_cache(&self.cache_path, self.wal.current_lsn())?;
                self.pages.set_dn_index_root(PageId(0))?;
                self.pages.free_page(root)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Resolve the WAL key from the options or the key file.
fn resolve_key(options: &EngineOptions) -> DbResult<Option<[u8; 32]>> {
    if let Some(key) = options.encryption_key {
        return Ok(Some(key));
    }
    let Some(path) = &options.encryption_key_file else {
        return Ok(None);
    };
    let text = fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| DbError::Config(format!("encryption key file is not hex: {e}")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| DbError::Config("encryption key must be 32 bytes".into()))?;
    Ok(Some(key))
}

/// Rebuild the DN tree by scanning every data page.
fn rebuild_dn_index(pages: &Arc<PageManager>) -> DbResult<RadixTree> {
    let tree = RadixTree::new();
    for id in 1..pages.total_pages() {
        let page = pages.read_page(PageId(id))?;
        if page.page_type != PageType::Data {
            continue;
        }
        for slot in data_page::live_slots(&page) {
            let Some(bytes) = data_page::read(&page, slot) else {
                continue;
            };
            let entry: Entry = match decode_from_slice(bytes, bincode_config()) {
                Ok((entry, _)) => entry,
                Err(e) => {
                    warn!(page = id, slot, error = %e, "skipping undecodable entry");
                    continue;
                }
            };
            tree.insert(
                &entry.dn,
                EntryRef {
                    page_id: PageId(id),
                    slot,
                },
            )?;
        }
    }
    Ok(tree)
}

/// Highest transaction id appearing anywhere in the WAL.
fn highest_tx_id(wal: &Wal) -> DbResult<TxId> {
    let mut max_tx = 0;
    let mut iter = wal.iter(1)?;
    while let Some(record) = iter.next()? {
        max_tx = max_tx.max(record.tx_id);
    }
    Ok(max_tx)
}
