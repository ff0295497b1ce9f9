//! Crash recovery and checkpointing.
//!
//! Recovery is a three-pass ARIES simplification over the WAL:
//!
//! 1. **Analysis** builds a transaction table and a dirty-page table from
//!    every record, noting the last checkpoint.
//! 2. **Redo** replays update images from the earliest point that could
//!    have dirtied a page that never reached disk.
//! 3. **Undo** walks loser transactions backwards, restores their
//!    before-images, and logs an `Abort` for each.
//!
//! Running recovery twice over the same WAL and data file is a no-op the
//! second time: redo rewrites identical bytes and undo finds no losers
//! still active once their aborts are logged.


mod checkpoint;

pub use checkpoint::{ActiveTxFn, CheckpointManager};

use buffer::BufferPool;
use common::{DbError, DbResult, Lsn, PageId, TxId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storage::{PageManager, PAGE_PAYLOAD_SIZE};
use tracing::{debug, info, warn};
use wal::{CheckpointData, Wal, WalRecord, WalRecordType};

/// Lifecycle of a transaction as reconstructed by analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// Per-transaction bookkeeping built during the analysis pass.
#[derive(Clone, Copy, Debug)]
pub struct TxTableEntry {
    pub state: TxState,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo_next_lsn: Lsn,
}

/// Counters reported by [`RecoveryManager::recover`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub updates_redone: usize,
    pub updates_undone: usize,
    pub txs_aborted: usize,
}

/// Drives the three recovery passes.
pub struct RecoveryManager {
    wal: Arc<Wal>,
    pages: Arc<PageManager>,
    pool: Option<Arc<BufferPool>>,
    in_progress: AtomicBool,
}

/// Clears the in-progress flag even on early error returns.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecoveryManager {
    pub fn new(wal: Arc<Wal>, pages: Arc<PageManager>) -> Self {
        Self {
            wal,
            pages,
            pool: None,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Keep an attached buffer pool coherent with redone/undone pages.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Run analysis, redo, and undo.
    ///
    /// # Errors
    ///
    /// `RecoveryInProgress` when another call is already running; I/O and
    /// WAL errors otherwise. Individual update replays whose target page no
    /// longer exists are skipped, not fatal.
    pub fn recover(&self) -> DbResult<RecoveryStats> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbError::RecoveryInProgress);
        }
        let _guard = InProgressGuard(&self.in_progress);

        let mut stats = RecoveryStats::default();
        let analysis = self.analyze(&mut stats)?;
        debug!(
            transactions = analysis.tx_table.len(),
            dirty_pages = analysis.dirty_pages.len(),
            redo_lsn = analysis.redo_lsn,
            "analysis complete"
        );

        self.redo(&analysis, &mut stats)?;
        self.undo(&analysis, &mut stats)?;

        info!(
            scanned = stats.records_scanned,
            redone = stats.updates_redone,
            undone = stats.updates_undone,
            aborted = stats.txs_aborted,
            "recovery complete"
        );
        Ok(stats)
    }

    fn analyze(&self, stats: &mut RecoveryStats) -> DbResult<Analysis> {
        let mut tx_table: HashMap<TxId, TxTableEntry> = HashMap::new();
        let mut dirty_pages: HashMap<PageId, Lsn> = HashMap::new();
        let mut checkpoint_lsn = None;
        let mut first_lsn = None;

        let mut iter = self.wal.iter(1)?;
        while let Some(record) = iter.next()? {
            stats.records_scanned += 1;
            first_lsn.get_or_insert(record.lsn);

            match record.record_type {
                WalRecordType::Begin => {
                    tx_table.insert(
                        record.tx_id,
                        TxTableEntry {
                            state: TxState::Active,
                            first_lsn: record.lsn,
                            last_lsn: record.lsn,
                            undo_next_lsn: record.lsn,
                        },
                    );
                }
                WalRecordType::Commit | WalRecordType::Abort => {
                    let state = if record.record_type == WalRecordType::Commit {
                        TxState::Committed
                    } else {
                        TxState::Aborted
                    };
                    let entry = tx_table.entry(record.tx_id).or_insert(TxTableEntry {
                        state,
                        first_lsn: record.lsn,
                        last_lsn: record.lsn,
                        undo_next_lsn: record.lsn,
                    });
                    entry.state = state;
                    entry.last_lsn = record.lsn;
                }
                WalRecordType::Update => {
                    let entry = tx_table.entry(record.tx_id).or_insert(TxTableEntry {
                        state: TxState::Active,
                        first_lsn: record.lsn,
                        last_lsn: record.lsn,
                        undo_next_lsn: record.lsn,
                    });
                    entry.last_lsn = record.lsn;
                    entry.undo_next_lsn = record.lsn;
                    dirty_pages.entry(record.page_id).or_insert(record.lsn);
                }
                WalRecordType::Checkpoint => {
                    checkpoint_lsn = Some(record.lsn);
                    // Seed state that predates a truncated log prefix.
                    if let Ok(data) = CheckpointData::decode(&record.new_data) {
                        for tx in data.active_tx_ids {
                            tx_table.entry(tx).or_insert(TxTableEntry {
                                state: TxState::Active,
                                first_lsn: record.lsn,
                                last_lsn: record.lsn,
                                undo_next_lsn: record.lsn,
                            });
                        }
                        for page in data.dirty_page_ids {
                            dirty_pages.entry(page).or_insert(record.lsn);
                        }
                    } else {
                        warn!(lsn = record.lsn, "unreadable checkpoint payload; ignoring");
                    }
                }
            }
        }

        let base = checkpoint_lsn.or(first_lsn).unwrap_or(1);
        let redo_lsn = dirty_pages.values().copied().min().unwrap_or(base).min(base);

        Ok(Analysis {
            tx_table,
            dirty_pages,
            redo_lsn,
        })
    }

    fn redo(&self, analysis: &Analysis, stats: &mut RecoveryStats) -> DbResult<()> {
        let mut iter = self.wal.iter(analysis.redo_lsn)?;
        while let Some(record) = iter.next()? {
            if record.record_type != WalRecordType::Update {
                continue;
            }
            // Aborted transactions are excluded so that re-running recovery
            // after an undo pass does not resurrect their images.
            match analysis.tx_table.get(&record.tx_id) {
                Some(entry) if entry.state != TxState::Aborted => {}
                _ => continue,
            }
            if self.apply_image(record.page_id, record.offset, &record.new_data)? {
                stats.updates_redone += 1;
            }
        }
        self.pages.sync()?;
        Ok(())
    }

    fn undo(&self, analysis: &Analysis, stats: &mut RecoveryStats) -> DbResult<()> {
        let losers: Vec<TxId> = analysis
            .tx_table
            .iter()
            .filter(|(_, entry)| entry.state == TxState::Active)
            .map(|(&tx, _)| tx)
            .collect();
        if losers.is_empty() {
            return Ok(());
        }

        let mut updates = Vec::new();
        let mut iter = self.wal.iter(1)?;
        while let Some(record) = iter.next()? {
            if record.record_type == WalRecordType::Update && losers.contains(&record.tx_id) {
                updates.push(record);
            }
        }
        updates.sort_by(|a, b| b.lsn.cmp(&a.lsn));

        for record in &updates {
            if self.apply_image(record.page_id, record.offset, &record.old_data)? {
                stats.updates_undone += 1;
            }
        }

        for &tx in &losers {
            self.wal.append(WalRecord::abort(tx))?;
            stats.txs_aborted += 1;
        }
        self.wal.sync()?;
        self.pages.sync()?;
        Ok(())
    }

    /// Overwrite a payload slice of a page, skipping pages that no longer
    /// exist or images that fall outside the payload.
    fn apply_image(&self, page_id: PageId, offset: u16, image: &[u8]) -> DbResult<bool> {
        if image.is_empty() {
            return Ok(false);
        }
        let start = offset as usize;
        if start + image.len() > PAGE_PAYLOAD_SIZE {
            warn!(page = page_id.0, offset, len = image.len(), "image outside payload; skipping");
            return Ok(false);
        }

        let mut page = match self.pages.read_page(page_id) {
            Ok(page) => page,
            Err(DbError::PageOutOfRange(_)) | Err(DbError::InvalidPageId(_)) => {
                warn!(page = page_id.0, "replay target page missing; skipping");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        page.payload[start..start + image.len()].copy_from_slice(image);
        self.pages.write_page(&page)?;
        if let Some(pool) = &self.pool {
            if pool.contains(page_id) {
                pool.put(page_id, &page.serialize())?;
            }
        }
        Ok(true)
    }
}

struct Analysis {
    tx_table: HashMap<TxId, TxTableEntry>,
    dirty_pages: HashMap<PageId, Lsn>,
    redo_lsn: Lsn,
}
