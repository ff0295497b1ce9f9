//! Checkpoint protocol: bound recovery work and let the WAL shrink.

use buffer::BufferPool;
use common::{DbError, DbResult, Lsn, TxId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use storage::PageManager;
use tracing::info;
use wal::{CheckpointData, Wal, WalRecord};

/// Supplies the transaction ids that are live at checkpoint time.
pub type ActiveTxFn = Box<dyn Fn() -> Vec<TxId> + Send + Sync>;

#[derive(Default)]
struct CheckpointState {
    last_lsn: Option<Lsn>,
    last_time: Option<Instant>,
}

/// Takes checkpoints and truncates the WAL behind them.
pub struct CheckpointManager {
    wal: Arc<Wal>,
    pages: Arc<PageManager>,
    pool: Option<Arc<BufferPool>>,
    active_txs: Option<ActiveTxFn>,
    min_interval: Duration,
    state: Mutex<CheckpointState>,
    in_progress: AtomicBool,
}

impl CheckpointManager {
    pub fn new(wal: Arc<Wal>, pages: Arc<PageManager>) -> Self {
        Self {
            wal,
            pages,
            pool: None,
            active_txs: None,
            min_interval: Duration::from_secs(300),
            state: Mutex::new(CheckpointState::default()),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_active_txs(mut self, f: ActiveTxFn) -> Self {
        self.active_txs = Some(f);
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Flush dirty state, log a checkpoint record, and fsync the WAL.
    ///
    /// Returns the checkpoint record's LSN.
    ///
    /// # Errors
    ///
    /// `CheckpointInProgress` when another call is already running.
    pub fn checkpoint(&self) -> DbResult<Lsn> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbError::CheckpointInProgress);
        }
        let result = self.checkpoint_inner();
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn checkpoint_inner(&self) -> DbResult<Lsn> {
        if let Some(pool) = &self.pool {
            pool.flush_all()?;
        }
        self.pages.sync()?;

        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let data = CheckpointData {
            timestamp_nanos,
            last_lsn: self.wal.current_lsn().saturating_sub(1),
            active_tx_ids: self.active_txs.as_ref().map(|f| f()).unwrap_or_default(),
            // Usually empty right after flush_all; anything re-dirtied since
            // is captured so analysis can seed its dirty-page table.
            dirty_page_ids: self
                .pool
                .as_ref()
                .map(|p| p.dirty_page_ids())
                .unwrap_or_default(),
        };

        let lsn = self.wal.append(WalRecord::checkpoint(&data))?;
        self.wal.sync()?;

        let mut state = self.state.lock();
        state.last_lsn = Some(lsn);
        state.last_time = Some(Instant::now());
        info!(lsn, "checkpoint complete");
        Ok(lsn)
    }

    /// Truncate the WAL up to (but not including) the last checkpoint record.
    ///
    /// # Errors
    ///
    /// `NoActiveCheckpoint` before the first successful checkpoint.
    pub fn truncate_wal(&self) -> DbResult<()> {
        let last = self
            .state
            .lock()
            .last_lsn
            .ok_or(DbError::NoActiveCheckpoint)?;
        self.wal.truncate(last.saturating_sub(1))
    }

    /// True when the configured interval has elapsed (or nothing has been
    /// checkpointed yet).
    pub fn should_checkpoint(&self) -> bool {
        match self.state.lock().last_time {
            Some(at) => at.elapsed() >= self.min_interval,
            None => true,
        }
    }

    pub fn last_checkpoint_lsn(&self) -> Option<Lsn> {
        self.state.lock().last_lsn
    }
}
