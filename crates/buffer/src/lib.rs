//! Bounded page cache with pin accounting and write-back.
//!
//! The buffer pool sits between callers and the page manager. It never
//! touches the data file itself: dirty frames are written back through a
//! flush callback wired in at construction time (conventionally
//! `PageManager::write_page`). Eviction walks the LRU order from the cold
//! end, skipping pinned frames; a dirty victim is flushed before it is
//! dropped.
//!
//! # Example
//!
//! ```
//! use buffer::BufferPool;
//! use common::PageId;
//!
//! let pool = BufferPool::new(2, 4096);
//! pool.put(PageId(1), &vec![0u8; 4096]).unwrap();
//! pool.pin(PageId(1)).unwrap();
//! pool.put(PageId(2), &vec![0u8; 4096]).unwrap();
//! pool.put(PageId(3), &vec![0u8; 4096]).unwrap(); // evicts page 2, not the pinned 1
//! assert!(pool.contains(PageId(1)));
//! ```


use common::{DbError, DbResult, PageId};
use hashbrown::HashSet;
use lru::LruCache;
use parking_lot::Mutex;

/// Callback invoked to persist a dirty frame before eviction or on flush.
pub type FlushFn = Box<dyn Fn(PageId, &[u8]) -> DbResult<()> + Send + Sync>;

/// One cached page frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferPage {
    pub id: PageId,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub pin_count: i32,
}

/// Counters reported by [`BufferPool::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

struct Inner {
    // Unbounded: capacity is enforced by hand so pinned frames are never
    // victims and dirty victims go through the flush callback first.
    frames: LruCache<PageId, BufferPage>,
    dirty: HashSet<PageId>,
    stats: BufferPoolStats,
}

/// Bounded LRU cache of page frames.
///
/// All operations serialize through a single mutex.
pub struct BufferPool {
    capacity: usize,
    page_size: usize,
    flush: Option<FlushFn>,
    inner: Mutex<Inner>,
}

impl BufferPool {
    /// A pool without a flush callback; dirty victims are dropped clean.
    pub fn new(capacity: usize, page_size: usize) -> Self {
        Self::build(capacity, page_size, None)
    }

    /// A pool that writes dirty frames back through `flush`.
    pub fn with_flush(capacity: usize, page_size: usize, flush: FlushFn) -> Self {
        Self::build(capacity, page_size, Some(flush))
    }

    fn build(capacity: usize, page_size: usize, flush: Option<FlushFn>) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            capacity,
            page_size,
            flush,
            inner: Mutex::new(Inner {
                frames: LruCache::unbounded(),
                dirty: HashSet::new(),
                stats: BufferPoolStats::default(),
            }),
        }
    }

    /// Fetch a copy of a cached frame, marking it most recently used.
    pub fn get(&self, id: PageId) -> Option<BufferPage> {
        let mut inner = self.inner.lock();
        match inner.frames.get(&id).cloned() {
            Some(frame) => {
                inner.stats.hits += 1;
                Some(frame)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or overwrite a frame.
    ///
    /// An existing frame keeps its pin count and dirty flag; the bytes are
    /// copied into place. Inserting into a full pool evicts the coldest
    /// unpinned frame first.
    ///
    /// # Errors
    ///
    /// `BufferPoolFull` when every frame is pinned, or the flush callback's
    /// error when writing back a dirty victim fails.
    pub fn put(&self, id: PageId, data: &[u8]) -> DbResult<()> {
        debug_assert_eq!(data.len(), self.page_size);
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get_mut(&id) {
            frame.data.clear();
            frame.data.extend_from_slice(data);
            return Ok(());
        }

        if inner.frames.len() >= self.capacity {
            self.evict_locked(&mut inner)?;
        }
        inner.frames.put(
            id,
            BufferPage {
                id,
                data: data.to_vec(),
                dirty: false,
                pin_count: 0,
            },
        );
        Ok(())
    }

    /// Pin a frame so it cannot be evicted.
    pub fn pin(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .peek_mut(&id)
            .ok_or(DbError::PageNotFound(id.0))?;
        frame.pin_count += 1;
        Ok(())
    }

    /// Drop one pin from a frame.
    pub fn unpin(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .peek_mut(&id)
            .ok_or(DbError::PageNotFound(id.0))?;
        if frame.pin_count == 0 {
            return Err(DbError::NegativePinCount(id.0));
        }
        frame.pin_count -= 1;
        Ok(())
    }

    /// Mark a frame dirty.
    pub fn mark_dirty(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .peek_mut(&id)
            .ok_or(DbError::PageNotFound(id.0))?;
        frame.dirty = true;
        inner.dirty.insert(id);
        Ok(())
    }

    /// Write every dirty frame through the flush callback.
    ///
    /// Flushes exactly the dirty set observed at entry. The first callback
    /// error aborts the loop; frames not yet flushed stay dirty.
    pub fn flush_all(&self) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let Some(flush) = self.flush.as_ref() else {
            return Ok(());
        };
        let dirty_ids: Vec<PageId> = inner.dirty.iter().copied().collect();
        for id in dirty_ids {
            if let Some(frame) = inner.frames.peek(&id) {
                flush(id, &frame.data)?;
                inner.stats.flushes += 1;
            }
            if let Some(frame) = inner.frames.peek_mut(&id) {
                frame.dirty = false;
            }
            inner.dirty.remove(&id);
        }
        Ok(())
    }

    /// Flush one frame if it is dirty; a clean or absent frame is a no-op.
    pub fn flush_page(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty.contains(&id) {
            return Ok(());
        }
        if let Some(flush) = self.flush.as_ref() {
            if let Some(frame) = inner.frames.peek(&id) {
                flush(id, &frame.data)?;
                inner.stats.flushes += 1;
            }
        }
        if let Some(frame) = inner.frames.peek_mut(&id) {
            frame.dirty = false;
        }
        inner.dirty.remove(&id);
        Ok(())
    }

    /// Evict the least recently used unpinned frame.
    ///
    /// Returns the evicted id and its bytes, or `None` when every frame is
    /// pinned (or the pool is empty).
    pub fn evict(&self) -> DbResult<Option<(PageId, Vec<u8>)>> {
        let mut inner = self.inner.lock();
        if inner.frames.is_empty() {
            return Ok(None);
        }
        match self.evict_locked(&mut inner) {
            Ok(evicted) => Ok(Some(evicted)),
            Err(DbError::BufferPoolFull) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drop a frame, flushing it first if dirty.
    pub fn remove(&self, id: PageId) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let frame = inner.frames.peek(&id).ok_or(DbError::PageNotFound(id.0))?;
        if frame.pin_count > 0 {
            return Err(DbError::PagePinned(id.0));
        }
        if frame.dirty {
            if let Some(flush) = self.flush.as_ref() {
                flush(id, &frame.data)?;
                inner.stats.flushes += 1;
            }
        }
        inner.frames.pop(&id);
        inner.dirty.remove(&id);
        Ok(())
    }

    /// Flush everything, then drop every frame.
    pub fn clear(&self) -> DbResult<()> {
        self.flush_all()?;
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.dirty.clear();
        Ok(())
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.inner.lock().frames.contains(&id)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dirty_page_count(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    pub fn dirty_page_ids(&self) -> Vec<PageId> {
        self.inner.lock().dirty.iter().copied().collect()
    }

    pub fn get_all_page_ids(&self) -> Vec<PageId> {
        self.inner.lock().frames.iter().map(|(id, _)| *id).collect()
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.inner.lock().stats
    }

    /// Pick the coldest unpinned frame, flush it if dirty, and drop it.
    fn evict_locked(&self, inner: &mut Inner) -> DbResult<(PageId, Vec<u8>)> {
        let victim = inner
            .frames
            .iter()
            .rev()
            .find(|(_, frame)| frame.pin_count == 0)
            .map(|(id, _)| *id)
            .ok_or(DbError::BufferPoolFull)?;

        let frame = inner.frames.peek(&victim).expect("victim frame present");
        if frame.dirty {
            // Without a callback the frame is dropped clean; production
            // callers always wire one.
            if let Some(flush) = self.flush.as_ref() {
                flush(victim, &frame.data)?;
                inner.stats.flushes += 1;
            }
        }

        let frame = inner.frames.pop(&victim).expect("victim frame present");
        inner.dirty.remove(&victim);
        inner.stats.evictions += 1;
        Ok((victim, frame.data))
    }
}
