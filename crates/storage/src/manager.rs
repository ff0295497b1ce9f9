//! Page manager: file lifecycle, allocation, and page I/O.

use crate::freelist::{next_page, set_next_page, FreeList, FREE_LIST_ENTRIES_PER_PAGE};
use crate::header::FileHeader;
use crate::page::{Page, PageType, PAGE_SIZE};
use common::{DbError, DbResult, PageId};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// Pages added in one growth step when the free list is exhausted.
const MIN_GROWTH_PAGES: u64 = 8;

/// Options for [`PageManager::open`].
#[derive(Clone, Debug)]
pub struct PageManagerOptions {
    pub page_size: usize,
    pub initial_pages: u64,
    pub create_if_new: bool,
    pub read_only: bool,
    pub sync_on_write: bool,
}

impl Default for PageManagerOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            initial_pages: 16,
            create_if_new: true,
            read_only: false,
            sync_on_write: false,
        }
    }
}

/// Counters reported by [`PageManager::stats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageManagerStats {
    pub total_pages: u64,
    pub free_pages: usize,
}

#[derive(Debug)]
struct State {
    file: File,
    header: FileHeader,
    closed: bool,
}

/// Owner of the data file.
///
/// A single reader-writer lock guards the file and header: `read_page` and
/// `stats` take it shared, every mutator takes it exclusive. The free list
/// carries its own lock and is always acquired after the state lock.
#[derive(Debug)]
pub struct PageManager {
    state: RwLock<State>,
    free_list: FreeList,
    read_only: bool,
    sync_on_write: bool,
}

impl PageManager {
    /// Open or create a data file.
    ///
    /// A new file gets a header page, pages `1..initial_pages` on the free
    /// list, and is truncated to exactly `initial_pages * PAGE_SIZE` bytes.
    /// An existing file has its header validated and its free-list chain
    /// walked (each chain page CRC-checked).
    ///
    /// # Errors
    ///
    /// `Config` for an unsupported page size, `InvalidMagic` /
    /// `UnsupportedVersion` / `HeaderChecksum` / `FileCorrupted` for an
    /// unrecognizable file, `Io` for OS failures.
    pub fn open(path: impl AsRef<Path>, options: PageManagerOptions) -> DbResult<Self> {
        if options.page_size != PAGE_SIZE {
            return Err(DbError::Config(format!(
                "unsupported page size {} (only {PAGE_SIZE} is supported)",
                options.page_size
            )));
        }
        if options.initial_pages == 0 {
            return Err(DbError::Config("initial_pages must be > 0".into()));
        }

        let path = path.as_ref();
        if path.exists() {
            Self::open_existing(path, &options)
        } else if options.create_if_new && !options.read_only {
            Self::create(path, &options)
        } else {
            Err(DbError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("data file not found: {}", path.display()),
            )))
        }
    }

    fn create(path: &Path, options: &PageManagerOptions) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = FileHeader::new(options.initial_pages);
        file.write_all_at(&header.serialize(), 0)?;

        let free_list = FreeList::new();
        for id in 1..options.initial_pages {
            let page = Page::new(PageId(id), PageType::Free);
            file.write_all_at(&page.serialize(), id * PAGE_SIZE as u64)?;
            free_list.push(PageId(id));
        }

        file.set_len(options.initial_pages * PAGE_SIZE as u64)?;
        file.sync_all()?;
        debug!(path = %path.display(), pages = options.initial_pages, "created data file");

        Ok(Self {
            state: RwLock::new(State {
                file,
                header,
                closed: false,
            }),
            free_list,
            read_only: false,
            sync_on_write: options.sync_on_write,
        })
    }

    fn open_existing(path: &Path, options: &PageManagerOptions) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let mut header = FileHeader::deserialize_validated(&buf)?;

        // Walk the free-list chain, CRC-checking every link.
        let free_list = FreeList::new();
        let mut chain = Vec::new();
        let mut next = header.free_list_head;
        while next.0 != 0 {
            if next.0 >= header.total_pages || chain.len() as u64 >= header.total_pages {
                return Err(DbError::FileCorrupted(format!(
                    "free-list chain escapes the file at page {}",
                    next.0
                )));
            }
            file.read_exact_at(&mut buf, next.0 * PAGE_SIZE as u64)?;
            let page = Page::deserialize_validated(&buf)?;
            if page.page_type != PageType::Free {
                return Err(DbError::FileCorrupted(format!(
                    "free-list chain points at a {:?} page ({})",
                    page.page_type, page.id.0
                )));
            }
            next = next_page(&page);
            chain.push(page);
        }
        free_list.load_from_pages(&chain)?;
        // The persisted chain is only authoritative at clean close; once its
        // pages can be reallocated, a mid-run header sync must not point at
        // them. Close rebuilds the chain and restores the head.
        header.free_list_head = PageId(0);
        debug!(
            path = %path.display(),
            total_pages = header.total_pages,
            free_pages = free_list.len(),
            "opened data file"
        );

        Ok(Self {
            state: RwLock::new(State {
                file,
                header,
                closed: false,
            }),
            free_list,
            read_only: options.read_only,
            sync_on_write: options.sync_on_write,
        })
    }

    /// Allocate a page, reusing a free one or growing the file.
    ///
    /// The returned page has been written zeroed with the requested type.
    pub fn allocate_page(&self, page_type: PageType) -> DbResult<PageId> {
        let mut state = self.state.write();
        self.check_writable(&state)?;

        let id = match self.free_list.pop() {
            Some(id) => id,
            None => {
                // Grow the file; hand out the first new page, free the rest.
                let first_new = state.header.total_pages;
                let growth = MIN_GROWTH_PAGES.max(1);
                for i in 1..growth {
                    let id = PageId(first_new + i);
                    let page = Page::new(id, PageType::Free);
                    state
                        .file
                        .write_all_at(&page.serialize(), id.0 * PAGE_SIZE as u64)?;
                    self.free_list.push(id);
                }
                state.header.total_pages = first_new + growth;
                let len = state.header.total_pages * PAGE_SIZE as u64;
                state.file.set_len(len)?;
                // Persist the new page count so pages allocated past the old
                // end survive a crash (recovery skips pages it cannot see).
                state.file.write_all_at(&state.header.serialize(), 0)?;
                state.file.sync_data()?;
                debug!(total_pages = state.header.total_pages, "grew data file");
                PageId(first_new)
            }
        };

        let page = Page::new(id, page_type);
        state
            .file
            .write_all_at(&page.serialize(), id.0 * PAGE_SIZE as u64)?;
        if self.sync_on_write {
            state.file.sync_data()?;
        }
        Ok(id)
    }

    /// Return a page to the free list.
    pub fn free_page(&self, id: PageId) -> DbResult<()> {
        let state = self.state.write();
        self.check_writable(&state)?;
        if id.0 == 0 {
            return Err(DbError::CannotFreeHeader);
        }
        if id.0 >= state.header.total_pages {
            return Err(DbError::PageOutOfRange(id.0));
        }
        if self.free_list.contains(id) {
            return Err(DbError::PageAlreadyFree(id.0));
        }

        let page = Page::new(id, PageType::Free);
        state
            .file
            .write_all_at(&page.serialize(), id.0 * PAGE_SIZE as u64)?;
        if self.sync_on_write {
            state.file.sync_data()?;
        }
        self.free_list.push(id);
        Ok(())
    }

    /// Read a page without checksum validation.
    pub fn read_page(&self, id: PageId) -> DbResult<Page> {
        let state = self.state.read();
        self.check_open(&state)?;
        if id.0 >= state.header.total_pages {
            return Err(DbError::PageOutOfRange(id.0));
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        state.file.read_exact_at(&mut buf, id.0 * PAGE_SIZE as u64)?;
        Page::deserialize(&buf)
    }

    /// Read a page and verify its payload checksum.
    pub fn read_page_validated(&self, id: PageId) -> DbResult<Page> {
        let state = self.state.read();
        self.check_open(&state)?;
        if id.0 >= state.header.total_pages {
            return Err(DbError::PageOutOfRange(id.0));
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        state.file.read_exact_at(&mut buf, id.0 * PAGE_SIZE as u64)?;
        Page::deserialize_validated(&buf)
    }

    /// Read several pages in one shared-lock acquisition.
    pub fn read_pages(&self, ids: &[PageId]) -> DbResult<Vec<Page>> {
        let state = self.state.read();
        self.check_open(&state)?;
        let mut pages = Vec::with_capacity(ids.len());
        let mut buf = vec![0u8; PAGE_SIZE];
        for &id in ids {
            if id.0 >= state.header.total_pages {
                return Err(DbError::PageOutOfRange(id.0));
            }
            state.file.read_exact_at(&mut buf, id.0 * PAGE_SIZE as u64)?;
            pages.push(Page::deserialize(&buf)?);
        }
        Ok(pages)
    }

    /// Serialize a page (refreshing its checksum) and write it in place.
    pub fn write_page(&self, page: &Page) -> DbResult<()> {
        let state = self.state.write();
        self.check_writable(&state)?;
        if page.id.0 == 0 {
            return Err(DbError::InvalidPageId(0));
        }
        if page.id.0 >= state.header.total_pages {
            return Err(DbError::PageOutOfRange(page.id.0));
        }
        state
            .file
            .write_all_at(&page.serialize(), page.id.0 * PAGE_SIZE as u64)?;
        if self.sync_on_write {
            state.file.sync_data()?;
        }
        Ok(())
    }

    /// Write several pages in one exclusive-lock acquisition.
    pub fn write_pages(&self, pages: &[Page]) -> DbResult<()> {
        let state = self.state.write();
        self.check_writable(&state)?;
        for page in pages {
            if page.id.0 == 0 {
                return Err(DbError::InvalidPageId(0));
            }
            if page.id.0 >= state.header.total_pages {
                return Err(DbError::PageOutOfRange(page.id.0));
            }
            state
                .file
                .write_all_at(&page.serialize(), page.id.0 * PAGE_SIZE as u64)?;
        }
        if self.sync_on_write {
            state.file.sync_data()?;
        }
        Ok(())
    }

    /// Persist the header and fsync the file.
    pub fn sync(&self) -> DbResult<()> {
        let state = self.state.write();
        self.check_open(&state)?;
        if self.read_only {
            return Ok(());
        }
        state.file.write_all_at(&state.header.serialize(), 0)?;
        state.file.sync_all()?;
        Ok(())
    }

    /// Persist the free list and header, fsync, and mark the manager closed.
    ///
    /// The free-list chain is stored inside free pages themselves, so the
    /// entry set loaded on reopen includes the chain's own pages. A second
    /// call returns `FileClosed`.
    pub fn close(&self) -> DbResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(DbError::FileClosed);
        }
        if self.read_only {
            state.closed = true;
            return Ok(());
        }

        let ids = self.free_list.peek_all();
        if ids.is_empty() {
            state.header.free_list_head = PageId(0);
        } else {
            let pages_needed = ids.len().div_ceil(FREE_LIST_ENTRIES_PER_PAGE);
            let chain = &ids[..pages_needed];
            let mut start = 0;
            for (i, &pid) in chain.iter().enumerate() {
                let mut page = Page::new(pid, PageType::Free);
                let (next_start, _) = self.free_list.serialize_to_page(&mut page, start);
                start = next_start;
                let next = chain.get(i + 1).copied().unwrap_or(PageId(0));
                set_next_page(&mut page, next);
                state
                    .file
                    .write_all_at(&page.serialize(), pid.0 * PAGE_SIZE as u64)?;
            }
            state.header.free_list_head = chain[0];
        }

        state.file.write_all_at(&state.header.serialize(), 0)?;
        state.file.sync_all()?;
        state.closed = true;
        debug!(free_pages = ids.len(), "closed data file");
        Ok(())
    }

    pub fn total_pages(&self) -> u64 {
        self.state.read().header.total_pages
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn stats(&self) -> PageManagerStats {
        let state = self.state.read();
        PageManagerStats {
            total_pages: state.header.total_pages,
            free_pages: self.free_list.len(),
        }
    }

    pub fn dn_index_root(&self) -> PageId {
        self.state.read().header.dn_index_root
    }

    pub fn set_dn_index_root(&self, root: PageId) -> DbResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        state.header.dn_index_root = root;
        Ok(())
    }

    pub fn data_root(&self) -> PageId {
        self.state.read().header.data_root
    }

    pub fn set_data_root(&self, root: PageId) -> DbResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        state.header.data_root = root;
        Ok(())
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    fn check_open(&self, state: &State) -> DbResult<()> {
        if state.closed {
            return Err(DbError::FileClosed);
        }
        Ok(())
    }

    fn check_writable(&self, state: &State) -> DbResult<()> {
        self.check_open(state)?;
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        Ok(())
    }
}
