//! Isolated on-disk contexts for engine and storage tests.

use common::EngineOptions;
use engine::ObaDb;
use std::path::{Path, PathBuf};
use storage::{PageManager, PageManagerOptions};
use tempfile::TempDir;

/// A temporary database directory that is removed on drop.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
///
/// let ctx = DbContext::new();
/// let db = ctx.open();
/// db.close().unwrap();
/// ```
pub struct DbContext {
    dir: TempDir,
}

impl DbContext {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Engine options pointing at this context's directory.
    pub fn options(&self) -> EngineOptions {
        EngineOptions::builder()
            .data_dir(self.dir.path().to_path_buf())
            .initial_pages(8)
            .build()
    }

    /// Open (or reopen) the database in this directory.
    pub fn open(&self) -> ObaDb {
        ObaDb::open(self.options()).expect("open database")
    }

    /// Open a bare page manager over a file in this directory.
    pub fn open_pages(&self, initial_pages: u64) -> PageManager {
        PageManager::open(
            self.data_file(),
            PageManagerOptions {
                initial_pages,
                ..Default::default()
            },
        )
        .expect("open page manager")
    }

    pub fn data_file(&self) -> PathBuf {
        self.dir.path().join("data.oba")
    }

    pub fn wal_file(&self) -> PathBuf {
        self.dir.path().join("wal.oba")
    }
}

impl Default for DbContext {
    fn default() -> Self {
        Self::new()
    }
}
