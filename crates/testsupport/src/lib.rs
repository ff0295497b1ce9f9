//! Test support utilities for the ObaDB workspace.
//!
//! Provides isolated on-disk fixtures, directory-entry builders, and
//! property-based generators for core types.
//!
//! # Example Usage
//!
//! ```no_run
//! use testsupport::prelude::*;
//!
//! let ctx = DbContext::new();
//! let db = ctx.open();
//! db.add_entry(&person("alice")).unwrap();
//! db.close().unwrap();
//! ```

pub mod context;
pub mod fixtures;
pub mod proptest_generators;

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::context::*;
    pub use crate::fixtures::*;
}
