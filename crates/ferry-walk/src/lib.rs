//! Source expansion for ferry operations.
//!
//! Operations never transfer directories as a unit. Every requested root is
//! expanded by a [`FileWalker`] into a flat, depth-first list of entries, and
//! the engine transfers that list one entry at a time.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ferry_core::{LocalFs, WalkConfig};
//! use ferry_walk::FileWalker;
//!
//! let walker = FileWalker::new(Arc::new(LocalFs), WalkConfig::default()).unwrap();
//! for entry in walker.walk(["/path/to/dir"]).flatten() {
//!     println!("{} ({} bytes)", entry.path.display(), entry.size);
//! }
//! ```

mod prune;
mod walker;

pub use prune::prune_empty_dirs;
pub use walker::{Expansion, FileWalker, Walk, WalkError};
