//! Single-file page store.
//!
//! # File Format
//!
//! The file is a sequence of 4KB pages:
//!
//! - Page 0: metadata (page count, root offset, magic, format version)
//! - Pages 1-N: B-tree nodes, appended and never rewritten once published
//!
//! There is no free list. Pages abandoned by copy-on-write stay allocated
//! until the tree is compacted into a new file.

pub mod btree;
pub mod page;
pub mod pager;

pub use btree::{BTree, BTreeError, TreeStats};
pub use page::{MappedPage, NULL_OFFSET, PAGE_SIZE, PageOffset};
pub use pager::{Pager, PagerError};
