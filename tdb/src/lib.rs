#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in library code; a corrupt page must surface as an error.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

// Layout:
//  - storage::page    mapped 4KB page views and byte accessors
//  - storage::pager   file growth, page mapping, metadata root CAS
//  - storage::btree   node encoding and the copy-on-write tree
//  - config           tree parameters from the environment

pub mod config;
pub mod storage;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, DeleteStrategy, TreeConfig};
pub use storage::btree::{BTree, BTreeError, TreeStats};
