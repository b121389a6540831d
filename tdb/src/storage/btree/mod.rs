//! Copy-on-write B-tree stored in a page file.
//!
//! # Structure
//!
//! Every node occupies one 4KB page and holds up to `2t - 1` keys, where `t`
//! is the half-degree the node was created with. Internal nodes also hold
//! `keys + 1` child offsets. Each key carries a validity flag; a cleared flag
//! is a tombstone.
//!
//! Published pages are immutable. Writers copy the path they touch and swap
//! the root offset in the metadata page; readers snapshot the root once.
//!
//! # Usage
//!
//! ```
//! use tdb::config::TreeConfig;
//! use tdb::storage::btree::BTree;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let tree = BTree::create(&dir.path().join("db"), TreeConfig::default()).unwrap();
//!
//! for key in [10, 20, 30] {
//!     tree.insert(key, key as u64 * 2).unwrap();
//! }
//! tree.remove(20).unwrap();
//!
//! assert_eq!(tree.search(30).unwrap(), Some(60));
//! assert_eq!(tree.traverse().unwrap(), vec![10, 30]);
//! ```

mod node;
mod tree;

pub use node::{Entry, Located, MAX_HALF_DEGREE, MIN_HALF_DEGREE, Node, NodeError, capacity};
pub use tree::{BTree, BTreeError, PublishHook, TreeStats};
