use tempfile::TempDir;

use crate::config::TreeConfig;
use crate::storage::btree::BTree;

/// Create a fresh tree in its own temporary directory.
///
/// The directory is removed when the returned `TempDir` is dropped, so keep
/// it alive for as long as the tree is used.
pub fn new_test_tree(config: TreeConfig) -> (TempDir, BTree) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let tree = BTree::create(&dir.path().join("test.db"), config).expect("create tree");
    (dir, tree)
}

/// Value stored for `key` by the helpers below.
pub const fn value_for(key: i64) -> u64 {
    key.unsigned_abs() + 100
}

/// Insert every key with [`value_for`] as its value.
pub fn insert_all(tree: &BTree, keys: &[i64]) {
    for &key in keys {
        tree.insert(key, value_for(key))
            .unwrap_or_else(|e| panic!("insert {key}: {e}"));
    }
}

/// Assert every key is found with the value [`insert_all`] gave it.
pub fn assert_all_present(tree: &BTree, keys: &[i64]) {
    for &key in keys {
        assert_eq!(
            tree.search(key).expect("search"),
            Some(value_for(key)),
            "key {key}"
        );
    }
}
