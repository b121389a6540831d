//! B-tree node layout and structural primitives.
//!
//! A node occupies exactly one 4KB page:
//!
//! - `half_degree`: u16 (t; capacity is `2t - 1` keys)
//! - `leaf`: u16 (0 or 1)
//! - `key_count`: u16
//! - keys: `2t - 1` x i64
//! - validity flags: `2t - 1` x u8 (0 = tombstoned)
//! - values: `2t - 1` x u64
//! - child offsets: `2t` x u64
//! - bytes 4092-4095: CRC32 of everything before it
//!
//! Array sizes are fixed by the half-degree stored in the node, so a node's
//! capacity never changes after creation.
//!
//! Nodes are decoded into an owned [`Node`], mutated, and encoded again. The
//! primitives here never write to a page reachable from a published root:
//! every structural change lands in freshly appended pages, and the caller
//! publishes the new arm with a single root swap.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::btree::tree::BTreeError;
use crate::storage::page::{MappedPage, NULL_OFFSET, PageOffset};
use crate::storage::pager::Pager;

/// Smallest usable half-degree.
pub const MIN_HALF_DEGREE: u16 = 2;

/// Largest half-degree whose arrays and checksum fit in one page.
pub const MAX_HALF_DEGREE: u16 = 82;

/// Fixed header field offsets.
mod layout {
    use crate::storage::page::PAGE_SIZE;

    pub const HALF_DEGREE: usize = 0;
    pub const LEAF: usize = 2;
    pub const KEY_COUNT: usize = 4;
    pub const KEYS: usize = 6;
    pub const CHECKSUM: usize = PAGE_SIZE - 4;
}

const _: () = assert!(ArrayOffsets::new(MAX_HALF_DEGREE).end <= layout::CHECKSUM);
const _: () = assert!(ArrayOffsets::new(MAX_HALF_DEGREE + 1).end > layout::CHECKSUM);

/// Start of each per-key array for a given half-degree.
#[derive(Debug, Clone, Copy)]
struct ArrayOffsets {
    keys: usize,
    valid: usize,
    values: usize,
    children: usize,
    end: usize,
}

impl ArrayOffsets {
    const fn new(half_degree: u16) -> Self {
        let capacity = capacity(half_degree);
        let keys = layout::KEYS;
        let valid = keys + 8 * capacity;
        let values = valid + capacity;
        let children = values + 8 * capacity;
        let end = children + 8 * (capacity + 1);
        Self {
            keys,
            valid,
            values,
            children,
            end,
        }
    }
}

/// Maximum number of keys in a node of half-degree `t`.
#[must_use]
pub const fn capacity(half_degree: u16) -> usize {
    2 * half_degree as usize - 1
}

/// One key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub key: i64,
    pub value: u64,
    /// Cleared when the key is tombstoned.
    pub valid: bool,
}

impl Entry {
    /// A live entry.
    #[must_use]
    pub const fn new(key: i64, value: u64) -> Self {
        Self {
            key,
            value,
            valid: true,
        }
    }
}

/// A decoded B-tree node.
///
/// Invariants:
/// - `entries.len() <= capacity(half_degree)`
/// - `entries` are sorted by key with no repeats
/// - leaves have no children; internal nodes have `entries.len() + 1`
/// - every key in `children[i]` < `entries[i].key` < every key in `children[i + 1]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub half_degree: u16,
    pub leaf: bool,
    pub entries: Vec<Entry>,
    pub children: Vec<PageOffset>,
}

impl Node {
    /// Create a new empty leaf.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::new() is not const-stable
    pub fn new_leaf(half_degree: u16) -> Self {
        Self {
            half_degree,
            leaf: true,
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create a new internal node with no keys.
    ///
    /// The caller must push its first child before encoding.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new_internal(half_degree: u16) -> Self {
        Self {
            half_degree,
            leaf: false,
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Maximum number of keys this node can hold.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        capacity(self.half_degree)
    }

    /// Check if the node is at capacity.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity()
    }

    /// Index of `key`, or the index of the first key greater than it.
    pub fn find_index(&self, key: i64) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(&key))
    }

    /// Decode a node from a mapped page.
    pub fn from_page(page: &MappedPage) -> Result<Self, NodeError> {
        let half_degree = page.read_u16(layout::HALF_DEGREE);
        if !(MIN_HALF_DEGREE..=MAX_HALF_DEGREE).contains(&half_degree) {
            return Err(NodeError::InvalidHalfDegree(half_degree));
        }

        let leaf = match page.read_u16(layout::LEAF) {
            0 => false,
            1 => true,
            other => return Err(NodeError::InvalidLeafFlag(other)),
        };

        let key_count = page.read_u16(layout::KEY_COUNT) as usize;
        let capacity = capacity(half_degree);
        if key_count > capacity {
            return Err(NodeError::KeyCountOverflow {
                key_count,
                capacity,
            });
        }

        let stored = page.read_u32(layout::CHECKSUM);
        let actual = page.compute_checksum(layout::CHECKSUM);
        if stored != actual {
            return Err(NodeError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let arrays = ArrayOffsets::new(half_degree);
        let entries = (0..key_count)
            .map(|i| Entry {
                key: page.read_i64(arrays.keys + 8 * i),
                valid: page.read_u8(arrays.valid + i) != 0,
                value: page.read_u64(arrays.values + 8 * i),
            })
            .collect();

        let children = if leaf {
            Vec::new()
        } else {
            (0..=key_count)
                .map(|i| page.read_u64(arrays.children + 8 * i))
                .collect()
        };

        Ok(Self {
            half_degree,
            leaf,
            entries,
            children,
        })
    }

    /// Encode the node into a mapped page, replacing its previous contents.
    pub fn write_to_page(&self, page: &mut MappedPage) {
        debug_assert!(self.entries.len() <= self.capacity());
        debug_assert!(self.leaf || self.children.len() == self.entries.len() + 1);

        page.as_bytes_mut().fill(0);
        page.write_u16(layout::HALF_DEGREE, self.half_degree);
        page.write_u16(layout::LEAF, u16::from(self.leaf));
        page.write_u16(layout::KEY_COUNT, self.entries.len() as u16);

        let arrays = ArrayOffsets::new(self.half_degree);
        for (i, entry) in self.entries.iter().enumerate() {
            page.write_i64(arrays.keys + 8 * i, entry.key);
            page.write_u8(arrays.valid + i, u8::from(entry.valid));
            page.write_u64(arrays.values + 8 * i, entry.value);
        }
        for (i, &child) in self.children.iter().enumerate() {
            page.write_u64(arrays.children + 8 * i, child);
        }

        let checksum = page.compute_checksum(layout::CHECKSUM);
        page.write_u32(layout::CHECKSUM, checksum);
    }

    /// Read the node stored at `ofs`.
    ///
    /// Offset 0 is the metadata page and never a node.
    pub fn read(pager: &Pager, ofs: PageOffset) -> Result<Self, BTreeError> {
        if ofs == NULL_OFFSET {
            return Err(NodeError::ReservedOffset.into());
        }
        let page = pager.map_page_from(ofs)?;
        Ok(Self::from_page(&page)?)
    }

    /// Write the node to the page at `ofs`.
    ///
    /// Only valid for pages that no published root can reach.
    pub fn write(&self, pager: &Pager, ofs: PageOffset) -> Result<(), BTreeError> {
        if ofs == NULL_OFFSET {
            return Err(NodeError::ReservedOffset.into());
        }
        let mut page = pager.map_page_from(ofs)?;
        self.write_to_page(&mut page);
        Ok(())
    }

    /// Write the node to a freshly appended page and return its offset.
    pub fn append(&self, pager: &Pager) -> Result<PageOffset, BTreeError> {
        let ofs = pager.append_page()?;
        self.write(pager, ofs)?;
        Ok(ofs)
    }

    /// Split a full node around its median.
    ///
    /// `self` keeps the lower `t - 1` entries (and `t` children); the upper
    /// half is returned as a new node together with the median entry.
    #[must_use]
    pub fn split(&mut self) -> (Entry, Self) {
        let t = self.half_degree as usize;
        debug_assert!(self.entries.len() == 2 * t - 1);

        let median = self.entries[t - 1];
        let right_entries: Vec<Entry> = self.entries.drain(t..).collect();
        let right_children: Vec<PageOffset> = if self.leaf {
            Vec::new()
        } else {
            self.children.drain(t..).collect()
        };
        self.entries.truncate(t - 1);

        let right = Self {
            half_degree: self.half_degree,
            leaf: self.leaf,
            entries: right_entries,
            children: right_children,
        };

        (median, right)
    }
}

/// Where a key was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// Offset of the node holding the key.
    pub ofs: PageOffset,
    /// Index of the key within that node.
    pub index: usize,
    /// The entry as stored (may be tombstoned).
    pub entry: Entry,
    /// Offset of the node's parent, `None` for the root.
    pub parent: Option<PageOffset>,
}

/// Split the full child at `parent.children[i]`.
///
/// Both halves go to newly appended pages, so the original child page is left
/// untouched. The median moves into `parent` at index `i` and the parent's
/// child slots `i` and `i + 1` point at the two halves. The parent itself is
/// only modified in memory; the caller writes it. Returns the decoded halves.
pub fn split_child(pager: &Pager, parent: &mut Node, i: usize) -> Result<(Node, Node), BTreeError> {
    let mut left = Node::read(pager, parent.children[i])?;
    if !left.is_full() {
        return Err(BTreeError::Corrupted(format!(
            "split of non-full child at {}",
            parent.children[i]
        )));
    }

    let (median, right) = left.split();
    let left_ofs = left.append(pager)?;
    let right_ofs = right.append(pager)?;

    parent.entries.insert(i, median);
    parent.children[i] = left_ofs;
    parent.children.insert(i + 1, right_ofs);

    Ok((left, right))
}

/// Insert into the subtree rooted at the private node `node` (stored at `ofs`).
///
/// Descends toward the leaf, splitting any full child before entering it, so
/// no node on the way down is ever over capacity. Each child entered is first
/// copied to a new page (or is already new from a split) and the parent is
/// rewritten to point at the copy. The key must not already be present.
pub fn insert_non_full(
    pager: &Pager,
    ofs: PageOffset,
    node: Node,
    key: i64,
    value: u64,
) -> Result<(), BTreeError> {
    let mut ofs = ofs;
    let mut node = node;

    loop {
        let idx = match node.find_index(key) {
            Ok(_) => return Err(BTreeError::DuplicateKey(key)),
            Err(idx) => idx,
        };

        if node.leaf {
            node.entries.insert(idx, Entry::new(key, value));
            return node.write(pager, ofs);
        }

        let child = Node::read(pager, node.children[idx])?;
        let (next_ofs, next) = if child.is_full() {
            let (left, right) = split_child(pager, &mut node, idx)?;
            match key.cmp(&node.entries[idx].key) {
                Ordering::Less => (node.children[idx], left),
                Ordering::Greater => (node.children[idx + 1], right),
                Ordering::Equal => return Err(BTreeError::DuplicateKey(key)),
            }
        } else {
            let copy_ofs = child.append(pager)?;
            node.children[idx] = copy_ofs;
            (copy_ofs, child)
        };

        node.write(pager, ofs)?;
        ofs = next_ofs;
        node = next;
    }
}

/// Find the first key >= `key` along the search path from `root`.
///
/// Returns the owning node, index and parent when the key is present
/// (tombstoned or not), `None` when the search ends in a leaf.
pub fn search(pager: &Pager, root: PageOffset, key: i64) -> Result<Option<Located>, BTreeError> {
    let mut ofs = root;
    let mut parent = None;

    loop {
        let node = Node::read(pager, ofs)?;
        match node.find_index(key) {
            Ok(index) => {
                return Ok(Some(Located {
                    ofs,
                    index,
                    entry: node.entries[index],
                    parent,
                }));
            }
            Err(_) if node.leaf => return Ok(None),
            Err(i) => {
                parent = Some(ofs);
                ofs = node.children[i];
            }
        }
    }
}

/// In-order walk over every entry, tombstones included.
pub fn traverse<F>(pager: &Pager, ofs: PageOffset, visit: &mut F) -> Result<(), BTreeError>
where
    F: FnMut(&Entry),
{
    let node = Node::read(pager, ofs)?;
    for (i, entry) in node.entries.iter().enumerate() {
        if !node.leaf {
            traverse(pager, node.children[i], visit)?;
        }
        visit(entry);
    }
    if let Some(&last) = node.children.last() {
        traverse(pager, last, visit)?;
    }
    Ok(())
}

/// Copy the path from `ofs` down to the node holding `key`, apply `update` to
/// the entry in the copy, and return the offset of the copied subtree root.
///
/// Returns `None` (and allocates nothing) if the key isn't present.
pub fn rewrite_entry<F>(
    pager: &Pager,
    ofs: PageOffset,
    key: i64,
    update: F,
) -> Result<Option<PageOffset>, BTreeError>
where
    F: FnOnce(&mut Entry),
{
    let mut node = Node::read(pager, ofs)?;
    match node.find_index(key) {
        Ok(i) => {
            update(&mut node.entries[i]);
            Ok(Some(node.append(pager)?))
        }
        Err(_) if node.leaf => Ok(None),
        Err(i) => match rewrite_entry(pager, node.children[i], key, update)? {
            Some(child) => {
                node.children[i] = child;
                Ok(Some(node.append(pager)?))
            }
            None => Ok(None),
        },
    }
}

/// Remove `key` from the subtree at `ofs` by copying.
///
/// The node holding the key is rewritten without it. For a leaf the entry is
/// simply dropped. For an internal node the entry is replaced by the largest
/// entry of its left subtree; if that subtree holds no entries at all, the key
/// and the empty left child are dropped together. Ancestors are copied to
/// point at the new pages. No merging or rebalancing happens.
///
/// Returns the new subtree root and the removed entry, or `None` if absent.
pub fn remove_structural(
    pager: &Pager,
    ofs: PageOffset,
    key: i64,
) -> Result<Option<(PageOffset, Entry)>, BTreeError> {
    let mut node = Node::read(pager, ofs)?;
    match node.find_index(key) {
        Ok(i) => {
            let removed = node.entries[i];
            if node.leaf {
                node.entries.remove(i);
            } else if let Some((child, predecessor)) = pop_max(pager, node.children[i])? {
                node.entries[i] = predecessor;
                node.children[i] = child;
            } else {
                node.entries.remove(i);
                node.children.remove(i);
            }
            Ok(Some((node.append(pager)?, removed)))
        }
        Err(_) if node.leaf => Ok(None),
        Err(i) => match remove_structural(pager, node.children[i], key)? {
            Some((child, removed)) => {
                node.children[i] = child;
                Ok(Some((node.append(pager)?, removed)))
            }
            None => Ok(None),
        },
    }
}

/// Remove the largest entry of the subtree at `ofs` by copying.
///
/// Returns `None` if the subtree holds no entries.
fn pop_max(pager: &Pager, ofs: PageOffset) -> Result<Option<(PageOffset, Entry)>, BTreeError> {
    let mut node = Node::read(pager, ofs)?;

    if node.leaf {
        let Some(max) = node.entries.pop() else {
            return Ok(None);
        };
        return Ok(Some((node.append(pager)?, max)));
    }

    let last = node.children.len() - 1;
    if let Some((child, max)) = pop_max(pager, node.children[last])? {
        node.children[last] = child;
        return Ok(Some((node.append(pager)?, max)));
    }

    // Rightmost subtree is empty: the last key is the maximum, and the empty
    // child goes with it.
    let Some(max) = node.entries.pop() else {
        return Ok(None);
    };
    node.children.pop();
    Ok(Some((node.append(pager)?, max)))
}

/// Errors that can occur when working with B-tree nodes.
#[derive(Debug)]
pub enum NodeError {
    /// Offset 0 is the metadata page and never a node.
    ReservedOffset,
    /// Half-degree outside the supported range.
    InvalidHalfDegree(u16),
    /// Leaf flag is neither 0 nor 1.
    InvalidLeafFlag(u16),
    /// More keys than the node's capacity.
    KeyCountOverflow { key_count: usize, capacity: usize },
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReservedOffset => write!(f, "offset 0 is reserved for metadata"),
            Self::InvalidHalfDegree(t) => write!(
                f,
                "invalid half-degree {t} (must be {MIN_HALF_DEGREE}-{MAX_HALF_DEGREE})"
            ),
            Self::InvalidLeafFlag(v) => write!(f, "invalid leaf flag: {v}"),
            Self::KeyCountOverflow {
                key_count,
                capacity,
            } => write!(f, "key count {key_count} exceeds capacity {capacity}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64};
    use tempfile::{TempDir, tempdir};

    fn test_pager() -> (TempDir, Pager) {
        let dir = tempdir().expect("create temp dir");
        let pager = Pager::create(&dir.path().join("test.db")).expect("create pager");
        (dir, pager)
    }

    fn leaf_with(half_degree: u16, keys: &[i64]) -> Node {
        let mut node = Node::new_leaf(half_degree);
        node.entries = keys.iter().map(|&k| Entry::new(k, k.unsigned_abs() * 10)).collect();
        node
    }

    #[test]
    fn test_layout_limits() {
        assert_eq!(capacity(4), 7);
        assert_eq!(ArrayOffsets::new(MAX_HALF_DEGREE).end, 50 * 82 - 11);
        assert!(ArrayOffsets::new(MAX_HALF_DEGREE).end <= PAGE_SIZE - 4);
    }

    #[test]
    fn test_leaf_node_roundtrip() {
        let (_dir, pager) = test_pager();
        let mut node = leaf_with(4, &[-5, 1, 9]);
        node.entries[1].valid = false;

        let ofs = node.append(&pager).expect("append");
        let restored = Node::read(&pager, ofs).expect("read");

        assert_eq!(restored, node);
        assert!(!restored.entries[1].valid);
        assert_eq!(restored.entries[2].value, 90);
    }

    #[test]
    fn test_internal_node_roundtrip() {
        let (_dir, pager) = test_pager();
        let mut node = Node::new_internal(MAX_HALF_DEGREE);
        node.entries = vec![Entry::new(10, 1), Entry::new(20, 2), Entry::new(30, 3)];
        node.children = vec![4096, 8192, 12288, 16384];

        let ofs = node.append(&pager).expect("append");
        let restored = Node::read(&pager, ofs).expect("read");

        assert_eq!(restored.children, vec![4096, 8192, 12288, 16384]);
        assert_eq!(restored, node);
    }

    #[test]
    fn test_read_reserved_offset() {
        let (_dir, pager) = test_pager();
        let result = Node::read(&pager, 0);
        assert!(matches!(
            result,
            Err(BTreeError::Node(NodeError::ReservedOffset))
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let (_dir, pager) = test_pager();
        let ofs = leaf_with(4, &[1, 2, 3]).append(&pager).expect("append");

        let mut page = pager.map_page_from(ofs).expect("map");
        let key = page.read_i64(layout::KEYS);
        page.write_i64(layout::KEYS, key + 1);
        drop(page);

        let result = Node::read(&pager, ofs);
        assert!(matches!(
            result,
            Err(BTreeError::Node(NodeError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_zeroed_page_is_not_a_node() {
        let (_dir, pager) = test_pager();
        let ofs = pager.append_page().expect("append");
        let result = Node::read(&pager, ofs);
        assert!(matches!(
            result,
            Err(BTreeError::Node(NodeError::InvalidHalfDegree(0)))
        ));
    }

    #[test]
    fn test_find_index() {
        let node = leaf_with(4, &[10, 20, 30]);
        assert_eq!(node.find_index(5), Err(0));
        assert_eq!(node.find_index(10), Ok(0));
        assert_eq!(node.find_index(25), Err(2));
        assert_eq!(node.find_index(35), Err(3));
    }

    #[test]
    fn test_split_leaf() {
        let mut node = leaf_with(3, &[1, 2, 3, 4, 5]);
        let (median, right) = node.split();

        assert_eq!(median.key, 3);
        assert_eq!(node.entries.iter().map(|e| e.key).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(right.entries.iter().map(|e| e.key).collect::<Vec<_>>(), [4, 5]);
        assert!(right.leaf);
    }

    #[test]
    fn test_split_internal() {
        let mut node = Node::new_internal(2);
        node.entries = vec![Entry::new(10, 0), Entry::new(20, 0), Entry::new(30, 0)];
        node.children = vec![1, 2, 3, 4].into_iter().map(|p| p * PAGE_SIZE_U64).collect();

        let (median, right) = node.split();

        assert_eq!(median.key, 20);
        assert_eq!(node.children, vec![4096, 8192]);
        assert_eq!(right.children, vec![12288, 16384]);
        assert_eq!(right.entries.len(), 1);
    }

    #[test]
    fn test_split_child_leaves_original_untouched() {
        let (_dir, pager) = test_pager();
        let child = leaf_with(2, &[1, 2, 3]);
        let child_ofs = child.append(&pager).expect("append");

        let mut parent = Node::new_internal(2);
        parent.children.push(child_ofs);

        let (left, right) = split_child(&pager, &mut parent, 0).expect("split");

        assert_eq!(parent.entries.len(), 1);
        assert_eq!(parent.entries[0].key, 2);
        assert_eq!(parent.children.len(), 2);
        assert_ne!(parent.children[0], child_ofs);
        assert_eq!(left.entries[0].key, 1);
        assert_eq!(right.entries[0].key, 3);
        assert_eq!(Node::read(&pager, child_ofs).expect("read"), child);
        assert_eq!(Node::read(&pager, parent.children[1]).expect("read"), right);
    }

    #[test]
    fn test_insert_non_full_and_search() {
        let (_dir, pager) = test_pager();
        let root = leaf_with(2, &[10, 20]);
        let ofs = pager.append_page().expect("append");

        insert_non_full(&pager, ofs, root, 15, 150).expect("insert");

        let found = search(&pager, ofs, 15).expect("search").expect("present");
        assert_eq!(found.ofs, ofs);
        assert_eq!(found.index, 1);
        assert_eq!(found.entry.value, 150);
        assert_eq!(found.parent, None);
        assert!(search(&pager, ofs, 16).expect("search").is_none());
    }

    #[test]
    fn test_insert_non_full_rejects_duplicate() {
        let (_dir, pager) = test_pager();
        let ofs = pager.append_page().expect("append");
        let result = insert_non_full(&pager, ofs, leaf_with(2, &[10]), 10, 1);
        assert!(matches!(result, Err(BTreeError::DuplicateKey(10))));
    }

    #[test]
    fn test_remove_structural_from_leaf() {
        let (_dir, pager) = test_pager();
        let ofs = leaf_with(3, &[1, 2, 3]).append(&pager).expect("append");

        let (new_ofs, removed) = remove_structural(&pager, ofs, 2)
            .expect("remove")
            .expect("present");

        assert_eq!(removed.key, 2);
        assert_ne!(new_ofs, ofs);
        let copy = Node::read(&pager, new_ofs).expect("read");
        assert_eq!(copy.entries.iter().map(|e| e.key).collect::<Vec<_>>(), [1, 3]);
        // Original page still holds all keys
        assert_eq!(Node::read(&pager, ofs).expect("read").entries.len(), 3);
        assert!(remove_structural(&pager, ofs, 7).expect("remove").is_none());
    }

    #[test]
    fn test_remove_structural_internal_uses_predecessor() {
        let (_dir, pager) = test_pager();
        let left = leaf_with(2, &[1, 2]).append(&pager).expect("append");
        let right = leaf_with(2, &[5, 6]).append(&pager).expect("append");
        let mut root = Node::new_internal(2);
        root.entries = vec![Entry::new(4, 40)];
        root.children = vec![left, right];
        let root_ofs = root.append(&pager).expect("append");

        let (new_root, removed) = remove_structural(&pager, root_ofs, 4)
            .expect("remove")
            .expect("present");
        assert_eq!(removed.value, 40);

        let mut keys = Vec::new();
        traverse(&pager, new_root, &mut |e: &Entry| keys.push(e.key)).expect("traverse");
        assert_eq!(keys, vec![1, 2, 5, 6]);

        let copy = Node::read(&pager, new_root).expect("read");
        assert_eq!(copy.entries[0].key, 2);
    }

    #[test]
    fn test_remove_structural_drops_empty_left_child() {
        let (_dir, pager) = test_pager();
        let left = leaf_with(2, &[]).append(&pager).expect("append");
        let right = leaf_with(2, &[5]).append(&pager).expect("append");
        let mut root = Node::new_internal(2);
        root.entries = vec![Entry::new(4, 40)];
        root.children = vec![left, right];
        let root_ofs = root.append(&pager).expect("append");

        let (new_root, _) = remove_structural(&pager, root_ofs, 4)
            .expect("remove")
            .expect("present");

        let copy = Node::read(&pager, new_root).expect("read");
        assert!(copy.entries.is_empty());
        assert_eq!(copy.children, vec![right]);
    }

    #[test]
    fn test_rewrite_entry_copies_path() {
        let (_dir, pager) = test_pager();
        let left = leaf_with(2, &[1, 2]).append(&pager).expect("append");
        let right = leaf_with(2, &[5, 6]).append(&pager).expect("append");
        let mut root = Node::new_internal(2);
        root.entries = vec![Entry::new(4, 40)];
        root.children = vec![left, right];
        let root_ofs = root.append(&pager).expect("append");

        let new_root = rewrite_entry(&pager, root_ofs, 6, |e| e.valid = false)
            .expect("rewrite")
            .expect("present");

        let copy = Node::read(&pager, new_root).expect("read");
        assert_eq!(copy.children[0], left);
        assert_ne!(copy.children[1], right);
        let found = search(&pager, new_root, 6).expect("search").expect("present");
        assert!(!found.entry.valid);
        assert_eq!(found.parent, Some(new_root));
        // Old arm unchanged
        let old = search(&pager, root_ofs, 6).expect("search").expect("present");
        assert!(old.entry.valid);

        assert!(rewrite_entry(&pager, root_ofs, 3, |e| e.valid = false)
            .expect("rewrite")
            .is_none());
    }
}
