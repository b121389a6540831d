//! B-tree over a page file with copy-on-write writes.
//!
//! Keys are i64, values u64. All durable state lives in pages; the only
//! mutable shared word is the root offset in the metadata page.
//!
//! Every write follows the same protocol:
//!
//! 1. Snapshot the root offset.
//! 2. Build a new arm: copy each node on the root-to-target path into fresh
//!    pages and apply the change there. Untouched siblings are shared.
//! 3. Swap the root from the snapshot to the new arm's root.
//! 4. If the swap loses (another writer published first), drop the arm as
//!    garbage and start over from step 1.
//!
//! Published pages are never written, so readers that snapshot the root once
//! see a consistent tree for as long as they hold the snapshot.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::{ConfigError, DeleteStrategy, TreeConfig};
use crate::storage::btree::node::{self, Entry, Node, NodeError};
use crate::storage::page::{NULL_OFFSET, PageOffset};
use crate::storage::pager::{Pager, PagerError};

/// Cap on the backoff exponent; waits never exceed ~1ms.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Callback run after a new arm is built and before its root swap.
pub type PublishHook = Arc<dyn Fn() + Send + Sync>;

/// Result of building one write attempt.
enum Outcome<T> {
    /// Swap the root to this offset, then return the value.
    Publish(PageOffset, T),
    /// Nothing to publish.
    Unchanged(T),
}

/// Structural summary produced by [`BTree::validate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Nodes reachable from the root.
    pub nodes: u64,
    /// Leaves reachable from the root.
    pub leaves: u64,
    /// Longest root-to-leaf path, counted in nodes.
    pub height: u32,
    /// Shortest root-to-leaf path, counted in nodes.
    pub min_leaf_depth: u32,
    /// Entries with the validity flag set.
    pub live_entries: u64,
    /// Entries with the validity flag cleared.
    pub tombstones: u64,
    /// Pages allocated in the file, excluding the metadata page.
    pub allocated_pages: u64,
    /// Allocated pages not reachable from the root (abandoned arms and
    /// superseded copies).
    pub unreachable_pages: u64,
}

/// A handle on a B-tree stored in a page file.
///
/// Handles are cheap to clone and safe to share between threads; every
/// clone talks to the same pager.
#[derive(Clone)]
pub struct BTree {
    pager: Arc<Pager>,
    config: TreeConfig,
    before_publish: Option<PublishHook>,
}

impl BTree {
    /// Create a new, empty tree in a new file.
    pub fn create(path: &Path, config: TreeConfig) -> Result<Self, BTreeError> {
        config.validate()?;
        let pager = Pager::create(path)?;
        Ok(Self::from_pager(Arc::new(pager), config))
    }

    /// Open the tree stored in an existing file.
    ///
    /// `config.half_degree` only applies to nodes created from now on;
    /// existing nodes keep the capacity they were created with.
    pub fn open(path: &Path, config: TreeConfig) -> Result<Self, BTreeError> {
        config.validate()?;
        let pager = Pager::open(path)?;
        Ok(Self::from_pager(Arc::new(pager), config))
    }

    /// Wrap an already-open pager.
    #[must_use]
    pub const fn from_pager(pager: Arc<Pager>, config: TreeConfig) -> Self {
        Self {
            pager,
            config,
            before_publish: None,
        }
    }

    /// Install a hook that runs between building an arm and swapping it in.
    #[must_use]
    pub fn with_before_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_publish = Some(Arc::new(hook));
        self
    }

    /// The underlying pager.
    #[must_use]
    pub const fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// The configuration this handle writes with.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Current root offset (0 for an empty tree).
    #[must_use]
    pub fn root_ofs(&self) -> PageOffset {
        self.pager.root_ofs()
    }

    /// Flush all pages to durable storage.
    pub fn sync(&self) -> Result<(), BTreeError> {
        Ok(self.pager.sync()?)
    }

    /// Insert a new key.
    ///
    /// Fails with [`BTreeError::DuplicateKey`] if the key is already present
    /// and valid; the tree is left unchanged and no pages are allocated. A
    /// tombstoned key is revived with the new value.
    pub fn insert(&self, key: i64, value: u64) -> Result<(), BTreeError> {
        self.commit("insert", |snapshot| {
            if snapshot == NULL_OFFSET {
                let mut leaf = Node::new_leaf(self.config.half_degree);
                leaf.entries.push(Entry::new(key, value));
                return Ok(Outcome::Publish(leaf.append(&self.pager)?, ()));
            }

            match node::search(&self.pager, snapshot, key)? {
                Some(found) if found.entry.valid => Err(BTreeError::DuplicateKey(key)),
                Some(_) => {
                    let root = node::rewrite_entry(&self.pager, snapshot, key, |entry| {
                        entry.valid = true;
                        entry.value = value;
                    })?
                    .ok_or_else(|| vanished(key))?;
                    Ok(Outcome::Publish(root, ()))
                }
                None => Ok(Outcome::Publish(self.insert_arm(snapshot, key, value)?, ())),
            }
        })
    }

    /// Build the arm for inserting an absent key under `snapshot`.
    fn insert_arm(&self, snapshot: PageOffset, key: i64, value: u64) -> Result<PageOffset, BTreeError> {
        let root = Node::read(&self.pager, snapshot)?;

        if !root.is_full() {
            let ofs = self.pager.append_page()?;
            node::insert_non_full(&self.pager, ofs, root, key, value)?;
            return Ok(ofs);
        }

        // Full root: grow a level. The old root becomes the new root's only
        // child and is split straight away.
        let mut new_root = Node::new_internal(self.config.half_degree);
        new_root.children.push(snapshot);
        let (left, right) = node::split_child(&self.pager, &mut new_root, 0)?;

        let (target_ofs, target) = match key.cmp(&new_root.entries[0].key) {
            Ordering::Less => (new_root.children[0], left),
            Ordering::Greater => (new_root.children[1], right),
            Ordering::Equal => return Err(BTreeError::DuplicateKey(key)),
        };

        let new_root_ofs = new_root.append(&self.pager)?;
        node::insert_non_full(&self.pager, target_ofs, target, key, value)?;
        Ok(new_root_ofs)
    }

    /// Look up a key.
    ///
    /// Returns [`BTreeError::EmptyTree`] if nothing was ever inserted, and
    /// `Ok(None)` if the key is absent or tombstoned.
    pub fn search(&self, key: i64) -> Result<Option<u64>, BTreeError> {
        let root = self.pager.root_ofs();
        if root == NULL_OFFSET {
            return Err(BTreeError::EmptyTree);
        }

        Ok(node::search(&self.pager, root, key)?
            .filter(|found| found.entry.valid)
            .map(|found| found.entry.value))
    }

    /// Like [`search`](Self::search), but an empty tree is just "not found".
    pub fn get(&self, key: i64) -> Result<Option<u64>, BTreeError> {
        match self.search(key) {
            Err(BTreeError::EmptyTree) => Ok(None),
            other => other,
        }
    }

    /// Remove a key, returning its value if it was present.
    ///
    /// Uses the configured [`DeleteStrategy`]. Removing an absent key is a
    /// no-op that publishes nothing.
    pub fn remove(&self, key: i64) -> Result<Option<u64>, BTreeError> {
        let strategy = self.config.delete_strategy;

        self.commit("remove", |snapshot| {
            if snapshot == NULL_OFFSET {
                return Err(BTreeError::EmptyTree);
            }

            let value = match node::search(&self.pager, snapshot, key)? {
                Some(found) if found.entry.valid => found.entry.value,
                _ => return Ok(Outcome::Unchanged(None)),
            };

            let root = match strategy {
                DeleteStrategy::Tombstone => {
                    node::rewrite_entry(&self.pager, snapshot, key, |entry| entry.valid = false)?
                        .ok_or_else(|| vanished(key))?
                }
                DeleteStrategy::StructuralCopy => {
                    let (root, _) = node::remove_structural(&self.pager, snapshot, key)?
                        .ok_or_else(|| vanished(key))?;
                    self.collapse_root(root)?
                }
            };

            Ok(Outcome::Publish(root, Some(value)))
        })
    }

    /// Skip internal roots that have no keys left, so the tree loses a level
    /// instead of keeping a chain of single-child nodes.
    fn collapse_root(&self, mut root: PageOffset) -> Result<PageOffset, BTreeError> {
        loop {
            let node = Node::read(&self.pager, root)?;
            if node.leaf || !node.entries.is_empty() {
                return Ok(root);
            }
            root = node.children[0];
        }
    }

    /// Run one write through the snapshot / build / swap / retry loop.
    fn commit<T, F>(&self, op: &'static str, mut build: F) -> Result<T, BTreeError>
    where
        F: FnMut(PageOffset) -> Result<Outcome<T>, BTreeError>,
    {
        let mut rng = rand::rng();
        let attempts = self.config.max_cas_retries;

        for attempt in 0..attempts {
            let snapshot = self.pager.root_ofs();
            let (new_root, result) = match build(snapshot)? {
                Outcome::Unchanged(result) => return Ok(result),
                Outcome::Publish(new_root, result) => (new_root, result),
            };

            if let Some(hook) = &self.before_publish {
                hook();
            }

            if self.pager.set_root_ofs(snapshot, new_root) {
                tracing::debug!("{op}: published root {new_root} (attempt {attempt})");
                return Ok(result);
            }

            tracing::debug!("{op}: root moved from {snapshot}, discarding arm (attempt {attempt})");
            let ceiling = 1u64 << attempt.min(MAX_BACKOFF_SHIFT);
            std::thread::sleep(Duration::from_micros(rng.random_range(0..=ceiling)));
        }

        tracing::warn!("{op}: gave up after {attempts} lost root swaps");
        Err(BTreeError::RetriesExhausted { attempts })
    }

    /// Valid keys in ascending order.
    pub fn traverse(&self) -> Result<Vec<i64>, BTreeError> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    /// Valid `(key, value)` pairs in ascending key order.
    pub fn entries(&self) -> Result<Vec<(i64, u64)>, BTreeError> {
        let root = self.pager.root_ofs();
        if root == NULL_OFFSET {
            return Err(BTreeError::EmptyTree);
        }

        let mut out = Vec::new();
        node::traverse(&self.pager, root, &mut |entry: &Entry| {
            if entry.valid {
                out.push((entry.key, entry.value));
            }
        })?;
        Ok(out)
    }

    /// Render the current structure as a Graphviz digraph.
    ///
    /// Each node is labelled with its keys (tombstones prefixed with `~`) and
    /// its page offset.
    pub fn to_dot(&self) -> Result<String, BTreeError> {
        let mut dot = String::from("digraph G {\n");
        let root = self.pager.root_ofs();
        if root != NULL_OFFSET {
            self.dot_subtree(root, &mut dot)?;
        }
        dot.push_str("}\n");
        Ok(dot)
    }

    fn dot_subtree(&self, ofs: PageOffset, dot: &mut String) -> Result<(), BTreeError> {
        let node = Node::read(&self.pager, ofs)?;

        let mut label = String::new();
        for entry in &node.entries {
            if !entry.valid {
                label.push('~');
            }
            label.push_str(&entry.key.to_string());
            label.push(' ');
        }
        dot.push_str(&format!("  n{ofs} [label=\"{label}ofs={ofs}\"]\n"));

        for &child in &node.children {
            dot.push_str(&format!("  n{ofs} -> n{child}\n"));
            self.dot_subtree(child, dot)?;
        }
        Ok(())
    }

    /// Write [`to_dot`](Self::to_dot) output to a file.
    pub fn export_graph(&self, path: &Path) -> Result<(), BTreeError> {
        let dot = self.to_dot()?;
        std::fs::write(path, dot).map_err(BTreeError::Io)
    }

    /// Check ordering, capacity and child-count invariants over the whole
    /// tree reachable from the current root.
    pub fn validate(&self) -> Result<TreeStats, BTreeError> {
        let root = self.pager.root_ofs();
        let mut stats = TreeStats {
            allocated_pages: u64::from(self.pager.page_count()) - 1,
            ..TreeStats::default()
        };

        if root != NULL_OFFSET {
            let mut seen = HashSet::new();
            stats.min_leaf_depth = u32::MAX;
            self.validate_subtree(root, None, None, 1, &mut seen, &mut stats)?;
        }

        stats.unreachable_pages = stats.allocated_pages.saturating_sub(stats.nodes);
        Ok(stats)
    }

    fn validate_subtree(
        &self,
        ofs: PageOffset,
        lower: Option<i64>,
        upper: Option<i64>,
        depth: u32,
        seen: &mut HashSet<PageOffset>,
        stats: &mut TreeStats,
    ) -> Result<(), BTreeError> {
        if !seen.insert(ofs) {
            return Err(BTreeError::Corrupted(format!("page {ofs} reachable twice")));
        }

        let node = Node::read(&self.pager, ofs)?;
        stats.nodes += 1;

        if node.entries.len() > node.capacity() {
            return Err(BTreeError::Corrupted(format!(
                "page {ofs} holds {} keys, capacity {}",
                node.entries.len(),
                node.capacity()
            )));
        }

        let mut previous = lower;
        for entry in &node.entries {
            if previous.is_some_and(|p| entry.key <= p) {
                return Err(BTreeError::Corrupted(format!(
                    "page {ofs}: key {} out of order",
                    entry.key
                )));
            }
            previous = Some(entry.key);

            if entry.valid {
                stats.live_entries += 1;
            } else {
                stats.tombstones += 1;
            }
        }
        if let (Some(last), Some(upper)) = (previous, upper) {
            if last >= upper {
                return Err(BTreeError::Corrupted(format!(
                    "page {ofs}: key {last} not below bound {upper}"
                )));
            }
        }

        if node.leaf {
            stats.leaves += 1;
            stats.height = stats.height.max(depth);
            stats.min_leaf_depth = stats.min_leaf_depth.min(depth);
            return Ok(());
        }

        if node.children.len() != node.entries.len() + 1 {
            return Err(BTreeError::Corrupted(format!(
                "page {ofs}: {} keys but {} children",
                node.entries.len(),
                node.children.len()
            )));
        }

        for (i, &child) in node.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(node.entries[i - 1].key) };
            let hi = node.entries.get(i).map_or(upper, |e| Some(e.key));
            self.validate_subtree(child, lo, hi, depth + 1, seen, stats)?;
        }
        Ok(())
    }

    /// Rewrite every live entry into a fresh file at `path` and return a
    /// handle on it.
    ///
    /// The new tree is bulk-loaded bottom-up, so it holds no tombstones and
    /// no unreachable pages. The source tree is not modified.
    pub fn compact_into(&self, path: &Path) -> Result<Self, BTreeError> {
        let entries: Vec<Entry> = match self.entries() {
            Ok(pairs) => pairs.into_iter().map(|(k, v)| Entry::new(k, v)).collect(),
            Err(BTreeError::EmptyTree) => Vec::new(),
            Err(e) => return Err(e),
        };

        let target = Self::create(path, self.config)?;
        if !entries.is_empty() {
            let height = bulk_height(entries.len(), self.config.half_degree);
            let root = bulk_load(&target.pager, self.config.half_degree, &entries, height)?;
            if !target.pager.set_root_ofs(NULL_OFFSET, root) {
                return Err(BTreeError::Corrupted(
                    "compaction target root changed during load".to_string(),
                ));
            }
        }
        target.sync()?;

        tracing::info!(
            "compacted {} entries into {}",
            entries.len(),
            path.display()
        );
        Ok(target)
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("pager", &self.pager)
            .field("config", &self.config)
            .field("before_publish", &self.before_publish.is_some())
            .finish()
    }
}

fn vanished(key: i64) -> BTreeError {
    BTreeError::Corrupted(format!("key {key} vanished from an immutable snapshot"))
}

/// Most entries a subtree of the given height (0 = leaf) can hold.
fn subtree_capacity(height: u32, half_degree: u16) -> usize {
    let fanout = node::capacity(half_degree) + 1;
    fanout
        .saturating_pow(height.saturating_add(1))
        .saturating_sub(1)
}

/// Smallest height whose full subtree holds `len` entries.
fn bulk_height(len: usize, half_degree: u16) -> u32 {
    let mut height = 0;
    while subtree_capacity(height, half_degree) < len {
        height += 1;
    }
    height
}

/// Build a subtree of exactly `height` levels below the root holding `entries`.
///
/// Entries are spread evenly across the children, with one separator
/// promoted between each pair, so every leaf ends up at the same depth.
fn bulk_load(
    pager: &Pager,
    half_degree: u16,
    entries: &[Entry],
    height: u32,
) -> Result<PageOffset, BTreeError> {
    if height == 0 {
        let mut leaf = Node::new_leaf(half_degree);
        leaf.entries.extend_from_slice(entries);
        return leaf.append(pager);
    }

    let child_capacity = subtree_capacity(height - 1, half_degree);
    let fanout = (entries.len() + 1).div_ceil(child_capacity + 1).max(1);
    let in_children = entries.len() - (fanout - 1);
    let base = in_children / fanout;
    let extra = in_children % fanout;

    let mut node = Node::new_internal(half_degree);
    let mut cursor = 0;
    for i in 0..fanout {
        let take = base + usize::from(i < extra);
        let child = bulk_load(pager, half_degree, &entries[cursor..cursor + take], height - 1)?;
        node.children.push(child);
        cursor += take;

        if i + 1 < fanout {
            node.entries.push(entries[cursor]);
            cursor += 1;
        }
    }

    node.append(pager)
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Pager error (I/O, metadata, allocation).
    Pager(PagerError),
    /// Node decode error.
    Node(NodeError),
    /// I/O error outside the pager (diagnostic export).
    Io(std::io::Error),
    /// Invalid configuration.
    Config(ConfigError),
    /// The key is already present and valid.
    DuplicateKey(i64),
    /// The tree has no root yet.
    EmptyTree,
    /// The root swap kept losing to other writers.
    RetriesExhausted { attempts: u32 },
    /// A structural invariant does not hold.
    Corrupted(String),
}

impl BTreeError {
    /// Whether this is an ordinary outcome the caller is expected to branch
    /// on, as opposed to a fatal I/O or invariant failure.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::DuplicateKey(_) | Self::EmptyTree)
    }
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pager(e) => write!(f, "pager error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::DuplicateKey(k) => write!(f, "duplicate key: {k}"),
            Self::EmptyTree => write!(f, "empty tree"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "root update failed after {attempts} attempts")
            }
            Self::Corrupted(msg) => write!(f, "corrupted tree: {msg}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pager(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::DuplicateKey(_)
            | Self::EmptyTree
            | Self::RetriesExhausted { .. }
            | Self::Corrupted(_) => None,
        }
    }
}

impl From<PagerError> for BTreeError {
    fn from(e: PagerError) -> Self {
        Self::Pager(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<ConfigError> for BTreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
