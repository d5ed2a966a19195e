//! B+Tree nodes and the copy-on-write mutation engine.
//!
//! Nodes are serialized as chunks. An interior entry stores the maximum key
//! of its child subtree and a pointer that is either a durable [`ChunkRef`]
//! or an in-memory node staged by the current modification. Saving a tree
//! walks staged nodes bottom-up, writing each as a new chunk — existing
//! chunks are never touched, so readers holding an older root keep a fully
//! consistent view.

use serde::{Deserialize, Serialize};

use canopy_core::{Buffer, ChunkRef, Error, FileBackend, Result};

use crate::cache::ChunkCache;
use crate::modify::{KeyChange, KeyOperation, Modification, ModificationResult, Operation};
use crate::pager::{read_chunk, PagedWriter};

/// Values at or below this size are stored inline in the leaf; larger
/// values become standalone chunks referenced by locator.
pub(crate) const MAX_INLINE_VALUE: usize = 128;

/// A stored value: inline bytes or a reference to a value chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueRef {
    /// The value bytes, stored in the leaf itself.
    Inline(Vec<u8>),
    /// Locator of a chunk holding the value bytes.
    Chunk(ChunkRef),
}

/// One key/value slot in a leaf node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry {
    /// The entry's key. Keys within a node are strictly increasing.
    pub key: Vec<u8>,
    /// The entry's value or value reference.
    pub value: ValueRef,
}

/// A child pointer in an interior node.
#[derive(Debug)]
pub enum Child {
    /// A durable child chunk.
    Disk(ChunkRef),
    /// A child staged in memory by an in-progress modification.
    Mem(Box<Node>),
}

/// One child slot in an interior node.
#[derive(Debug)]
pub struct InteriorEntry {
    /// The maximum key stored anywhere in the child's subtree.
    pub max_key: Vec<u8>,
    /// The child pointer.
    pub child: Child,
}

/// A B+Tree node: a leaf of key/value entries or an interior node of
/// child pointers.
#[derive(Debug)]
pub enum Node {
    /// Leaf level: ordered key/value entries.
    Leaf(Vec<LeafEntry>),
    /// Interior level: ordered (max key, child) entries.
    Interior(Vec<InteriorEntry>),
}

// On-disk representations. Interior children are always durable chunk
// locators by the time a node is serialized.

#[derive(Serialize)]
enum NodeReprRef<'a> {
    Leaf(&'a Vec<LeafEntry>),
    Interior(Vec<DiskEntryRef<'a>>),
}

#[derive(Serialize)]
struct DiskEntryRef<'a> {
    max_key: &'a [u8],
    child: ChunkRef,
}

#[derive(Deserialize)]
enum NodeRepr {
    Leaf(Vec<LeafEntry>),
    Interior(Vec<DiskEntry>),
}

#[derive(Deserialize)]
struct DiskEntry {
    max_key: Vec<u8>,
    child: ChunkRef,
}

impl Node {
    /// Number of entries in this node.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Interior(entries) => entries.len(),
        }
    }

    /// Returns true if the node has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The maximum key reachable through this node.
    pub fn max_key(&self) -> Option<&[u8]> {
        match self {
            Node::Leaf(entries) => entries.last().map(|entry| entry.key.as_slice()),
            Node::Interior(entries) => entries.last().map(|entry| entry.max_key.as_slice()),
        }
    }

    /// Decodes a node from a chunk payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let repr: NodeRepr = bincode::deserialize(bytes)
            .map_err(|err| Error::corrupt(format!("undecodable tree node: {}", err)))?;
        Ok(match repr {
            NodeRepr::Leaf(entries) => Node::Leaf(entries),
            NodeRepr::Interior(entries) => Node::Interior(
                entries
                    .into_iter()
                    .map(|entry| InteriorEntry {
                        max_key: entry.max_key,
                        child: Child::Disk(entry.child),
                    })
                    .collect(),
            ),
        })
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let repr = match self {
            Node::Leaf(entries) => NodeReprRef::Leaf(entries),
            Node::Interior(entries) => {
                let mut disk_entries = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry.child {
                        Child::Disk(chunk) => disk_entries.push(DiskEntryRef {
                            max_key: &entry.max_key,
                            child: chunk,
                        }),
                        Child::Mem(_) => {
                            return Err(Error::InvalidOperation(
                                "cannot serialize a node with staged children".to_string(),
                            ))
                        }
                    }
                }
                NodeReprRef::Interior(disk_entries)
            }
        };
        bincode::serialize(&repr)
            .map_err(|err| Error::serialization(format!("failed to encode tree node: {}", err)))
    }
}

/// Shared read/write context for tree operations.
pub(crate) struct TreeContext<'a> {
    pub file: &'a dyn FileBackend,
    pub cache: Option<&'a ChunkCache>,
    pub max_order: usize,
}

impl TreeContext<'_> {
    pub(crate) fn min_order(&self) -> usize {
        self.max_order / 2
    }

    pub(crate) fn load_node(&self, chunk: ChunkRef) -> Result<Node> {
        let payload = read_chunk(self.file, self.cache, chunk)?;
        Node::decode(&payload)
    }
}

/// Reads the value stored under `value` back into an owned buffer.
pub(crate) fn resolve_value(ctx: &TreeContext<'_>, value: &ValueRef) -> Result<Buffer<'static>> {
    match value {
        ValueRef::Inline(bytes) => Ok(Buffer::owned(bytes.clone())),
        ValueRef::Chunk(chunk) => {
            let payload = read_chunk(ctx.file, ctx.cache, *chunk)?;
            Ok(Buffer::owned(payload.as_ref().clone()))
        }
    }
}

fn make_value_ref(writer: &mut PagedWriter<'_>, value: &Buffer<'static>) -> Result<ValueRef> {
    if value.len() <= MAX_INLINE_VALUE {
        Ok(ValueRef::Inline(value.as_slice().to_vec()))
    } else {
        Ok(ValueRef::Chunk(writer.write_chunk(value.as_slice())?))
    }
}

/// Point lookup against a durable root.
pub(crate) fn get_value(
    ctx: &TreeContext<'_>,
    root: ChunkRef,
    key: &[u8],
) -> Result<Option<Buffer<'static>>> {
    let mut node = ctx.load_node(root)?;
    loop {
        match node {
            Node::Leaf(entries) => {
                return match entries.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
                    Ok(index) => Ok(Some(resolve_value(ctx, &entries[index].value)?)),
                    Err(_) => Ok(None),
                }
            }
            Node::Interior(entries) => {
                let index = entries.partition_point(|entry| entry.max_key.as_slice() < key);
                let Some(entry) = entries.get(index) else {
                    return Ok(None);
                };
                node = match entry.child {
                    Child::Disk(chunk) => ctx.load_node(chunk)?,
                    Child::Mem(_) => unreachable!("durable nodes only reference durable children"),
                };
            }
        }
    }
}

struct BatchState<'f> {
    keys: std::collections::VecDeque<Buffer<'static>>,
    operation: Operation<'f>,
    results: Vec<ModificationResult>,
}

impl BatchState<'_> {
    /// Pops the next key if it falls at or below `bound`.
    fn next_key_within(&mut self, bound: Option<&[u8]>) -> Option<Buffer<'static>> {
        let front = self.keys.front()?;
        if let Some(bound) = bound {
            if front.as_slice() > bound {
                return None;
            }
        }
        self.keys.pop_front()
    }

    fn record(&mut self, key: &Buffer<'static>, change: KeyChange) {
        self.results.push(ModificationResult {
            key: key.clone(),
            change,
        });
    }
}

/// Applies a batched modification against `root`, writing new chunks through
/// `writer`, and returns the new root locator (`None` for an emptied tree)
/// plus the per-key outcomes. The previous root remains untouched on disk.
pub(crate) fn modify_tree(
    ctx: &TreeContext<'_>,
    root: Option<ChunkRef>,
    modification: Modification<'_>,
    writer: &mut PagedWriter<'_>,
) -> Result<(Option<ChunkRef>, Vec<ModificationResult>)> {
    modification.validate()?;

    let mut batch = BatchState {
        keys: modification.keys.into(),
        operation: modification.operation,
        results: Vec::new(),
    };

    let mut node = match root {
        Some(chunk) => ctx.load_node(chunk)?,
        None => Node::Leaf(Vec::new()),
    };

    let changed = modify_node(&mut node, &mut batch, None, ctx, writer)?;
    if !changed {
        return Ok((root, batch.results));
    }

    // Root adjustments: grow a new root above splits, collapse single-child
    // interior roots so all leaves stay at equal depth.
    loop {
        if let Node::Interior(entries) = &mut node {
            if entries.len() == 1 {
                if let Some(only) = entries.pop() {
                    node = match only.child {
                        Child::Mem(child) => *child,
                        Child::Disk(chunk) => ctx.load_node(chunk)?,
                    };
                    continue;
                }
            }
        }
        if node.len() > ctx.max_order {
            let parts = split_node(node, ctx.max_order)?;
            node = Node::Interior(
                parts
                    .into_iter()
                    .map(|part| {
                        let max_key = part
                            .max_key()
                            .map(<[u8]>::to_vec)
                            .unwrap_or_default();
                        InteriorEntry {
                            max_key,
                            child: Child::Mem(Box::new(part)),
                        }
                    })
                    .collect(),
            );
            continue;
        }
        break;
    }

    if node.is_empty() {
        return Ok((None, batch.results));
    }

    let new_root = save_node(&mut node, writer)?;
    Ok((Some(new_root), batch.results))
}

/// Recursively applies the batch to `node`. Keys above `bound` are left for
/// a following sibling. Returns whether anything under `node` changed.
fn modify_node(
    node: &mut Node,
    batch: &mut BatchState<'_>,
    bound: Option<&[u8]>,
    ctx: &TreeContext<'_>,
    writer: &mut PagedWriter<'_>,
) -> Result<bool> {
    match node {
        Node::Leaf(entries) => apply_to_leaf(entries, batch, bound, ctx, writer),
        Node::Interior(entries) => {
            let mut changed = false;
            let child_count = entries.len();
            for index in 0..child_count {
                let Some(front) = batch.keys.front() else {
                    break;
                };
                if let Some(bound) = bound {
                    if front.as_slice() > bound {
                        break;
                    }
                }

                let is_last = index + 1 == child_count;
                if !is_last && front.as_slice() > entries[index].max_key.as_slice() {
                    continue;
                }

                // The last child absorbs every remaining in-bound key so
                // inserts past the current maximum have a home.
                let child_bound = if is_last {
                    bound.map(<[u8]>::to_vec)
                } else {
                    Some(entries[index].max_key.clone())
                };

                let entry = &mut entries[index];
                let original = match entry.child {
                    Child::Disk(chunk) => Some(chunk),
                    Child::Mem(_) => None,
                };
                if let Child::Disk(chunk) = entry.child {
                    entry.child = Child::Mem(Box::new(ctx.load_node(chunk)?));
                }
                let child = match &mut entry.child {
                    Child::Mem(child) => child,
                    Child::Disk(_) => unreachable!("child was just staged"),
                };

                let child_changed =
                    modify_node(child.as_mut(), batch, child_bound.as_deref(), ctx, writer)?;
                if child_changed {
                    changed = true;
                    if let Some(max_key) = child.max_key() {
                        entry.max_key = max_key.to_vec();
                    }
                } else if let Some(chunk) = original {
                    // Nothing changed below; point back at the durable chunk
                    // so the subtree is not rewritten.
                    entry.child = Child::Disk(chunk);
                }
            }

            if changed {
                rebalance_children(entries, ctx)?;
            }
            Ok(changed)
        }
    }
}

fn apply_to_leaf(
    entries: &mut Vec<LeafEntry>,
    batch: &mut BatchState<'_>,
    bound: Option<&[u8]>,
    ctx: &TreeContext<'_>,
    writer: &mut PagedWriter<'_>,
) -> Result<bool> {
    let mut changed = false;
    while let Some(key) = batch.next_key_within(bound) {
        let position = entries.binary_search_by(|entry| entry.key.as_slice().cmp(key.as_slice()));
        match &mut batch.operation {
            Operation::Set(value) => {
                let value_ref = make_value_ref(writer, value)?;
                store_entry(entries, position, &key, value_ref);
                changed = true;
                batch.record(&key, KeyChange::Set);
            }
            Operation::Remove => match position {
                Ok(index) => {
                    entries.remove(index);
                    changed = true;
                    batch.record(&key, KeyChange::Removed);
                }
                Err(_) => batch.record(&key, KeyChange::Unchanged),
            },
            Operation::CompareSwap(swap) => {
                let current = match position {
                    Ok(index) => Some(resolve_value(ctx, &entries[index].value)?),
                    Err(_) => None,
                };
                match (swap.0)(key.as_slice(), current) {
                    KeyOperation::Skip => batch.record(&key, KeyChange::Unchanged),
                    KeyOperation::Set(value) => {
                        let value_ref = make_value_ref(writer, &value)?;
                        store_entry(entries, position, &key, value_ref);
                        changed = true;
                        batch.record(&key, KeyChange::Set);
                    }
                    KeyOperation::Remove => match position {
                        Ok(index) => {
                            entries.remove(index);
                            changed = true;
                            batch.record(&key, KeyChange::Removed);
                        }
                        Err(_) => batch.record(&key, KeyChange::Unchanged),
                    },
                }
            }
        }
    }
    Ok(changed)
}

fn store_entry(
    entries: &mut Vec<LeafEntry>,
    position: std::result::Result<usize, usize>,
    key: &Buffer<'static>,
    value: ValueRef,
) {
    match position {
        Ok(index) => entries[index].value = value,
        Err(index) => entries.insert(
            index,
            LeafEntry {
                key: key.as_slice().to_vec(),
                value,
            },
        ),
    }
}

/// Restores the occupancy invariant among an interior node's children:
/// drops emptied children, splits overflowing ones, and merges or
/// rebalances staged children that fell below `min_order`.
fn rebalance_children(entries: &mut Vec<InteriorEntry>, ctx: &TreeContext<'_>) -> Result<()> {
    let previous = std::mem::take(entries);
    for entry in previous {
        match entry.child {
            Child::Mem(node) if node.is_empty() => {}
            Child::Mem(node) if node.len() > ctx.max_order => {
                for part in split_node(*node, ctx.max_order)? {
                    let max_key = part.max_key().map(<[u8]>::to_vec).unwrap_or_default();
                    entries.push(InteriorEntry {
                        max_key,
                        child: Child::Mem(Box::new(part)),
                    });
                }
            }
            child => entries.push(InteriorEntry {
                max_key: entry.max_key,
                child,
            }),
        }
    }

    let min_order = ctx.min_order();
    let mut index = 0;
    while index < entries.len() {
        let underflowing = matches!(&entries[index].child, Child::Mem(node) if node.len() < min_order);
        if !underflowing || entries.len() < 2 {
            index += 1;
            continue;
        }

        // Merge with the following sibling (or the preceding one at the
        // tail), then re-split evenly if the merge overflows.
        let left = if index + 1 < entries.len() { index } else { index - 1 };
        let merged = merge_siblings(entries.remove(left + 1), entries.remove(left), ctx)?;
        let mut insert_at = left;
        for part in merged {
            let max_key = part.max_key().map(<[u8]>::to_vec).unwrap_or_default();
            entries.insert(
                insert_at,
                InteriorEntry {
                    max_key,
                    child: Child::Mem(Box::new(part)),
                },
            );
            insert_at += 1;
        }
        index = left;
    }
    Ok(())
}

/// Combines two adjacent siblings into one node, or two balanced nodes if
/// the combination would overflow (the borrow/rebalance case).
fn merge_siblings(
    right: InteriorEntry,
    left: InteriorEntry,
    ctx: &TreeContext<'_>,
) -> Result<Vec<Node>> {
    let left_node = load_child(left.child, ctx)?;
    let right_node = load_child(right.child, ctx)?;

    let combined = match (left_node, right_node) {
        (Node::Leaf(mut left_entries), Node::Leaf(right_entries)) => {
            left_entries.extend(right_entries);
            Node::Leaf(left_entries)
        }
        (Node::Interior(mut left_entries), Node::Interior(right_entries)) => {
            left_entries.extend(right_entries);
            Node::Interior(left_entries)
        }
        _ => {
            return Err(Error::corrupt(
                "sibling nodes at mismatched levels".to_string(),
            ))
        }
    };

    if combined.len() > ctx.max_order {
        split_node(combined, ctx.max_order)
    } else {
        Ok(vec![combined])
    }
}

fn load_child(child: Child, ctx: &TreeContext<'_>) -> Result<Node> {
    match child {
        Child::Mem(node) => Ok(*node),
        Child::Disk(chunk) => ctx.load_node(chunk),
    }
}

/// Splits an overflowing node into the smallest number of pieces that all
/// satisfy the order bounds, preserving key order.
fn split_node(node: Node, max_order: usize) -> Result<Vec<Node>> {
    Ok(match node {
        Node::Leaf(entries) => split_entries(entries, max_order)
            .into_iter()
            .map(Node::Leaf)
            .collect(),
        Node::Interior(entries) => split_entries(entries, max_order)
            .into_iter()
            .map(Node::Interior)
            .collect(),
    })
}

fn split_entries<T>(entries: Vec<T>, max_order: usize) -> Vec<Vec<T>> {
    let pieces = entries.len().div_ceil(max_order.max(1)).max(1);
    let base = entries.len() / pieces;
    let extra = entries.len() % pieces;

    let mut result = Vec::with_capacity(pieces);
    let mut iter = entries.into_iter();
    for piece in 0..pieces {
        let take = base + usize::from(piece < extra);
        result.push(iter.by_ref().take(take).collect());
    }
    result
}

/// Persists `node` and every staged descendant, depth-first, returning the
/// node's new chunk locator. Children already on disk are left untouched.
pub(crate) fn save_node(node: &mut Node, writer: &mut PagedWriter<'_>) -> Result<ChunkRef> {
    if let Node::Interior(entries) = node {
        for entry in entries.iter_mut() {
            if let Child::Mem(child) = &mut entry.child {
                let chunk = save_node(child.as_mut(), writer)?;
                entry.child = Child::Disk(chunk);
            }
        }
    }
    let bytes = node.encode()?;
    writer.write_chunk(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modify::CompareSwap;
    use canopy_core::StdFileBackend;
    use tempfile::tempdir;

    const ORDER: usize = 4;

    struct Fixture {
        _dir: tempfile::TempDir,
        file: StdFileBackend,
        root: Option<ChunkRef>,
        position: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let file = StdFileBackend::open(dir.path().join("tree")).unwrap();
            Self {
                _dir: dir,
                file,
                root: None,
                position: 0,
            }
        }

        fn ctx(&self) -> TreeContext<'_> {
            TreeContext {
                file: &self.file,
                cache: None,
                max_order: ORDER,
            }
        }

        fn apply(&mut self, modification: Modification<'_>) -> Vec<ModificationResult> {
            let ctx = self.ctx();
            let mut writer = PagedWriter::new(&self.file, None, self.position);
            let (root, results) = modify_tree(&ctx, self.root, modification, &mut writer).unwrap();
            self.position = writer.finish().unwrap();
            self.root = root;
            results
        }

        fn set_all(&mut self, pairs: &[(&[u8], &[u8])]) {
            for (key, value) in pairs {
                self.apply(Modification {
                    keys: vec![Buffer::owned(key.to_vec())],
                    operation: Operation::Set(Buffer::owned(value.to_vec())),
                });
            }
        }

        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            let root = self.root?;
            get_value(&self.ctx(), root, key)
                .unwrap()
                .map(Buffer::into_vec)
        }

        /// Walks the tree verifying structural invariants. Returns the
        /// number of leaf entries seen.
        fn check_invariants(&self) -> usize {
            let Some(root) = self.root else {
                return 0;
            };
            let ctx = self.ctx();
            let node = ctx.load_node(root).unwrap();
            let mut count = 0;
            let mut last_key: Option<Vec<u8>> = None;
            Self::check_node(&ctx, &node, true, &mut count, &mut last_key);
            count
        }

        fn check_node(
            ctx: &TreeContext<'_>,
            node: &Node,
            is_root: bool,
            count: &mut usize,
            last_key: &mut Option<Vec<u8>>,
        ) -> usize {
            assert!(node.len() <= ORDER, "node overflows: {} entries", node.len());
            if !is_root {
                assert!(
                    node.len() >= ORDER / 2,
                    "non-root node underflows: {} entries",
                    node.len()
                );
            }
            match node {
                Node::Leaf(entries) => {
                    for entry in entries {
                        if let Some(previous) = last_key {
                            assert!(
                                previous.as_slice() < entry.key.as_slice(),
                                "keys out of order"
                            );
                        }
                        *last_key = Some(entry.key.clone());
                        *count += 1;
                    }
                    1
                }
                Node::Interior(entries) => {
                    assert!(!is_root || entries.len() > 1, "trivial interior root");
                    let mut depth = None;
                    for entry in entries {
                        let child = match entry.child {
                            Child::Disk(chunk) => ctx.load_node(chunk).unwrap(),
                            Child::Mem(_) => panic!("staged child in durable tree"),
                        };
                        assert_eq!(
                            child.max_key().unwrap(),
                            entry.max_key.as_slice(),
                            "stale max_key"
                        );
                        let child_depth =
                            Self::check_node(ctx, &child, false, count, last_key);
                        if let Some(depth) = depth {
                            assert_eq!(depth, child_depth, "leaves at unequal depth");
                        }
                        depth = Some(child_depth);
                    }
                    depth.unwrap() + 1
                }
            }
        }
    }

    fn key(i: usize) -> Vec<u8> {
        format!("key{:04}", i).into_bytes()
    }

    #[test]
    fn insert_and_lookup_single_leaf() {
        let mut fixture = Fixture::new();
        fixture.set_all(&[(b"b", b"2"), (b"a", b"1"), (b"c", b"3")]);

        assert_eq!(fixture.get(b"a").unwrap(), b"1");
        assert_eq!(fixture.get(b"b").unwrap(), b"2");
        assert_eq!(fixture.get(b"c").unwrap(), b"3");
        assert!(fixture.get(b"d").is_none());
        assert_eq!(fixture.check_invariants(), 3);
    }

    #[test]
    fn splits_preserve_order_and_depth() {
        let mut fixture = Fixture::new();
        for i in 0..100 {
            fixture.apply(Modification {
                keys: vec![Buffer::owned(key(i))],
                operation: Operation::Set(Buffer::owned(vec![i as u8])),
            });
            fixture.check_invariants();
        }

        assert_eq!(fixture.check_invariants(), 100);
        for i in 0..100 {
            assert_eq!(fixture.get(&key(i)).unwrap(), vec![i as u8]);
        }
    }

    #[test]
    fn batched_insert_splits_into_bounded_nodes() {
        let mut fixture = Fixture::new();
        let keys: Vec<_> = (0..50).map(|i| Buffer::owned(key(i))).collect();
        let results = fixture.apply(Modification {
            keys,
            operation: Operation::Set(Buffer::owned(b"v".to_vec())),
        });

        assert_eq!(results.len(), 50);
        assert_eq!(fixture.check_invariants(), 50);
    }

    #[test]
    fn updates_replace_in_place() {
        let mut fixture = Fixture::new();
        fixture.set_all(&[(b"k", b"old")]);
        fixture.set_all(&[(b"k", b"new")]);

        assert_eq!(fixture.get(b"k").unwrap(), b"new");
        assert_eq!(fixture.check_invariants(), 1);
    }

    #[test]
    fn removals_merge_back_to_a_leaf() {
        let mut fixture = Fixture::new();
        for i in 0..60 {
            fixture.apply(Modification {
                keys: vec![Buffer::owned(key(i))],
                operation: Operation::Set(Buffer::owned(b"v".to_vec())),
            });
        }

        for i in 0..59 {
            fixture.apply(Modification {
                keys: vec![Buffer::owned(key(i))],
                operation: Operation::Remove,
            });
            fixture.check_invariants();
        }

        assert_eq!(fixture.check_invariants(), 1);
        assert_eq!(fixture.get(&key(59)).unwrap(), b"v");
    }

    #[test]
    fn remove_everything_yields_empty_root() {
        let mut fixture = Fixture::new();
        let keys: Vec<_> = (0..20).map(|i| Buffer::owned(key(i))).collect();
        fixture.apply(Modification {
            keys: keys.clone(),
            operation: Operation::Set(Buffer::owned(b"v".to_vec())),
        });
        fixture.apply(Modification {
            keys,
            operation: Operation::Remove,
        });

        assert!(fixture.root.is_none());
    }

    #[test]
    fn remove_missing_key_is_a_noop() {
        let mut fixture = Fixture::new();
        fixture.set_all(&[(b"a", b"1")]);
        let before = fixture.root;

        let results = fixture.apply(Modification {
            keys: vec![Buffer::owned(b"zzz".to_vec())],
            operation: Operation::Remove,
        });

        assert_eq!(results[0].change, KeyChange::Unchanged);
        assert_eq!(fixture.root, before, "no-op must not produce a new root");
    }

    #[test]
    fn old_roots_remain_readable_after_modification() {
        let mut fixture = Fixture::new();
        fixture.set_all(&[(b"a", b"1"), (b"b", b"2")]);
        let old_root = fixture.root.unwrap();

        fixture.set_all(&[(b"a", b"changed"), (b"c", b"3")]);

        // The old root still serves the old view.
        let ctx = fixture.ctx();
        let old_a = get_value(&ctx, old_root, b"a").unwrap().unwrap();
        assert_eq!(old_a, b"1");
        assert!(get_value(&ctx, old_root, b"c").unwrap().is_none());

        assert_eq!(fixture.get(b"a").unwrap(), b"changed");
    }

    #[test]
    fn compare_swap_sees_current_value() {
        let mut fixture = Fixture::new();
        fixture.set_all(&[(b"k", b"one")]);

        let mut observed = None;
        let mut callback = |_key: &[u8], value: Option<Buffer<'static>>| {
            observed = value.as_ref().map(|v| v.as_slice().to_vec());
            KeyOperation::Set(Buffer::owned(b"two".to_vec()))
        };
        fixture.apply(Modification {
            keys: vec![Buffer::owned(b"k".to_vec())],
            operation: Operation::CompareSwap(CompareSwap::new(&mut callback)),
        });

        assert_eq!(observed.unwrap(), b"one");
        assert_eq!(fixture.get(b"k").unwrap(), b"two");
    }

    #[test]
    fn large_values_round_trip_through_value_chunks() {
        let mut fixture = Fixture::new();
        let large = vec![0xABu8; MAX_INLINE_VALUE * 10];
        fixture.apply(Modification {
            keys: vec![Buffer::owned(b"big".to_vec())],
            operation: Operation::Set(Buffer::owned(large.clone())),
        });

        assert_eq!(fixture.get(b"big").unwrap(), large);

        // The leaf stores a reference, not the bytes.
        let ctx = fixture.ctx();
        let root = ctx.load_node(fixture.root.unwrap()).unwrap();
        match root {
            Node::Leaf(entries) => {
                assert!(matches!(entries[0].value, ValueRef::Chunk(_)));
            }
            Node::Interior(_) => panic!("single-entry tree should be a leaf"),
        }
    }

    #[test]
    fn node_encoding_round_trips() {
        let node = Node::Leaf(vec![
            LeafEntry {
                key: b"a".to_vec(),
                value: ValueRef::Inline(b"1".to_vec()),
            },
            LeafEntry {
                key: b"b".to_vec(),
                value: ValueRef::Chunk(ChunkRef {
                    offset: 42,
                    length: 7,
                }),
            },
        ]);
        let bytes = node.encode().unwrap();
        let decoded = Node::decode(&bytes).unwrap();
        match decoded {
            Node::Leaf(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].key, b"a");
                assert_eq!(
                    entries[1].value,
                    ValueRef::Chunk(ChunkRef {
                        offset: 42,
                        length: 7
                    })
                );
            }
            Node::Interior(_) => panic!("decoded wrong variant"),
        }
    }

    #[test]
    fn split_entries_respects_bounds() {
        for len in 5..200usize {
            let entries: Vec<usize> = (0..len).collect();
            let pieces = split_entries(entries, ORDER);
            let total: usize = pieces.iter().map(Vec::len).sum();
            assert_eq!(total, len);
            for piece in &pieces {
                assert!(piece.len() <= ORDER);
                if len > ORDER {
                    assert!(piece.len() >= ORDER / 2, "piece of {} from {}", piece.len(), len);
                }
            }
        }
    }
}
