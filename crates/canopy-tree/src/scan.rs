//! Ordered range scans.
//!
//! A [`TreeScanner`] captures a tree's root when it is created and walks
//! that version lazily, so concurrent writers (which only ever append new
//! chunks and publish new roots) can never disturb an in-progress scan. A
//! scan is restartable: feed [`TreeScanner::bookmark`] back in as an
//! excluded start bound to continue where a previous scan stopped.

use std::ops::Bound;
use std::sync::Arc;

use canopy_core::{Buffer, ChunkRef, FileBackend, Result};

use crate::cache::ChunkCache;
use crate::node::{Child, LeafEntry, Node, ValueRef};
use crate::pager::read_chunk;

/// The result of evaluating a key or node during a scan.
#[derive(Clone, Copy, Debug)]
pub enum ScanEvaluation {
    /// Read the data for this entry.
    ReadData,
    /// Skip this entry's contained data.
    Skip,
    /// Stop scanning.
    Stop,
}

struct Frame {
    node: Node,
    /// Forward: index of the next entry to visit. Backward: count of
    /// entries still to visit (the next one is `position - 1`).
    position: usize,
}

/// A lazy, ordered iterator over the entries of one tree version.
pub struct TreeScanner {
    file: Arc<dyn FileBackend>,
    cache: Option<ChunkCache>,
    root: Option<ChunkRef>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    forwards: bool,
    stack: Vec<Frame>,
    primed: bool,
    done: bool,
    last_key: Option<Vec<u8>>,
}

impl TreeScanner {
    pub(crate) fn new(
        file: Arc<dyn FileBackend>,
        cache: Option<ChunkCache>,
        root: Option<ChunkRef>,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        forwards: bool,
    ) -> Self {
        Self {
            file,
            cache,
            root,
            start,
            end,
            forwards,
            stack: Vec::new(),
            primed: false,
            done: false,
            last_key: None,
        }
    }

    /// The last key this scanner yielded. Feeding it back as an excluded
    /// start bound (or excluded end bound when scanning backwards) resumes
    /// the scan after that key against a fresh snapshot.
    #[must_use]
    pub fn bookmark(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    fn load(&self, chunk: ChunkRef) -> Result<Node> {
        let payload = read_chunk(self.file.as_ref(), self.cache.as_ref(), chunk)?;
        Node::decode(&payload)
    }

    fn push(&mut self, node: Node) {
        let position = if self.forwards {
            match &node {
                Node::Leaf(entries) => match &self.start {
                    Bound::Unbounded => 0,
                    Bound::Included(start) => {
                        entries.partition_point(|entry| entry.key.as_slice() < start.as_slice())
                    }
                    Bound::Excluded(start) => {
                        entries.partition_point(|entry| entry.key.as_slice() <= start.as_slice())
                    }
                },
                Node::Interior(entries) => match &self.start {
                    Bound::Unbounded => 0,
                    Bound::Included(start) => entries
                        .partition_point(|entry| entry.max_key.as_slice() < start.as_slice()),
                    Bound::Excluded(start) => entries
                        .partition_point(|entry| entry.max_key.as_slice() <= start.as_slice()),
                },
            }
        } else {
            match &node {
                Node::Leaf(entries) => match &self.end {
                    Bound::Unbounded => entries.len(),
                    Bound::Included(end) => {
                        entries.partition_point(|entry| entry.key.as_slice() <= end.as_slice())
                    }
                    Bound::Excluded(end) => {
                        entries.partition_point(|entry| entry.key.as_slice() < end.as_slice())
                    }
                },
                Node::Interior(entries) => match &self.end {
                    Bound::Unbounded => entries.len(),
                    // The child straddling the bound may still hold in-range
                    // keys, so include it and let the leaf check decide.
                    Bound::Included(end) | Bound::Excluded(end) => entries
                        .partition_point(|entry| entry.max_key.as_slice() < end.as_slice())
                        .saturating_add(1)
                        .min(entries.len()),
                },
            }
        };
        self.stack.push(Frame { node, position });
    }

    /// Returns true if `key` lies past the far bound of the scan.
    fn past_limit(&self, key: &[u8]) -> bool {
        if self.forwards {
            match &self.end {
                Bound::Unbounded => false,
                Bound::Included(end) => key > end.as_slice(),
                Bound::Excluded(end) => key >= end.as_slice(),
            }
        } else {
            match &self.start {
                Bound::Unbounded => false,
                Bound::Included(start) => key < start.as_slice(),
                Bound::Excluded(start) => key <= start.as_slice(),
            }
        }
    }

    /// Advances to the next in-range leaf entry without reading its value.
    pub(crate) fn next_entry(&mut self) -> Result<Option<LeafEntry>> {
        if self.done {
            return Ok(None);
        }
        if !self.primed {
            self.primed = true;
            if let Some(root) = self.root {
                let node = self.load(root)?;
                self.push(node);
            }
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.done = true;
                return Ok(None);
            };

            let forwards = self.forwards;
            let next_child = match &mut frame.node {
                Node::Leaf(entries) => {
                    let entry = if forwards {
                        if frame.position < entries.len() {
                            let entry = entries[frame.position].clone();
                            frame.position += 1;
                            Some(entry)
                        } else {
                            None
                        }
                    } else if frame.position > 0 {
                        frame.position -= 1;
                        Some(entries[frame.position].clone())
                    } else {
                        None
                    };

                    match entry {
                        Some(entry) => {
                            if self.past_limit(&entry.key) {
                                self.done = true;
                                return Ok(None);
                            }
                            self.last_key = Some(entry.key.clone());
                            return Ok(Some(entry));
                        }
                        None => {
                            self.stack.pop();
                            continue;
                        }
                    }
                }
                Node::Interior(entries) => {
                    let child = if forwards {
                        if frame.position < entries.len() {
                            let child = &entries[frame.position].child;
                            frame.position += 1;
                            Some(child)
                        } else {
                            None
                        }
                    } else if frame.position > 0 {
                        frame.position -= 1;
                        Some(&entries[frame.position].child)
                    } else {
                        None
                    };

                    match child {
                        Some(Child::Disk(chunk)) => Some(*chunk),
                        Some(Child::Mem(_)) => {
                            unreachable!("scans only traverse durable nodes")
                        }
                        None => {
                            self.stack.pop();
                            continue;
                        }
                    }
                }
            };

            if let Some(chunk) = next_child {
                let node = self.load(chunk)?;
                self.push(node);
            }
        }
    }

    pub(crate) fn resolve(&self, value: &ValueRef) -> Result<Buffer<'static>> {
        match value {
            ValueRef::Inline(bytes) => Ok(Buffer::owned(bytes.clone())),
            ValueRef::Chunk(chunk) => {
                let payload = read_chunk(self.file.as_ref(), self.cache.as_ref(), *chunk)?;
                Ok(Buffer::owned(payload.as_ref().clone()))
            }
        }
    }
}

impl Iterator for TreeScanner {
    type Item = Result<(Buffer<'static>, Buffer<'static>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => {
                let value = match self.resolve(&entry.value) {
                    Ok(value) => value,
                    Err(err) => return Some(Err(err)),
                };
                Some(Ok((Buffer::owned(entry.key), value)))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Converts a caller range into owned bounds.
pub(crate) fn owned_bounds<'k, R>(range: &R) -> (Bound<Vec<u8>>, Bound<Vec<u8>>)
where
    R: std::ops::RangeBounds<&'k [u8]> + ?Sized,
{
    fn convert(bound: Bound<&&[u8]>) -> Bound<Vec<u8>> {
        match bound {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(key) => Bound::Included(key.to_vec()),
            Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
        }
    }
    (convert(range.start_bound()), convert(range.end_bound()))
}
