/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Builder for [`FixedTree`]s.
//!
//! Two build modes are supported:
//! 1. **Positional**: [`add`](FixedTreeGenerator::add) stores a node at a fixed index. Hashing is deferred
//!    until [`tree`](FixedTreeGenerator::tree), which hashes recursively from the root. `add` can be called
//!    from many threads, at distinct indices, in any order.
//! 2. **Append**: [`append`](FixedTreeGenerator::append) fills the tree from the highest index downward
//!    and hashes each node as it arrives. Children always have higher indices than their parent, so
//!    they are already hashed.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{children_indices, node_hash, parent_index, FixedTree, FixedTreeNode, TreeError};

pub struct FixedTreeGenerator {
    size: u64,
    inner: Mutex<GeneratorInner>,
}

struct GeneratorInner {
    nodes: Vec<Option<FixedTreeNode>>,
    appended: u64,
}

impl FixedTreeGenerator {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            inner: Mutex::new(GeneratorInner {
                nodes: vec![None; size as usize],
                appended: 0,
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Store a node at `index`. Replacing an existing node invalidates the hashes on its path to the
    /// root, so calling [`tree`](Self::tree) again stays consistent.
    pub fn add(&self, index: u64, key: Vec<u8>, extra: Vec<u8>) -> Result<(), TreeError> {
        if index >= self.size {
            return Err(TreeError::OutOfRange {
                index,
                size: self.size,
            });
        }
        if key.is_empty() {
            return Err(TreeError::EmptyKey(index));
        }

        let mut inner = self.lock();
        inner.nodes[index as usize] = Some(FixedTreeNode::new(index, key, Vec::new(), extra));

        let mut current = index;
        while current != 0 {
            current = parent_index(current)?;
            match inner.nodes[current as usize].as_mut() {
                Some(parent) if !parent.hash().is_empty() => parent.set_hash(Vec::new()),
                _ => break,
            }
        }

        Ok(())
    }

    /// Store a node at the highest free index and hash it immediately.
    pub fn append(&self, key: Vec<u8>, extra: Vec<u8>) -> Result<u64, TreeError> {
        let mut inner = self.lock();
        if inner.appended >= self.size {
            return Err(TreeError::OutOfRange {
                index: self.size,
                size: self.size,
            });
        }
        let index = self.size - 1 - inner.appended;
        if key.is_empty() {
            return Err(TreeError::EmptyKey(index));
        }

        let (left, right) = children_indices(index, self.size);
        let left = child_hash(&inner.nodes, left)?;
        let right = child_hash(&inner.nodes, right)?;

        let hash = node_hash(&key, &extra, left.as_deref(), right.as_deref());
        inner.nodes[index as usize] = Some(FixedTreeNode::new(index, key, hash, extra));
        inner.appended += 1;

        Ok(index)
    }

    /// Hash every node not hashed yet and return the finished tree. Calling it more than once returns
    /// the same tree.
    pub fn tree(&self) -> Result<FixedTree, TreeError> {
        let mut inner = self.lock();
        if let Some(missing) = inner.nodes.iter().position(Option::is_none) {
            return Err(TreeError::EmptyNodeInTree(missing as u64));
        }
        if self.size > 0 {
            hash_from(&mut inner.nodes, 0, self.size)?;
        }

        let nodes = inner.nodes.iter().flatten().cloned().collect();
        Ok(FixedTree::new(nodes))
    }

    fn lock(&self) -> MutexGuard<'_, GeneratorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn child_hash(nodes: &[Option<FixedTreeNode>], child: Option<u64>) -> Result<Option<Vec<u8>>, TreeError> {
    match child {
        None => Ok(None),
        Some(child) => match &nodes[child as usize] {
            Some(node) if !node.hash().is_empty() => Ok(Some(node.hash().to_vec())),
            _ => Err(TreeError::EmptyNodeInTree(child)),
        },
    }
}

fn hash_from(nodes: &mut [Option<FixedTreeNode>], index: u64, size: u64) -> Result<Vec<u8>, TreeError> {
    let node = nodes[index as usize]
        .as_ref()
        .ok_or(TreeError::EmptyNodeInTree(index))?;
    if !node.hash().is_empty() {
        return Ok(node.hash().to_vec());
    }

    let (left, right) = children_indices(index, size);
    let left = left.map(|left| hash_from(nodes, left, size)).transpose()?;
    let right = right.map(|right| hash_from(nodes, right, size)).transpose()?;

    let node = nodes[index as usize]
        .as_mut()
        .ok_or(TreeError::EmptyNodeInTree(index))?;
    let hash = node_hash(node.key(), node.extra(), left.as_deref(), right.as_deref());
    node.set_hash(hash.clone());

    Ok(hash)
}
