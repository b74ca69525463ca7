/*
 * Copy-on-write B+tree
 *
 * Every key-value pair of the store lives in the leaves of a single B+tree whose
 * nodes are pages. Internal nodes only hold separator keys:
 *
 *              [ k1 | k2 ]
 *             /     |     \
 *      keys < k1  k1 <= keys < k2  keys >= k2
 *
 * Nothing reachable from a committed root is ever modified. Changing a leaf
 * rewrites it through PageManager::write_copy, which hands back a new page
 * number, so every ancestor on the path to the root is rewritten too and the
 * transaction ends up with a new root. Readers holding the old root keep seeing
 * the old tree:
 *
 *      old root        new root
 *       /    \          /    \
 *      A      B  <---- /      B'
 *             shared  A
 *
 * Nodes split by encoded size when they no longer fit a page. Deletes remove
 * empty nodes and collapse single-child roots but never rebalance, so nodes
 * may be underfull; all leaves stay at the same depth.
 */

use crate::error::{Error, Result};
use crate::page_manager::{Page, PageManager};
use crate::types::PageNumber;
use std::cmp::Ordering;

const LEAF: u8 = 1;
const INTERNAL: u8 = 2;

// (1 byte) type + (2 bytes) entry count
const NODE_HEADER: usize = 3;
// (4 bytes) key_len + (4 bytes) value_len
const LEAF_ENTRY_OVERHEAD: usize = 8;
// (4 bytes) key_len + (8 bytes) right child
const INTERNAL_ENTRY_OVERHEAD: usize = 12;

/// Largest key plus value that fits: a quarter of a page, so that any node
/// that overflows after one insert splits into two halves that both fit.
pub(crate) fn max_entry_size(page_size: usize) -> usize {
    (page_size - NODE_HEADER) / 4 - LEAF_ENTRY_OVERHEAD
}

fn corrupted(page_number: PageNumber, what: &str) -> Error {
    Error::Corrupted(format!("tree page {page_number}: {what}"))
}

struct Reader<'a> {
    raw: &'a [u8],
    offset: usize,
    page_number: PageNumber,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.raw.len() {
            return Err(corrupted(self.page_number, "entry overruns the page"));
        }
        let slice = &self.raw[self.offset..(self.offset + len)];
        self.offset += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let page_number = self.page_number;
        self.take(2)?
            .try_into()
            .map(u16::from_be_bytes)
            .map_err(|_| corrupted(page_number, "short read"))
    }

    fn u32(&mut self) -> Result<u32> {
        let page_number = self.page_number;
        self.take(4)?
            .try_into()
            .map(u32::from_be_bytes)
            .map_err(|_| corrupted(page_number, "short read"))
    }

    fn u64(&mut self) -> Result<u64> {
        let page_number = self.page_number;
        self.take(8)?
            .try_into()
            .map(u64::from_be_bytes)
            .map_err(|_| corrupted(page_number, "short read"))
    }
}

// Leaf page format is:
// * (1 byte) type: 1 = LEAF
// * (2 bytes) entry count
// * per entry: (4 bytes) key_len, (4 bytes) value_len, key_data, value_data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct LeafNode {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl LeafNode {
    fn encoded_len(&self) -> usize {
        NODE_HEADER
            + self
                .entries
                .iter()
                .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len())
                .sum::<usize>()
    }

    fn find(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }
}

// Internal page format is:
// * (1 byte) type: 2 = INTERNAL
// * (2 bytes) key count
// * (8 bytes) first child
// * per key: (4 bytes) key_len, key_data, (8 bytes) child holding keys >= key_data
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InternalNode {
    keys: Vec<Vec<u8>>,
    children: Vec<PageNumber>,
}

impl InternalNode {
    fn encoded_len(&self) -> usize {
        NODE_HEADER
            + 8
            + self
                .keys
                .iter()
                .map(|k| INTERNAL_ENTRY_OVERHEAD + k.len())
                .sum::<usize>()
    }

    fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }
}

pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    fn from_page(page: &Page) -> Result<Node> {
        let page_number = page.get_page_number();
        let mut reader = Reader {
            raw: page.memory(),
            offset: 0,
            page_number,
        };
        let node_type = reader.take(1)?[0];
        let count = reader.u16()? as usize;
        match node_type {
            LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key_len = reader.u32()? as usize;
                    let value_len = reader.u32()? as usize;
                    let key = reader.take(key_len)?.to_vec();
                    let value = reader.take(value_len)?.to_vec();
                    entries.push((key, value));
                }
                Ok(Node::Leaf(LeafNode { entries }))
            }
            INTERNAL => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(reader.u64()?);
                for _ in 0..count {
                    let key_len = reader.u32()? as usize;
                    keys.push(reader.take(key_len)?.to_vec());
                    children.push(reader.u64()?);
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            _ => Err(corrupted(page_number, "unknown node type")),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Node::Leaf(leaf) => {
                let mut out = Vec::with_capacity(leaf.encoded_len());
                out.push(LEAF);
                out.extend_from_slice(&(leaf.entries.len() as u16).to_be_bytes());
                for (key, value) in &leaf.entries {
                    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    out.extend_from_slice(key);
                    out.extend_from_slice(value);
                }
                out
            }
            Node::Internal(node) => {
                let mut out = Vec::with_capacity(node.encoded_len());
                out.push(INTERNAL);
                out.extend_from_slice(&(node.keys.len() as u16).to_be_bytes());
                out.extend_from_slice(&node.children[0].to_be_bytes());
                for (key, child) in node.keys.iter().zip(&node.children[1..]) {
                    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                    out.extend_from_slice(key);
                    out.extend_from_slice(&child.to_be_bytes());
                }
                out
            }
        }
    }
}

// The page is dropped before returning, since we can't allocate or write while
// a page is in flight
fn read_node(manager: &PageManager, page_number: PageNumber) -> Result<Node> {
    let page = manager.get_page(page_number)?;
    Node::from_page(&page)
}

/// Entries of `page_number` if it decodes as a leaf, whether or not any tree
/// still references it.
pub(crate) fn leaf_entries(
    manager: &PageManager,
    page_number: PageNumber,
) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
    match read_node(manager, page_number)? {
        Node::Leaf(leaf) => Ok(Some(leaf.entries)),
        Node::Internal(_) => Ok(None),
    }
}

// Index of the first element of the right half, splitting by encoded size
fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let upper = sizes.len().saturating_sub(1).max(1);
    let mut acc = 0;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            return (i + 1).clamp(1, upper);
        }
    }
    upper
}

/// Looks up `key` in the tree rooted at `root`.
pub(crate) fn get(
    manager: &PageManager,
    root: Option<PageNumber>,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let mut page_number = match root {
        Some(root) => root,
        None => return Ok(None),
    };
    loop {
        match read_node(manager, page_number)? {
            Node::Internal(node) => page_number = node.children[node.child_index(key)],
            Node::Leaf(mut leaf) => {
                return Ok(match leaf.find(key) {
                    Ok(i) => Some(leaf.entries.swap_remove(i).1),
                    Err(_) => None,
                })
            }
        }
    }
}

enum InsertOutcome {
    Done(PageNumber),
    Split(PageNumber, Vec<u8>, PageNumber),
}

/// A tree being modified by a write transaction.
pub(crate) struct BtreeMut<'a> {
    manager: &'a PageManager,
    root: Option<PageNumber>,
    max_entry: usize,
}

impl<'a> BtreeMut<'a> {
    pub(crate) fn new(manager: &'a PageManager, root: Option<PageNumber>) -> Self {
        BtreeMut {
            manager,
            root,
            max_entry: max_entry_size(manager.page_size()),
        }
    }

    pub(crate) fn root(&self) -> Option<PageNumber> {
        self.root
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() + value.len() > self.max_entry {
            return Err(Error::RecordTooLarge {
                size: key.len() + value.len(),
                max: self.max_entry,
            });
        }
        let root = match self.root {
            Some(root) => root,
            None => {
                let leaf = LeafNode {
                    entries: vec![(key.to_vec(), value.to_vec())],
                };
                self.root = Some(self.manager.write_copy(None, &Node::Leaf(leaf).to_bytes())?);
                return Ok(None);
            }
        };
        let (outcome, old) = self.insert_into(root, key, value)?;
        let new_root = match outcome {
            InsertOutcome::Done(page_number) => page_number,
            InsertOutcome::Split(left, separator, right) => {
                let node = InternalNode {
                    keys: vec![separator],
                    children: vec![left, right],
                };
                self.manager
                    .write_copy(None, &Node::Internal(node).to_bytes())?
            }
        };
        self.root = Some(new_root);
        Ok(old)
    }

    // Returns the page number(s) of the sub-tree into which the key was inserted
    fn insert_into(
        &mut self,
        page_number: PageNumber,
        key: &[u8],
        value: &[u8],
    ) -> Result<(InsertOutcome, Option<Vec<u8>>)> {
        match read_node(self.manager, page_number)? {
            Node::Leaf(mut leaf) => {
                let old = match leaf.find(key) {
                    Ok(i) => Some(std::mem::replace(&mut leaf.entries[i].1, value.to_vec())),
                    Err(i) => {
                        leaf.entries.insert(i, (key.to_vec(), value.to_vec()));
                        None
                    }
                };
                Ok((self.write_leaf(page_number, leaf)?, old))
            }
            Node::Internal(mut node) => {
                let index = node.child_index(key);
                let (outcome, old) = self.insert_into(node.children[index], key, value)?;
                match outcome {
                    InsertOutcome::Done(child) => node.children[index] = child,
                    InsertOutcome::Split(left, separator, right) => {
                        node.children[index] = left;
                        node.keys.insert(index, separator);
                        node.children.insert(index + 1, right);
                    }
                }
                Ok((self.write_internal(page_number, node)?, old))
            }
        }
    }

    fn write_leaf(&mut self, page_number: PageNumber, mut leaf: LeafNode) -> Result<InsertOutcome> {
        if leaf.encoded_len() <= self.manager.page_size() {
            let page_number = self
                .manager
                .write_copy(Some(page_number), &Node::Leaf(leaf).to_bytes())?;
            return Ok(InsertOutcome::Done(page_number));
        }
        let sizes: Vec<usize> = leaf
            .entries
            .iter()
            .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len())
            .collect();
        let right = LeafNode {
            entries: leaf.entries.split_off(split_point(&sizes)),
        };
        let separator = right.entries[0].0.clone();
        let left = self
            .manager
            .write_copy(Some(page_number), &Node::Leaf(leaf).to_bytes())?;
        let right = self.manager.write_copy(None, &Node::Leaf(right).to_bytes())?;
        Ok(InsertOutcome::Split(left, separator, right))
    }

    fn write_internal(
        &mut self,
        page_number: PageNumber,
        mut node: InternalNode,
    ) -> Result<InsertOutcome> {
        if node.encoded_len() <= self.manager.page_size() {
            let page_number = self
                .manager
                .write_copy(Some(page_number), &Node::Internal(node).to_bytes())?;
            return Ok(InsertOutcome::Done(page_number));
        }
        let sizes: Vec<usize> = node
            .keys
            .iter()
            .map(|k| INTERNAL_ENTRY_OVERHEAD + k.len())
            .collect();
        // keys[mid] moves up; children[..=mid] stay left
        let mid = split_point(&sizes).clamp(1, node.keys.len().saturating_sub(2).max(1));
        let right_keys = node.keys.split_off(mid + 1);
        let right_children = node.children.split_off(mid + 1);
        let separator = node.keys.pop().ok_or_else(|| corrupted(page_number, "empty split"))?;
        let right = InternalNode {
            keys: right_keys,
            children: right_children,
        };
        let left = self
            .manager
            .write_copy(Some(page_number), &Node::Internal(node).to_bytes())?;
        let right = self
            .manager
            .write_copy(None, &Node::Internal(right).to_bytes())?;
        Ok(InsertOutcome::Split(left, separator, right))
    }

    /// Removes `key`, returning its value. If the key is absent the tree is
    /// not modified.
    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = match self.root {
            Some(root) => root,
            None => return Ok(None),
        };
        match self.remove_from(root, key)? {
            None => Ok(None),
            Some((new_root, old)) => {
                self.root = new_root;
                self.collapse_root()?;
                Ok(Some(old))
            }
        }
    }

    // Returns None if the key was not found. Otherwise returns the new page
    // number of the sub-tree, or None if the sub-tree is now empty.
    fn remove_from(
        &mut self,
        page_number: PageNumber,
        key: &[u8],
    ) -> Result<Option<(Option<PageNumber>, Vec<u8>)>> {
        match read_node(self.manager, page_number)? {
            Node::Leaf(mut leaf) => {
                let index = match leaf.find(key) {
                    Ok(index) => index,
                    Err(_) => return Ok(None),
                };
                let (_, old) = leaf.entries.remove(index);
                if leaf.entries.is_empty() {
                    self.manager.free(page_number);
                    return Ok(Some((None, old)));
                }
                let page_number = self
                    .manager
                    .write_copy(Some(page_number), &Node::Leaf(leaf).to_bytes())?;
                Ok(Some((Some(page_number), old)))
            }
            Node::Internal(mut node) => {
                let index = node.child_index(key);
                let (child, old) = match self.remove_from(node.children[index], key)? {
                    None => return Ok(None),
                    Some(result) => result,
                };
                match child {
                    Some(child) => node.children[index] = child,
                    None => {
                        // Drop the empty child together with the separator bounding it
                        node.children.remove(index);
                        if !node.keys.is_empty() {
                            node.keys.remove(index.saturating_sub(1));
                        }
                        if node.children.is_empty() {
                            self.manager.free(page_number);
                            return Ok(Some((None, old)));
                        }
                    }
                }
                let page_number = self
                    .manager
                    .write_copy(Some(page_number), &Node::Internal(node).to_bytes())?;
                Ok(Some((Some(page_number), old)))
            }
        }
    }

    fn collapse_root(&mut self) -> Result<()> {
        while let Some(root) = self.root {
            match read_node(self.manager, root)? {
                Node::Internal(node) if node.children.len() == 1 => {
                    self.manager.free(root);
                    self.root = Some(node.children[0]);
                }
                _ => break,
            }
        }
        Ok(())
    }
}

/// Smallest key greater than every key starting with `prefix`, or None if
/// there is no such key.
pub(crate) fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

enum IterState {
    Unstarted,
    Running,
    Done,
}

/// Lazy ascending iterator over `[start, end)`.
///
/// Pages are read one leaf at a time as the iterator advances; no lock is held
/// between calls to `next`.
pub(crate) struct RangeIter<'a> {
    manager: &'a PageManager,
    root: Option<PageNumber>,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    // internal nodes on the path to the current leaf, with the next child to visit
    stack: Vec<(InternalNode, usize)>,
    leaf: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    state: IterState,
}

pub(crate) fn range<'a>(
    manager: &'a PageManager,
    root: Option<PageNumber>,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
) -> RangeIter<'a> {
    RangeIter {
        manager,
        root,
        start,
        end,
        stack: vec![],
        leaf: Vec::new().into_iter(),
        state: IterState::Unstarted,
    }
}

/// Iterates every entry whose key starts with `prefix`.
pub(crate) fn scan_prefix<'a>(
    manager: &'a PageManager,
    root: Option<PageNumber>,
    prefix: &[u8],
) -> RangeIter<'a> {
    range(manager, root, prefix.to_vec(), prefix_end(prefix))
}

impl<'a> RangeIter<'a> {
    fn seek(&mut self) -> Result<()> {
        let mut page_number = match self.root {
            Some(root) => root,
            None => return Ok(()),
        };
        loop {
            match read_node(self.manager, page_number)? {
                Node::Internal(node) => {
                    let index = node.child_index(&self.start);
                    page_number = node.children[index];
                    self.stack.push((node, index + 1));
                }
                Node::Leaf(leaf) => {
                    let position = leaf
                        .entries
                        .partition_point(|(k, _)| k.as_slice() < self.start.as_slice());
                    let mut entries = leaf.entries;
                    self.leaf = entries.split_off(position).into_iter();
                    return Ok(());
                }
            }
        }
    }

    // Moves to the next leaf in key order. Returns false at the end of the tree.
    fn next_leaf(&mut self) -> Result<bool> {
        let mut page_number = loop {
            match self.stack.last_mut() {
                None => return Ok(false),
                Some((node, next)) if *next < node.children.len() => {
                    let child = node.children[*next];
                    *next += 1;
                    break child;
                }
                Some(_) => {
                    self.stack.pop();
                }
            }
        };
        loop {
            match read_node(self.manager, page_number)? {
                Node::Internal(node) => {
                    page_number = node.children[0];
                    self.stack.push((node, 1));
                }
                Node::Leaf(leaf) => {
                    self.leaf = leaf.entries.into_iter();
                    return Ok(true);
                }
            }
        }
    }
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                IterState::Done => return None,
                IterState::Unstarted => {
                    self.state = IterState::Running;
                    if let Err(err) = self.seek() {
                        self.state = IterState::Done;
                        return Some(Err(err));
                    }
                }
                IterState::Running => {
                    if let Some((key, value)) = self.leaf.next() {
                        if let Some(end) = &self.end {
                            if key.as_slice() >= end.as_slice() {
                                self.state = IterState::Done;
                                return None;
                            }
                        }
                        return Some(Ok((key, value)));
                    }
                    match self.next_leaf() {
                        Ok(true) => continue,
                        Ok(false) => {
                            self.state = IterState::Done;
                            return None;
                        }
                        Err(err) => {
                            self.state = IterState::Done;
                            return Some(Err(err));
                        }
                    }
                }
            }
        }
    }
}

/// Shape of a tree, as found by [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub entries: u64,
    pub pages: u64,
    pub depth: u32,
}

/// Walks the whole tree checking key order, separator bounds and that all
/// leaves sit at the same depth.
pub(crate) fn verify(manager: &PageManager, root: Option<PageNumber>) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    let mut leaf_depth = None;
    if let Some(root) = root {
        verify_node(manager, root, None, None, 1, &mut leaf_depth, &mut stats)?;
    }
    stats.depth = leaf_depth.unwrap_or(0);
    Ok(stats)
}

fn verify_node(
    manager: &PageManager,
    page_number: PageNumber,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    depth: u32,
    leaf_depth: &mut Option<u32>,
    stats: &mut TreeStats,
) -> Result<()> {
    stats.pages += 1;
    let in_bounds = |key: &[u8]| {
        lower.map_or(true, |lower| key >= lower) && upper.map_or(true, |upper| key < upper)
    };
    match read_node(manager, page_number)? {
        Node::Leaf(leaf) => {
            if leaf.entries.is_empty() {
                return Err(corrupted(page_number, "empty leaf"));
            }
            match *leaf_depth {
                Some(expected) if expected != depth => {
                    return Err(corrupted(page_number, "leaves at different depths"))
                }
                _ => *leaf_depth = Some(depth),
            }
            for window in leaf.entries.windows(2) {
                if window[0].0.cmp(&window[1].0) != Ordering::Less {
                    return Err(corrupted(page_number, "leaf keys out of order"));
                }
            }
            if !leaf.entries.iter().all(|(k, _)| in_bounds(k.as_slice())) {
                return Err(corrupted(page_number, "leaf key outside parent bounds"));
            }
            stats.entries += leaf.entries.len() as u64;
        }
        Node::Internal(node) => {
            if node.children.len() != node.keys.len() + 1 {
                return Err(corrupted(page_number, "child count mismatch"));
            }
            if !node.keys.iter().all(|k| in_bounds(k.as_slice())) {
                return Err(corrupted(page_number, "separator outside parent bounds"));
            }
            for (i, child) in node.children.iter().enumerate() {
                let child_lower = if i == 0 {
                    lower
                } else {
                    Some(node.keys[i - 1].as_slice())
                };
                let child_upper = node.keys.get(i).map(|k| k.as_slice()).or(upper);
                verify_node(
                    manager,
                    *child,
                    child_lower,
                    child_upper,
                    depth + 1,
                    leaf_depth,
                    stats,
                )?;
            }
        }
    }
    Ok(())
}
