//! # Delta Tree
//!
//! A balanced binary search tree of prefix-compressed records packed into a
//! page at build time, immutable on disk. Each node stores left/right child
//! offsets and a delta (`record::DeltaView`) that reproduces the node's
//! record given a base: the node's greatest lesser ancestor or least
//! greater ancestor, whichever shares the longer key prefix, with the
//! page's lower and upper bound records standing in at the edges.
//!
//! ## On-page Layout
//!
//! ```text
//! TreeHeader (18 bytes):
//!   num_items u16 | node_bytes_used u32 | node_bytes_free u32 |
//!   node_bytes_deleted u32 | initial_height u8 | max_height u8 |
//!   large_nodes u8 | pad u8
//! Nodes, root first (offsets are absolute within the tree region, 0 = none):
//!   left_offset, right_offset  (u16 each, or u32 each on "large" pages)
//!   delta bytes
//! ```
//!
//! A tree is "large" when its region exceeds `u16::MAX` bytes and child
//! offsets no longer fit in 16 bits.
//!
//! ## Mirror
//!
//! `DeltaMirror` is the in-memory accessor: it decodes nodes lazily into an
//! index-linked cache (`DecodedNode`) and supports `insert` (appending a
//! new node into the page's free tail, bounded by a maximum decoded-path
//! height), `erase` (soft delete via the node's flag byte), seeks, and
//! bidirectional iteration that hides deleted nodes. Iteration order is the
//! sorted order of the surviving records, bounded by the mirror's lower and
//! upper sentinel records.
//!
//! Cursors (`DtCursor`) are plain copyable positions; every movement method
//! takes the mirror so any number of cursors can share one decode cache.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::record::{DeltaView, Record, FLAG_IS_DELETED, FLAG_PREFIX_SOURCE_PREV};
use crate::config::DELTA_TREE_SMALL_SIZE_LIMIT;
use crate::storage::PageBuf;

pub const TREE_HEADER_SIZE: usize = 18;

/// Bytes of one logical B+tree page: either a single pager page or the
/// concatenated usable areas of several.
#[derive(Debug, Clone)]
#[derive(Debug)]
pub enum PageContent {
    Single(Arc<PageBuf>),
    Multi(Arc<Vec<u8>>),
}

impl PageContent {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PageContent::Single(page) => page.usable(),
            PageContent::Multi(bytes) => bytes,
        }
    }
}

/// Backing bytes of a mirror: shared page content for reads, an owned copy
/// for in-place mutation.
#[derive(Debug, Clone)]
pub enum TreeBytes {
    Shared { content: PageContent, off: usize },
    Owned { content: Vec<u8>, off: usize },
}

impl TreeBytes {
    fn bytes(&self) -> &[u8] {
        match self {
            TreeBytes::Shared { content, off } => &content.bytes()[*off..],
            TreeBytes::Owned { content, off } => &content[*off..],
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            TreeBytes::Shared { .. } => bail!("mutation of a shared delta-tree page"),
            TreeBytes::Owned { content, off } => Ok(&mut content[*off..]),
        }
    }

    /// The full owned page content (page header included), for writing the
    /// mutated page back out.
    pub fn into_owned_content(self) -> Result<Vec<u8>> {
        match self {
            TreeBytes::Shared { .. } => bail!("shared delta-tree page has no owned content"),
            TreeBytes::Owned { content, .. } => Ok(content),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TreeHeader {
    num_items: U16,
    node_bytes_used: U32,
    node_bytes_free: U32,
    node_bytes_deleted: U32,
    initial_height: u8,
    max_height: u8,
    large_nodes: u8,
    pad: u8,
}

const _: () = assert!(std::mem::size_of::<TreeHeader>() == TREE_HEADER_SIZE);

fn header(bytes: &[u8]) -> &TreeHeader {
    TreeHeader::ref_from_bytes(&bytes[..TREE_HEADER_SIZE]).expect("tree header size")
}

fn header_mut(bytes: &mut [u8]) -> &mut TreeHeader {
    TreeHeader::mut_from_bytes(&mut bytes[..TREE_HEADER_SIZE]).expect("tree header size")
}

pub fn node_header_size(large: bool) -> usize {
    if large {
        8
    } else {
        4
    }
}

pub fn empty_tree_size() -> usize {
    TREE_HEADER_SIZE
}

fn read_child_offsets(bytes: &[u8], raw: usize, large: bool) -> (usize, usize) {
    if large {
        let left = u32::from_le_bytes(bytes[raw..raw + 4].try_into().unwrap()) as usize;
        let right = u32::from_le_bytes(bytes[raw + 4..raw + 8].try_into().unwrap()) as usize;
        (left, right)
    } else {
        let left = u16::from_le_bytes(bytes[raw..raw + 2].try_into().unwrap()) as usize;
        let right = u16::from_le_bytes(bytes[raw + 2..raw + 4].try_into().unwrap()) as usize;
        (left, right)
    }
}

fn write_child_offsets(bytes: &mut [u8], raw: usize, large: bool, left: usize, right: usize) {
    if large {
        bytes[raw..raw + 4].copy_from_slice(&(left as u32).to_le_bytes());
        bytes[raw + 4..raw + 8].copy_from_slice(&(right as u32).to_le_bytes());
    } else {
        bytes[raw..raw + 2].copy_from_slice(&(left as u16).to_le_bytes());
        bytes[raw + 2..raw + 4].copy_from_slice(&(right as u16).to_le_bytes());
    }
}

fn less_or_equal_power_of_two(n: usize) -> usize {
    let mut p = 1;
    while p + p <= n {
        p += p;
    }
    p
}

/// Inorder index of the root of a perfect (minimal height, missing nodes
/// as far right as possible) subtree of the given size.
fn perfect_subtree_split_point(count: usize) -> usize {
    let s = less_or_equal_power_of_two((count - 1) / 2 + 1) - 1;
    (s * 2 + 1).min(count - s - 1)
}

/// Builds a packed tree from sorted `records` into `buf` (the tree region
/// of a page). Returns the bytes used, including the tree header. Fails if
/// the records do not fit; callers size pages with worst-case delta
/// estimates so a failure indicates a sizing bug.
pub fn build_tree(
    buf: &mut [u8],
    records: &[Record],
    lower: &Record,
    upper: &Record,
) -> Result<usize> {
    ensure!(
        buf.len() >= TREE_HEADER_SIZE,
        "delta-tree region of {} bytes cannot hold the tree header",
        buf.len()
    );
    let large = buf.len() > DELTA_TREE_SMALL_SIZE_LIMIT;

    let used = if records.is_empty() {
        0
    } else {
        let common = lower.common_prefix_len(upper, 0);
        build_node(buf, large, records, lower, upper, common, TREE_HEADER_SIZE)?
    };

    let initial_height = if records.is_empty() {
        0
    } else {
        (usize::BITS - records.len().leading_zeros()) as u8
    };

    let node_bytes_free = (buf.len() - TREE_HEADER_SIZE - used) as u32;
    let hdr = header_mut(buf);
    *hdr = TreeHeader {
        num_items: U16::new(records.len() as u16),
        node_bytes_used: U32::new(used as u32),
        node_bytes_free: U32::new(node_bytes_free),
        node_bytes_deleted: U32::new(0),
        initial_height,
        max_height: 0,
        large_nodes: large as u8,
        pad: 0,
    };

    Ok(TREE_HEADER_SIZE + used)
}

fn build_node(
    buf: &mut [u8],
    large: bool,
    records: &[Record],
    prev: &Record,
    next: &Record,
    subtree_common: usize,
    at: usize,
) -> Result<usize> {
    debug_assert!(!records.is_empty());
    let count = records.len();
    let mid = perfect_subtree_split_point(count);
    let item = &records[mid];

    let common_with_prev = item.common_prefix_len(prev, subtree_common);
    let common_with_next = item.common_prefix_len(next, subtree_common);
    let (prefix_source_prev, common, base) = if common_with_prev >= common_with_next {
        (true, common_with_prev, prev)
    } else {
        (false, common_with_next, next)
    };

    let hdr_size = node_header_size(large);
    let delta_size = item.delta_size_with_prefix(base, common, false);
    let node_size = hdr_size + delta_size;
    ensure!(
        at + node_size <= buf.len(),
        "delta-tree build overflow at offset {} ({} byte node, {} byte region)",
        at,
        node_size,
        buf.len()
    );

    let written = item.write_delta(&mut buf[at + hdr_size..at + node_size], base, common);
    debug_assert_eq!(written, delta_size);
    if prefix_source_prev {
        buf[at + hdr_size] |= FLAG_PREFIX_SOURCE_PREV;
    }

    let mut consumed = node_size;
    let mut left_off = 0;
    let mut right_off = 0;

    if mid > 0 {
        left_off = at + consumed;
        consumed += build_node(
            buf,
            large,
            &records[..mid],
            prev,
            item,
            common_with_prev,
            left_off,
        )?;
    }
    if mid + 1 < count {
        right_off = at + consumed;
        consumed += build_node(
            buf,
            large,
            &records[mid + 1..],
            item,
            next,
            common_with_next,
            right_off,
        )?;
    }

    write_child_offsets(buf, at, large, left_off, right_off);
    Ok(consumed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Unknown,
    Null,
    Node(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeBound {
    Lower,
    Upper,
    Node(usize),
}

#[derive(Debug)]
struct DecodedNode {
    raw: usize,
    parent: Option<usize>,
    other_ancestor: Option<usize>,
    is_left_child: bool,
    left: Link,
    right: Link,
    prev: NodeBound,
    next: NodeBound,
    item: Record,
}

/// In-memory accessor for one delta-tree page: lazily decodes the packed
/// tree and supports reads plus (over an owned buffer) insert and erase.
pub struct DeltaMirror {
    buf: TreeBytes,
    lower: Record,
    upper: Record,
    large: bool,
    nodes: Vec<DecodedNode>,
    root: Option<usize>,
}

impl DeltaMirror {
    pub fn new(buf: TreeBytes, lower: Record, upper: Record) -> Result<Self> {
        let (large, has_root) = {
            let bytes = buf.bytes();
            ensure!(
                bytes.len() >= TREE_HEADER_SIZE,
                "page too small for a delta tree"
            );
            let hdr = header(bytes);
            (hdr.large_nodes != 0, hdr.node_bytes_used.get() > 0)
        };

        let mut mirror = Self {
            buf,
            lower,
            upper,
            large,
            nodes: Vec::new(),
            root: None,
        };
        if has_root {
            let root = mirror.decode_node(TREE_HEADER_SIZE, None, false)?;
            mirror.root = Some(root);
        }
        Ok(mirror)
    }

    pub fn lower_bound(&self) -> &Record {
        &self.lower
    }

    pub fn upper_bound(&self) -> &Record {
        &self.upper
    }

    pub fn num_items(&self) -> usize {
        header(self.buf.bytes()).num_items.get() as usize
    }

    pub fn node_bytes_free(&self) -> usize {
        header(self.buf.bytes()).node_bytes_free.get() as usize
    }

    /// Consumes the mirror, returning the mutated page content.
    pub fn into_content(self) -> Result<Vec<u8>> {
        self.buf.into_owned_content()
    }

    pub fn cursor(&self) -> DtCursor {
        DtCursor { node: None }
    }

    fn bound_record(&self, bound: NodeBound) -> &Record {
        match bound {
            NodeBound::Lower => &self.lower,
            NodeBound::Upper => &self.upper,
            NodeBound::Node(i) => &self.nodes[i].item,
        }
    }

    fn delta_view(&self, raw: usize) -> DeltaView<'_> {
        DeltaView::new(&self.buf.bytes()[raw + node_header_size(self.large)..])
    }

    fn node_deleted(&self, idx: usize) -> bool {
        self.delta_view(self.nodes[idx].raw).is_deleted()
    }

    fn set_node_deleted(&mut self, idx: usize, deleted: bool) -> Result<()> {
        let off = self.nodes[idx].raw + node_header_size(self.large);
        let bytes = self.buf.bytes_mut()?;
        if deleted {
            bytes[off] |= FLAG_IS_DELETED;
        } else {
            bytes[off] &= !FLAG_IS_DELETED;
        }
        Ok(())
    }

    fn prev_ancestor_of(&self, idx: usize) -> Option<usize> {
        let n = &self.nodes[idx];
        if n.parent.is_some() && n.is_left_child {
            n.other_ancestor
        } else {
            n.parent
        }
    }

    fn next_ancestor_of(&self, idx: usize) -> Option<usize> {
        let n = &self.nodes[idx];
        if n.parent.is_some() && !n.is_left_child {
            n.other_ancestor
        } else {
            n.parent
        }
    }

    fn decode_node(&mut self, raw: usize, parent: Option<usize>, is_left: bool) -> Result<usize> {
        let (prev, next, other_ancestor) = match parent {
            None => (NodeBound::Lower, NodeBound::Upper, None),
            Some(p) => {
                if is_left {
                    (self.nodes[p].prev, NodeBound::Node(p), self.prev_ancestor_of(p))
                } else {
                    (NodeBound::Node(p), self.nodes[p].next, self.next_ancestor_of(p))
                }
            }
        };

        ensure!(
            raw + node_header_size(self.large) < self.buf.bytes().len(),
            "delta-tree node offset {} out of bounds",
            raw
        );

        let item = {
            let view = self.delta_view(raw);
            let base = if view.prefix_source_prev() {
                self.bound_record(prev)
            } else {
                self.bound_record(next)
            };
            view.apply(base)
        };

        self.nodes.push(DecodedNode {
            raw,
            parent,
            other_ancestor,
            is_left_child: is_left,
            left: Link::Unknown,
            right: Link::Unknown,
            prev,
            next,
            item,
        });
        Ok(self.nodes.len() - 1)
    }

    fn left_child(&mut self, idx: usize) -> Result<Option<usize>> {
        match self.nodes[idx].left {
            Link::Null => Ok(None),
            Link::Node(i) => Ok(Some(i)),
            Link::Unknown => {
                let raw = self.nodes[idx].raw;
                let (left, _) = read_child_offsets(self.buf.bytes(), raw, self.large);
                if left == 0 {
                    self.nodes[idx].left = Link::Null;
                    Ok(None)
                } else {
                    let child = self.decode_node(left, Some(idx), true)?;
                    self.nodes[idx].left = Link::Node(child);
                    Ok(Some(child))
                }
            }
        }
    }

    fn right_child(&mut self, idx: usize) -> Result<Option<usize>> {
        match self.nodes[idx].right {
            Link::Null => Ok(None),
            Link::Node(i) => Ok(Some(i)),
            Link::Unknown => {
                let raw = self.nodes[idx].raw;
                let (_, right) = read_child_offsets(self.buf.bytes(), raw, self.large);
                if right == 0 {
                    self.nodes[idx].right = Link::Null;
                    Ok(None)
                } else {
                    let child = self.decode_node(right, Some(idx), false)?;
                    self.nodes[idx].right = Link::Node(child);
                    Ok(Some(child))
                }
            }
        }
    }

    /// Inserts `rec`, appending a node into the page's free tail. Returns
    /// `Ok(false)` without modifying anything when the record is already
    /// present (and not deleted), does not fit in the remaining space, or
    /// would land deeper than `max_height` (the caller's signal to switch
    /// from in-place update to a linear-merge rewrite).
    pub fn insert(&mut self, rec: &Record, skip: usize, max_height: usize) -> Result<bool> {
        let mut height = 1usize;
        let mut at = self.root;
        let mut add_left_child = false;
        let mut parent = None;

        while let Some(idx) = at {
            let cmp = rec.compare(&self.nodes[idx].item, skip);
            parent = Some(idx);
            match cmp {
                std::cmp::Ordering::Equal => {
                    return if self.node_deleted(idx) {
                        self.set_node_deleted(idx, false)?;
                        let bytes = self.buf.bytes_mut()?;
                        let hdr = header_mut(bytes);
                        hdr.num_items = U16::new(hdr.num_items.get() + 1);
                        Ok(true)
                    } else {
                        Ok(false)
                    };
                }
                std::cmp::Ordering::Greater => {
                    let right = self.right_child(idx)?;
                    if right.is_none() {
                        add_left_child = false;
                        break;
                    }
                    at = right;
                }
                std::cmp::Ordering::Less => {
                    let left = self.left_child(idx)?;
                    if left.is_none() {
                        add_left_child = true;
                        break;
                    }
                    at = left;
                }
            }
            height += 1;
        }

        if height > max_height {
            return Ok(false);
        }

        let (prev, next) = match parent {
            None => (NodeBound::Lower, NodeBound::Upper),
            Some(p) => {
                if add_left_child {
                    (self.nodes[p].prev, NodeBound::Node(p))
                } else {
                    (NodeBound::Node(p), self.nodes[p].next)
                }
            }
        };

        let common = {
            let p = self.bound_record(prev);
            let n = self.bound_record(next);
            p.common_prefix_len(n, skip)
        };
        let common_with_prev = rec.common_prefix_len(self.bound_record(prev), common);
        let common_with_next = rec.common_prefix_len(self.bound_record(next), common);
        let (base_prev, common_prefix) = if common_with_prev >= common_with_next {
            (true, common_with_prev)
        } else {
            (false, common_with_next)
        };

        let hdr_size = node_header_size(self.large);
        let (delta_size, raw) = {
            let base = self.bound_record(if base_prev { prev } else { next });
            let delta_size = rec.delta_size_with_prefix(base, common_prefix, false);
            let bytes = self.buf.bytes();
            let hdr = header(bytes);
            let node_space = hdr_size + delta_size;
            if node_space > hdr.node_bytes_free.get() as usize {
                return Ok(false);
            }
            let raw = TREE_HEADER_SIZE + hdr.node_bytes_used.get() as usize;
            ensure!(
                raw + node_space <= bytes.len(),
                "delta-tree free-byte accounting exceeds page bounds"
            );
            (delta_size, raw)
        };

        // Serialize the new node into the free tail of the page.
        {
            let base = self.bound_record(if base_prev { prev } else { next }).clone();
            let large = self.large;
            let bytes = self.buf.bytes_mut()?;
            write_child_offsets(bytes, raw, large, 0, 0);
            let written = rec.write_delta(
                &mut bytes[raw + hdr_size..raw + hdr_size + delta_size],
                &base,
                common_prefix,
            );
            debug_assert_eq!(written, delta_size);
            if base_prev {
                bytes[raw + hdr_size] |= FLAG_PREFIX_SOURCE_PREV;
            }

            let node_space = hdr_size + delta_size;
            let hdr = header_mut(bytes);
            hdr.num_items = U16::new(hdr.num_items.get() + 1);
            hdr.node_bytes_used = U32::new(hdr.node_bytes_used.get() + node_space as u32);
            hdr.node_bytes_free = U32::new(hdr.node_bytes_free.get() - node_space as u32);
            if height as u8 > hdr.max_height {
                hdr.max_height = height as u8;
            }
        }

        // Link from the parent, both on page and in the decode cache.
        let new_idx = self.nodes.len();
        let (other_ancestor, is_left) = match parent {
            None => (None, false),
            Some(p) => {
                let other = if add_left_child {
                    self.prev_ancestor_of(p)
                } else {
                    self.next_ancestor_of(p)
                };
                (other, add_left_child)
            }
        };

        if let Some(p) = parent {
            let parent_raw = self.nodes[p].raw;
            let large = self.large;
            let bytes = self.buf.bytes_mut()?;
            let (mut left, mut right) = read_child_offsets(bytes, parent_raw, large);
            if add_left_child {
                left = raw;
            } else {
                right = raw;
            }
            write_child_offsets(bytes, parent_raw, large, left, right);
            if add_left_child {
                self.nodes[p].left = Link::Node(new_idx);
            } else {
                self.nodes[p].right = Link::Node(new_idx);
            }
        }

        self.nodes.push(DecodedNode {
            raw,
            parent,
            other_ancestor,
            is_left_child: is_left,
            left: Link::Null,
            right: Link::Null,
            prev,
            next,
            item: rec.clone(),
        });
        if parent.is_none() {
            self.root = Some(new_idx);
        }

        Ok(true)
    }

    /// Erases `rec` by marking its node deleted. Returns false if absent.
    pub fn erase(&mut self, rec: &Record, skip: usize) -> Result<bool> {
        let mut c = self.cursor();
        if c.seek(self, rec, skip)? {
            c.erase(self)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn erase_at(&mut self, idx: usize) -> Result<()> {
        let size = {
            let view = self.delta_view(self.nodes[idx].raw);
            view.total_size()
        };
        self.set_node_deleted(idx, true)?;
        let bytes = self.buf.bytes_mut()?;
        let hdr = header_mut(bytes);
        hdr.num_items = U16::new(hdr.num_items.get() - 1);
        hdr.node_bytes_deleted = U32::new(hdr.node_bytes_deleted.get() + size as u32);
        Ok(())
    }
}

/// A position in a delta-tree page. Copyable; all movement goes through a
/// `DeltaMirror` so cursors share one decode cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtCursor {
    node: Option<usize>,
}

impl DtCursor {
    pub fn invalid() -> Self {
        Self { node: None }
    }

    pub fn valid(&self) -> bool {
        self.node.is_some()
    }

    pub fn get(&self, m: &DeltaMirror) -> Record {
        m.nodes[self.node.expect("cursor invalid")].item.clone()
    }

    pub fn get_ref<'m>(&self, m: &'m DeltaMirror) -> &'m Record {
        &m.nodes[self.node.expect("cursor invalid")].item
    }

    /// The record at the cursor, or the mirror's upper bound when invalid.
    pub fn get_or_upper(&self, m: &DeltaMirror) -> Record {
        match self.node {
            Some(i) => m.nodes[i].item.clone(),
            None => m.upper.clone(),
        }
    }

    /// Marks the current node deleted and advances to the next surviving
    /// record.
    pub fn erase(&mut self, m: &mut DeltaMirror) -> Result<()> {
        let idx = self.node.expect("cursor invalid");
        m.erase_at(idx)?;
        self.move_next(m)?;
        Ok(())
    }

    pub fn move_first(&mut self, m: &mut DeltaMirror) -> Result<bool> {
        self.node = m.root;
        let mut n = m.root;
        while let Some(idx) = n {
            n = m.left_child(idx)?;
            if n.is_some() {
                self.node = n;
            }
        }
        self.hide_deleted_forward(m)
    }

    pub fn move_last(&mut self, m: &mut DeltaMirror) -> Result<bool> {
        self.node = m.root;
        let mut n = m.root;
        while let Some(idx) = n {
            n = m.right_child(idx)?;
            if n.is_some() {
                self.node = n;
            }
        }
        self.hide_deleted_backward(m)
    }

    fn step_next(&mut self, m: &mut DeltaMirror) -> Result<()> {
        let idx = self.node.expect("cursor invalid");
        match m.right_child(idx)? {
            None => self.node = m.next_ancestor_of(idx),
            Some(mut n) => {
                self.node = Some(n);
                while let Some(left) = m.left_child(n)? {
                    self.node = Some(left);
                    n = left;
                }
            }
        }
        Ok(())
    }

    fn step_prev(&mut self, m: &mut DeltaMirror) -> Result<()> {
        let idx = self.node.expect("cursor invalid");
        match m.left_child(idx)? {
            None => self.node = m.prev_ancestor_of(idx),
            Some(mut n) => {
                self.node = Some(n);
                while let Some(right) = m.right_child(n)? {
                    self.node = Some(right);
                    n = right;
                }
            }
        }
        Ok(())
    }

    pub fn move_next(&mut self, m: &mut DeltaMirror) -> Result<bool> {
        self.step_next(m)?;
        self.hide_deleted_forward(m)
    }

    pub fn move_prev(&mut self, m: &mut DeltaMirror) -> Result<bool> {
        self.step_prev(m)?;
        self.hide_deleted_backward(m)
    }

    fn hide_deleted_forward(&mut self, m: &mut DeltaMirror) -> Result<bool> {
        while let Some(idx) = self.node {
            if !m.node_deleted(idx) {
                return Ok(true);
            }
            self.step_next(m)?;
        }
        Ok(false)
    }

    fn hide_deleted_backward(&mut self, m: &mut DeltaMirror) -> Result<bool> {
        while let Some(idx) = self.node {
            if !m.node_deleted(idx) {
                return Ok(true);
            }
            self.step_prev(m)?;
        }
        Ok(false)
    }

    /// Moves to the node equal to `rec`; false (and an invalid position) if
    /// absent or deleted.
    pub fn seek(&mut self, m: &mut DeltaMirror, rec: &Record, skip: usize) -> Result<bool> {
        let mut n = m.root;
        self.node = None;
        while let Some(idx) = n {
            match rec.compare(&m.nodes[idx].item, skip) {
                std::cmp::Ordering::Equal => {
                    if m.node_deleted(idx) {
                        return Ok(false);
                    }
                    self.node = Some(idx);
                    return Ok(true);
                }
                std::cmp::Ordering::Greater => n = m.right_child(idx)?,
                std::cmp::Ordering::Less => n = m.left_child(idx)?,
            }
        }
        Ok(false)
    }

    /// Moves to the greatest record `<= rec`.
    pub fn seek_less_than_or_equal(
        &mut self,
        m: &mut DeltaMirror,
        rec: &Record,
        skip: usize,
    ) -> Result<bool> {
        let mut n = m.root;
        self.node = None;
        while let Some(idx) = n {
            match rec.compare(&m.nodes[idx].item, skip) {
                std::cmp::Ordering::Less => n = m.left_child(idx)?,
                std::cmp::Ordering::Equal => {
                    self.node = Some(idx);
                    break;
                }
                std::cmp::Ordering::Greater => {
                    self.node = Some(idx);
                    n = m.right_child(idx)?;
                }
            }
        }
        self.hide_deleted_backward(m)
    }

    /// Moves to the greatest record strictly less than `rec`.
    pub fn seek_less_than(
        &mut self,
        m: &mut DeltaMirror,
        rec: &Record,
        skip: usize,
    ) -> Result<bool> {
        let mut n = m.root;
        self.node = None;
        while let Some(idx) = n {
            match rec.compare(&m.nodes[idx].item, skip) {
                std::cmp::Ordering::Greater => {
                    self.node = Some(idx);
                    n = m.right_child(idx)?;
                }
                _ => n = m.left_child(idx)?,
            }
        }
        self.hide_deleted_backward(m)
    }

    /// Moves to the least record `>= rec`.
    pub fn seek_greater_than_or_equal(
        &mut self,
        m: &mut DeltaMirror,
        rec: &Record,
        skip: usize,
    ) -> Result<bool> {
        let mut n = m.root;
        self.node = None;
        while let Some(idx) = n {
            match rec.compare(&m.nodes[idx].item, skip) {
                std::cmp::Ordering::Greater => n = m.right_child(idx)?,
                std::cmp::Ordering::Equal => {
                    self.node = Some(idx);
                    break;
                }
                std::cmp::Ordering::Less => {
                    self.node = Some(idx);
                    n = m.left_child(idx)?;
                }
            }
        }
        self.hide_deleted_forward(m)
    }
}

/// Walks every surviving record's value bytes without decoding keys or
/// versions (no base records needed). Used by the lazy subtree deletion
/// pass to enumerate child page links cheaply.
pub fn walk_values(tree_bytes: &[u8], mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
    ensure!(
        tree_bytes.len() >= TREE_HEADER_SIZE,
        "page too small for a delta tree"
    );
    let hdr = header(tree_bytes);
    if hdr.node_bytes_used.get() == 0 {
        return Ok(());
    }
    let large = hdr.large_nodes != 0;
    let hdr_size = node_header_size(large);

    let mut stack = vec![TREE_HEADER_SIZE];
    while let Some(raw) = stack.pop() {
        ensure!(
            raw + hdr_size < tree_bytes.len(),
            "delta-tree node offset {} out of bounds",
            raw
        );
        let view = DeltaView::new(&tree_bytes[raw + hdr_size..]);
        if !view.is_deleted() {
            if let Some(value) = view.value() {
                f(value)?;
            }
        }
        let (left, right) = read_child_offsets(tree_bytes, raw, large);
        if left != 0 {
            stack.push(left);
        }
        if right != 0 {
            stack.push(right);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &str, version: u64, value: Option<&str>) -> Record {
        Record::new(
            key.as_bytes().to_vec(),
            version,
            value.map(|v| v.as_bytes().to_vec()),
        )
    }

    fn bounds() -> (Record, Record) {
        (rec("", 0, None), Record::new(vec![0xFF; 12], 0, None))
    }

    fn sorted_records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| rec(&format!("key{:05}", i), 0, Some(&format!("val{}", i))))
            .collect()
    }

    fn build_mirror(records: &[Record]) -> DeltaMirror {
        let (lower, upper) = bounds();
        let mut buf = vec![0u8; 16384];
        build_tree(&mut buf, records, &lower, &upper).unwrap();
        DeltaMirror::new(
            TreeBytes::Owned {
                content: buf,
                off: 0,
            },
            lower,
            upper,
        )
        .unwrap()
    }

    #[test]
    fn build_then_forward_iteration_matches_input() {
        let records = sorted_records(100);
        let mut m = build_mirror(&records);
        assert_eq!(m.num_items(), 100);

        let mut c = m.cursor();
        assert!(c.move_first(&mut m).unwrap());
        for expected in &records {
            assert_eq!(&c.get(&m), expected);
            c.move_next(&mut m).unwrap();
        }
        assert!(!c.valid());
    }

    #[test]
    fn build_then_reverse_iteration_matches_reverse() {
        let records = sorted_records(77);
        let mut m = build_mirror(&records);

        let mut c = m.cursor();
        assert!(c.move_last(&mut m).unwrap());
        for expected in records.iter().rev() {
            assert_eq!(&c.get(&m), expected);
            c.move_prev(&mut m).unwrap();
        }
        assert!(!c.valid());
    }

    #[test]
    fn empty_tree_has_no_positions() {
        let mut m = build_mirror(&[]);
        let mut c = m.cursor();
        assert!(!c.move_first(&mut m).unwrap());
        assert!(!c.move_last(&mut m).unwrap());
        assert_eq!(m.num_items(), 0);
    }

    #[test]
    fn seeks_find_expected_records() {
        let records = sorted_records(50);
        let mut m = build_mirror(&records);
        let mut c = m.cursor();

        assert!(c.seek(&mut m, &records[17], 0).unwrap());
        assert_eq!(c.get(&m), records[17]);

        let probe = rec("key00017zzz", 0, None);
        assert!(c.seek_less_than_or_equal(&mut m, &probe, 0).unwrap());
        assert_eq!(c.get(&m), records[17]);

        assert!(c.seek_greater_than_or_equal(&mut m, &probe, 0).unwrap());
        assert_eq!(c.get(&m), records[18]);

        assert!(c.seek_less_than(&mut m, &records[17], 0).unwrap());
        assert_eq!(c.get(&m), records[16]);

        // Below the first record.
        assert!(!c.seek_less_than(&mut m, &records[0], 0).unwrap());
        // Above the last record.
        let high = rec("zzz", 0, None);
        assert!(!c.seek_greater_than_or_equal(&mut m, &high, 0).unwrap());
        assert!(c.seek_less_than_or_equal(&mut m, &high, 0).unwrap());
        assert_eq!(c.get(&m), records[49]);
    }

    #[test]
    fn insert_into_existing_tree() {
        let records = sorted_records(20);
        let mut m = build_mirror(&records);

        let new = rec("key00005a", 0, Some("inserted"));
        assert!(m.insert(&new, 0, 64).unwrap());
        assert_eq!(m.num_items(), 21);

        let mut c = m.cursor();
        assert!(c.seek(&mut m, &new, 0).unwrap());

        // Iteration order includes the insertion at the right place.
        let mut all = Vec::new();
        let mut c = m.cursor();
        let mut ok = c.move_first(&mut m).unwrap();
        while ok {
            all.push(c.get(&m));
            ok = c.move_next(&mut m).unwrap();
        }
        let mut expected = records.clone();
        expected.insert(6, new);
        assert_eq!(all, expected);
    }

    #[test]
    fn insert_duplicate_fails() {
        let records = sorted_records(10);
        let mut m = build_mirror(&records);
        assert!(!m.insert(&records[3], 0, 64).unwrap());
    }

    #[test]
    fn erase_hides_record_and_reinsert_revives_it() {
        let records = sorted_records(10);
        let mut m = build_mirror(&records);

        assert!(m.erase(&records[4], 0).unwrap());
        assert_eq!(m.num_items(), 9);

        let mut c = m.cursor();
        assert!(!c.seek(&mut m, &records[4], 0).unwrap());
        assert!(c.seek_greater_than_or_equal(&mut m, &records[4], 0).unwrap());
        assert_eq!(c.get(&m), records[5]);

        // Erasing again reports absence.
        assert!(!m.erase(&records[4], 0).unwrap());

        // Reinserting un-deletes in place.
        assert!(m.insert(&records[4], 0, 64).unwrap());
        assert_eq!(m.num_items(), 10);
        assert!(c.seek(&mut m, &records[4], 0).unwrap());
    }

    #[test]
    fn erase_all_then_iterate_empty() {
        let records = sorted_records(8);
        let mut m = build_mirror(&records);
        for r in &records {
            assert!(m.erase(r, 0).unwrap());
        }
        assert_eq!(m.num_items(), 0);
        let mut c = m.cursor();
        assert!(!c.move_first(&mut m).unwrap());
    }

    #[test]
    fn insert_respects_height_bound() {
        let records = sorted_records(64);
        let mut m = build_mirror(&records);
        // The perfect tree of 64 nodes has height 7; a bound of 1 can only
        // fail for any new key.
        let new = rec("key00010a", 0, None);
        assert!(!m.insert(&new, 0, 1).unwrap());
    }

    #[test]
    fn insert_fails_when_page_full() {
        let (lower, upper) = bounds();
        let records = sorted_records(4);
        let mut buf = vec![0u8; 0];
        // Size the region to exactly fit the built tree, leaving no free
        // tail for inserts.
        let mut probe = vec![0u8; 16384];
        let used = build_tree(&mut probe, &records, &lower, &upper).unwrap();
        buf.resize(used, 0);
        build_tree(&mut buf, &records, &lower, &upper).unwrap();

        let mut m = DeltaMirror::new(
            TreeBytes::Owned {
                content: buf,
                off: 0,
            },
            lower,
            upper,
        )
        .unwrap();
        let new = rec("key-that-does-not-fit", 0, Some("xxxxxxxxxxxxxxxx"));
        assert!(!m.insert(&new, 0, 64).unwrap());
    }

    #[test]
    fn insert_into_empty_tree_builds_root() {
        let mut m = build_mirror(&[]);
        let new = rec("first", 3, Some("value"));
        assert!(m.insert(&new, 0, 64).unwrap());
        assert_eq!(m.num_items(), 1);

        let mut c = m.cursor();
        assert!(c.move_first(&mut m).unwrap());
        assert_eq!(c.get(&m), new);
        assert!(!c.move_next(&mut m).unwrap());
    }

    #[test]
    fn value_walk_sees_all_values_without_bases() {
        let records: Vec<Record> = (0..30)
            .map(|i| {
                let mut r = rec(&format!("node{:03}", i), 0, None);
                r.set_child_pages(&[100 + i as u64]);
                r
            })
            .collect();
        let (lower, upper) = bounds();
        let mut buf = vec![0u8; 16384];
        build_tree(&mut buf, &records, &lower, &upper).unwrap();

        let mut seen = Vec::new();
        walk_values(&buf, |value| {
            seen.push(u64::from_le_bytes(value.try_into().unwrap()));
            Ok(())
        })
        .unwrap();
        seen.sort_unstable();
        let expected: Vec<u64> = (100..130).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn large_page_uses_wide_offsets() {
        let records: Vec<Record> = (0..2000)
            .map(|i| rec(&format!("key{:06}", i), 0, Some(&"v".repeat(40))))
            .collect();
        let (lower, upper) = bounds();
        let mut buf = vec![0u8; 128 * 1024];
        build_tree(&mut buf, &records, &lower, &upper).unwrap();
        assert_eq!(header(&buf).large_nodes, 1);

        let mut m = DeltaMirror::new(
            TreeBytes::Owned {
                content: buf,
                off: 0,
            },
            lower,
            upper,
        )
        .unwrap();
        let mut c = m.cursor();
        assert!(c.move_first(&mut m).unwrap());
        let mut count = 0;
        let mut ok = true;
        while ok {
            count += 1;
            ok = c.move_next(&mut m).unwrap();
        }
        assert_eq!(count, 2000);
    }
}
