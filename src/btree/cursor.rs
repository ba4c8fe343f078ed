//! # Read Cursors
//!
//! User-visible, bidirectional iteration over `(key -> value)` pairs at a
//! snapshot version.
//!
//! ## Two-cursor Rule
//!
//! Leaf records are `(key, version, optional value)` and the format allows
//! several internal versions per key (the current writer emits only
//! version 0, but the reader stays general). `ReadCursor` therefore keeps
//! two leaf cursors: `cur1` holds the candidate record and `cur2` trails
//! one step ahead. A user-visible pair exists at `cur1` iff its record is
//! present (has a value) at version `v` AND either its version is exactly
//! `v` or the record at `cur2` is invalid, at a different key, or not in
//! effect at `v`. In other words, `cur1` must be the newest record for its
//! key that the snapshot version can see.
//!
//! ## Seeking
//!
//! All three find operations start by seeking `cur1` strictly less than
//! `(key, v+1)` and then settle forward or backward to the comparison
//! mode. A positive prefetch budget asks the pager to speculatively load
//! right siblings of height-2 ancestors, charged per page read.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::btree::deltatree::{DeltaMirror, DtCursor, PageContent, TreeBytes};
use crate::btree::record::{PageIds, Record};
use crate::btree::{db_begin, db_end, BTREE_PAGE_HEADER_SIZE};
use crate::pager::{Pager, Snapshot};

fn read_content(
    pager: &mut Pager,
    snapshot: &Snapshot,
    ids: &PageIds,
    no_hit: bool,
) -> Result<PageContent> {
    if ids.len() == 1 {
        return Ok(PageContent::Single(pager.snapshot_read(
            snapshot,
            ids[0],
            true,
            no_hit,
        )?));
    }
    let mut bytes = Vec::with_capacity(ids.len() * pager.usable_page_size());
    for id in ids {
        let page = pager.snapshot_read(snapshot, *id, true, no_hit)?;
        bytes.extend_from_slice(page.usable());
    }
    Ok(PageContent::Multi(Arc::new(bytes)))
}

#[derive(Clone, Debug)]
struct PathEntry {
    ids: PageIds,
    height: u8,
    mirror: Rc<RefCell<DeltaMirror>>,
    pos: DtCursor,
}

/// Cursor over the leaf-level records of the tree at one snapshot. The
/// page path is a stack of shared page mirrors, so cloning a cursor (as
/// the two-cursor rule does constantly) shares every decode cache.
#[derive(Clone)]
#[derive(Debug)]
pub(crate) struct LeafCursor {
    root: PageIds,
    path: Vec<PathEntry>,
}

impl LeafCursor {
    pub(crate) fn new(root: PageIds) -> Self {
        Self {
            root,
            path: Vec::new(),
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.path
            .last()
            .map_or(false, |e| e.height == 1 && e.pos.valid())
    }

    pub(crate) fn record(&self) -> Record {
        let entry = self.path.last().expect("cursor has no position");
        entry.pos.get(&entry.mirror.borrow())
    }

    pub(crate) fn present(&self) -> bool {
        if !self.valid() {
            return false;
        }
        let entry = self.path.last().unwrap();
        entry.pos.get_ref(&entry.mirror.borrow()).value.is_some()
    }

    pub(crate) fn valid_at_version(&self, version: u64) -> bool {
        if !self.valid() {
            return false;
        }
        let entry = self.path.last().unwrap();
        entry.pos.get_ref(&entry.mirror.borrow()).version <= version
    }

    fn move_to_root(&mut self, pager: &mut Pager, snapshot: &Snapshot) -> Result<()> {
        if !self.path.is_empty() {
            self.path.truncate(1);
            return Ok(());
        }
        let ids = self.root.clone();
        let content = read_content(pager, snapshot, &ids, false)?;
        let height = content.bytes()[0];
        let mirror = DeltaMirror::new(
            TreeBytes::Shared {
                content,
                off: BTREE_PAGE_HEADER_SIZE,
            },
            db_begin(),
            db_end(),
        )?;
        self.path.push(PathEntry {
            ids,
            height,
            mirror: Rc::new(RefCell::new(mirror)),
            pos: DtCursor::invalid(),
        });
        Ok(())
    }

    /// Reads the child page under the top cursor position and pushes it
    /// onto the path. With a prefetch budget and a height-2 parent, right
    /// siblings are speculatively loaded into the cache.
    fn descend(
        &mut self,
        pager: &mut Pager,
        snapshot: &Snapshot,
        mut prefetch_bytes: usize,
    ) -> Result<()> {
        let (child_ids, child_lower, child_upper, parent_height, sibling_pos) = {
            let entry = self.path.last().expect("descend from empty path");
            let mut mirror = entry.mirror.borrow_mut();
            let link = entry.pos.get(&mirror);
            let mut next_pos = entry.pos;
            next_pos.move_next(&mut mirror)?;
            let upper = next_pos.get_or_upper(&mirror);
            (
                link.child_page_ids()?,
                link.without_value(),
                upper.without_value(),
                entry.height,
                next_pos,
            )
        };

        if prefetch_bytes > 0 && parent_height == 2 && sibling_pos.valid() {
            let entry = self.path.last().unwrap();
            let mirror = Rc::clone(&entry.mirror);
            let mut pos = sibling_pos;
            let mut m = mirror.borrow_mut();
            loop {
                let rec = pos.get(&m);
                if rec.value.is_some() {
                    let ids = rec.child_page_ids()?;
                    for id in &ids {
                        pager.snapshot_read(snapshot, *id, true, true)?;
                        prefetch_bytes =
                            prefetch_bytes.saturating_sub(pager.logical_page_size());
                    }
                }
                if prefetch_bytes == 0 || !pos.move_next(&mut m)? {
                    break;
                }
            }
        }

        let content = read_content(pager, snapshot, &child_ids, false)?;
        let height = content.bytes()[0];
        let mirror = DeltaMirror::new(
            TreeBytes::Shared {
                content,
                off: BTREE_PAGE_HEADER_SIZE,
            },
            child_lower,
            child_upper,
        )?;
        self.path.push(PathEntry {
            ids: child_ids,
            height,
            mirror: Rc::new(RefCell::new(mirror)),
            pos: DtCursor::invalid(),
        });
        Ok(())
    }

    /// Seeks to the greatest leaf record strictly less than `query`,
    /// descending from the root. On failure the cursor settles on the
    /// previous leaf record if any.
    pub(crate) fn seek_less_than(
        &mut self,
        pager: &mut Pager,
        snapshot: &Snapshot,
        query: &Record,
        prefetch_bytes: usize,
    ) -> Result<bool> {
        self.move_to_root(pager, snapshot)?;

        loop {
            let (success, is_leaf) = {
                let entry = self.path.last_mut().unwrap();
                let mut mirror = entry.mirror.borrow_mut();
                let mut ok = entry.pos.seek_less_than(&mut mirror, query, 0)?;
                if entry.height > 1 {
                    // Value-less records bound children but link nowhere.
                    while ok && entry.pos.get_ref(&mirror).value.is_none() {
                        ok = entry.pos.move_prev(&mut mirror)?;
                    }
                }
                (ok, entry.height == 1)
            };

            if success {
                if is_leaf {
                    return Ok(true);
                }
                self.descend(pager, snapshot, prefetch_bytes)?;
            } else {
                // Nothing below the query on this page: the answer is the
                // immediately previous leaf record, reached by moving up.
                return self.move_dir(pager, snapshot, false);
            }
        }
    }

    /// Moves to the neighboring leaf record, walking up and back down the
    /// page path as needed. Returns false at the end of the tree.
    pub(crate) fn move_dir(
        &mut self,
        pager: &mut Pager,
        snapshot: &Snapshot,
        forward: bool,
    ) -> Result<bool> {
        loop {
            let moved = {
                let entry = self.path.last_mut().expect("move on unseeked cursor");
                let mut mirror = entry.mirror.borrow_mut();
                let mut ok = entry.pos.valid()
                    && if forward {
                        entry.pos.move_next(&mut mirror)?
                    } else {
                        entry.pos.move_prev(&mut mirror)?
                    };
                if entry.height > 1 {
                    while ok && entry.pos.get_ref(&mirror).value.is_none() {
                        ok = if forward {
                            entry.pos.move_next(&mut mirror)?
                        } else {
                            entry.pos.move_prev(&mut mirror)?
                        };
                    }
                }
                ok
            };

            if moved {
                break;
            }
            if self.path.len() == 1 {
                return Ok(false);
            }
            self.path.pop();
        }

        // Walk back down to the leaf level.
        while self.path.last().unwrap().height > 1 {
            self.descend(pager, snapshot, 0)?;
            let settled = {
                let entry = self.path.last_mut().unwrap();
                let mut mirror = entry.mirror.borrow_mut();
                let mut ok = if forward {
                    entry.pos.move_first(&mut mirror)?
                } else {
                    entry.pos.move_last(&mut mirror)?
                };
                if entry.height > 1 {
                    while ok && entry.pos.get_ref(&mirror).value.is_none() {
                        ok = if forward {
                            entry.pos.move_next(&mut mirror)?
                        } else {
                            entry.pos.move_prev(&mut mirror)?
                        };
                    }
                }
                ok
            };
            if !settled {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Moves to the first or last leaf record of the tree.
    pub(crate) fn move_extreme(
        &mut self,
        pager: &mut Pager,
        snapshot: &Snapshot,
        first: bool,
    ) -> Result<bool> {
        self.move_to_root(pager, snapshot)?;
        loop {
            let (success, is_leaf) = {
                let entry = self.path.last_mut().unwrap();
                let mut mirror = entry.mirror.borrow_mut();
                let mut ok = if first {
                    entry.pos.move_first(&mut mirror)?
                } else {
                    entry.pos.move_last(&mut mirror)?
                };
                if entry.height > 1 {
                    while ok && entry.pos.get_ref(&mirror).value.is_none() {
                        ok = if first {
                            entry.pos.move_next(&mut mirror)?
                        } else {
                            entry.pos.move_prev(&mut mirror)?
                        };
                    }
                }
                (ok, entry.height == 1)
            };
            if !success {
                return Ok(false);
            }
            if is_leaf {
                return Ok(true);
            }
            self.descend(pager, snapshot, 0)?;
        }
    }
}

/// Bidirectional cursor over user-visible `(key -> value)` pairs at a
/// snapshot version.
#[derive(Debug)]
pub struct ReadCursor<'a> {
    pager: &'a mut Pager,
    snapshot: Snapshot,
    version: u64,
    cur1: LeafCursor,
    cur2: LeafCursor,
    kv: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a> ReadCursor<'a> {
    pub(crate) fn new(
        pager: &'a mut Pager,
        snapshot: Snapshot,
        root: PageIds,
        version: u64,
    ) -> Self {
        Self {
            pager,
            snapshot,
            version,
            cur1: LeafCursor::new(root.clone()),
            cur2: LeafCursor::new(root),
            kv: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kv.is_some()
    }

    pub fn key(&self) -> &[u8] {
        &self.kv.as_ref().expect("cursor is not valid").0
    }

    pub fn value(&self) -> &[u8] {
        &self.kv.as_ref().expect("cursor is not valid").1
    }

    pub fn take_value(&mut self) -> Option<Vec<u8>> {
        self.kv.take().map(|(_, v)| v)
    }

    pub fn find_equal(&mut self, key: &[u8]) -> Result<()> {
        self.find(key, 0, 0)
    }

    pub fn find_first_equal_or_greater(&mut self, key: &[u8], prefetch_bytes: usize) -> Result<()> {
        self.find(key, 1, prefetch_bytes)
    }

    pub fn find_last_less_or_equal(&mut self, key: &[u8], prefetch_bytes: usize) -> Result<()> {
        self.find(key, -1, prefetch_bytes)
    }

    pub fn next(&mut self) -> Result<()> {
        self.step(true)
    }

    pub fn prev(&mut self) -> Result<()> {
        self.step(false)
    }

    /// Seek to the key closest to `key` under the comparison mode:
    /// `cmp == 0` exact, `cmp > 0` first greater-or-equal, `cmp < 0` last
    /// less-or-equal.
    fn find(&mut self, key: &[u8], cmp: i32, prefetch_bytes: usize) -> Result<()> {
        let query = Record::new(key.to_vec(), self.version + 1, None);
        self.kv = None;

        self.cur1
            .seek_less_than(self.pager, &self.snapshot, &query, prefetch_bytes)?;

        // An exact present match satisfies every comparison mode.
        if self.cur1.present() {
            let rec = self.cur1.record();
            if rec.key == key {
                self.kv = Some((rec.key, rec.value.unwrap()));
                return Ok(());
            }
        }

        if cmp == 0 {
            return Ok(());
        }

        if cmp > 0 {
            if !self.cur1.valid() {
                // The query is below the first record of the tree.
                if !self.cur1.move_extreme(self.pager, &self.snapshot, true)? {
                    return Ok(());
                }
            } else {
                // Move past every remaining record of the query key; with
                // multi-version records the next one could share it.
                loop {
                    if !self.cur1.move_dir(self.pager, &self.snapshot, true)? {
                        return Ok(());
                    }
                    if self.cur1.record().key.as_slice() > key {
                        break;
                    }
                }
            }
            self.step(true)
        } else {
            if !self.cur1.valid() {
                return Ok(());
            }
            self.step(false)
        }
    }

    /// Moves to the neighboring user-visible pair. With `kv` set this
    /// advances past the returned key; with `kv` empty it settles at the
    /// current internal position (used by the find operations).
    fn step(&mut self, forward: bool) -> Result<()> {
        ensure!(self.cur1.valid(), "cursor step without a leaf position");

        if self.kv.is_some() {
            loop {
                self.cur2 = self.cur1.clone();
                let prev_key = self.cur2.record().key;
                if !self.cur1.move_dir(self.pager, &self.snapshot, forward)? {
                    break;
                }
                if self.cur1.record().key != prev_key {
                    break;
                }
            }
        }

        if self.cur1.valid() {
            self.cur2 = self.cur1.clone();
            self.cur2.move_dir(self.pager, &self.snapshot, true)?;
        }

        while self.cur1.valid() {
            let rec = self.cur1.record();
            let newest_for_key = rec.version == self.version
                || !self.cur2.valid_at_version(self.version)
                || self.cur2.record().key != rec.key;
            if rec.value.is_some() && rec.version <= self.version && newest_for_key {
                self.kv = Some((rec.key, rec.value.unwrap()));
                return Ok(());
            }

            if forward {
                self.cur1 = self.cur2.clone();
                self.cur2.move_dir(self.pager, &self.snapshot, true)?;
            } else {
                self.cur2 = self.cur1.clone();
                self.cur1.move_dir(self.pager, &self.snapshot, false)?;
            }
        }

        self.kv = None;
        Ok(())
    }
}
