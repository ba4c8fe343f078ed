//! # Versioned Tree
//!
//! The versioned B+tree proper: buffered writes at a single write version,
//! a recursive commit that reconciles the mutation buffer against the
//! existing tree, a page writer that builds runs of delta-tree pages, and
//! a lazy reclamation queue for bulk subtree deletes.
//!
//! ## Commit
//!
//! `commit()` walks the tree recursively in parallel with the slice of the
//! mutation buffer covering each subtree. Per subtree:
//!
//! - If one mutation range covers the whole subtree it is either returned
//!   unchanged (range untouched) or deleted wholesale: leaves are freed
//!   immediately, internal subtrees are pushed onto the lazy-delete queue
//!   so bulk clears do not block the commit.
//! - A touched leaf is first updated *in place*: the page bytes are cloned
//!   and edited through the delta-tree mirror, then written back with
//!   `atomic_update_page` so the leaf keeps its page ids and old versions
//!   stay readable. If an insert does not fit (or would decode too deep),
//!   the leaf falls back to a linear merge of surviving records with the
//!   mutation stream, rewritten as fresh pages.
//! - A touched internal node recurses into each child, then rebuilds
//!   itself only if some child link changed, inserting value-less
//!   placeholder records where needed so that every stored child link's
//!   upper bound stays decodable.
//! - If the root level ends up with several children, new root levels are
//!   built until one remains; if everything was deleted, a fresh empty
//!   root leaf is written.
//!
//! ## Persistent Header
//!
//! The tree persists itself in the pager's meta key:
//!
//! ```text
//! u16 format_version | u8 height | QueueState lazy_delete (34 bytes) |
//! u8 root_id_count | u64 root_lpid[count]
//! ```

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::smallvec;
use zerocopy::{FromBytes, IntoBytes};

use crate::btree::cursor::ReadCursor;
use crate::btree::deltatree::{build_tree, empty_tree_size, node_header_size, walk_values};
use crate::btree::deltatree::{DeltaMirror, PageContent, TreeBytes};
use crate::btree::mutation::{MutationBuffer, MutationSlice};
use crate::btree::record::{PageIds, Record};
use crate::btree::{db_begin, db_end, BTREE_PAGE_HEADER_SIZE};
use crate::config::{
    DELTA_TREE_SMALL_SIZE_LIMIT, LAZY_CLEAR_BATCH, LAZY_CLEAR_COMMIT_BUDGET,
    MAX_INPLACE_TREE_HEIGHT, MIN_INTERNAL_ENTRIES, PAGE_FILL_FACTOR, TREE_FORMAT_VERSION,
};
use crate::error::StoreError;
use crate::pager::{Pager, PagerOptions, Snapshot};
use crate::storage::{PageBuf, PageQueue, QueueEntry, QueueState, QUEUE_STATE_SIZE};

/// A subtree root awaiting background reclamation.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct LazyDeleteEntry {
    pub version: u64,
    pub pages: PageIds,
}

impl QueueEntry for LazyDeleteEntry {
    fn encoded_len(&self) -> usize {
        8 + 1 + self.pages.len() * 8
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.version.to_le_bytes());
        dst[8] = self.pages.len() as u8;
        for (i, id) in self.pages.iter().enumerate() {
            dst[9 + i * 8..17 + i * 8].copy_from_slice(&id.to_le_bytes());
        }
    }

    fn decode(src: &[u8]) -> Result<(Self, usize)> {
        ensure!(src.len() >= 9, "truncated lazy-delete entry");
        let version = u64::from_le_bytes(src[..8].try_into().unwrap());
        let count = src[8] as usize;
        let total = 9 + count * 8;
        ensure!(src.len() >= total, "truncated lazy-delete entry page list");
        let pages = src[9..total]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok((Self { version, pages }, total))
    }
}

/// Persistent tree header, stored as the pager's meta key.
#[derive(Debug, Clone)]
pub struct TreeMeta {
    pub height: u8,
    pub root: PageIds,
    pub lazy_delete: QueueState,
}

impl TreeMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 1 + QUEUE_STATE_SIZE + 1 + self.root.len() * 8);
        out.extend_from_slice(&TREE_FORMAT_VERSION.to_le_bytes());
        out.push(self.height);
        out.extend_from_slice(self.lazy_delete.as_bytes());
        out.push(self.root.len() as u8);
        for id in &self.root {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= 2 + 1 + QUEUE_STATE_SIZE + 1,
            "meta key of {} bytes is too short for a tree header",
            bytes.len()
        );
        let format = u16::from_le_bytes(bytes[..2].try_into().unwrap());
        ensure!(
            format == TREE_FORMAT_VERSION,
            StoreError::FormatMismatch {
                found: format,
                expected: TREE_FORMAT_VERSION,
            }
        );
        let height = bytes[2];
        let state_end = 3 + QUEUE_STATE_SIZE;
        let lazy_delete = QueueState::ref_from_bytes(&bytes[3..state_end])
            .map_err(|e| eyre::eyre!("failed to parse lazy-delete queue state: {:?}", e))?;
        let count = bytes[state_end] as usize;
        let ids_end = state_end + 1 + count * 8;
        ensure!(
            bytes.len() >= ids_end && count > 0,
            "malformed root page id list in tree header"
        );
        let root = bytes[state_end + 1..ids_end]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self {
            height,
            root,
            lazy_delete: *lazy_delete,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TreeCounters {
    pub sets: u64,
    pub clears: u64,
    pub clears_single_key: u64,
    pub commits: u64,
    pub gets: u64,
    pub page_writes: u64,
    pub ext_page_writes: u64,
    pub page_updates: u64,
    pub commit_subtree_walks: u64,
    pub lazy_freed_pages: u64,
}

/// Child links returned by one subtree commit: the replacement link
/// records (empty = subtree deleted) and the upper bound required to
/// decode the rightmost of them.
struct ChildLinks {
    children: Vec<Record>,
    upper_bound: Record,
}

impl ChildLinks {
    fn deleted() -> Self {
        Self {
            children: Vec::new(),
            upper_bound: Record::default(),
        }
    }

    fn unchanged(decode_lower: &Record, decode_upper: &Record) -> Self {
        Self {
            children: vec![decode_lower.clone()],
            upper_bound: decode_upper.clone(),
        }
    }
}

struct ChildInfo {
    page_id: PageIds,
    lower: Record,
    upper: Record,
    decode_lower: Record,
    decode_upper: Record,
}

#[derive(Debug)]
pub struct VersionedTree {
    pager: Pager,
    meta: TreeMeta,
    lazy_delete: PageQueue<LazyDeleteEntry>,
    buffer: Option<MutationBuffer>,
    write_version: u64,
    last_committed: u64,
    new_oldest: u64,
    counters: TreeCounters,
}

impl VersionedTree {
    /// Opens (or creates) a versioned tree over a store file.
    pub fn open(path: &std::path::Path, options: PagerOptions) -> Result<Self> {
        let mut pager = Pager::open(path, options)?;
        let latest = pager.latest_version();
        let logical = pager.logical_page_size();
        let physical = crate::storage::physical_page_size(logical);

        let meta_bytes = pager.meta_key().to_vec();
        let (meta, lazy_delete, last_committed) = if meta_bytes.is_empty() {
            // Fresh store: write an empty root leaf and create the
            // lazy-delete queue, then make the initial tree commit.
            let root_id = pager.new_page_id()?;
            let root_page = make_empty_root_page(&pager)?;
            pager.update_page(root_id, root_page)?;

            let queue_page = pager.new_page_id()?;
            let lazy_delete: PageQueue<LazyDeleteEntry> =
                PageQueue::create("lazy-delete", logical, physical, queue_page);

            let meta = TreeMeta {
                height: 1,
                root: smallvec![root_id],
                lazy_delete: lazy_delete.state(),
            };
            pager.set_commit_version(latest + 1);
            pager.set_meta_key(&meta.encode());
            pager.commit()?;
            (meta, lazy_delete, latest + 1)
        } else {
            let meta = TreeMeta::decode(&meta_bytes)?;
            let lazy_delete =
                PageQueue::recover("lazy-delete", logical, physical, &meta.lazy_delete);
            (meta, lazy_delete, latest)
        };

        let new_oldest = pager.oldest_version();
        Ok(Self {
            pager,
            meta,
            lazy_delete,
            buffer: None,
            write_version: 0,
            last_committed,
            new_oldest,
            counters: TreeCounters::default(),
        })
    }

    pub fn latest_version(&self) -> u64 {
        if self.buffer.is_some() {
            self.write_version
        } else {
            self.last_committed
        }
    }

    pub fn last_committed_version(&self) -> u64 {
        self.last_committed
    }

    pub fn oldest_version(&self) -> u64 {
        self.pager.oldest_version()
    }

    pub fn height(&self) -> u8 {
        self.meta.height
    }

    pub fn root_page_ids(&self) -> &PageIds {
        &self.meta.root
    }

    pub fn counters(&self) -> TreeCounters {
        self.counters
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn user_page_count(&mut self) -> Result<i64> {
        self.pager.user_page_count()
    }

    pub fn lazy_delete_entries(&self) -> i64 {
        self.lazy_delete.num_entries()
    }

    pub fn lazy_delete_pages(&self) -> i64 {
        self.lazy_delete.num_pages()
    }

    /// Starts (or continues) buffering writes for `version`. Must be
    /// beyond the last committed version and nondecreasing.
    pub fn set_write_version(&mut self, version: u64) -> Result<()> {
        ensure!(
            version > self.last_committed,
            "write version {} not beyond last committed version {}",
            version,
            self.last_committed
        );
        if self.buffer.is_none() {
            self.buffer = Some(MutationBuffer::new());
        } else {
            ensure!(
                version >= self.write_version,
                "write version may not decrease within a commit cycle"
            );
        }
        self.write_version = version;
        Ok(())
    }

    fn buffer_mut(&mut self) -> Result<&mut MutationBuffer> {
        self.buffer
            .as_mut()
            .ok_or_else(|| eyre::eyre!("no write version set; call set_write_version first"))
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.counters.sets += 1;
        self.buffer_mut()?.set(key, value);
        Ok(())
    }

    /// Clears `[begin, end)`. A single-key range (`end == begin + \x00`)
    /// produces one boundary instead of two.
    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        ensure!(begin < end, "empty or inverted clear range");
        self.counters.clears += 1;

        let single_key = end.len() == begin.len() + 1
            && end[end.len() - 1] == 0
            && end.starts_with(begin);
        if single_key {
            self.counters.clears_single_key += 1;
            self.buffer_mut()?.clear_single(begin);
        } else {
            self.buffer_mut()?.clear_range(begin, end);
        }
        Ok(())
    }

    pub fn clear_key(&mut self, key: &[u8]) -> Result<()> {
        self.counters.clears += 1;
        self.counters.clears_single_key += 1;
        self.buffer_mut()?.clear_single(key);
        Ok(())
    }

    /// Oldest version to retain as of the next commit.
    pub fn set_oldest_version(&mut self, version: u64) {
        self.new_oldest = version;
    }

    /// Read cursor bound to the snapshot at `version`. The root page id is
    /// taken from the snapshot's own meta key, so the cursor sees exactly
    /// the tree as committed at that version.
    pub fn cursor(&mut self, version: u64) -> Result<ReadCursor<'_>> {
        let snapshot = self.pager.get_read_snapshot(version)?;
        ensure!(
            !snapshot.meta_key().is_empty(),
            "no committed tree at version {}",
            version
        );
        let meta = TreeMeta::decode(snapshot.meta_key())?;
        Ok(ReadCursor::new(&mut self.pager, snapshot, meta.root, version))
    }

    /// Point lookup at `version`.
    pub fn get(&mut self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        self.counters.gets += 1;
        let mut cur = self.cursor(version)?;
        cur.find_equal(key)?;
        Ok(cur.take_value())
    }

    /// Commits the current mutation buffer at the write version. With no
    /// buffered writes this is a no-op.
    pub fn commit(&mut self) -> Result<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        let write_version = self.write_version;

        self.pager.set_oldest_version(self.new_oldest)?;

        // Background reclamation work piggybacked on the commit, bounded
        // so bulk deletes never stall the commit path.
        let freed = self.incremental_subtree_clear(LAZY_CLEAR_COMMIT_BUDGET)?;
        self.counters.lazy_freed_pages += freed as u64;

        let latest = self.pager.latest_version();
        let snapshot = self.pager.get_read_snapshot(latest)?;

        let entries = buffer.into_entries();
        let muts = MutationSlice::new(&entries);

        let root_ids = self.meta.root.clone();
        let mut lower = db_begin();
        lower.set_child_pages(&root_ids);
        let upper = db_end();
        let height = self.meta.height;

        let links = self.commit_subtree(
            &muts,
            &snapshot,
            &root_ids,
            height == 1,
            &lower,
            &upper,
            &lower,
            &upper,
            0,
        )?;
        drop(snapshot);

        if links.children.is_empty() {
            // The whole tree was deleted; start over with an empty root.
            let root_id = self.pager.new_page_id()?;
            let page = make_empty_root_page(&self.pager)?;
            self.pager.update_page(root_id, page)?;
            self.meta.height = 1;
            self.meta.root = smallvec![root_id];
        } else if links.children.len() == 1 {
            self.meta.root = links.children[0].child_page_ids()?;
        } else {
            let new_level = self.build_new_root(write_version, links.children)?;
            self.meta.root = new_level[0].child_page_ids()?;
        }

        self.pager.set_commit_version(write_version);

        self.flush_lazy_queue()?;
        self.meta.lazy_delete = self.lazy_delete.state();
        self.pager.set_meta_key(&self.meta.encode());

        self.pager.commit()?;
        self.last_committed = write_version;
        self.counters.commits += 1;
        Ok(())
    }

    fn flush_lazy_queue(&mut self) -> Result<()> {
        loop {
            let n = self.lazy_delete.ids_needed();
            if n == 0 {
                break;
            }
            let ids = (0..n)
                .map(|_| self.pager.new_page_id())
                .collect::<Result<Vec<_>>>()?;
            self.lazy_delete.supply_ids(ids);
        }
        self.lazy_delete.finish_flush(&mut self.pager.core)?;
        for id in self.lazy_delete.take_freed() {
            self.pager.free_page(id, 0)?;
        }
        Ok(())
    }

    /// Pops lazy-delete entries in batches and frees their subtrees one
    /// level at a time, re-queueing inner nodes at the front. Returns the
    /// number of pages freed; stops once `max_pages` have been freed or
    /// the queue is drained.
    pub fn incremental_subtree_clear(&mut self, max_pages: usize) -> Result<usize> {
        let latest = self.pager.latest_version();
        let mut freed = 0usize;

        loop {
            let mut batch = Vec::new();
            while batch.len() < LAZY_CLEAR_BATCH {
                match self.lazy_delete.pop(&mut self.pager.core, None)? {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }
            for id in self.lazy_delete.take_freed() {
                self.pager.free_page(id, 0)?;
            }

            if batch.is_empty() {
                // Entries pushed since the last flush are invisible to
                // pop; flush mid-pass to keep draining.
                if self.lazy_delete.num_entries() > 0 {
                    self.flush_lazy_queue()?;
                    continue;
                }
                break;
            }

            for entry in batch {
                let content = self.read_page_at_latest(latest, &entry.pages, false)?;
                let height = content.bytes()[0];
                ensure!(height > 1, "leaf page id in the lazy-delete queue");

                let mut children: Vec<PageIds> = Vec::new();
                walk_values(&content.bytes()[BTREE_PAGE_HEADER_SIZE..], |value| {
                    ensure!(
                        !value.is_empty() && value.len() % 8 == 0,
                        "malformed child link in lazily deleted page"
                    );
                    children.push(
                        value
                            .chunks_exact(8)
                            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                            .collect(),
                    );
                    Ok(())
                })?;

                for child in children {
                    if height == 2 {
                        for id in &child {
                            self.pager.free_page(*id, entry.version)?;
                        }
                        freed += child.len();
                    } else {
                        self.lazy_delete.push_front(&LazyDeleteEntry {
                            version: entry.version,
                            pages: child,
                        })?;
                    }
                }

                for id in &entry.pages {
                    self.pager.free_page(*id, entry.version)?;
                }
                freed += entry.pages.len();
            }

            if freed >= max_pages {
                break;
            }
        }

        Ok(freed)
    }

    /// Clears the whole tree, drains the lazy-delete queue to exhaustion
    /// across commits, and verifies that exactly one (empty) root page and
    /// one lazy-delete queue page remain in use.
    pub fn destroy_and_verify_empty(&mut self) -> Result<()> {
        loop {
            let next = self.last_committed + 1;
            self.set_write_version(next)?;
            self.clear_range(b"", crate::config::MAX_KEY_SENTINEL)?;
            let freed = self.incremental_subtree_clear(usize::MAX)?;
            self.counters.lazy_freed_pages += freed as u64;
            self.commit()?;
            if self.lazy_delete.num_entries() == 0 && freed == 0 {
                break;
            }
        }

        self.set_oldest_version(self.last_committed);
        self.set_write_version(self.last_committed + 1)?;
        self.commit()?;

        ensure!(
            self.lazy_delete.num_entries() == 0 && self.lazy_delete.num_pages() == 1,
            "lazy-delete queue not drained"
        );
        ensure!(
            self.meta.height == 1 && self.meta.root.len() == 1,
            "tree did not collapse to a single root page"
        );
        let user_pages = self.pager.user_page_count()?;
        ensure!(
            user_pages == 2,
            "expected 2 user pages (root + lazy-delete queue), found {}",
            user_pages
        );
        Ok(())
    }

    fn read_page(
        &mut self,
        snapshot: &Snapshot,
        ids: &PageIds,
        cacheable: bool,
    ) -> Result<PageContent> {
        if ids.len() == 1 {
            return Ok(PageContent::Single(self.pager.snapshot_read(
                snapshot,
                ids[0],
                cacheable,
                false,
            )?));
        }
        let mut bytes = Vec::with_capacity(ids.len() * self.pager.usable_page_size());
        for id in ids {
            let page = self.pager.snapshot_read(snapshot, *id, cacheable, false)?;
            bytes.extend_from_slice(page.usable());
        }
        Ok(PageContent::Multi(Arc::new(bytes)))
    }

    fn read_page_at_latest(
        &mut self,
        version: u64,
        ids: &PageIds,
        cacheable: bool,
    ) -> Result<PageContent> {
        if ids.len() == 1 {
            return Ok(PageContent::Single(self.pager.read_page_at_version(
                ids[0], version, cacheable, false,
            )?));
        }
        let mut bytes = Vec::with_capacity(ids.len() * self.pager.usable_page_size());
        for id in ids {
            let page = self
                .pager
                .read_page_at_version(*id, version, cacheable, false)?;
            bytes.extend_from_slice(page.usable());
        }
        Ok(PageContent::Multi(Arc::new(bytes)))
    }

    fn free_btree_page(&mut self, ids: &PageIds, version: u64) -> Result<()> {
        for id in ids {
            self.pager.free_page(*id, version)?;
        }
        Ok(())
    }

    /// Rewrites an in-place-updated page over its original ids via atomic
    /// remapped writes.
    fn update_btree_page(
        &mut self,
        old_ids: &PageIds,
        content: Vec<u8>,
        version: u64,
    ) -> Result<PageIds> {
        let block = self.pager.usable_page_size();
        ensure!(
            content.len() == old_ids.len() * block,
            "updated page content of {} bytes does not match {} blocks",
            content.len(),
            old_ids.len()
        );

        let mut new_ids = PageIds::new();
        for (i, id) in old_ids.iter().enumerate() {
            let mut page = self.pager.new_page_buffer();
            page.usable_mut()
                .copy_from_slice(&content[i * block..(i + 1) * block]);
            new_ids.push(self.pager.atomic_update_page(*id, page, version)?);
        }
        self.counters.page_writes += 1;
        if new_ids.len() > 1 {
            self.counters.ext_page_writes += (new_ids.len() - 1) as u64;
        }
        Ok(new_ids)
    }

    /// Builds new root levels until a single child remains.
    fn build_new_root(&mut self, version: u64, mut records: Vec<Record>) -> Result<Vec<Record>> {
        while records.len() > 1 {
            self.meta.height += 1;
            let height = self.meta.height;
            records = self.write_pages(
                &db_begin(),
                &db_end(),
                &records,
                height,
                version,
                &PageIds::new(),
            )?;
        }
        Ok(records)
    }

    /// Writes `entries` (sorted) to one or more pages at `height`,
    /// returning one child-link record per page written. Reuses the
    /// original ids via atomic update when the result is a single page of
    /// the same block count; otherwise frees the old ids and allocates.
    fn write_pages(
        &mut self,
        lower: &Record,
        upper: &Record,
        entries: &[Record],
        height: u8,
        version: u64,
        previous_id: &PageIds,
    ) -> Result<Vec<Record>> {
        ensure!(!entries.is_empty(), "write_pages with no entries");
        let mut records: Vec<Record> = Vec::new();

        let block_size = self.pager.usable_page_size();
        let mut page_size = block_size - BTREE_PAGE_HEADER_SIZE;
        let mut fill_target = (page_size as f32 * PAGE_FILL_FACTOR) as usize;
        let mut block_count = 1usize;
        let mut large = page_size > DELTA_TREE_SMALL_SIZE_LIMIT;

        let mut kv_bytes = 0usize;
        let mut compressed = empty_tree_size();

        let minimum_entries = if height == 1 { 1 } else { MIN_INTERNAL_ENTRIES };
        let skip_len = entries
            .first()
            .unwrap()
            .common_prefix_len(entries.last().unwrap(), 0);

        let mut start = 0usize;
        let mut i = 0usize;
        let mut page_lower_bound = lower.without_value();

        loop {
            // Fill the page up to the target, but never below the minimum
            // entry count.
            while i < entries.len()
                && (i - start < minimum_entries || compressed < fill_target)
            {
                let entry = &entries[i];
                let base = if i == start {
                    &page_lower_bound
                } else {
                    &entries[i - 1]
                };
                let skip = if i == 0 { 0 } else { skip_len };

                // Prefix borrowing is redistributed by the balanced build,
                // so assume worst-case delta overhead per record.
                let delta_size = entry.delta_size(base, skip, true);
                let mut node_size = node_header_size(large) + delta_size;

                let mut space_available = page_size - compressed;
                if node_size > space_available {
                    let mut new_blocks = 1 + (node_size - space_available - 1) / block_size;
                    let mut new_page_size = page_size + new_blocks * block_size;
                    if !large && new_page_size > DELTA_TREE_SMALL_SIZE_LIMIT {
                        large = true;
                        node_size += node_header_size(true) - node_header_size(false);
                        compressed += (i - start) * (node_header_size(true) - node_header_size(false));
                        space_available = page_size.saturating_sub(compressed);
                        if node_size > space_available {
                            new_blocks = 1 + (node_size - space_available - 1) / block_size;
                        }
                        new_page_size = page_size + new_blocks * block_size;
                    }
                    block_count += new_blocks;
                    page_size = new_page_size;
                    fill_target = (page_size as f32 * PAGE_FILL_FACTOR) as usize;
                }

                kv_bytes += entry.kv_bytes();
                compressed += node_size;
                i += 1;
            }

            let mut next_start = i;
            // A value-less record at the break point only served as the
            // upper bound of an unmodified child; the page boundary now
            // serves that purpose.
            if height != 1 && next_start < entries.len() && entries[next_start].value.is_none() {
                next_start += 1;
            }

            let mut page_upper_bound = if i == entries.len() {
                upper.without_value()
            } else {
                entries[i].without_value()
            };
            let is_last_page = next_start == entries.len();

            // Shorten interior leaf boundaries to the minimal separator
            // for better prefix compression; internal bounds stay exact.
            if !is_last_page && height == 1 {
                let common = page_upper_bound.common_prefix_len(&entries[i - 1], 0);
                let len = (common + 1).min(page_upper_bound.key.len());
                page_upper_bound.truncate(len);
            }

            // Build the page content: header plus packed tree, spanning
            // `block_count` pager pages.
            let total = block_count * block_size;
            let mut content = vec![0u8; total];
            content[0] = height;
            content[1..5].copy_from_slice(&(kv_bytes as u32).to_le_bytes());
            build_tree(
                &mut content[BTREE_PAGE_HEADER_SIZE..],
                &entries[start..i],
                &page_lower_bound,
                &page_upper_bound,
            )?;

            let mut pages = Vec::with_capacity(block_count);
            for chunk in content.chunks(block_size) {
                let mut page = self.pager.new_page_buffer();
                page.usable_mut()[..chunk.len()].copy_from_slice(chunk);
                pages.push(page);
            }

            let is_only_page = is_last_page && start == 0;
            let mut child_id = PageIds::new();
            if is_only_page && previous_id.len() == pages.len() {
                for (p, page) in pages.into_iter().enumerate() {
                    child_id.push(self.pager.atomic_update_page(previous_id[p], page, version)?);
                }
            } else {
                // The parent must be rewritten anyway, so there is no
                // benefit in keeping any of the original ids.
                if records.is_empty() && !previous_id.is_empty() {
                    self.free_btree_page(previous_id, version)?;
                }
                for page in pages {
                    let id = self.pager.new_page_id()?;
                    self.pager.update_page(id, page)?;
                    child_id.push(id);
                }
            }

            self.counters.page_writes += 1;
            if child_id.len() > 1 {
                self.counters.ext_page_writes += (child_id.len() - 1) as u64;
            }

            let mut link = page_lower_bound.clone();
            link.set_child_pages(&child_id);
            records.push(link);

            if is_last_page {
                // A skipped trailing placeholder still bounds the subtree
                // to its left; emit it so the parent keeps decodability.
                if height != 1 && i != entries.len() {
                    records.push(page_upper_bound);
                }
                break;
            }

            start = next_start;
            i = next_start;
            kv_bytes = 0;
            compressed = empty_tree_size();
            page_lower_bound = page_upper_bound;
        }

        Ok(records)
    }

    /// Recursively reconciles one subtree against the slice of the
    /// mutation buffer covering it. See the module docs for the shape of
    /// the algorithm; the logic mirrors the write path invariants exactly:
    /// `lower`/`upper` are the subtree's key bounds for this commit,
    /// `decode_lower`/`decode_upper` the bounds its pages were encoded
    /// with (they differ when an earlier commit left the subtree intact
    /// under a wider range).
    #[allow(clippy::too_many_arguments)]
    fn commit_subtree(
        &mut self,
        muts: &MutationSlice<'_>,
        snapshot: &Snapshot,
        root_id: &PageIds,
        is_leaf: bool,
        lower: &Record,
        upper: &Record,
        decode_lower: &Record,
        decode_upper: &Record,
        skip_len: usize,
    ) -> Result<ChildLinks> {
        self.counters.commit_subtree_walks += 1;
        let write_version = self.last_committed + 1;

        // The mutation boundaries surrounding this subtree.
        let i_mut = muts.upper_bound(&lower.key) - 1;
        let i_end = muts.lower_bound(&upper.key);

        // Fast paths when one mutation range covers the entire subtree.
        if i_mut + 1 == i_end {
            let mutation = muts.mutation(i_mut);
            let mut cleared = mutation.clear_after_boundary;
            let mut unchanged = !cleared;

            if muts.key(i_mut) == lower.key.as_slice() {
                if cleared && !mutation.boundary_cleared() {
                    cleared = false;
                }
                if unchanged && mutation.boundary_changed {
                    unchanged = false;
                }
            }

            if (cleared || unchanged) && muts.key(i_end) == upper.key.as_slice() {
                if muts.mutation(i_end).boundary_changed {
                    unchanged = false;
                } else {
                    cleared = false;
                }
            }

            ensure!(
                !(cleared && unchanged),
                "subtree cannot be both cleared and unchanged"
            );

            if unchanged {
                return Ok(ChildLinks::unchanged(decode_lower, decode_upper));
            }
            if cleared {
                if is_leaf {
                    self.free_btree_page(root_id, write_version)?;
                } else {
                    self.lazy_delete.push_back(&LazyDeleteEntry {
                        version: write_version,
                        pages: root_id.clone(),
                    })?;
                }
                return Ok(ChildLinks::deleted());
            }
        }

        let content = self.read_page(snapshot, root_id, true)?;
        let height = content.bytes()[0];
        ensure!(
            is_leaf == (height == 1),
            "page height {} does not match expected level",
            height
        );

        if is_leaf {
            self.commit_leaf(
                muts,
                root_id,
                content,
                lower,
                upper,
                decode_lower,
                decode_upper,
                i_mut,
                i_end,
                skip_len,
                write_version,
            )
        } else {
            self.commit_internal(
                muts,
                snapshot,
                root_id,
                content,
                height,
                lower,
                upper,
                decode_lower,
                decode_upper,
                write_version,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_leaf(
        &mut self,
        muts: &MutationSlice<'_>,
        root_id: &PageIds,
        content: PageContent,
        lower: &Record,
        upper: &Record,
        decode_lower: &Record,
        decode_upper: &Record,
        i_mut: usize,
        i_end: usize,
        mut skip_len: usize,
        write_version: u64,
    ) -> Result<ChildLinks> {
        // Try an in-place update unless the page is empty or its decode
        // bounds no longer match this commit's bounds.
        let decoded_items = {
            let probe = DeltaMirror::new(
                TreeBytes::Shared {
                    content: content.clone(),
                    off: BTREE_PAGE_HEADER_SIZE,
                },
                decode_lower.without_value(),
                decode_upper.without_value(),
            )?;
            probe.num_items()
        };
        let mut updating =
            decoded_items > 0 && decode_lower == lower && decode_upper == upper;

        let buf = if updating {
            TreeBytes::Owned {
                content: content.bytes().to_vec(),
                off: BTREE_PAGE_HEADER_SIZE,
            }
        } else {
            TreeBytes::Shared {
                content: content.clone(),
                off: BTREE_PAGE_HEADER_SIZE,
            }
        };
        let mut mirror = DeltaMirror::new(
            buf,
            decode_lower.without_value(),
            decode_upper.without_value(),
        )?;
        let mut cursor = mirror.cursor();
        cursor.move_first(&mut mirror)?;

        let mut merged: Vec<Record> = Vec::new();
        let mut changes_made = false;
        let mut i = i_mut;
        let mut first_boundary = true;

        while i != i_end {
            // Apply the boundary key's own change only if there is one and
            // this is not a boundary below the subtree's lower bound.
            let apply_boundary_change = muts.mutation(i).boundary_changed
                && (!first_boundary || muts.key(i) >= lower.key.as_slice());
            first_boundary = false;

            // Records at the boundary key itself.
            while cursor.valid() && cursor.get_ref(&mirror).key.as_slice() == muts.key(i) {
                if !apply_boundary_change {
                    if !updating {
                        merged.push(cursor.get(&mirror));
                    }
                    cursor.move_next(&mut mirror)?;
                } else {
                    changes_made = true;
                    if updating {
                        cursor.erase(&mut mirror)?;
                    } else {
                        cursor.move_next(&mut mirror)?;
                    }
                }
            }

            // Insert the new record for a set boundary. Clears were
            // handled above by dropping the old records.
            if apply_boundary_change && muts.mutation(i).boundary_set() {
                let rec = Record::new(
                    muts.key(i).to_vec(),
                    0,
                    muts.mutation(i).boundary_value.clone(),
                );
                changes_made = true;

                if updating && !mirror.insert(&rec, skip_len, MAX_INPLACE_TREE_HEIGHT)? {
                    // Doesn't fit in place: replay what the page still
                    // holds up to the cursor and continue as a merge.
                    updating = false;
                    let mut catch_up = mirror.cursor();
                    let mut ok = catch_up.move_first(&mut mirror)?;
                    while ok && catch_up != cursor {
                        merged.push(catch_up.get(&mirror));
                        ok = catch_up.move_next(&mut mirror)?;
                    }
                }
                if !updating {
                    merged.push(rec);
                }
            }

            let remove = muts.mutation(i).clear_after_boundary;
            i += 1;
            if i == i_end {
                skip_len = 0;
            }
            let end_rec = Record::new(muts.key(i).to_vec(), 0, None);

            if remove != updating {
                // Either skipping records that survive an update, or
                // skipping records a merge drops; both are a plain seek.
                if !updating {
                    changes_made = true;
                }
                cursor.seek_greater_than_or_equal(&mut mirror, &end_rec, skip_len)?;
            } else {
                while cursor.valid()
                    && cursor.get_ref(&mirror).compare(&end_rec, skip_len)
                        == std::cmp::Ordering::Less
                {
                    if updating {
                        changes_made = true;
                        cursor.erase(&mut mirror)?;
                    } else {
                        merged.push(cursor.get(&mirror));
                        cursor.move_next(&mut mirror)?;
                    }
                }
            }
        }

        // Any remaining records share the end boundary's key.
        if cursor.valid() {
            let remove = muts.mutation(i_end).boundary_changed;
            if remove {
                changes_made = true;
            }
            if remove == updating {
                while cursor.valid() {
                    if updating {
                        cursor.erase(&mut mirror)?;
                    } else {
                        merged.push(cursor.get(&mirror));
                        cursor.move_next(&mut mirror)?;
                    }
                }
            }
        }

        if !changes_made {
            return Ok(ChildLinks::unchanged(decode_lower, decode_upper));
        }

        if updating {
            if mirror.num_items() == 0 {
                self.free_btree_page(root_id, write_version)?;
                return Ok(ChildLinks::deleted());
            }
            let content = mirror.into_content()?;
            let new_ids = self.update_btree_page(root_id, content, write_version)?;
            self.counters.page_updates += 1;
            let mut link = decode_lower.without_value();
            link.set_child_pages(&new_ids);
            return Ok(ChildLinks {
                children: vec![link],
                upper_bound: decode_upper.clone(),
            });
        }

        if merged.is_empty() {
            self.free_btree_page(root_id, write_version)?;
            return Ok(ChildLinks::deleted());
        }

        let children = self.write_pages(lower, upper, &merged, 1, write_version, root_id)?;
        Ok(ChildLinks {
            children,
            upper_bound: upper.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_internal(
        &mut self,
        muts: &MutationSlice<'_>,
        snapshot: &Snapshot,
        root_id: &PageIds,
        content: PageContent,
        height: u8,
        lower: &Record,
        upper: &Record,
        decode_lower: &Record,
        decode_upper: &Record,
        write_version: u64,
    ) -> Result<ChildLinks> {
        let mut mirror = DeltaMirror::new(
            TreeBytes::Shared {
                content,
                off: BTREE_PAGE_HEADER_SIZE,
            },
            decode_lower.without_value(),
            decode_upper.without_value(),
        )?;

        // Collect per-child bounds first, then recurse.
        let mut infos: Vec<ChildInfo> = Vec::new();
        let mut cursor = mirror.cursor();
        cursor.move_first(&mut mirror)?;
        let mut first = true;

        while cursor.valid() {
            let link = cursor.get(&mirror);
            ensure!(
                link.value.is_some(),
                "internal page iteration reached a record without a child link"
            );
            let child_lower = if first { lower.clone() } else { link.clone() };
            first = false;

            let decode_child_lower = link.clone();
            let page_id = link.child_page_ids()?;

            let has_next = cursor.move_next(&mut mirror)?;
            let decode_child_upper = if has_next {
                cursor.get(&mirror)
            } else {
                decode_upper.clone()
            };

            // A value-less placeholder only exists to bound the previous
            // child; skip it for the next child's key range.
            if cursor.valid() && cursor.get_ref(&mirror).value.is_none() {
                let moved = cursor.move_next(&mut mirror)?;
                ensure!(
                    !moved || cursor.get_ref(&mirror).value.is_some(),
                    "consecutive placeholder records in internal page"
                );
            }
            let child_upper = if cursor.valid() {
                cursor.get(&mirror)
            } else {
                upper.clone()
            };

            infos.push(ChildInfo {
                page_id,
                lower: child_lower,
                upper: child_upper,
                decode_lower: decode_child_lower,
                decode_upper: decode_child_upper,
            });
        }

        let child_is_leaf = height == 2;
        let mut results: Vec<ChildLinks> = Vec::with_capacity(infos.len());
        for info in &infos {
            let links = self.commit_subtree(
                muts,
                snapshot,
                &info.page_id,
                child_is_leaf,
                &info.lower,
                &info.upper,
                &info.decode_lower,
                &info.decode_upper,
                0,
            )?;
            results.push(links);
        }

        // Rebuild this node's entry list, reconciling against the original
        // records so an untouched page is recognized as unmodified.
        let mut builder = InternalPageBuilder::new(&mut mirror)?;
        for links in &results {
            if !links.children.is_empty() {
                builder.add_entries(&mut mirror, links)?;
            }
        }
        builder.finalize(&mut mirror, upper, decode_upper)?;

        if !builder.modified {
            return Ok(ChildLinks::unchanged(decode_lower, decode_upper));
        }

        if builder.child_page_count == 0 {
            self.free_btree_page(root_id, write_version)?;
            return Ok(ChildLinks::deleted());
        }

        debug_assert!(
            builder.entries.last().map_or(true, |e| e.value.is_none())
                || builder.last_upper_bound.same_except_value(upper)
        );

        let children =
            self.write_pages(lower, upper, &builder.entries, height, write_version, root_id)?;
        Ok(ChildLinks {
            children,
            upper_bound: upper.clone(),
        })
    }
}

/// Accumulates the replacement entry list for an internal page, tracking
/// whether it differs from the page's existing records and inserting
/// value-less placeholders wherever a child link's required upper bound
/// would otherwise be lost.
struct InternalPageBuilder {
    cursor: crate::btree::deltatree::DtCursor,
    entries: Vec<Record>,
    last_upper_bound: Record,
    modified: bool,
    child_page_count: usize,
}

impl InternalPageBuilder {
    fn new(mirror: &mut DeltaMirror) -> Result<Self> {
        let mut cursor = mirror.cursor();
        cursor.move_first(mirror)?;
        Ok(Self {
            cursor,
            entries: Vec::new(),
            last_upper_bound: Record::default(),
            modified: false,
            child_page_count: 0,
        })
    }

    fn add_entry(&mut self, mirror: &mut DeltaMirror, rec: Record) -> Result<()> {
        if rec.value.is_some() {
            self.child_page_count += 1;
        }

        if !self.modified {
            if self.cursor.valid() {
                if rec != self.cursor.get(mirror) {
                    self.modified = true;
                } else {
                    self.cursor.move_next(mirror)?;
                }
            } else {
                self.modified = true;
            }
        }

        self.entries.push(rec);
        Ok(())
    }

    fn add_entries(&mut self, mirror: &mut DeltaMirror, links: &ChildLinks) -> Result<()> {
        // If the previous child set's upper bound is not the next set's
        // first key, record it as a value-less entry so the previous child
        // page stays decodable.
        if !self.entries.is_empty()
            && self.entries.last().unwrap().value.is_some()
            && (links.children.is_empty()
                || !links.children[0].same_except_value(&self.last_upper_bound))
        {
            let placeholder = self.last_upper_bound.without_value();
            self.add_entry(mirror, placeholder)?;
        }

        for child in &links.children {
            self.add_entry(mirror, child.clone())?;
        }
        self.last_upper_bound = links.upper_bound.clone();
        Ok(())
    }

    fn finalize(
        &mut self,
        mirror: &mut DeltaMirror,
        upper: &Record,
        decode_upper: &Record,
    ) -> Result<()> {
        self.modified = self.modified || self.cursor.valid();

        if !self.entries.is_empty() && self.entries.last().unwrap().value.is_some() {
            if !self.modified && !self.last_upper_bound.same_except_value(decode_upper) {
                self.modified = true;
            }
            if self.modified && !self.last_upper_bound.same_except_value(upper) {
                let placeholder = self.last_upper_bound.without_value();
                self.add_entry(mirror, placeholder)?;
                self.last_upper_bound = upper.clone();
            }
        }
        Ok(())
    }
}

fn make_empty_root_page(pager: &Pager) -> Result<PageBuf> {
    let mut page = pager.new_page_buffer();
    let usable = page.usable_mut();
    usable[0] = 1;
    usable[1..5].copy_from_slice(&0u32.to_le_bytes());
    build_tree(
        &mut usable[BTREE_PAGE_HEADER_SIZE..],
        &[],
        &db_begin(),
        &db_end(),
    )?;
    Ok(page)
}
