//! # DWAL Pager
//!
//! Pager with delayed write-ahead-log (DWAL) remapping: `atomic_update_page`
//! writes new content for a logical page id to a freshly allocated physical
//! page and logs a remap `(version, original, new)`, so readers at older
//! versions keep seeing the old bytes at the original id while readers at
//! newer versions are routed to the new page. Once a remap's version falls
//! below the oldest version any reader can request, the remap is *undone*:
//! the new page's bytes are copied back over the original id and the
//! alternate page is freed. The remap queue and the alternate pages it
//! references are, in effect, a write-ahead log whose application is
//! delayed until old readers are gone.
//!
//! ## Page Id Lifecycle
//!
//! ```text
//! new_page_id():  free list -> delayed-free list (version <= effective
//!                 oldest) -> grow file
//! free_page(v):   has live remaps -> remap log (freed when undone)
//!                 v < effective oldest -> free list
//!                 otherwise -> delayed-free list
//! ```
//!
//! The *effective oldest version* is the minimum of the oldest version set
//! by the user (as of the last commit) and the version of the oldest live
//! snapshot; no page is reused, and no remap undone, for versions at or
//! above it that a reader could still request.
//!
//! ## Commit Protocol (bit-exact disk order)
//!
//! 1. Write the previously committed header to page 1 (backup).
//! 2. Quiesce the remap undoer (a no-op here: the undoer runs inline at
//!    the end of the previous commit).
//! 3. Two-phase flush the three queues until a quiet round.
//! 4. Stamp the queue states into the working header.
//! 5. All data writes are complete (writes are synchronous).
//! 6. fsync.
//! 7. Write the working header to page 0.
//! 8. fsync.
//! 9. Publish the committed snapshot, expire old snapshots, run the remap
//!    undo pass up to the effective oldest version.
//!
//! A failed commit leaves the store at its previous committed state: the
//! header at page 0 is the last thing written, after everything it
//! references is durable.
//!
//! ## Recovery
//!
//! Page 0 is read and checksum-verified; on failure the backup at page 1
//! is tried, and if intact it is written back to page 0 (and synced)
//! before proceeding. The in-memory remap table is rebuilt by replaying
//! the remap queue from head to tail. A file that exists but is shorter
//! than two physical blocks was never successfully committed and is
//! refused rather than silently re-initialized.

mod snapshot;

pub use snapshot::Snapshot;
pub(crate) use snapshot::SnapshotInner;

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;

use crate::config::{
    BACKUP_HEADER_PAGE, DEFAULT_CACHE_BYTES, DEFAULT_PAGE_SIZE, HEADER_PAGE, INVALID_LPID,
    PAGE_CHECKSUM_SIZE, SMALLEST_PHYSICAL_BLOCK,
};
use crate::error::StoreError;
use crate::storage::{
    physical_page_size, FileStorage, PageBuf, PageCache, PageFile, PageQueue, PagerHeader,
    QueueEntry, QueuePageIo,
};

/// A page freed at `version` that may still be read by a retained snapshot;
/// it becomes reusable only once the effective oldest version passes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DelayedFreeEntry {
    pub version: u64,
    pub page_id: u64,
}

impl QueueEntry for DelayedFreeEntry {
    fn encoded_len(&self) -> usize {
        16
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.version.to_le_bytes());
        dst[8..16].copy_from_slice(&self.page_id.to_le_bytes());
    }

    fn decode(src: &[u8]) -> Result<(Self, usize)> {
        ensure!(src.len() >= 16, "truncated delayed-free entry");
        Ok((
            Self {
                version: u64::from_le_bytes(src[..8].try_into().unwrap()),
                page_id: u64::from_le_bytes(src[8..16].try_into().unwrap()),
            },
            16,
        ))
    }
}

/// Remap log entry. `new_page == INVALID_LPID` means "free `original` once
/// all prior remaps of it are undone".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemapEntry {
    pub version: u64,
    pub original: u64,
    pub new_page: u64,
}

impl QueueEntry for RemapEntry {
    fn encoded_len(&self) -> usize {
        24
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.version.to_le_bytes());
        dst[8..16].copy_from_slice(&self.original.to_le_bytes());
        dst[16..24].copy_from_slice(&self.new_page.to_le_bytes());
    }

    fn decode(src: &[u8]) -> Result<(Self, usize)> {
        ensure!(src.len() >= 24, "truncated remap entry");
        Ok((
            Self {
                version: u64::from_le_bytes(src[..8].try_into().unwrap()),
                original: u64::from_le_bytes(src[8..16].try_into().unwrap()),
                new_page: u64::from_le_bytes(src[16..24].try_into().unwrap()),
            },
            24,
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PagerCounters {
    pub page_reads: u64,
    pub page_writes: u64,
    pub commits: u64,
    pub remaps_undone: u64,
}

#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub page_size: usize,
    pub cache_bytes: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_bytes: DEFAULT_CACHE_BYTES,
        }
    }
}

/// Physical page I/O plus the page cache. Split out from `Pager` so the
/// queues (which are pager fields themselves) can borrow it independently.
#[derive(Debug)]
pub(crate) struct PagerCore {
    file: Box<dyn PageFile>,
    path: PathBuf,
    logical_page_size: usize,
    physical_page_size: usize,
    cache: PageCache,
    counters: PagerCounters,
}

impl PagerCore {
    pub(crate) fn logical_page_size(&self) -> usize {
        self.logical_page_size
    }

    /// Bytes per page available to callers (logical size minus checksum).
    pub(crate) fn usable_page_size(&self) -> usize {
        self.logical_page_size - PAGE_CHECKSUM_SIZE
    }

    pub(crate) fn new_page_buffer(&self) -> PageBuf {
        PageBuf::new(self.logical_page_size, self.physical_page_size)
    }

    fn page_offset(&self, id: u64) -> u64 {
        id * self.physical_page_size as u64
    }

    fn read_physical(&mut self, id: u64) -> Result<PageBuf> {
        let mut bytes = vec![0u8; self.physical_page_size].into_boxed_slice();
        self.file
            .read_at(&mut bytes, self.page_offset(id))
            .wrap_err_with(|| format!("failed to read page {} from {:?}", id, self.path))?;
        self.counters.page_reads += 1;
        let page = PageBuf::from_bytes(bytes, self.logical_page_size);
        page.ensure_checksum(id)?;
        Ok(page)
    }

    /// Most recent content of `id`. `cacheable` controls whether a miss
    /// populates the cache; `no_hit` reads without promoting (prefetch).
    pub(crate) fn read_page(
        &mut self,
        id: u64,
        cacheable: bool,
        no_hit: bool,
    ) -> Result<Arc<PageBuf>> {
        if !cacheable {
            if let Some(page) = self.cache.get_if_exists(id) {
                return Ok(page);
            }
            return Ok(Arc::new(self.read_physical(id)?));
        }

        if let Some(page) = self.cache.get(id, no_hit) {
            return Ok(page);
        }
        let page = Arc::new(self.read_physical(id)?);
        self.cache.insert(id, Arc::clone(&page));
        Ok(page)
    }

    /// Writes `page` at `id`, stamping its checksum, and replaces the
    /// cached content immediately so subsequent reads see the new bytes.
    pub(crate) fn write_page(&mut self, id: u64, mut page: PageBuf) -> Result<()> {
        page.update_checksum(id);
        self.file
            .write_at(page.raw(), self.page_offset(id))
            .wrap_err_with(|| format!("failed to write page {} to {:?}", id, self.path))?;
        self.counters.page_writes += 1;
        self.cache.insert(id, Arc::new(page));
        Ok(())
    }

    /// Header pages are always one physical block, addressed in blocks.
    /// Checksums are verified explicitly by recovery, not here.
    fn read_header_block(&mut self, id: u64) -> Result<PageBuf> {
        let mut bytes = vec![0u8; SMALLEST_PHYSICAL_BLOCK].into_boxed_slice();
        self.file
            .read_at(&mut bytes, id * SMALLEST_PHYSICAL_BLOCK as u64)
            .wrap_err_with(|| format!("failed to read header page {} from {:?}", id, self.path))?;
        Ok(PageBuf::from_bytes(bytes, SMALLEST_PHYSICAL_BLOCK))
    }

    fn write_header_block(&mut self, id: u64, header: &PagerHeader) -> Result<()> {
        let mut page = PageBuf::new(SMALLEST_PHYSICAL_BLOCK, SMALLEST_PHYSICAL_BLOCK);
        header.encode_into(&mut page)?;
        page.update_checksum(id);
        self.file
            .write_at(page.raw(), id * SMALLEST_PHYSICAL_BLOCK as u64)
            .wrap_err_with(|| format!("failed to write header page {} to {:?}", id, self.path))?;
        self.counters.page_writes += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }

    pub(crate) fn cache_counters(&self) -> crate::storage::CacheCounters {
        self.cache.counters()
    }
}

impl QueuePageIo for PagerCore {
    fn read_queue_page(&mut self, id: u64) -> Result<Arc<PageBuf>> {
        self.read_page(id, true, false)
    }

    fn write_queue_page(&mut self, id: u64, page: PageBuf) -> Result<()> {
        self.write_page(id, page)
    }
}

#[derive(Debug)]
pub struct Pager {
    pub(crate) core: PagerCore,
    header: PagerHeader,
    committed: PagerHeader,
    free_list: PageQueue<u64>,
    delayed_free: PageQueue<DelayedFreeEntry>,
    remap_log: PageQueue<RemapEntry>,
    remapped: HashMap<u64, BTreeMap<u64, u64>>,
    snapshots: VecDeque<Arc<SnapshotInner>>,
}

impl Pager {
    /// Opens (or creates) a store file and recovers it.
    pub fn open(path: &Path, options: PagerOptions) -> Result<Self> {
        let file = FileStorage::open(path)?;
        Self::with_file(Box::new(file), path.to_path_buf(), options)
    }

    /// Opens over an arbitrary file driver; tests use this to inject an
    /// in-memory file with deterministic failures.
    pub fn with_file(
        mut file: Box<dyn PageFile>,
        path: PathBuf,
        options: PagerOptions,
    ) -> Result<Self> {
        ensure!(
            options.page_size >= SMALLEST_PHYSICAL_BLOCK,
            "logical page size {} below smallest physical block {}",
            options.page_size,
            SMALLEST_PHYSICAL_BLOCK
        );

        let file_len = file.len()?;
        if file_len == 0 {
            Self::create_new(file, path, options)
        } else if file_len < 2 * SMALLEST_PHYSICAL_BLOCK as u64 {
            // The file was never successfully committed. Re-initializing it
            // in place would silently discard whatever it holds.
            bail!(
                "store file {:?} is {} bytes, smaller than two physical blocks; refusing to open",
                path,
                file_len
            );
        } else {
            Self::recover(file, path, options)
        }
    }

    fn create_new(file: Box<dyn PageFile>, path: PathBuf, options: PagerOptions) -> Result<Self> {
        let logical = options.page_size;
        let physical = physical_page_size(logical);

        let mut header = PagerHeader::new(logical as u32);
        header.committed_version = 1;
        header.oldest_version = 1;
        // Pages 0 and 1 are reserved for the active and backup header.
        header.page_count = 2;

        let core = PagerCore {
            file,
            path,
            logical_page_size: logical,
            physical_page_size: physical,
            cache: PageCache::new((options.cache_bytes / physical).max(1)),
            counters: PagerCounters::default(),
        };

        let free_page_id = header.page_count as u64;
        header.page_count += 1;
        let delayed_page_id = header.page_count as u64;
        header.page_count += 1;
        let remap_page_id = header.page_count as u64;
        header.page_count += 1;

        let free_list = PageQueue::create("free-list", logical, physical, free_page_id);
        let delayed_free = PageQueue::create("delayed-free", logical, physical, delayed_page_id);
        let remap_log = PageQueue::create("remap-log", logical, physical, remap_page_id);

        header.free_list = free_list.state();
        header.delayed_free_list = delayed_free.state();
        header.remap_log = remap_log.state();

        let mut pager = Self {
            core,
            committed: header.clone(),
            header,
            free_list,
            delayed_free,
            remap_log,
            remapped: HashMap::new(),
            snapshots: VecDeque::new(),
        };
        pager.commit()?;
        Ok(pager)
    }

    fn recover(file: Box<dyn PageFile>, path: PathBuf, options: PagerOptions) -> Result<Self> {
        let mut core = PagerCore {
            file,
            path,
            logical_page_size: SMALLEST_PHYSICAL_BLOCK,
            physical_page_size: SMALLEST_PHYSICAL_BLOCK,
            cache: PageCache::new(1),
            counters: PagerCounters::default(),
        };

        let mut recovered_from_backup = false;
        let mut header_page = core.read_header_block(HEADER_PAGE)?;
        if !header_page.verify_checksum(HEADER_PAGE) {
            let backup = core.read_header_block(BACKUP_HEADER_PAGE)?;
            ensure!(
                backup.verify_checksum(BACKUP_HEADER_PAGE),
                StoreError::ChecksumFailed { page: HEADER_PAGE }
            );
            header_page = backup;
            recovered_from_backup = true;
        }

        let header = PagerHeader::decode(header_page.usable())?;
        let logical = header.page_size as usize;
        let physical = physical_page_size(logical);
        core.logical_page_size = logical;
        core.physical_page_size = physical;
        core.cache.set_limit((options.cache_bytes / physical).max(1));

        let free_list = PageQueue::recover("free-list", logical, physical, &header.free_list);
        let delayed_free =
            PageQueue::recover("delayed-free", logical, physical, &header.delayed_free_list);
        let mut remap_log: PageQueue<RemapEntry> =
            PageQueue::recover("remap-log", logical, physical, &header.remap_log);

        // Rebuild the in-memory remap table by replaying the log in order.
        let mut remapped: HashMap<u64, BTreeMap<u64, u64>> = HashMap::new();
        for entry in remap_log.peek_all(&mut core)? {
            if entry.new_page != INVALID_LPID {
                remapped
                    .entry(entry.original)
                    .or_default()
                    .insert(entry.version, entry.new_page);
            }
        }

        if recovered_from_backup {
            // Restore the active header before any further writes so the
            // backup stays intact if this write fails.
            core.write_header_block(HEADER_PAGE, &header)?;
            core.sync()?;
        }

        let mut pager = Self {
            core,
            committed: header.clone(),
            header,
            free_list,
            delayed_free,
            remap_log,
            remapped,
            snapshots: VecDeque::new(),
        };
        pager.add_latest_snapshot();
        Ok(pager)
    }

    pub fn logical_page_size(&self) -> usize {
        self.core.logical_page_size()
    }

    /// Usable bytes per page (logical size minus the checksum slot).
    pub fn usable_page_size(&self) -> usize {
        self.core.usable_page_size()
    }

    pub fn new_page_buffer(&self) -> PageBuf {
        self.core.new_page_buffer()
    }

    pub fn latest_version(&self) -> u64 {
        self.committed.committed_version
    }

    pub fn oldest_version(&self) -> u64 {
        self.header.oldest_version
    }

    pub fn meta_key(&self) -> &[u8] {
        &self.header.meta
    }

    pub fn set_meta_key(&mut self, meta: &[u8]) {
        self.header.meta = meta.to_vec();
    }

    pub fn set_commit_version(&mut self, version: u64) {
        debug_assert!(version >= self.header.committed_version);
        self.header.committed_version = version;
    }

    /// Advances the pending oldest version. Actual page reuse stays bounded
    /// by live snapshots.
    pub fn set_oldest_version(&mut self, version: u64) -> Result<()> {
        ensure!(
            version >= self.header.oldest_version,
            "oldest version may not move backwards ({} < {})",
            version,
            self.header.oldest_version
        );
        ensure!(
            version <= self.header.committed_version,
            "oldest version {} beyond committed version {}",
            version,
            self.header.committed_version
        );
        self.header.oldest_version = version;
        self.expire_snapshots(version);
        Ok(())
    }

    /// `min(oldest version as of the last commit, oldest live snapshot)`.
    /// Gates page reuse and remap undo.
    pub fn effective_oldest_version(&self) -> u64 {
        let snapshot_floor = self
            .snapshots
            .front()
            .map_or(u64::MAX, |s| s.version);
        self.committed.oldest_version.min(snapshot_floor)
    }

    pub fn counters(&self) -> PagerCounters {
        self.core.counters
    }

    pub fn cache_counters(&self) -> crate::storage::CacheCounters {
        self.core.cache_counters()
    }

    fn new_last_page_id(&mut self) -> u64 {
        let id = self.header.page_count as u64;
        self.header.page_count += 1;
        id
    }

    /// Routes queue pages exhausted by pops through `free_page` at version
    /// 0; they become reusable after the next commit.
    fn drain_queue_frees(&mut self) -> Result<()> {
        loop {
            let mut freed = self.free_list.take_freed();
            freed.extend(self.delayed_free.take_freed());
            freed.extend(self.remap_log.take_freed());
            if freed.is_empty() {
                return Ok(());
            }
            for id in freed {
                self.free_page(id, 0)?;
            }
        }
    }

    /// Smallest reusable id from the free list, else the smallest
    /// delayed-free id whose version is at or below the effective oldest
    /// version, else a fresh id at the end of the file.
    pub fn new_page_id(&mut self) -> Result<u64> {
        if let Some(id) = self.free_list.pop(&mut self.core, None)? {
            self.drain_queue_frees()?;
            return Ok(id);
        }

        let cutoff = DelayedFreeEntry {
            version: self.effective_oldest_version(),
            page_id: u64::MAX,
        };
        if let Some(entry) = self.delayed_free.pop(&mut self.core, Some(&cutoff))? {
            self.drain_queue_frees()?;
            return Ok(entry.page_id);
        }

        self.drain_queue_frees()?;
        Ok(self.new_last_page_id())
    }

    /// Writes `page` to `id`. The cached content is replaced immediately so
    /// later reads observe the new bytes.
    pub fn update_page(&mut self, id: u64, page: PageBuf) -> Result<()> {
        self.core.write_page(id, page)
    }

    /// Writes `page` as the content of `id` as of `version` without
    /// touching the bytes older readers see: the content goes to a fresh
    /// physical page and a remap entry routes reads at `version` and later
    /// to it. Returns `id`, which remains the page's logical identity.
    pub fn atomic_update_page(&mut self, id: u64, page: PageBuf, version: u64) -> Result<u64> {
        let new_id = self.new_page_id()?;
        self.core.write_page(new_id, page)?;
        self.remap_log.push_back(&RemapEntry {
            version,
            original: id,
            new_page: new_id,
        })?;
        self.remapped.entry(id).or_default().insert(version, new_id);
        Ok(id)
    }

    /// Releases `id` as of `version`. A page with live remaps is only
    /// marked in the remap log and freed when its remaps are undone; a page
    /// no reader can see goes straight to the free list; anything else
    /// waits on the delayed-free list.
    pub fn free_page(&mut self, id: u64, version: u64) -> Result<()> {
        if self.remapped.contains_key(&id) {
            self.remap_log.push_back(&RemapEntry {
                version,
                original: id,
                new_page: INVALID_LPID,
            })
        } else if version < self.effective_oldest_version() {
            self.free_list.push_back(&id)
        } else {
            self.delayed_free.push_back(&DelayedFreeEntry {
                version,
                page_id: id,
            })
        }
    }

    /// Latest content of `id` (committed or written this cycle).
    pub fn read_page(&mut self, id: u64, cacheable: bool, no_hit: bool) -> Result<Arc<PageBuf>> {
        self.core.read_page(id, cacheable, no_hit)
    }

    /// Content of `id` as seen at `version`, resolved through the remap
    /// table: the greatest remap at or below `version` wins; with none, the
    /// original page itself.
    pub fn read_page_at_version(
        &mut self,
        id: u64,
        version: u64,
        cacheable: bool,
        no_hit: bool,
    ) -> Result<Arc<PageBuf>> {
        let resolved = match self.remapped.get(&id) {
            Some(versions) => versions
                .range(..=version)
                .next_back()
                .map(|(_, &new_id)| new_id)
                .unwrap_or(id),
            None => id,
        };
        self.core.read_page(resolved, cacheable, no_hit)
    }

    /// Read through a snapshot handle. Fails with `SnapshotExpired` if the
    /// pager has retired the snapshot's version.
    pub fn snapshot_read(
        &mut self,
        snapshot: &Snapshot,
        id: u64,
        cacheable: bool,
        no_hit: bool,
    ) -> Result<Arc<PageBuf>> {
        ensure!(
            !snapshot.is_expired(),
            StoreError::SnapshotExpired {
                version: snapshot.version()
            }
        );
        self.read_page_at_version(id, snapshot.version(), cacheable, no_hit)
    }

    /// Greatest retained snapshot with version at or below `version`.
    pub fn get_read_snapshot(&self, version: u64) -> Result<Snapshot> {
        let idx = self
            .snapshots
            .partition_point(|s| s.version <= version);
        ensure!(
            idx > 0,
            StoreError::VersionTooOld {
                requested: version,
                oldest: self.snapshots.front().map_or(0, |s| s.version),
            }
        );
        Ok(Snapshot {
            inner: Arc::clone(&self.snapshots[idx - 1]),
        })
    }

    fn add_latest_snapshot(&mut self) {
        self.snapshots.push_back(SnapshotInner::new(
            self.committed.committed_version,
            self.committed.meta.clone(),
        ));
    }

    /// Drops retained snapshots below `version` that nothing else holds.
    fn expire_snapshots(&mut self, version: u64) {
        while self.snapshots.len() > 1 {
            let front = self.snapshots.front().unwrap();
            if front.version >= version || Arc::strong_count(front) > 1 {
                break;
            }
            front
                .expired
                .store(true, std::sync::atomic::Ordering::Release);
            self.snapshots.pop_front();
        }
    }

    fn alloc_ids(&mut self, n: usize) -> Result<Vec<u64>> {
        (0..n).map(|_| self.new_page_id()).collect()
    }

    /// Two-phase flush of the three queues. The remap log goes first (it is
    /// not involved in free-page management); the free and delayed-free
    /// lists then iterate pre-flush rounds together until neither has work,
    /// since allocating pages for one can generate work for either.
    fn flush_queues(&mut self) -> Result<()> {
        loop {
            let n = self.remap_log.ids_needed();
            if n == 0 {
                break;
            }
            let ids = self.alloc_ids(n)?;
            self.remap_log.supply_ids(ids);
        }
        self.remap_log.finish_flush(&mut self.core)?;

        loop {
            let n_free = self.free_list.ids_needed();
            if n_free > 0 {
                let ids = self.alloc_ids(n_free)?;
                self.free_list.supply_ids(ids);
            }
            let n_delayed = self.delayed_free.ids_needed();
            if n_delayed > 0 {
                let ids = self.alloc_ids(n_delayed)?;
                self.delayed_free.supply_ids(ids);
            }
            if n_free == 0 && n_delayed == 0 {
                break;
            }
        }
        self.free_list.finish_flush(&mut self.core)?;
        self.delayed_free.finish_flush(&mut self.core)?;
        Ok(())
    }

    /// Undoes remaps whose version has fallen strictly below the effective
    /// oldest version: copies the alternate page's bytes back over the
    /// original id, erases the mapping, and frees the alternate page (or,
    /// for free-markers, frees the original).
    fn undo_remaps(&mut self) -> Result<()> {
        let cutoff = self.effective_oldest_version();
        if cutoff == 0 {
            return Ok(());
        }
        let upper = RemapEntry {
            version: cutoff - 1,
            original: u64::MAX,
            new_page: u64::MAX,
        };

        while let Some(entry) = self.remap_log.pop(&mut self.core, Some(&upper))? {
            self.drain_queue_frees()?;
            if entry.new_page == INVALID_LPID {
                self.free_page(entry.original, entry.version)?;
                continue;
            }

            let data = self.core.read_page(entry.new_page, false, false)?;
            self.core.write_page(entry.original, (*data).clone())?;

            if let Some(versions) = self.remapped.get_mut(&entry.original) {
                versions.remove(&entry.version);
                if versions.is_empty() {
                    self.remapped.remove(&entry.original);
                }
            }
            // Nothing routes reads to the alternate page anymore.
            self.free_page(entry.new_page, 0)?;
            self.core.counters.remaps_undone += 1;
        }
        self.drain_queue_frees()
    }

    /// Commits all writes since the previous commit. See the module docs
    /// for the exact disk order.
    pub fn commit(&mut self) -> Result<()> {
        self.core
            .write_header_block(BACKUP_HEADER_PAGE, &self.committed)?;

        self.flush_queues()?;

        self.header.free_list = self.free_list.state();
        self.header.delayed_free_list = self.delayed_free.state();
        self.header.remap_log = self.remap_log.state();

        self.core.sync()?;
        self.core.write_header_block(HEADER_PAGE, &self.header)?;
        self.core.sync()?;

        self.committed = self.header.clone();
        self.add_latest_snapshot();
        self.expire_snapshots(self.header.oldest_version);
        self.core.counters.commits += 1;

        self.undo_remaps()?;
        Ok(())
    }

    /// Pages in use by the pager's user: total pages minus headers, queue
    /// storage and queue entries. Runs the remap undoer and a queue flush
    /// first so pending frees are accounted.
    pub fn user_page_count(&mut self) -> Result<i64> {
        self.undo_remaps()?;
        self.flush_queues()?;
        Ok(self.header.page_count
            - 2
            - self.free_list.num_pages()
            - self.free_list.num_entries()
            - self.delayed_free.num_pages()
            - self.delayed_free.num_entries()
            - self.remap_log.num_pages())
    }

    #[cfg(test)]
    pub(crate) fn remap_table_len(&self) -> usize {
        self.remapped.len()
    }

    #[cfg(test)]
    pub(crate) fn free_list_entries(&self) -> i64 {
        self.free_list.num_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pager(path: &Path) -> Pager {
        Pager::open(path, PagerOptions::default()).unwrap()
    }

    fn page_with(pager: &Pager, byte: u8) -> PageBuf {
        let mut page = pager.new_page_buffer();
        page.usable_mut()[0] = byte;
        page
    }

    #[test]
    fn create_and_reopen_preserves_committed_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");

        {
            let mut pager = open_pager(&path);
            assert_eq!(pager.latest_version(), 1);

            let id = pager.new_page_id().unwrap();
            pager.update_page(id, page_with(&pager, 0x5A)).unwrap();
            pager.set_commit_version(2);
            pager.set_meta_key(b"hello");
            pager.commit().unwrap();
        }

        let mut pager = open_pager(&path);
        assert_eq!(pager.latest_version(), 2);
        assert_eq!(pager.meta_key(), b"hello");
        let page = pager.read_page(5, true, false).unwrap();
        assert_eq!(page.usable()[0], 0x5A);
    }

    #[test]
    fn refuses_truncated_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.larch");
        std::fs::write(&path, b"not a store").unwrap();

        let err = Pager::open(&path, PagerOptions::default()).unwrap_err();
        assert!(err.to_string().contains("refusing to open"));
    }

    #[test]
    fn freed_page_reused_after_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reuse.larch");
        let mut pager = open_pager(&path);

        let id = pager.new_page_id().unwrap();
        pager.update_page(id, page_with(&pager, 1)).unwrap();
        pager.set_commit_version(2);
        pager.commit().unwrap();

        // Freed below the effective oldest version: free list, reusable
        // only after the next commit flushes the queue.
        pager.free_page(id, 0).unwrap();
        pager.set_commit_version(3);
        pager.commit().unwrap();

        let reused = pager.new_page_id().unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn atomic_update_preserves_old_version_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remap.larch");
        let mut pager = open_pager(&path);

        let id = pager.new_page_id().unwrap();
        pager.update_page(id, page_with(&pager, 1)).unwrap();
        pager.set_commit_version(2);
        pager.commit().unwrap();

        let returned = pager
            .atomic_update_page(id, page_with(&pager, 2), 3)
            .unwrap();
        assert_eq!(returned, id);
        pager.set_commit_version(3);
        pager.commit().unwrap();

        let old = pager.read_page_at_version(id, 2, true, false).unwrap();
        assert_eq!(old.usable()[0], 1);
        let new = pager.read_page_at_version(id, 3, true, false).unwrap();
        assert_eq!(new.usable()[0], 2);
    }

    #[test]
    fn remap_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remap2.larch");
        let id;
        {
            let mut pager = open_pager(&path);
            id = pager.new_page_id().unwrap();
            pager.update_page(id, page_with(&pager, 1)).unwrap();
            pager.set_commit_version(2);
            pager.commit().unwrap();
            pager
                .atomic_update_page(id, page_with(&pager, 2), 3)
                .unwrap();
            pager.set_commit_version(3);
            pager.commit().unwrap();
        }

        let mut pager = open_pager(&path);
        assert_eq!(pager.remap_table_len(), 1);
        let old = pager.read_page_at_version(id, 2, true, false).unwrap();
        assert_eq!(old.usable()[0], 1);
        let new = pager.read_page_at_version(id, 3, true, false).unwrap();
        assert_eq!(new.usable()[0], 2);
    }

    #[test]
    fn backup_header_recovers_corrupted_page_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recover.larch");
        {
            let mut pager = open_pager(&path);
            let id = pager.new_page_id().unwrap();
            pager.update_page(id, page_with(&pager, 9)).unwrap();
            pager.set_commit_version(2);
            pager.commit().unwrap();
            // One more commit so the backup header matches version 2.
            pager.set_commit_version(3);
            pager.commit().unwrap();
        }

        // Flip one bit in page 0.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[100] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let pager = open_pager(&path);
        assert_eq!(pager.latest_version(), 2);
    }

    #[test]
    fn both_headers_corrupt_is_checksum_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dead.larch");
        {
            let mut pager = open_pager(&path);
            pager.set_commit_version(2);
            pager.commit().unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[100] ^= 0x01;
        bytes[SMALLEST_PHYSICAL_BLOCK + 100] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let err = Pager::open(&path, PagerOptions::default()).unwrap_err();
        let kind = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(kind, StoreError::ChecksumFailed { .. }));
    }

    #[test]
    fn snapshot_blocks_remap_undo_until_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("undo.larch");
        let mut pager = open_pager(&path);

        let id = pager.new_page_id().unwrap();
        pager.update_page(id, page_with(&pager, 1)).unwrap();
        pager.set_commit_version(2);
        pager.commit().unwrap();

        pager
            .atomic_update_page(id, page_with(&pager, 2), 3)
            .unwrap();
        pager.set_commit_version(3);
        pager.commit().unwrap();

        let snap = pager.get_read_snapshot(2).unwrap();

        // Oldest advances past the remap, but the live snapshot at 2 pins
        // the effective oldest version at 2, so the remap at 3 stays.
        pager.set_oldest_version(3).unwrap();
        pager.set_commit_version(4);
        pager.commit().unwrap();
        assert_eq!(pager.remap_table_len(), 1);
        let old = pager.snapshot_read(&snap, id, true, false).unwrap();
        assert_eq!(old.usable()[0], 1);

        drop(snap);
        pager.set_oldest_version(4).unwrap();
        pager.set_commit_version(5);
        pager.commit().unwrap();

        assert_eq!(pager.remap_table_len(), 0);
        let cur = pager.read_page(id, true, false).unwrap();
        assert_eq!(cur.usable()[0], 2);
    }

    #[test]
    fn version_too_old_snapshot_request() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.larch");
        let pager = open_pager(&path);

        let err = pager.get_read_snapshot(0).unwrap_err();
        let kind = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(kind, StoreError::VersionTooOld { .. }));
    }

    #[test]
    fn delayed_free_respects_live_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("delayed.larch");
        let mut pager = open_pager(&path);

        let id = pager.new_page_id().unwrap();
        pager.update_page(id, page_with(&pager, 7)).unwrap();
        pager.set_commit_version(2);
        pager.commit().unwrap();

        let snap = pager.get_read_snapshot(2).unwrap();

        // Free at version 3: a snapshot at 2 may still read it.
        pager.free_page(id, 3).unwrap();
        pager.set_commit_version(3);
        pager.commit().unwrap();

        // Effective oldest is 2 (snapshot floor), so the delayed page at
        // version 3 is not reusable and a fresh id is grown instead.
        let next = pager.new_page_id().unwrap();
        assert_ne!(next, id);

        drop(snap);
        pager.set_oldest_version(3).unwrap();
        pager.set_commit_version(4);
        pager.commit().unwrap();

        let reused = pager.new_page_id().unwrap();
        assert_eq!(reused, id);
    }
}
