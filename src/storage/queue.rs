//! # FIFO Page-Queue
//!
//! A strongly-typed FIFO whose backing store is a linked list of pages,
//! used for the pager's free list, delayed-free list and remap log, and for
//! the B+tree's lazy-delete list.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       8     next_page    LPID of the next page in the chain
//! 8       2     next_offset  item offset to resume at on that page
//! 10      2     end_offset   end of valid items on this page
//! 12      ...   densely packed serialized items
//! ```
//!
//! Item offsets (including `end_offset` and the persisted head offset) are
//! relative to the start of the item area.
//!
//! ## Write Discipline
//!
//! No queue page is ever rewritten after its contents become durable. Items
//! pushed since the last flush accumulate in memory: the current tail
//! buffer, plus sealed full buffers awaiting page ids. At flush time the
//! tail chain is linked to a freshly allocated empty tail page and written
//! once, so that after recovery the tail chain is intact and the new tail
//! page (never yet written) is where writing resumes.
//!
//! Items pushed to the *front* go to a separate chain which, at flush, is
//! linked ahead of the current head position and becomes the new head.
//!
//! `pop` returns only items that were flushed; it reads pages through the
//! `QueuePageIo` capability and never calls back into the pager.
//!
//! ## Breaking the Pager Cycle
//!
//! The free list and delayed-free list are themselves queues owned by the
//! pager: a queue that allocated or freed pages mid-operation would recurse
//! into itself. Instead:
//!
//! - `pop` defers page frees into an internal list the pager drains after
//!   each call (queue pages are freed at version 0; they become reusable
//!   after the next commit).
//! - pushes never allocate; sealed buffers wait for ids.
//! - Flushing is two-phase: `ids_needed`/`supply_ids` form the pre-flush
//!   round. The caller loops the rounds across all of its queues until none
//!   reports outstanding work (allocating ids can pop a queue, which can
//!   free a queue page, which pushes again), then calls `finish_flush` on
//!   each to link and write the chains.

use std::marker::PhantomData;
use std::sync::Arc;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{INVALID_LPID, PAGE_CHECKSUM_SIZE};
use crate::storage::header::QueueState;
use crate::storage::page::PageBuf;

pub const QUEUE_PAGE_HEADER_SIZE: usize = 12;

/// Serialization contract for queue items. Fixed-size items implement this
/// directly over little-endian fields; variable-size items carry their own
/// length information.
pub trait QueueEntry: Clone + PartialOrd + std::fmt::Debug {
    fn encoded_len(&self) -> usize;
    fn encode(&self, dst: &mut [u8]);
    fn decode(src: &[u8]) -> Result<(Self, usize)>;
}

impl QueueEntry for u64 {
    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(src: &[u8]) -> Result<(Self, usize)> {
        ensure!(src.len() >= 8, "truncated queue item");
        Ok((u64::from_le_bytes(src[..8].try_into().unwrap()), 8))
    }
}

/// Page I/O capability handed to the queue by its owner. The queue never
/// allocates or frees through this; it only reads and writes pages whose
/// ids it was given.
pub trait QueuePageIo {
    fn read_queue_page(&mut self, id: u64) -> Result<Arc<PageBuf>>;
    fn write_queue_page(&mut self, id: u64, page: PageBuf) -> Result<()>;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct QueuePageHeader {
    next_page: U64,
    next_offset: U16,
    end_offset: U16,
}

const _: () = assert!(std::mem::size_of::<QueuePageHeader>() == QUEUE_PAGE_HEADER_SIZE);

fn read_page_header(page: &PageBuf) -> QueuePageHeader {
    *QueuePageHeader::ref_from_bytes(&page.usable()[..QUEUE_PAGE_HEADER_SIZE])
        .expect("queue page header size")
}

fn write_page_header(page: &mut PageBuf, next_page: u64, next_offset: u16, end_offset: u16) {
    let hdr = QueuePageHeader {
        next_page: U64::new(next_page),
        next_offset: U16::new(next_offset),
        end_offset: U16::new(end_offset),
    };
    page.usable_mut()[..QUEUE_PAGE_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
}

#[derive(Clone, Debug)]
struct ReadCursor {
    page_id: u64,
    offset: usize,
    end_page_id: u64,
    page: Option<Arc<PageBuf>>,
}

#[derive(Debug)]
struct PendingPage {
    id: Option<u64>,
    buf: PageBuf,
    offset: usize,
}

#[derive(Debug)]
pub struct PageQueue<T: QueueEntry> {
    name: &'static str,
    logical_size: usize,
    physical_size: usize,
    data_bytes: usize,
    num_pages: i64,
    num_entries: i64,
    head: ReadCursor,
    tail: Vec<PendingPage>,
    front: Vec<PendingPage>,
    new_tail_page: Option<u64>,
    freed: Vec<u64>,
    _marker: PhantomData<T>,
}

impl<T: QueueEntry> PageQueue<T> {
    /// Creates a new queue whose first (still unwritten) page is
    /// `first_page`.
    pub fn create(
        name: &'static str,
        logical_size: usize,
        physical_size: usize,
        first_page: u64,
    ) -> Self {
        let mut q = Self::empty(name, logical_size, physical_size);
        q.num_pages = 1;
        q.head = ReadCursor {
            page_id: first_page,
            offset: 0,
            end_page_id: first_page,
            page: None,
        };
        q.tail.push(PendingPage {
            id: Some(first_page),
            buf: PageBuf::new(logical_size, physical_size),
            offset: 0,
        });
        q
    }

    /// Restores a queue from its persisted state. The tail page recorded in
    /// the state has never been written and is where writing resumes.
    pub fn recover(
        name: &'static str,
        logical_size: usize,
        physical_size: usize,
        state: &QueueState,
    ) -> Self {
        let mut q = Self::empty(name, logical_size, physical_size);
        q.num_pages = state.num_pages();
        q.num_entries = state.num_entries();
        q.head = ReadCursor {
            page_id: state.head_page(),
            offset: state.head_offset() as usize,
            end_page_id: state.tail_page(),
            page: None,
        };
        q.tail.push(PendingPage {
            id: Some(state.tail_page()),
            buf: PageBuf::new(logical_size, physical_size),
            offset: 0,
        });
        q
    }

    fn empty(name: &'static str, logical_size: usize, physical_size: usize) -> Self {
        let usable = logical_size - PAGE_CHECKSUM_SIZE;
        Self {
            name,
            logical_size,
            physical_size,
            data_bytes: usable - QUEUE_PAGE_HEADER_SIZE,
            num_pages: 0,
            num_entries: 0,
            head: ReadCursor {
                page_id: INVALID_LPID,
                offset: 0,
                end_page_id: INVALID_LPID,
                page: None,
            },
            tail: Vec::new(),
            front: Vec::new(),
            new_tail_page: None,
            freed: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn num_entries(&self) -> i64 {
        self.num_entries
    }

    pub fn num_pages(&self) -> i64 {
        self.num_pages
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Queue pages exhausted by pops since the last drain. The owner must
    /// route these through its page-free path at version 0.
    pub fn take_freed(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.freed)
    }

    pub fn push_back(&mut self, item: &T) -> Result<()> {
        let need = item.encoded_len();
        ensure!(
            need <= self.data_bytes,
            "queue item of {} bytes exceeds queue page capacity {}",
            need,
            self.data_bytes
        );

        let cur = self.tail.last().expect("tail chain always has a page");
        if cur.offset + need > self.data_bytes {
            self.tail.push(PendingPage {
                id: None,
                buf: PageBuf::new(self.logical_size, self.physical_size),
                offset: 0,
            });
            self.num_pages += 1;
        }

        let cur = self.tail.last_mut().unwrap();
        let start = QUEUE_PAGE_HEADER_SIZE + cur.offset;
        item.encode(&mut cur.buf.usable_mut()[start..start + need]);
        cur.offset += need;
        let end = cur.offset as u16;
        set_end_offset(&mut cur.buf, end);
        self.num_entries += 1;
        Ok(())
    }

    /// Pushes an item onto the *front* of the queue. Front items accumulate
    /// in their own chain and become the head of the queue at the next
    /// flush, in push order ahead of all existing items.
    pub fn push_front(&mut self, item: &T) -> Result<()> {
        let need = item.encoded_len();
        ensure!(
            need <= self.data_bytes,
            "queue item of {} bytes exceeds queue page capacity {}",
            need,
            self.data_bytes
        );

        let needs_new = match self.front.last() {
            None => true,
            Some(p) => p.offset + need > self.data_bytes,
        };
        if needs_new {
            self.front.push(PendingPage {
                id: None,
                buf: PageBuf::new(self.logical_size, self.physical_size),
                offset: 0,
            });
            self.num_pages += 1;
        }

        let cur = self.front.last_mut().unwrap();
        let start = QUEUE_PAGE_HEADER_SIZE + cur.offset;
        item.encode(&mut cur.buf.usable_mut()[start..start + need]);
        cur.offset += need;
        let end = cur.offset as u16;
        set_end_offset(&mut cur.buf, end);
        self.num_entries += 1;
        Ok(())
    }

    /// Pops the item at the front of the queue. With `upper`, returns
    /// `None` without consuming when the next item compares greater than
    /// the bound. Only flushed items are visible.
    pub fn pop(&mut self, io: &mut dyn QueuePageIo, upper: Option<&T>) -> Result<Option<T>> {
        match read_step::<T>(&mut self.head, io, upper)? {
            None => Ok(None),
            Some((item, exhausted)) => {
                self.num_entries -= 1;
                if let Some(old) = exhausted {
                    self.num_pages -= 1;
                    self.freed.push(old);
                }
                Ok(Some(item))
            }
        }
    }

    /// Reads every flushed item from head to tail without consuming
    /// anything or freeing pages.
    pub fn peek_all(&mut self, io: &mut dyn QueuePageIo) -> Result<Vec<T>> {
        let mut cursor = self.head.clone();
        let mut items = Vec::new();
        while let Some((item, _)) = read_step::<T>(&mut cursor, io, None)? {
            items.push(item);
        }
        Ok(items)
    }

    /// First phase of flushing: how many fresh page ids this queue needs
    /// before `finish_flush` can run. The caller allocates them (which may
    /// generate more queue work) and hands them over with `supply_ids`,
    /// looping across all of its queues until every one reports zero.
    pub fn ids_needed(&self) -> usize {
        let mut n = self.tail.iter().filter(|p| p.id.is_none()).count()
            + self.front.iter().filter(|p| p.id.is_none()).count();
        if self.tail_has_pending() && self.new_tail_page.is_none() {
            n += 1;
        }
        n
    }

    pub fn supply_ids(&mut self, ids: Vec<u64>) {
        let mut ids = ids.into_iter();
        for p in self.tail.iter_mut().filter(|p| p.id.is_none()) {
            p.id = ids.next();
            debug_assert!(p.id.is_some(), "short id supply for {}", self.name);
        }
        for p in self.front.iter_mut().filter(|p| p.id.is_none()) {
            p.id = ids.next();
            debug_assert!(p.id.is_some(), "short id supply for {}", self.name);
        }
        if self.tail_has_pending() && self.new_tail_page.is_none() {
            self.new_tail_page = ids.next();
            debug_assert!(
                self.new_tail_page.is_some(),
                "short id supply for {}",
                self.name
            );
        }
        debug_assert!(ids.next().is_none(), "excess id supply for {}", self.name);
    }

    fn tail_has_pending(&self) -> bool {
        // A sealed page always received at least one item, so the chain has
        // pending data exactly when the current buffer does.
        self.tail.last().map_or(false, |p| p.offset > 0)
    }

    /// Second phase of flushing: links and writes the pending chains. All
    /// requested page ids must have been supplied.
    pub fn finish_flush(&mut self, io: &mut dyn QueuePageIo) -> Result<()> {
        ensure!(
            self.ids_needed() == 0,
            "finish_flush on {} with unsatisfied page id requests",
            self.name
        );

        if self.tail_has_pending() {
            let new_tail = self.new_tail_page.take().expect("new tail allocated");
            let chain = std::mem::take(&mut self.tail);
            let ids: Vec<u64> = chain.iter().map(|p| p.id.unwrap()).collect();
            let n = chain.len();
            for (i, mut p) in chain.into_iter().enumerate() {
                let next_id = if i + 1 < n { ids[i + 1] } else { new_tail };
                let end = read_page_header(&p.buf).end_offset.get();
                write_page_header(&mut p.buf, next_id, 0, end);
                io.write_queue_page(ids[i], p.buf)?;
            }
            self.num_pages += 1;
            self.tail.push(PendingPage {
                id: Some(new_tail),
                buf: PageBuf::new(self.logical_size, self.physical_size),
                offset: 0,
            });
        }

        if !self.front.is_empty() {
            let chain = std::mem::take(&mut self.front);
            let ids: Vec<u64> = chain.iter().map(|p| p.id.unwrap()).collect();
            let n = chain.len();
            for (i, mut p) in chain.into_iter().enumerate() {
                let (next_id, next_off) = if i + 1 < n {
                    (ids[i + 1], 0u16)
                } else {
                    (self.head.page_id, self.head.offset as u16)
                };
                let end = read_page_header(&p.buf).end_offset.get();
                write_page_header(&mut p.buf, next_id, next_off, end);
                io.write_queue_page(ids[i], p.buf)?;
            }
            self.head.page_id = ids[0];
            self.head.offset = 0;
            self.head.page = None;
        }

        self.head.end_page_id = self.tail.first().and_then(|p| p.id).unwrap_or(INVALID_LPID);
        Ok(())
    }

    /// The persisted state of the queue. Only meaningful after a flush.
    pub fn state(&self) -> QueueState {
        debug_assert!(!self.tail_has_pending() && self.front.is_empty());
        QueueState::new(
            self.head.page_id,
            self.head.offset as u16,
            self.tail.first().and_then(|p| p.id).unwrap_or(INVALID_LPID),
            self.num_pages,
            self.num_entries,
        )
    }
}

fn set_end_offset(page: &mut PageBuf, end_offset: u16) {
    // Only the end offset moves while filling; the link fields are set when
    // the chain is written at flush time.
    let hdr = read_page_header(page);
    write_page_header(page, hdr.next_page.get(), hdr.next_offset.get(), end_offset);
}

/// One read step of a cursor: decodes the next item, advancing across page
/// boundaries. Returns the item plus the id of a page the step exhausted
/// (the caller decides whether that frees the page).
fn read_step<T: QueueEntry>(
    cur: &mut ReadCursor,
    io: &mut dyn QueuePageIo,
    upper: Option<&T>,
) -> Result<Option<(T, Option<u64>)>> {
    if cur.page_id == INVALID_LPID || cur.page_id == cur.end_page_id {
        return Ok(None);
    }

    if cur.page.is_none() {
        cur.page = Some(io.read_queue_page(cur.page_id)?);
    }
    let page = cur.page.as_ref().unwrap().clone();
    let hdr = read_page_header(&page);
    let end = hdr.end_offset.get() as usize;
    ensure!(
        cur.offset < end,
        "queue cursor at offset {} past end offset {} on page {}",
        cur.offset,
        end,
        cur.page_id
    );

    let items = &page.usable()[QUEUE_PAGE_HEADER_SIZE..];
    let (item, used) = T::decode(&items[cur.offset..end])?;

    if let Some(bound) = upper {
        if item > *bound {
            return Ok(None);
        }
    }

    cur.offset += used;
    ensure!(cur.offset <= end, "queue item overran page {}", cur.page_id);

    let mut exhausted = None;
    if cur.offset == end {
        exhausted = Some(cur.page_id);
        cur.page_id = hdr.next_page.get();
        cur.offset = hdr.next_offset.get() as usize;
        cur.page = None;
    }

    Ok(Some((item, exhausted)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    /// In-memory page store standing in for the pager during queue tests.
    struct MemIo {
        pages: HashMap<u64, Arc<PageBuf>>,
        next_id: u64,
        writes: usize,
    }

    impl MemIo {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                next_id: 2,
                writes: 0,
            }
        }

        fn alloc(&mut self) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        fn alloc_many(&mut self, n: usize) -> Vec<u64> {
            (0..n).map(|_| self.alloc()).collect()
        }
    }

    impl QueuePageIo for MemIo {
        fn read_queue_page(&mut self, id: u64) -> Result<Arc<PageBuf>> {
            self.pages
                .get(&id)
                .cloned()
                .ok_or_else(|| eyre::eyre!("read of unwritten queue page {}", id))
        }

        fn write_queue_page(&mut self, id: u64, page: PageBuf) -> Result<()> {
            self.writes += 1;
            self.pages.insert(id, Arc::new(page));
            Ok(())
        }
    }

    fn flush(q: &mut PageQueue<u64>, io: &mut MemIo) {
        loop {
            let n = q.ids_needed();
            if n == 0 {
                break;
            }
            let ids = io.alloc_many(n);
            q.supply_ids(ids);
        }
        q.finish_flush(io).unwrap();
    }

    #[test]
    fn push_flush_pop_roundtrip() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        for i in 0..10u64 {
            q.push_back(&i).unwrap();
        }
        assert_eq!(q.num_entries(), 10);

        // Nothing visible before the flush.
        assert_eq!(q.pop(&mut io, None).unwrap(), None);

        flush(&mut q, &mut io);

        for i in 0..10u64 {
            assert_eq!(q.pop(&mut io, None).unwrap(), Some(i));
        }
        assert_eq!(q.pop(&mut io, None).unwrap(), None);
        assert_eq!(q.num_entries(), 0);
    }

    #[test]
    fn spans_multiple_pages_and_frees_consumed_ones() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        // 4080 data bytes per page -> 510 items per page.
        let count = 1500u64;
        for i in 0..count {
            q.push_back(&i).unwrap();
        }
        flush(&mut q, &mut io);
        assert!(q.num_pages() >= 3);

        for i in 0..count {
            assert_eq!(q.pop(&mut io, None).unwrap(), Some(i));
        }
        assert_eq!(q.pop(&mut io, None).unwrap(), None);

        let freed = q.take_freed();
        assert!(freed.len() >= 2, "consumed pages should be reported freed");
        assert!(freed.contains(&first));
    }

    #[test]
    fn pop_respects_upper_bound() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        for i in [5u64, 10, 20] {
            q.push_back(&i).unwrap();
        }
        flush(&mut q, &mut io);

        assert_eq!(q.pop(&mut io, Some(&7)).unwrap(), Some(5));
        assert_eq!(q.pop(&mut io, Some(&7)).unwrap(), None);
        assert_eq!(q.pop(&mut io, Some(&10)).unwrap(), Some(10));
        assert_eq!(q.pop(&mut io, None).unwrap(), Some(20));
    }

    #[test]
    fn push_front_items_come_out_first() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        q.push_back(&100).unwrap();
        flush(&mut q, &mut io);

        q.push_front(&1).unwrap();
        q.push_front(&2).unwrap();
        q.push_back(&200).unwrap();
        flush(&mut q, &mut io);

        assert_eq!(q.pop(&mut io, None).unwrap(), Some(1));
        assert_eq!(q.pop(&mut io, None).unwrap(), Some(2));
        assert_eq!(q.pop(&mut io, None).unwrap(), Some(100));
        assert_eq!(q.pop(&mut io, None).unwrap(), Some(200));
        assert_eq!(q.pop(&mut io, None).unwrap(), None);
    }

    #[test]
    fn peek_all_does_not_consume() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        for i in 0..600u64 {
            q.push_back(&i).unwrap();
        }
        flush(&mut q, &mut io);

        let all = q.peek_all(&mut io).unwrap();
        assert_eq!(all.len(), 600);
        assert_eq!(all[0], 0);
        assert_eq!(all[599], 599);
        assert_eq!(q.num_entries(), 600);
        assert!(q.take_freed().is_empty());

        assert_eq!(q.pop(&mut io, None).unwrap(), Some(0));
    }

    #[test]
    fn state_roundtrip_through_recover() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        for i in 0..700u64 {
            q.push_back(&i).unwrap();
        }
        flush(&mut q, &mut io);
        assert_eq!(q.pop(&mut io, None).unwrap(), Some(0));

        // Recovery resumes from a state captured at flush time; re-flush to
        // persist the head advance, as the pager does at commit.
        flush(&mut q, &mut io);
        let state = q.state();

        let mut q2: PageQueue<u64> = PageQueue::recover("test", 4096, 4096, &state);
        assert_eq!(q2.num_entries(), 699);
        assert_eq!(q2.pop(&mut io, None).unwrap(), Some(1));
    }

    #[test]
    fn empty_queue_needs_no_flush_work() {
        let mut io = MemIo::new();
        let first = io.alloc();
        let mut q: PageQueue<u64> = PageQueue::create("test", 4096, 4096, first);

        assert_eq!(q.ids_needed(), 0);
        q.finish_flush(&mut io).unwrap();
        assert_eq!(io.writes, 0, "untouched queue must not write its page");

        let state = q.state();
        assert_eq!(state.head_page(), first);
        assert_eq!(state.tail_page(), first);
        assert_eq!(state.num_pages(), 1);
        assert_eq!(state.num_entries(), 0);
    }

    #[test]
    fn oversized_item_is_rejected() {
        #[derive(Debug, Clone, PartialEq, PartialOrd)]
        struct Big;
        impl QueueEntry for Big {
            fn encoded_len(&self) -> usize {
                1 << 16
            }
            fn encode(&self, _dst: &mut [u8]) {}
            fn decode(_src: &[u8]) -> Result<(Self, usize)> {
                Ok((Big, 1 << 16))
            }
        }

        let mut q: PageQueue<Big> = PageQueue::create("test", 4096, 4096, 2);
        assert!(q.push_back(&Big).is_err());
    }
}
