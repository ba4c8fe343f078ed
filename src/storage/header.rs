//! # Pager Header
//!
//! On-disk header layout for pages 0 (active) and 1 (backup). The header is
//! written as a single smallest-physical-block sized page, checksummed with
//! its own page id, and rejected at recovery if its format version differs
//! from this build's.
//!
//! ## Layout (packed, little-endian, no padding)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------------
//! 0       2     format_version
//! 2       4     page_size          logical page size in bytes
//! 6       8     page_count
//! 14      34    free_list          embedded QueueState
//! 48      34    delayed_free_list  embedded QueueState
//! 82      34    remap_log          embedded QueueState
//! 116     8     committed_version
//! 124     8     oldest_version
//! 132     4     meta_len
//! 136     n     meta               opaque bytes owned by the B+tree
//! 136+n   ...   0xFF padding up to the checksum slot
//! ```
//!
//! Each `QueueState` is the persisted position of one FIFO page-queue:
//!
//! ```text
//! head_page (8) | head_offset (2) | tail_page (8) | num_pages (8) | num_entries (8)
//! ```
//!
//! The fixed fields plus the meta key must fit within one physical block
//! minus the checksum slot; `PagerHeader::encode_into` enforces this.

use eyre::{ensure, Result};
use zerocopy::little_endian::{I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{INVALID_LPID, PAGER_FORMAT_VERSION};
use crate::error::StoreError;
use crate::storage::page::PageBuf;

pub const QUEUE_STATE_SIZE: usize = 34;
pub const HEADER_FIXED_SIZE: usize = 136;

/// Persisted position of a FIFO page-queue, embedded in the pager header
/// (and, for the B+tree's lazy-delete queue, in the meta key).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct QueueState {
    head_page: U64,
    head_offset: U16,
    tail_page: U64,
    num_pages: I64,
    num_entries: I64,
}

const _: () = assert!(std::mem::size_of::<QueueState>() == QUEUE_STATE_SIZE);

impl QueueState {
    pub fn new(
        head_page: u64,
        head_offset: u16,
        tail_page: u64,
        num_pages: i64,
        num_entries: i64,
    ) -> Self {
        Self {
            head_page: U64::new(head_page),
            head_offset: U16::new(head_offset),
            tail_page: U64::new(tail_page),
            num_pages: I64::new(num_pages),
            num_entries: I64::new(num_entries),
        }
    }

    pub fn head_page(&self) -> u64 {
        self.head_page.get()
    }

    pub fn head_offset(&self) -> u16 {
        self.head_offset.get()
    }

    pub fn tail_page(&self) -> u64 {
        self.tail_page.get()
    }

    pub fn num_pages(&self) -> i64 {
        self.num_pages.get()
    }

    pub fn num_entries(&self) -> i64 {
        self.num_entries.get()
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new(INVALID_LPID, 0, INVALID_LPID, 0, 0)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeaderFixed {
    format_version: U16,
    page_size: U32,
    page_count: I64,
    free_list: QueueState,
    delayed_free_list: QueueState,
    remap_log: QueueState,
    committed_version: I64,
    oldest_version: I64,
    meta_len: U32,
}

const _: () = assert!(std::mem::size_of::<HeaderFixed>() == HEADER_FIXED_SIZE);

/// In-memory pager header. The pager keeps two: the working header mutated
/// between commits, and the last committed header used for recovery-visible
/// state (backup writes, effective oldest version).
#[derive(Debug, Clone)]
pub struct PagerHeader {
    pub format_version: u16,
    pub page_size: u32,
    pub page_count: i64,
    pub free_list: QueueState,
    pub delayed_free_list: QueueState,
    pub remap_log: QueueState,
    pub committed_version: u64,
    pub oldest_version: u64,
    pub meta: Vec<u8>,
}

impl PagerHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            format_version: PAGER_FORMAT_VERSION,
            page_size,
            page_count: 0,
            free_list: QueueState::default(),
            delayed_free_list: QueueState::default(),
            remap_log: QueueState::default(),
            committed_version: 0,
            oldest_version: 0,
            meta: Vec::new(),
        }
    }

    /// Serializes the header into a header page. The remainder of the page
    /// is padded with 0xFF; the checksum slot is left for the writer.
    pub fn encode_into(&self, page: &mut PageBuf) -> Result<()> {
        let avail = page.usable_size();
        ensure!(
            HEADER_FIXED_SIZE + self.meta.len() <= avail,
            "pager header with {} byte meta key exceeds header page ({} bytes usable)",
            self.meta.len(),
            avail
        );

        let fixed = HeaderFixed {
            format_version: U16::new(self.format_version),
            page_size: U32::new(self.page_size),
            page_count: I64::new(self.page_count),
            free_list: self.free_list,
            delayed_free_list: self.delayed_free_list,
            remap_log: self.remap_log,
            committed_version: I64::new(self.committed_version as i64),
            oldest_version: I64::new(self.oldest_version as i64),
            meta_len: U32::new(self.meta.len() as u32),
        };

        let buf = page.usable_mut();
        buf[..HEADER_FIXED_SIZE].copy_from_slice(fixed.as_bytes());
        buf[HEADER_FIXED_SIZE..HEADER_FIXED_SIZE + self.meta.len()].copy_from_slice(&self.meta);
        for b in &mut buf[HEADER_FIXED_SIZE + self.meta.len()..] {
            *b = 0xFF;
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_FIXED_SIZE,
            "buffer too small for pager header: {} < {}",
            bytes.len(),
            HEADER_FIXED_SIZE
        );

        let fixed = HeaderFixed::ref_from_bytes(&bytes[..HEADER_FIXED_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse pager header: {:?}", e))?;

        ensure!(
            fixed.format_version.get() == PAGER_FORMAT_VERSION,
            StoreError::FormatMismatch {
                found: fixed.format_version.get(),
                expected: PAGER_FORMAT_VERSION,
            }
        );

        let meta_len = fixed.meta_len.get() as usize;
        ensure!(
            HEADER_FIXED_SIZE + meta_len <= bytes.len(),
            "pager header meta key length {} overruns header page",
            meta_len
        );

        Ok(Self {
            format_version: fixed.format_version.get(),
            page_size: fixed.page_size.get(),
            page_count: fixed.page_count.get(),
            free_list: fixed.free_list,
            delayed_free_list: fixed.delayed_free_list,
            remap_log: fixed.remap_log,
            committed_version: fixed.committed_version.get() as u64,
            oldest_version: fixed.oldest_version.get() as u64,
            meta: bytes[HEADER_FIXED_SIZE..HEADER_FIXED_SIZE + meta_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SMALLEST_PHYSICAL_BLOCK;

    fn sample_header() -> PagerHeader {
        let mut h = PagerHeader::new(4096);
        h.page_count = 17;
        h.committed_version = 42;
        h.oldest_version = 40;
        h.free_list = QueueState::new(2, 100, 9, 3, 55);
        h.delayed_free_list = QueueState::new(3, 0, 3, 1, 0);
        h.remap_log = QueueState::new(4, 12, 8, 2, 7);
        h.meta = b"tree meta bytes".to_vec();
        h
    }

    #[test]
    fn header_encode_decode_roundtrip() {
        let h = sample_header();
        let mut page = PageBuf::new(SMALLEST_PHYSICAL_BLOCK, SMALLEST_PHYSICAL_BLOCK);
        h.encode_into(&mut page).unwrap();

        let parsed = PagerHeader::decode(page.usable()).unwrap();
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.page_count, 17);
        assert_eq!(parsed.committed_version, 42);
        assert_eq!(parsed.oldest_version, 40);
        assert_eq!(parsed.free_list, h.free_list);
        assert_eq!(parsed.delayed_free_list, h.delayed_free_list);
        assert_eq!(parsed.remap_log, h.remap_log);
        assert_eq!(parsed.meta, b"tree meta bytes");
    }

    #[test]
    fn header_pads_remainder_with_ff() {
        let h = sample_header();
        let mut page = PageBuf::new(SMALLEST_PHYSICAL_BLOCK, SMALLEST_PHYSICAL_BLOCK);
        h.encode_into(&mut page).unwrap();

        let tail_start = HEADER_FIXED_SIZE + h.meta.len();
        assert!(page.usable()[tail_start..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn header_rejects_wrong_format_version() {
        let h = sample_header();
        let mut page = PageBuf::new(SMALLEST_PHYSICAL_BLOCK, SMALLEST_PHYSICAL_BLOCK);
        h.encode_into(&mut page).unwrap();

        // Corrupt the format version field.
        page.raw_mut()[0] = 0xEE;
        let err = PagerHeader::decode(page.usable()).unwrap_err();
        let kind = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(kind, StoreError::FormatMismatch { .. }));
    }

    #[test]
    fn header_rejects_oversized_meta() {
        let mut h = sample_header();
        h.meta = vec![0u8; SMALLEST_PHYSICAL_BLOCK];
        let mut page = PageBuf::new(SMALLEST_PHYSICAL_BLOCK, SMALLEST_PHYSICAL_BLOCK);
        assert!(h.encode_into(&mut page).is_err());
    }

    #[test]
    fn queue_state_is_34_bytes() {
        assert_eq!(std::mem::size_of::<QueueState>(), 34);
        assert_eq!(std::mem::size_of::<HeaderFixed>(), 136);
    }
}
