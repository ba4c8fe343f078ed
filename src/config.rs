//! # LarchDB Configuration Constants
//!
//! This module centralizes the engine's configuration constants. Constants
//! that depend on each other are co-located and their relationships are
//! documented so a change in one place can't silently break another.
//!
//! ## Dependency Graph
//!
//! ```text
//! SMALLEST_PHYSICAL_BLOCK (4096 bytes)
//!       │
//!       ├─> Header pages 0 and 1 are always written as exactly one block
//!       │
//!       └─> Physical page size = logical page size rounded up to a
//!           multiple of SMALLEST_PHYSICAL_BLOCK
//!
//! DEFAULT_PAGE_SIZE (4096 bytes, logical)
//!       │
//!       ├─> Usable page size = logical size - PAGE_CHECKSUM_SIZE
//!       │
//!       └─> PAGE_FILL_FACTOR applies to the usable size minus the
//!           B+tree page header
//!
//! DEFAULT_CACHE_BYTES (2 MiB)
//!       │
//!       └─> Cache entry limit = DEFAULT_CACHE_BYTES / physical page size
//! ```
//!
//! ## Critical Invariants
//!
//! 1. The pager header (fixed fields + meta key) must fit in one
//!    `SMALLEST_PHYSICAL_BLOCK` minus the checksum slot.
//! 2. `MAX_INPLACE_TREE_HEIGHT` bounds decode-cache growth during in-place
//!    leaf updates; exceeding it switches the commit to a linear merge.

/// Smallest unit of physical I/O. Header pages are exactly one block; data
/// pages are a whole multiple of it.
pub const SMALLEST_PHYSICAL_BLOCK: usize = 4096;

/// Default logical page size for new stores.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Trailing bytes of every page reserved for the CRC32C checksum.
pub const PAGE_CHECKSUM_SIZE: usize = 4;

/// Default page cache budget in bytes.
pub const DEFAULT_CACHE_BYTES: usize = 2 * 1024 * 1024;

/// Pager on-disk format version, rejected on mismatch at recovery.
pub const PAGER_FORMAT_VERSION: u16 = 2;

/// B+tree meta-key format version, rejected on mismatch at init.
pub const TREE_FORMAT_VERSION: u16 = 1;

/// Reserved logical page ids.
pub const HEADER_PAGE: u64 = 0;
pub const BACKUP_HEADER_PAGE: u64 = 1;

/// Invalid logical page id sentinel, also used in remap entries to mean
/// "free the original page once its remaps are undone".
pub const INVALID_LPID: u64 = u64::MAX;

/// Target fill fraction for newly built B+tree pages.
pub const PAGE_FILL_FACTOR: f32 = 0.66;

/// A delta-tree beyond this many bytes uses wide (u32) node offsets.
pub const DELTA_TREE_SMALL_SIZE_LIMIT: usize = u16::MAX as usize;

/// Maximum decoded-path height allowed for an in-place delta-tree insert.
/// An insert that would land deeper fails, signalling the commit path to
/// switch from in-place update to a linear-merge rewrite of the page.
pub const MAX_INPLACE_TREE_HEIGHT: usize = 8;

/// Internal (non-leaf) pages are built with at least this many entries.
/// Leaves may hold a single oversized record.
pub const MIN_INTERNAL_ENTRIES: usize = 4;

/// Subtree roots processed per batch by the incremental lazy-delete pass.
pub const LAZY_CLEAR_BATCH: usize = 10;

/// Page budget for the lazy-delete work piggybacked on each commit.
pub const LAZY_CLEAR_COMMIT_BUDGET: usize = 100;

/// Reserved maximum key boundary. User keys must compare strictly below this
/// sentinel; it anchors the upper end of the mutation buffer and the tree's
/// rightmost decode bound.
pub const MAX_KEY_SENTINEL: &[u8] = &[0xff; 12];

const _: () = assert!(DEFAULT_PAGE_SIZE >= SMALLEST_PHYSICAL_BLOCK);
const _: () = assert!(DEFAULT_PAGE_SIZE % SMALLEST_PHYSICAL_BLOCK == 0);
const _: () = assert!(PAGE_CHECKSUM_SIZE == 4);
