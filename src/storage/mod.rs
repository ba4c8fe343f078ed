//! # Storage Module
//!
//! The foundational storage layer: checksummed page buffers, the on-disk
//! pager header, the FIFO page-queue, the page cache, and the positional
//! file driver seam.
//!
//! ## Architecture Overview
//!
//! Everything above this module deals in *logical pages*: fixed-size byte
//! buffers identified by a logical page id (LPID). This module provides:
//!
//! - `PageBuf`: a page-sized buffer whose last four bytes hold a CRC32C
//!   keyed by the page's own id (`page`).
//! - `PagerHeader` / `QueueState`: the packed little-endian header stored
//!   at pages 0 and 1 (`header`).
//! - `PageQueue`: a strongly-typed FIFO stored as a linked list of pages,
//!   used for the pager's free list, delayed-free list and remap log, and
//!   for the B+tree's lazy-delete list (`queue`).
//! - `PageCache`: an LRU object cache with pin-aware eviction (`cache`).
//! - `PageFile`: the process-level file driver seam. The engine only needs
//!   positional reads and writes plus `sync`; production uses a plain
//!   `std::fs::File`, tests may substitute an in-memory file to inject
//!   failures deterministically.
//!
//! ## Page Sizes
//!
//! The logical page size is chosen at store creation (default 4096) and
//! recorded in the header. The physical page size is the logical size
//! rounded up to a whole number of smallest physical blocks; pages are read
//! and written at `lpid * physical_size`, except header pages which always
//! use one-block addressing.

mod cache;
mod header;
mod page;
mod queue;

pub use cache::{CacheCounters, PageCache};
pub use header::{PagerHeader, QueueState, HEADER_FIXED_SIZE, QUEUE_STATE_SIZE};
pub use page::{page_checksum, PageBuf};
pub use queue::{PageQueue, QueueEntry, QueuePageIo, QUEUE_PAGE_HEADER_SIZE};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{Result, WrapErr};

use crate::config::SMALLEST_PHYSICAL_BLOCK;

/// Rounds a logical page size up to a whole number of physical blocks.
pub fn physical_page_size(logical: usize) -> usize {
    let mut physical = SMALLEST_PHYSICAL_BLOCK;
    while logical > physical {
        physical += SMALLEST_PHYSICAL_BLOCK;
    }
    physical
}

/// Positional file I/O as assumed by the pager: read/write at an offset and
/// a durability barrier. Implementations must persist all completed writes
/// when `sync` returns.
pub trait PageFile: Send {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn len(&mut self) -> Result<u64>;
}

/// `PageFile` over a plain `std::fs::File`.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file at {:?}", path))?;
        Ok(Self { file })
    }
}

impl PageFile for FileStorage {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek for read")?;
        self.file
            .read_exact(buf)
            .wrap_err_with(|| format!("failed to read {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek for write")?;
        self.file
            .write_all(buf)
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().wrap_err("fsync failed")?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        let meta = self.file.metadata().wrap_err("failed to stat store file")?;
        Ok(meta.len())
    }
}
