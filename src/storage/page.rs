//! # Page Buffer
//!
//! Fixed-size page buffer with an embedded checksum slot. Every page in a
//! LarchDB file ends with a 4-byte CRC32C over the rest of the page plus the
//! page's own logical id, so a page written at the wrong file offset fails
//! verification just like a corrupted one.
//!
//! ## Layout
//!
//! ```text
//! +--------------------------------+----------+
//! | usable bytes                   | crc32c   |
//! | (logical_size - 4)             | (4, LE)  |
//! +--------------------------------+----------+
//! |<-------- logical_size ------------------->|
//! |<-------- physical buffer (>= logical) --->|
//! ```
//!
//! The buffer is allocated at the physical page size (the logical size
//! rounded up to a whole number of physical blocks); bytes past the logical
//! size are slack and never checksummed. Header pages use a logical size of
//! exactly one physical block.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};

use crate::config::PAGE_CHECKSUM_SIZE;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Computes the page checksum: CRC32C of `data` with the logical page id
/// appended to the digested stream.
pub fn page_checksum(data: &[u8], page_id: u64) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(data);
    digest.update(&page_id.to_le_bytes());
    digest.finalize()
}

#[derive(Debug, Clone)]
#[derive(Debug)]
pub struct PageBuf {
    data: Box<[u8]>,
    logical_size: usize,
}

impl PageBuf {
    pub fn new(logical_size: usize, physical_size: usize) -> Self {
        debug_assert!(logical_size > PAGE_CHECKSUM_SIZE);
        debug_assert!(physical_size >= logical_size);
        Self {
            data: vec![0u8; physical_size].into_boxed_slice(),
            logical_size,
        }
    }

    /// Reconstructs a page from bytes read off disk. `bytes` must be at
    /// least the logical size.
    pub fn from_bytes(bytes: Box<[u8]>, logical_size: usize) -> Self {
        debug_assert!(bytes.len() >= logical_size);
        Self {
            data: bytes,
            logical_size,
        }
    }

    pub fn logical_size(&self) -> usize {
        self.logical_size
    }

    pub fn physical_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to callers, excluding the checksum slot.
    pub fn usable_size(&self) -> usize {
        self.logical_size - PAGE_CHECKSUM_SIZE
    }

    /// The full physical buffer, as written to disk.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn usable(&self) -> &[u8] {
        &self.data[..self.usable_size()]
    }

    pub fn usable_mut(&mut self) -> &mut [u8] {
        let n = self.usable_size();
        &mut self.data[..n]
    }

    pub fn stored_checksum(&self) -> u32 {
        let off = self.usable_size();
        u32::from_le_bytes(self.data[off..off + PAGE_CHECKSUM_SIZE].try_into().unwrap())
    }

    pub fn calculate_checksum(&self, page_id: u64) -> u32 {
        page_checksum(self.usable(), page_id)
    }

    /// Stamps the checksum slot for a page about to be written at `page_id`.
    pub fn update_checksum(&mut self, page_id: u64) {
        let sum = self.calculate_checksum(page_id);
        let off = self.usable_size();
        self.data[off..off + PAGE_CHECKSUM_SIZE].copy_from_slice(&sum.to_le_bytes());
    }

    pub fn verify_checksum(&self, page_id: u64) -> bool {
        self.stored_checksum() == self.calculate_checksum(page_id)
    }

    pub fn ensure_checksum(&self, page_id: u64) -> Result<()> {
        ensure!(
            self.verify_checksum(page_id),
            crate::error::StoreError::ChecksumFailed { page: page_id }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_roundtrip() {
        let mut page = PageBuf::new(4096, 4096);
        page.usable_mut()[0] = 0xAB;
        page.usable_mut()[100] = 0xCD;
        page.update_checksum(7);

        assert!(page.verify_checksum(7));
        assert!(page.ensure_checksum(7).is_ok());
    }

    #[test]
    fn checksum_keyed_by_page_id() {
        let mut page = PageBuf::new(4096, 4096);
        page.usable_mut()[0] = 1;
        page.update_checksum(7);

        // The same bytes at a different id must not verify.
        assert!(!page.verify_checksum(8));
    }

    #[test]
    fn single_bit_flip_detected() {
        let mut page = PageBuf::new(4096, 4096);
        page.usable_mut()[42] = 0x55;
        page.update_checksum(3);

        page.raw_mut()[42] ^= 0x01;
        assert!(!page.verify_checksum(3));

        let err = page.ensure_checksum(3).unwrap_err();
        let kind = err.downcast_ref::<crate::error::StoreError>().unwrap();
        assert_eq!(*kind, crate::error::StoreError::ChecksumFailed { page: 3 });
    }

    #[test]
    fn usable_size_excludes_checksum_slot() {
        let page = PageBuf::new(4096, 8192);
        assert_eq!(page.usable_size(), 4092);
        assert_eq!(page.physical_size(), 8192);
        assert_eq!(page.logical_size(), 4096);
    }
}
