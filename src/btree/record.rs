//! # B+tree Records and Delta Encoding
//!
//! A record is `(key, version, optional value)`. At a leaf, a present
//! value is the stored user value and an absent value represents a clear
//! at that version. At an internal node, a present value is a B+tree page
//! id: the raw little-endian bytes of one or more contiguous LPIDs.
//!
//! Records compare by key, then version, then value. This is the same
//! order delta compression uses for prefix borrowing.
//!
//! ## Delta Encoding
//!
//! Inside a delta-tree page each record is stored as a delta against a
//! *base* record supplied by the traversal context (the previous or next
//! sibling bound, selected by a flag bit):
//!
//! ```text
//! flags      1 byte
//! lengths    3-8 bytes, one of four formats (see table)
//! key suffix suffix_len bytes         key = base.key[..prefix_len] ++ suffix
//! value      value_len bytes          only if HAS_VALUE
//! version    0/4/6/8 bytes            signed delta against base.version
//! ```
//!
//! Flag bits:
//!
//! ```text
//! 0x80  prefix source is the previous bound (otherwise the next bound)
//! 0x40  deleted (soft delete inside a mutable page mirror)
//! 0x20  has value
//! 0x10  has nonzero version
//! 0x0C  version delta width code: 0, 4, 6 or 8 bytes
//! 0x03  length fields format
//! ```
//!
//! Length field formats, chosen as the smallest that fits
//! `(prefix_len, suffix_len, value_len)`:
//!
//! | Format | prefix | suffix | value | Total |
//! |--------|--------|--------|-------|-------|
//! | 0      | u8     | u8     | u8    | 3     |
//! | 1      | u8     | u8     | u16   | 4     |
//! | 2      | u8     | u8     | u32   | 6     |
//! | 3      | u16    | u16    | u32   | 8     |
//!
//! All multi-byte fields are little-endian.

use eyre::{ensure, Result};
use smallvec::SmallVec;

/// A logical B+tree page may span several physical pages; a single LPID is
/// the common case.
pub type PageIds = SmallVec<[u64; 2]>;

pub const FLAG_PREFIX_SOURCE_PREV: u8 = 0x80;
pub const FLAG_IS_DELETED: u8 = 0x40;
pub const FLAG_HAS_VALUE: u8 = 0x20;
pub const FLAG_HAS_VERSION: u8 = 0x10;
pub const FLAG_VERSION_DELTA_SIZE: u8 = 0x0C;
pub const FLAG_LENGTHS_FORMAT: u8 = 0x03;

const LENGTH_FORMAT_SIZES: [usize; 4] = [3, 4, 6, 8];
const VERSION_DELTA_SIZES: [usize; 4] = [0, 4, 6, 8];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Record {
    pub key: Vec<u8>,
    pub version: u64,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, version: u64, value: Option<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            version,
            value,
        }
    }

    pub fn without_value(&self) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version,
            value: None,
        }
    }

    /// Truncates the `(key, version)` tuple for use as a shortened page
    /// separator.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.key.len());
        self.key.truncate(len);
        self.version = 0;
    }

    /// Interprets the value as a child page id list (internal records).
    pub fn child_page_ids(&self) -> Result<PageIds> {
        let bytes = self
            .value
            .as_deref()
            .ok_or_else(|| eyre::eyre!("record without value has no child page"))?;
        ensure!(
            !bytes.is_empty() && bytes.len() % 8 == 0,
            "malformed child page id list of {} bytes",
            bytes.len()
        );
        Ok(bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    pub fn set_child_pages(&mut self, ids: &[u64]) {
        let mut bytes = Vec::with_capacity(ids.len() * 8);
        for id in ids {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        self.value = Some(bytes);
    }

    pub fn with_child_pages(&self, ids: &[u64]) -> Self {
        let mut rec = self.without_value();
        rec.set_child_pages(ids);
        rec
    }

    /// Common key prefix length with `other`, assuming the first `skip`
    /// bytes are already known equal.
    pub fn common_prefix_len(&self, other: &Record, skip: usize) -> usize {
        let a = &self.key;
        let b = &other.key;
        let start = skip.min(a.len()).min(b.len());
        let limit = a.len().min(b.len());
        let mut i = start;
        while i < limit && a[i] == b[i] {
            i += 1;
        }
        i
    }

    /// Full record ordering (key, version, value), skipping `skip` known
    /// equal key bytes.
    pub fn compare(&self, other: &Record, skip: usize) -> std::cmp::Ordering {
        let a_skip = skip.min(self.key.len());
        let b_skip = skip.min(other.key.len());
        self.key[a_skip..]
            .cmp(&other.key[b_skip..])
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.value.cmp(&other.value))
    }

    pub fn same_except_value(&self, other: &Record) -> bool {
        self.key == other.key && self.version == other.version
    }

    pub fn kv_bytes(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Encoded delta size against `base` with `skip` known-equal prefix
    /// bytes. With `worst_case`, assumes the least favorable length format
    /// and version delta width that a rebalanced tree placement could
    /// require.
    pub fn delta_size(&self, base: &Record, skip: usize, worst_case: bool) -> usize {
        let prefix_len = self.common_prefix_len(base, skip);
        self.delta_size_with_prefix(base, prefix_len, worst_case)
    }

    pub fn delta_size_with_prefix(&self, base: &Record, prefix_len: usize, worst_case: bool) -> usize {
        let suffix_len = self.key.len() - prefix_len;
        let value_len = self.value.as_ref().map_or(0, |v| v.len());

        let (format, version_bytes) = if worst_case {
            (
                determine_length_format(self.key.len(), self.key.len(), value_len),
                if self.version == 0 {
                    0
                } else {
                    version_delta_size((self.version as i64) << 1)
                },
            )
        } else {
            (
                determine_length_format(prefix_len, suffix_len, value_len),
                if self.version == 0 {
                    0
                } else {
                    version_delta_size(self.version as i64 - base.version as i64)
                },
            )
        };

        1 + LENGTH_FORMAT_SIZES[format] + suffix_len + value_len + version_bytes
    }

    /// Writes the delta for reconstructing `self` from `base` into `dst`,
    /// returning the bytes used. `prefix_len` is the shared key prefix to
    /// borrow from the base.
    pub fn write_delta(&self, dst: &mut [u8], base: &Record, prefix_len: usize) -> usize {
        let suffix = &self.key[prefix_len..];
        let value_len = self.value.as_ref().map_or(0, |v| v.len());
        let format = determine_length_format(prefix_len, suffix.len(), value_len);

        let mut flags = format as u8;
        if self.value.is_some() {
            flags |= FLAG_HAS_VALUE;
        }

        let mut pos = 1 + LENGTH_FORMAT_SIZES[format];
        match format {
            0 => {
                dst[1] = prefix_len as u8;
                dst[2] = suffix.len() as u8;
                dst[3] = value_len as u8;
            }
            1 => {
                dst[1] = prefix_len as u8;
                dst[2] = suffix.len() as u8;
                dst[3..5].copy_from_slice(&(value_len as u16).to_le_bytes());
            }
            2 => {
                dst[1] = prefix_len as u8;
                dst[2] = suffix.len() as u8;
                dst[3..7].copy_from_slice(&(value_len as u32).to_le_bytes());
            }
            _ => {
                dst[1..3].copy_from_slice(&(prefix_len as u16).to_le_bytes());
                dst[3..5].copy_from_slice(&(suffix.len() as u16).to_le_bytes());
                dst[5..9].copy_from_slice(&(value_len as u32).to_le_bytes());
            }
        }

        dst[pos..pos + suffix.len()].copy_from_slice(suffix);
        pos += suffix.len();
        if let Some(value) = &self.value {
            dst[pos..pos + value.len()].copy_from_slice(value);
            pos += value.len();
        }

        if self.version != 0 {
            flags |= FLAG_HAS_VERSION;
            let delta = self.version as i64 - base.version as i64;
            let width = version_delta_size(delta);
            let code = match width {
                0 => 0u8,
                4 => 1,
                6 => 2,
                _ => 3,
            };
            flags |= code << 2;
            let bytes = delta.to_le_bytes();
            dst[pos..pos + width].copy_from_slice(&bytes[..width]);
            pos += width;
        }

        dst[0] = flags;
        pos
    }
}

pub fn determine_length_format(prefix_len: usize, suffix_len: usize, value_len: usize) -> usize {
    // Large prefix or suffix length, which should be rare, is format 3.
    if prefix_len > 0xFF || suffix_len > 0xFF {
        3
    } else if value_len < 0x100 {
        0
    } else if value_len < 0x1_0000 {
        1
    } else {
        2
    }
}

pub fn version_delta_size(delta: i64) -> usize {
    if delta == 0 {
        0
    } else if delta == delta as i32 as i64 {
        4
    } else if delta == (delta << 16) >> 16 {
        6
    } else {
        8
    }
}

/// Read-only view of an encoded delta, starting at its flag byte.
#[derive(Debug, Clone, Copy)]
pub struct DeltaView<'a> {
    bytes: &'a [u8],
}

impl<'a> DeltaView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn flags(&self) -> u8 {
        self.bytes[0]
    }

    pub fn prefix_source_prev(&self) -> bool {
        self.flags() & FLAG_PREFIX_SOURCE_PREV != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags() & FLAG_IS_DELETED != 0
    }

    pub fn has_value(&self) -> bool {
        self.flags() & FLAG_HAS_VALUE != 0
    }

    pub fn has_version(&self) -> bool {
        self.flags() & FLAG_HAS_VERSION != 0
    }

    fn length_format(&self) -> usize {
        (self.flags() & FLAG_LENGTHS_FORMAT) as usize
    }

    pub fn prefix_len(&self) -> usize {
        match self.length_format() {
            0 | 1 | 2 => self.bytes[1] as usize,
            _ => u16::from_le_bytes(self.bytes[1..3].try_into().unwrap()) as usize,
        }
    }

    pub fn suffix_len(&self) -> usize {
        match self.length_format() {
            0 | 1 | 2 => self.bytes[2] as usize,
            _ => u16::from_le_bytes(self.bytes[3..5].try_into().unwrap()) as usize,
        }
    }

    pub fn value_len(&self) -> usize {
        match self.length_format() {
            0 => self.bytes[3] as usize,
            1 => u16::from_le_bytes(self.bytes[3..5].try_into().unwrap()) as usize,
            2 => u32::from_le_bytes(self.bytes[3..7].try_into().unwrap()) as usize,
            _ => u32::from_le_bytes(self.bytes[5..9].try_into().unwrap()) as usize,
        }
    }

    fn data_offset(&self) -> usize {
        1 + LENGTH_FORMAT_SIZES[self.length_format()]
    }

    pub fn key_suffix(&self) -> &'a [u8] {
        let off = self.data_offset();
        &self.bytes[off..off + self.suffix_len()]
    }

    /// Value bytes, decodable without any base record.
    pub fn value(&self) -> Option<&'a [u8]> {
        if !self.has_value() {
            return None;
        }
        let off = self.data_offset() + self.suffix_len();
        Some(&self.bytes[off..off + self.value_len()])
    }

    fn version_delta_width(&self) -> usize {
        VERSION_DELTA_SIZES[((self.flags() & FLAG_VERSION_DELTA_SIZE) >> 2) as usize]
    }

    fn version_delta(&self) -> i64 {
        let width = self.version_delta_width();
        if width == 0 {
            return 0;
        }
        let off = self.data_offset() + self.suffix_len() + self.value_len();
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.bytes[off..off + width]);
        let raw = i64::from_le_bytes(bytes);
        // Sign-extend the narrow encodings.
        match width {
            4 => raw as i32 as i64,
            6 => (raw << 16) >> 16,
            _ => raw,
        }
    }

    pub fn total_size(&self) -> usize {
        self.data_offset() + self.suffix_len() + self.value_len() + self.version_delta_width()
    }

    /// Reconstructs the full record given its base.
    pub fn apply(&self, base: &Record) -> Record {
        let prefix_len = self.prefix_len();
        let mut key = Vec::with_capacity(prefix_len + self.suffix_len());
        key.extend_from_slice(&base.key[..prefix_len]);
        key.extend_from_slice(self.key_suffix());

        let value = self.value().map(|v| v.to_vec());
        let version = if self.has_version() {
            (base.version as i64 + self.version_delta()) as u64
        } else {
            0
        };

        Record {
            key,
            version,
            value,
        }
    }
}
