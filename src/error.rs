//! # Semantic Error Kinds
//!
//! Most failures in LarchDB propagate as `eyre::Report` with contextual
//! messages. The conditions a caller may reasonably want to match on are
//! raised as `StoreError` variants inside the report and can be recovered
//! with `report.downcast_ref::<StoreError>()`:
//!
//! - `VersionTooOld`: a snapshot was requested below every retained version.
//! - `SnapshotExpired`: a read went through a snapshot handle the pager has
//!   already expired.
//! - `ChecksumFailed`: a data page failed CRC verification on read.
//! - `FormatMismatch`: the header or meta-key format version differs from
//!   what this build understands, or an existing file is too short to have
//!   ever been committed.
//!
//! Internal invariant violations (bugs) use `eyre::bail!` at the point of
//! detection and are not part of this enum.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version {requested} is too old, oldest retained version is {oldest}")]
    VersionTooOld { requested: u64, oldest: u64 },

    #[error("snapshot at version {version} has expired")]
    SnapshotExpired { version: u64 },

    #[error("checksum verification failed for page {page}")]
    ChecksumFailed { page: u64 },

    #[error("format version {found} not supported (expected {expected})")]
    FormatMismatch { found: u16, expected: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_downcasts_through_eyre() {
        let report = eyre::Report::new(StoreError::ChecksumFailed { page: 7 });
        let err = report.downcast_ref::<StoreError>().unwrap();
        assert_eq!(*err, StoreError::ChecksumFailed { page: 7 });
    }

    #[test]
    fn store_error_messages_name_the_condition() {
        let e = StoreError::VersionTooOld {
            requested: 3,
            oldest: 10,
        };
        assert!(e.to_string().contains("too old"));

        let e = StoreError::FormatMismatch {
            found: 9,
            expected: 2,
        };
        assert!(e.to_string().contains("format version 9"));
    }
}
