//! # Pager Snapshots
//!
//! A snapshot is a read view at a specific committed version. Handles are
//! reference-counted; the pager keeps its own reference per retained
//! version in a version-ordered deque and drops one only when it is the
//! sole remaining owner and the version has fallen below the pending
//! oldest version.
//!
//! Each handle carries an `expired` flag. The pager sets it when it
//! retires the version; any read attempted through an expired handle fails
//! with `StoreError::SnapshotExpired` rather than returning pages that may
//! since have been reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct SnapshotInner {
    pub(crate) version: u64,
    pub(crate) meta: Vec<u8>,
    pub(crate) expired: AtomicBool,
}

impl SnapshotInner {
    pub(crate) fn new(version: u64, meta: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            version,
            meta,
            expired: AtomicBool::new(false),
        })
    }
}

/// Read view at one committed version. Cheap to clone; all clones expire
/// together when the pager retires the version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub(crate) inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// The meta key that was committed at this snapshot's version.
    pub fn meta_key(&self) -> &[u8] {
        &self.inner.meta
    }

    pub fn is_expired(&self) -> bool {
        self.inner.expired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_exposes_version_and_meta() {
        let inner = SnapshotInner::new(12, b"meta".to_vec());
        let snap = Snapshot { inner };
        assert_eq!(snap.version(), 12);
        assert_eq!(snap.meta_key(), b"meta");
        assert!(!snap.is_expired());
    }

    #[test]
    fn expiry_is_visible_to_all_clones() {
        let inner = SnapshotInner::new(3, Vec::new());
        let snap = Snapshot {
            inner: Arc::clone(&inner),
        };
        let clone = snap.clone();

        inner.expired.store(true, Ordering::Release);
        assert!(snap.is_expired());
        assert!(clone.is_expired());
    }
}
