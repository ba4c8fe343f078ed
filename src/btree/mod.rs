//! # Versioned B+tree
//!
//! Ordered `(key, version) -> value` storage layered on the DWAL pager.
//! All data lives in leaf records; internal records map separator keys to
//! child page id lists. Commits apply a sorted mutation buffer to the tree
//! in one recursive pass, rewriting only the subtrees the buffer touches;
//! subtree-sized deletes are deferred to a lazy reclamation queue.
//!
//! ## Module Organization
//!
//! - `record`: records and their prefix-compressed delta encoding
//! - `deltatree`: the packed search tree occupying each page, plus its
//!   mutable in-memory mirror
//! - `mutation`: the per-commit sorted mutation buffer
//! - `tree`: the versioned tree itself (commit recursion, page writer,
//!   lazy delete queue, persistent meta key)
//! - `cursor`: user-visible read cursors bound to a snapshot version
//!
//! ## Page Format
//!
//! Every B+tree page (possibly spanning several pager pages, concatenated
//! in id order) is:
//!
//! ```text
//! u8  height       1 = leaf
//! u32 kv_bytes     raw key+value bytes stored in the page
//! <delta tree>
//! ```

mod cursor;
mod deltatree;
mod mutation;
mod record;
mod tree;

pub use cursor::ReadCursor;
pub use deltatree::{build_tree, walk_values, DeltaMirror, DtCursor, PageContent, TreeBytes};
pub use mutation::{MutationBuffer, MutationSlice, RangeMutation};
pub use record::{DeltaView, PageIds, Record};
pub use tree::{LazyDeleteEntry, TreeCounters, TreeMeta, VersionedTree};

use crate::config::MAX_KEY_SENTINEL;

pub(crate) const BTREE_PAGE_HEADER_SIZE: usize = 5;

/// The lowest possible boundary record of the tree.
pub(crate) fn db_begin() -> Record {
    Record::default()
}

/// A record greater than every storable user record.
pub(crate) fn db_end() -> Record {
    Record::new(MAX_KEY_SENTINEL.to_vec(), 0, None)
}
