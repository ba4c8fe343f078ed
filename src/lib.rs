//! # LarchDB - Versioned Copy-on-Write KV Storage Engine
//!
//! LarchDB stores ordered `(key, version) -> value` records in a single
//! paged file. Two layers do the work:
//!
//! - A **pager** providing atomic page updates with delayed
//!   write-ahead-log (DWAL) remapping: updating a page atomically writes
//!   the new bytes to a fresh physical page and logs a remap, so readers
//!   at older versions keep seeing the old bytes until no retained
//!   snapshot needs them, at which point the remap is undone in the
//!   background of a later commit.
//! - A **versioned B+tree** with prefix-compressed leaf deltas, bulk
//!   version-ordered mutation application, and a lazy reclamation queue
//!   that spreads subtree deletes across commits.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------+
//! |      VersionedTree (set/clear/commit)      |
//! +---------------------+----------------------+
//! |  MutationBuffer     |  ReadCursor          |
//! +---------------------+----------------------+
//! |  DeltaTree pages (records + delta codec)   |
//! +--------------------------------------------+
//! |  Pager: DWAL remaps, snapshots, free lists |
//! +--------------------------------------------+
//! |  PageQueue | PageCache | PagerHeader       |
//! +--------------------------------------------+
//! |  PageFile (positional I/O + fsync)         |
//! +--------------------------------------------+
//! ```
//!
//! ## File Layout
//!
//! ```text
//! page 0   active pager header (one physical block)
//! page 1   backup of the previously committed header
//! page 2+  data pages: B+tree pages, queue pages
//! ```
//!
//! Every page carries a trailing CRC32C keyed by its own page id. Commits
//! are double-fsync: everything the new header references is made durable
//! before the header itself is written and synced, so a crash at any point
//! recovers to the previous committed state (falling back to the backup
//! header if page 0 is torn).
//!
//! ## Quick Start
//!
//! ```no_run
//! use larchdb::{PagerOptions, VersionedTree};
//!
//! # fn main() -> eyre::Result<()> {
//! let mut tree = VersionedTree::open("data.larch".as_ref(), PagerOptions::default())?;
//!
//! let v = tree.last_committed_version() + 1;
//! tree.set_write_version(v)?;
//! tree.set(b"apple", b"red")?;
//! tree.clear_range(b"plum", b"prune")?;
//! tree.commit()?;
//!
//! assert_eq!(tree.get(b"apple", v)?, Some(b"red".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Versioning Model
//!
//! Writes are buffered at a single write version and become durable at
//! `commit()`. Reads go through snapshots: `cursor(version)` resolves page
//! reads through the remap table so any retained version stays readable.
//! `set_oldest_version` releases old versions; actual page reuse waits for
//! the oldest live snapshot.

pub mod btree;
pub mod config;
pub mod error;
pub mod pager;
pub mod storage;

pub use btree::{MutationBuffer, PageIds, ReadCursor, Record, TreeCounters, VersionedTree};
pub use error::StoreError;
pub use pager::{Pager, PagerCounters, PagerOptions, Snapshot};
pub use storage::{PageBuf, PageFile};
