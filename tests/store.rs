//! # End-to-End Store Scenarios
//!
//! This file is the source of truth for engine-level correctness. It
//! covers the full write/commit/read lifecycle across process restarts:
//!
//! - fresh open, set, commit, reopen, point and range reads
//! - range clears layered over older versions, multi-version reads
//! - recovery from a corrupted active header via the backup header
//! - the remap undo lifecycle gated on live snapshots
//! - free-list/delayed-free-list flushing under churn
//! - lazy subtree reclamation after bulk clears
//!
//! If a test fails after a change, the engine regressed; fix the engine,
//! not the expectations.

use larchdb::config::SMALLEST_PHYSICAL_BLOCK;
use larchdb::{PagerOptions, StoreError, VersionedTree};
use tempfile::tempdir;

fn open_tree(path: &std::path::Path) -> VersionedTree {
    VersionedTree::open(path, PagerOptions::default()).unwrap()
}

fn next_version(tree: &VersionedTree) -> u64 {
    tree.last_committed_version() + 1
}

mod basic_lifecycle {
    use super::*;

    #[test]
    fn fresh_open_set_commit_reopen_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");

        let v;
        {
            let mut tree = open_tree(&path);
            v = next_version(&tree);
            tree.set_write_version(v).unwrap();
            tree.set(b"apple", b"red").unwrap();
            tree.set(b"banana", b"yellow").unwrap();
            tree.commit().unwrap();
        }

        let mut tree = open_tree(&path);
        assert_eq!(tree.last_committed_version(), v);
        assert_eq!(tree.get(b"apple", v).unwrap(), Some(b"red".to_vec()));
        assert_eq!(tree.get(b"banana", v).unwrap(), Some(b"yellow".to_vec()));
        assert_eq!(tree.get(b"cherry", v).unwrap(), None);

        // Range scan over ["a", "c").
        let mut found = Vec::new();
        let mut cur = tree.cursor(v).unwrap();
        cur.find_first_equal_or_greater(b"a", 0).unwrap();
        while cur.is_valid() && cur.key() < b"c" as &[u8] {
            found.push((cur.key().to_vec(), cur.value().to_vec()));
            cur.next().unwrap();
        }
        assert_eq!(
            found,
            vec![
                (b"apple".to_vec(), b"red".to_vec()),
                (b"banana".to_vec(), b"yellow".to_vec()),
            ]
        );
    }

    #[test]
    fn range_clear_then_single_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        let v2 = next_version(&tree);
        tree.set_write_version(v2).unwrap();
        tree.set(b"apple", b"red").unwrap();
        tree.set(b"banana", b"yellow").unwrap();
        tree.commit().unwrap();

        let v3 = next_version(&tree);
        tree.set_write_version(v3).unwrap();
        tree.clear_range(b"a", b"c").unwrap();
        tree.set(b"apple", b"green").unwrap();
        tree.commit().unwrap();

        assert_eq!(tree.get(b"apple", v3).unwrap(), Some(b"green".to_vec()));
        assert_eq!(tree.get(b"banana", v3).unwrap(), None);

        // The older version is still retained and readable.
        assert_eq!(tree.get(b"banana", v2).unwrap(), Some(b"yellow".to_vec()));
        assert_eq!(tree.get(b"apple", v2).unwrap(), Some(b"red".to_vec()));
    }

    #[test]
    fn reads_below_oldest_version_fail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        let err = tree.cursor(0).unwrap_err();
        let kind = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(kind, StoreError::VersionTooOld { .. }));
    }

    #[test]
    fn reverse_iteration_with_find_last_less_or_equal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        let v = next_version(&tree);
        tree.set_write_version(v).unwrap();
        for i in 0..100u32 {
            tree.set(format!("k{:03}", i).as_bytes(), format!("v{}", i).as_bytes())
                .unwrap();
        }
        tree.commit().unwrap();

        let mut cur = tree.cursor(v).unwrap();
        cur.find_last_less_or_equal(b"k050", 0).unwrap();
        assert!(cur.is_valid());
        assert_eq!(cur.key(), b"k050");

        let mut count = 1;
        loop {
            cur.prev().unwrap();
            if !cur.is_valid() {
                break;
            }
            count += 1;
        }
        assert_eq!(count, 51);

        // A probe between keys lands on the predecessor.
        let mut cur = tree.cursor(v).unwrap();
        cur.find_last_less_or_equal(b"k0505", 0).unwrap();
        assert_eq!(cur.key(), b"k050");
    }

    #[test]
    fn idempotent_reapplication_of_same_mutations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        for _ in 0..2 {
            let v = next_version(&tree);
            tree.set_write_version(v).unwrap();
            for i in 0..300u32 {
                tree.set(format!("key{:04}", i).as_bytes(), b"same-value")
                    .unwrap();
            }
            tree.clear_range(b"key0100", b"key0200").unwrap();
            tree.commit().unwrap();
        }

        let v = tree.last_committed_version();
        assert_eq!(tree.get(b"key0050", v).unwrap(), Some(b"same-value".to_vec()));
        assert_eq!(tree.get(b"key0150", v).unwrap(), None);
        assert_eq!(tree.get(b"key0250", v).unwrap(), Some(b"same-value".to_vec()));
    }
}

mod recovery {
    use super::*;

    #[test]
    fn corrupted_active_header_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");

        let v;
        {
            let mut tree = open_tree(&path);
            v = next_version(&tree);
            tree.set_write_version(v).unwrap();
            tree.set(b"durable", b"yes").unwrap();
            tree.commit().unwrap();

            // A second commit makes the backup header describe version v.
            let v2 = next_version(&tree);
            tree.set_write_version(v2).unwrap();
            tree.commit().unwrap();
        }

        // Flip one bit inside the active header page.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[64] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let mut tree = open_tree(&path);
        assert_eq!(tree.last_committed_version(), v);
        assert_eq!(tree.get(b"durable", v).unwrap(), Some(b"yes".to_vec()));

        // The restored header was re-written to page 0, so a second
        // reopen reads it directly.
        drop(tree);
        let mut tree = open_tree(&path);
        assert_eq!(tree.get(b"durable", v).unwrap(), Some(b"yes".to_vec()));
    }

    #[test]
    fn both_headers_corrupt_is_unopenable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        {
            let _tree = open_tree(&path);
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[64] ^= 0x01;
        bytes[SMALLEST_PHYSICAL_BLOCK + 64] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let err = VersionedTree::open(&path, PagerOptions::default()).unwrap_err();
        let kind = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(kind, StoreError::ChecksumFailed { .. }));
    }

    #[test]
    fn truncated_existing_file_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        std::fs::write(&path, b"some stray bytes").unwrap();

        let err = VersionedTree::open(&path, PagerOptions::default()).unwrap_err();
        assert!(err.to_string().contains("refusing to open"));
    }

    #[test]
    fn state_survives_many_commit_reopen_cycles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");

        for round in 0..5u32 {
            let mut tree = open_tree(&path);
            let v = next_version(&tree);
            tree.set_write_version(v).unwrap();
            tree.set(format!("round{}", round).as_bytes(), b"done").unwrap();
            tree.commit().unwrap();
        }

        let mut tree = open_tree(&path);
        let v = tree.last_committed_version();
        for round in 0..5u32 {
            assert_eq!(
                tree.get(format!("round{}", round).as_bytes(), v).unwrap(),
                Some(b"done".to_vec()),
                "round {} lost",
                round
            );
        }
    }
}

mod versioning {
    use super::*;

    #[test]
    fn snapshot_pins_old_version_until_oldest_advances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        let v1 = next_version(&tree);
        tree.set_write_version(v1).unwrap();
        tree.set(b"k", b"old").unwrap();
        tree.commit().unwrap();

        let v2 = next_version(&tree);
        tree.set_write_version(v2).unwrap();
        tree.set(b"k", b"new").unwrap();
        tree.commit().unwrap();

        // Both versions visible while retained.
        assert_eq!(tree.get(b"k", v1).unwrap(), Some(b"old".to_vec()));
        assert_eq!(tree.get(b"k", v2).unwrap(), Some(b"new".to_vec()));

        // Advance the oldest version past v1 and commit; v1's snapshot is
        // expired and its pages become reclaimable.
        tree.set_oldest_version(v2);
        let v3 = next_version(&tree);
        tree.set_write_version(v3).unwrap();
        tree.commit().unwrap();

        let err = tree.cursor(v1).unwrap_err();
        let kind = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(kind, StoreError::VersionTooOld { .. }));
        assert_eq!(tree.get(b"k", v3).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn oldest_version_never_regresses_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let oldest;
        {
            let mut tree = open_tree(&path);
            for _ in 0..3 {
                let v = next_version(&tree);
                tree.set_write_version(v).unwrap();
                tree.set(b"x", b"y").unwrap();
                tree.commit().unwrap();
            }
            oldest = tree.last_committed_version();
            tree.set_oldest_version(oldest);
            let v = next_version(&tree);
            tree.set_write_version(v).unwrap();
            tree.commit().unwrap();
        }

        let tree = open_tree(&path);
        assert!(tree.oldest_version() >= oldest);
    }
}

mod page_reuse {
    use super::*;

    #[test]
    fn overwrite_churn_reuses_pages_instead_of_growing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        // Build a tree, then overwrite the same keys over many commits,
        // advancing the oldest version so remaps are undone and pages
        // recycled. File growth must flatten out.
        let v = next_version(&tree);
        tree.set_write_version(v).unwrap();
        for i in 0..500u32 {
            tree.set(format!("key{:04}", i).as_bytes(), b"0").unwrap();
        }
        tree.commit().unwrap();

        let mut sizes = Vec::new();
        for round in 0..10u32 {
            let v = next_version(&tree);
            tree.set_oldest_version(tree.last_committed_version());
            tree.set_write_version(v).unwrap();
            for i in (0..500u32).step_by(7) {
                tree.set(
                    format!("key{:04}", i).as_bytes(),
                    format!("{}", round).as_bytes(),
                )
                .unwrap();
            }
            tree.commit().unwrap();
            sizes.push(std::fs::metadata(&path).unwrap().len());
        }

        let first_half_max = *sizes[..5].iter().max().unwrap();
        let last = *sizes.last().unwrap();
        assert!(
            last <= first_half_max * 2,
            "file kept growing under churn: {:?}",
            sizes
        );

        let latest = tree.last_committed_version();
        assert_eq!(tree.get(b"key0000", latest).unwrap(), Some(b"9".to_vec()));
        assert_eq!(tree.get(b"key0001", latest).unwrap(), Some(b"0".to_vec()));
    }

    #[test]
    fn queue_flush_survives_allocation_free_interleaving() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        // Enough frees and allocations per commit to force queue pages to
        // fill and drain across the two-phase flush, exercising the
        // fixed-point loop. Data integrity afterwards is the proof that
        // no entry was lost.
        for round in 0..6u32 {
            let v = next_version(&tree);
            tree.set_oldest_version(tree.last_committed_version());
            tree.set_write_version(v).unwrap();
            for i in 0..800u32 {
                tree.set(
                    format!("r{}k{:05}", round % 2, i).as_bytes(),
                    format!("value-{}-{}", round, i).as_bytes(),
                )
                .unwrap();
            }
            if round > 0 {
                let gone = format!("r{}k", (round - 1) % 2);
                let gone_end = format!("r{}l", (round - 1) % 2);
                tree.clear_range(gone.as_bytes(), gone_end.as_bytes()).unwrap();
            }
            tree.commit().unwrap();
            tree.incremental_subtree_clear(usize::MAX).unwrap();
        }

        let v = tree.last_committed_version();
        assert_eq!(
            tree.get(b"r1k00000", v).unwrap(),
            Some(b"value-5-0".to_vec())
        );
        assert_eq!(tree.get(b"r0k00000", v).unwrap(), None);
    }
}

mod lazy_reclamation {
    use super::*;

    #[test]
    fn bulk_clear_commits_promptly_and_drains_incrementally() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        // Bulk-insert across several commits so the tree gains internal
        // levels.
        for batch in 0..10u32 {
            let v = next_version(&tree);
            tree.set_write_version(v).unwrap();
            for i in 0..1000u32 {
                let n = batch * 1000 + i;
                tree.set(format!("bulk{:07}", n).as_bytes(), b"payload-payload")
                    .unwrap();
            }
            tree.commit().unwrap();
        }
        assert!(tree.height() >= 2);
        let walks_before = tree.counters().commit_subtree_walks;

        // One range clear covering everything: the commit must push the
        // old subtrees onto the lazy-delete queue instead of walking them.
        let v = next_version(&tree);
        tree.set_write_version(v).unwrap();
        tree.clear_range(b"bulk", b"bulm").unwrap();
        tree.commit().unwrap();

        let walk_cost = tree.counters().commit_subtree_walks - walks_before;
        assert!(
            walk_cost < 50,
            "bulk clear visited {} subtrees; it should defer instead",
            walk_cost
        );
        assert!(tree.lazy_delete_entries() > 0 || tree.counters().lazy_freed_pages > 0);
        assert_eq!(tree.get(b"bulk0000000", v).unwrap(), None);

        // Drain the queue and verify the store collapses to an empty
        // root plus the lazy-delete queue page.
        tree.destroy_and_verify_empty().unwrap();
    }

    #[test]
    fn cleared_tree_still_serves_old_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.larch");
        let mut tree = open_tree(&path);

        let v1 = next_version(&tree);
        tree.set_write_version(v1).unwrap();
        for i in 0..2000u32 {
            tree.set(format!("doomed{:05}", i).as_bytes(), b"still-here")
                .unwrap();
        }
        tree.commit().unwrap();

        let v2 = next_version(&tree);
        tree.set_write_version(v2).unwrap();
        tree.clear_range(b"doomed", b"doomee").unwrap();
        tree.commit().unwrap();

        // Reclamation is gated on the oldest retained version, so the old
        // snapshot still reads everything.
        assert_eq!(
            tree.get(b"doomed00000", v1).unwrap(),
            Some(b"still-here".to_vec())
        );
        assert_eq!(tree.get(b"doomed00000", v2).unwrap(), None);
    }
}
