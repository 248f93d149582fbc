//! End-to-end store tests: push/pop round-trips, ordering, and restart
//! durability against real files in a temp directory.

use std::path::PathBuf;

use rand::{Rng, SeedableRng};

use bpn_core::{
    BundleView, CrcType, Eid, PrimaryBlock, PrimaryFields,
};
use bpn_core::primary::{BundleFlags, CreationTimestamp};
use bpn_storage::{BundleStore, ReadSession, StoreOptions, WriteSession, PER_SEGMENT_PAYLOAD, SEGMENT_SIZE};

fn store_paths(dir: &tempfile::TempDir, num_disks: usize) -> Vec<PathBuf> {
    (0..num_disks)
        .map(|i| dir.path().join(format!("store{i}.bin")))
        .collect()
}

fn options(dir: &tempfile::TempDir, num_disks: usize) -> StoreOptions {
    // 4096 segments of capacity
    StoreOptions::new(store_paths(dir, num_disks), 4096 * SEGMENT_SIZE as u64)
}

/// Serialize a v7 bundle with the given store-relevant head fields.
fn make_bundle(
    rng: &mut impl Rng,
    dest_node: u64,
    priority: u8,
    expiration_secs: u64,
    payload_len: usize,
) -> Vec<u8> {
    let mut payload = vec![0u8; payload_len];
    rng.fill(payload.as_mut_slice());
    let mut flags = BundleFlags::default();
    flags.set_priority_index(priority);
    let primary = PrimaryBlock {
        flags,
        crc_type: CrcType::Crc32c,
        destination: Eid::new(dest_node, 1),
        source: Eid::new(100, 1),
        report_to: Eid::NULL,
        creation: CreationTimestamp {
            time_ms: 0,
            sequence: 1,
        },
        lifetime_ms: expiration_secs * 1000,
        fragment_offset: None,
        total_adu_length: None,
    };
    BundleView::new(primary, payload, CrcType::Crc32c).rendered().to_vec()
}

fn push_bundle(store: &BundleStore, bundle: &[u8]) -> u64 {
    let fields = PrimaryFields::decode(bundle).unwrap();
    let mut session = WriteSession::new();
    let segments = store
        .push(&mut session, &fields, bundle.len() as u64)
        .unwrap();
    store.push_all_segments(&mut session, bundle).unwrap();
    segments
}

#[test]
fn single_byte_payload_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BundleStore::new(options(&dir, 2)).unwrap();
    let baseline = store.memory_manager().backup();

    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    let bundle = make_bundle(&mut rng, 5, 1, 100, 1);
    let segments = push_bundle(&store, &bundle);
    assert_eq!(segments, 1);
    assert_eq!(store.counters().num_bundles_stored, 1);

    let mut session = ReadSession::new();
    let size = store.pop_top(&mut session, &[5]).unwrap().unwrap();
    assert_eq!(size, bundle.len() as u64);
    let read_back = store.read_all(&mut session).unwrap();
    assert_eq!(read_back, bundle);

    store.remove_read_bundle_from_disk(&mut session, false).unwrap();
    assert!(store.memory_manager().is_backup_equal(&baseline));
    assert_eq!(store.counters().num_bundles_deleted_from_storage, 1);
}

#[test]
fn multi_segment_sizes_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BundleStore::new(options(&dir, 2)).unwrap();
    let baseline = store.memory_manager().backup();
    let mut rng = rand::rngs::StdRng::seed_from_u64(2);

    let payload_sizes = [
        1,
        PER_SEGMENT_PAYLOAD - 2,
        PER_SEGMENT_PAYLOAD - 1,
        PER_SEGMENT_PAYLOAD,
        PER_SEGMENT_PAYLOAD + 1,
        2 * PER_SEGMENT_PAYLOAD,
        2 * PER_SEGMENT_PAYLOAD + 2,
        10 * PER_SEGMENT_PAYLOAD - 57,
    ];
    for payload_len in payload_sizes {
        let bundle = make_bundle(&mut rng, 3, 2, 500, payload_len);
        let expected_segments = (bundle.len() as u64).div_ceil(PER_SEGMENT_PAYLOAD as u64);
        let segments = push_bundle(&store, &bundle);
        assert_eq!(segments, expected_segments, "payload {payload_len}");

        let mut session = ReadSession::new();
        let size = store.pop_top(&mut session, &[3]).unwrap().unwrap();
        assert_eq!(size, bundle.len() as u64);
        assert_eq!(store.read_all(&mut session).unwrap(), bundle);
        store.remove_read_bundle_from_disk(&mut session, false).unwrap();
    }
    assert!(store.memory_manager().is_backup_equal(&baseline));
}

#[test]
fn pop_order_priority_then_expiration() {
    let dir = tempfile::tempdir().unwrap();
    let store = BundleStore::new(options(&dir, 2)).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);

    // (priority, expiration) pushed in arbitrary order
    let entries = [(0u8, 10u64), (1, 50), (2, 200)];
    let mut bundles = Vec::new();
    for (priority, expiration) in entries {
        let bundle = make_bundle(&mut rng, 1, priority, expiration, 64);
        push_bundle(&store, &bundle);
        bundles.push(((priority, expiration), bundle));
    }

    // expedited first even though it expires last
    for expected in [(2u8, 200u64), (1, 50), (0, 10)] {
        let mut session = ReadSession::new();
        store.pop_top(&mut session, &[1]).unwrap().unwrap();
        let read_back = store.read_all(&mut session).unwrap();
        let (meta, _) = bundles
            .iter()
            .find(|(_, b)| *b == read_back)
            .expect("popped bundle should be one we pushed");
        assert_eq!(*meta, expected);
        store.remove_read_bundle_from_disk(&mut session, false).unwrap();
    }
}

#[test]
fn custody_is_exclusive_until_returned() {
    let dir = tempfile::tempdir().unwrap();
    let store = BundleStore::new(options(&dir, 1)).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(4);
    let bundle = make_bundle(&mut rng, 7, 1, 40, 200);
    push_bundle(&store, &bundle);

    let mut session = ReadSession::new();
    let size = store.pop_top(&mut session, &[7]).unwrap().unwrap();
    assert_eq!(size, bundle.len() as u64);

    // while held, a second session sees nothing
    let mut session2 = ReadSession::new();
    assert!(store.pop_top(&mut session2, &[7]).unwrap().is_none());

    // return, then pop again
    store.return_top(&mut session).unwrap();
    let size = store.pop_top(&mut session2, &[7]).unwrap().unwrap();
    assert_eq!(size, bundle.len() as u64);
    assert_eq!(store.read_all(&mut session2).unwrap(), bundle);
    store.remove_read_bundle_from_disk(&mut session2, false).unwrap();
}

#[test]
fn remove_requires_complete_read_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let store = BundleStore::new(options(&dir, 1)).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let bundle = make_bundle(&mut rng, 2, 0, 10, 3 * PER_SEGMENT_PAYLOAD);
    push_bundle(&store, &bundle);

    let mut session = ReadSession::new();
    store.pop_top(&mut session, &[2]).unwrap().unwrap();
    let _ = store.top_segment(&mut session).unwrap();

    let err = store
        .remove_read_bundle_from_disk(&mut session, false)
        .unwrap_err();
    assert!(matches!(err, bpn_storage::StorageError::BundleNotRead));

    // force removal mid-read succeeds and frees the chain
    let baseline_free = store.memory_manager().num_free();
    store.remove_read_bundle_from_disk(&mut session, true).unwrap();
    assert!(store.memory_manager().num_free() > baseline_free);
}

#[test]
fn restart_restores_bundles_and_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(6);

    // two bundles share a bucket to exercise LIFO restoration
    let specs: [(u64, u8, u64, usize); 5] = [
        (1, 2, 90, 64),
        (1, 1, 10, PER_SEGMENT_PAYLOAD + 11),
        (2, 1, 10, 4 * PER_SEGMENT_PAYLOAD),
        (1, 1, 10, 128),
        (1, 0, 5, 2 * PER_SEGMENT_PAYLOAD + 77),
    ];
    let mut bundles = Vec::new();
    let mut total_bytes = 0u64;
    let mut total_segments = 0u64;

    let backup;
    let expected_order: Vec<Vec<u8>>;
    {
        let store = BundleStore::new(options(&dir, 2)).unwrap();
        for (dest, priority, expiration, payload_len) in specs {
            let bundle = make_bundle(&mut rng, dest, priority, expiration, payload_len);
            total_bytes += bundle.len() as u64;
            total_segments += (bundle.len() as u64).div_ceil(PER_SEGMENT_PAYLOAD as u64);
            push_bundle(&store, &bundle);
            bundles.push(bundle);
        }
        backup = store.memory_manager().backup();

        // determine the pre-restart pop order without consuming custody
        let mut order = Vec::new();
        let mut sessions = Vec::new();
        loop {
            let mut session = ReadSession::new();
            if store.pop_top(&mut session, &[1, 2]).unwrap().is_none() {
                break;
            }
            order.push(store.read_all(&mut session).unwrap());
            sessions.push(session);
        }
        // return in reverse pop order so each bucket regains its original order
        for session in sessions.iter_mut().rev() {
            store.return_top(session).unwrap();
        }
        expected_order = order;
        // store drops here: workers drain and files are flushed
    }

    let mut opts = options(&dir, 2);
    opts.try_restore_from_disk = true;
    let store = BundleStore::new(opts).unwrap();

    let counters = store.counters();
    assert_eq!(counters.num_bundles_restored, 5);
    assert_eq!(counters.num_bytes_restored, total_bytes);
    assert_eq!(counters.num_segments_restored, total_segments);
    assert!(store.memory_manager().is_backup_equal(&backup));

    for expected in &expected_order {
        let mut session = ReadSession::new();
        store.pop_top(&mut session, &[1, 2]).unwrap().unwrap();
        assert_eq!(&store.read_all(&mut session).unwrap(), expected);
        store.remove_read_bundle_from_disk(&mut session, false).unwrap();
    }
    let mut session = ReadSession::new();
    assert!(store.pop_top(&mut session, &[1, 2]).unwrap().is_none());
    assert!(bundles.iter().all(|b| expected_order.contains(b)));
}

#[test]
fn deleted_head_is_skipped_on_restart_and_ids_reused() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let removed_chain: Vec<u32>;
    {
        let store = BundleStore::new(options(&dir, 2)).unwrap();
        // distinct expirations so pop order is deterministic
        for expiration in [10u64, 20, 30] {
            let bundle = make_bundle(&mut rng, 4, 1, expiration, 2 * PER_SEGMENT_PAYLOAD);
            push_bundle(&store, &bundle);
        }
        // remove the earliest-expiring bundle
        let mut session = ReadSession::new();
        store.pop_top(&mut session, &[4]).unwrap().unwrap();
        let _ = store.read_all(&mut session).unwrap();
        removed_chain = session.segment_chain().to_vec();
        store.remove_read_bundle_from_disk(&mut session, false).unwrap();
    }

    let mut opts = options(&dir, 2);
    opts.try_restore_from_disk = true;
    let store = BundleStore::new(opts).unwrap();
    assert_eq!(store.counters().num_bundles_restored, 2);

    // the freed IDs are available again, smallest-first
    let bundle = make_bundle(&mut rng, 9, 0, 99, 2 * PER_SEGMENT_PAYLOAD);
    let fields = PrimaryFields::decode(&bundle).unwrap();
    let mut session = WriteSession::new();
    store.push(&mut session, &fields, bundle.len() as u64).unwrap();
    assert_eq!(session.segment_chain(), removed_chain.as_slice());
    store.push_all_segments(&mut session, &bundle).unwrap();
}

#[test]
fn out_of_space_and_abort_releases_chain() {
    let dir = tempfile::tempdir().unwrap();
    // tiny store: 8 segments
    let opts = StoreOptions::new(store_paths(&dir, 1), 8 * SEGMENT_SIZE as u64);
    let store = BundleStore::new(opts).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(8);

    let bundle = make_bundle(&mut rng, 1, 1, 10, 20 * PER_SEGMENT_PAYLOAD);
    let fields = PrimaryFields::decode(&bundle).unwrap();
    let mut session = WriteSession::new();
    assert!(matches!(
        store.push(&mut session, &fields, bundle.len() as u64),
        Err(bpn_storage::StorageError::OutOfSpace { .. })
    ));

    // a partially-pushed session can be aborted without leaking segments
    let baseline = store.memory_manager().backup();
    let small = make_bundle(&mut rng, 1, 1, 10, 2 * PER_SEGMENT_PAYLOAD);
    let fields = PrimaryFields::decode(&small).unwrap();
    let mut session = WriteSession::new();
    store.push(&mut session, &fields, small.len() as u64).unwrap();
    store.push_segment(&mut session, &small[..PER_SEGMENT_PAYLOAD]).unwrap();
    store.abort_write(&mut session).unwrap();
    assert!(store.memory_manager().is_backup_equal(&baseline));
}

#[test]
fn auto_delete_files_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let paths = store_paths(&dir, 2);
    {
        let mut opts = options(&dir, 2);
        opts.auto_delete_files_on_exit = true;
        let store = BundleStore::new(opts).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        let bundle = make_bundle(&mut rng, 1, 1, 10, 10);
        push_bundle(&store, &bundle);
        assert!(paths.iter().all(|p| p.exists()));
    }
    assert!(paths.iter().all(|p| !p.exists()));
}
