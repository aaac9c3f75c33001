#![forbid(unsafe_code)]
//! End-to-end conformance scenarios over the full core: allocator +
//! transactions + write-ahead log, on in-memory devices.

use lfs_error::LfsError;
use lfs_harness::Harness;
use lfs_ondisk::LogRecord;
use lfs_txn::CommitMode;
use lfs_types::{BlockAddr, TxId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Deterministic PRNG for workload shuffling (no external crate needed for
/// reproducibility in CI).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn free_count_equals_total_minus_live_at_every_committed_point() {
    init_tracing();
    let total = 4 * 8192;
    let h = Harness::new(total, 64).expect("harness");
    let mut rng = Lcg(0x1ED6_E55E);
    let mut live: Vec<(BlockAddr, u64)> = Vec::new();

    for _ in 0..200 {
        let r = rng.next();
        if !live.is_empty() && r % 3 == 0 {
            let idx = (rng.next() as usize) % live.len();
            let (addr, n) = live.swap_remove(idx);
            h.free_commit(addr, n).expect("free");
        } else {
            let n = r % 64 + 1;
            match h.alloc_commit(None, n, CommitMode::Sync) {
                Ok(addr) => live.push((addr, n)),
                Err(LfsError::NoSpace) => {
                    let (addr, n) = live.pop().expect("no space implies live extents");
                    h.free_commit(addr, n).expect("free");
                }
                Err(e) => panic!("alloc failed: {e}"),
            }
        }

        let allocated: u64 = live.iter().map(|(_, n)| n).sum();
        assert_eq!(h.map.free_blocks(), total - allocated);
    }

    for (addr, n) in live.drain(..) {
        h.free_commit(addr, n).expect("drain");
    }
    assert_eq!(h.map.free_blocks(), total);
    for di in 0..4 {
        assert!(h.map.check_dmap(di).expect("tree exact"), "dmap {di}");
    }
}

#[test]
fn allocator_transactions_serialize_on_the_same_dmap_page() {
    init_tracing();
    let h = Arc::new(Harness::new(8192, 64).expect("harness"));

    // T1 owns dmap 0's page through an allocation and holds it.
    let t1 = h.txn.begin().expect("begin t1");
    let a1 = h.map.alloc(&h.txn, t1, Some(BlockAddr(0)), 8).expect("t1 alloc");
    assert_eq!(a1, BlockAddr(0));

    let order = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(2));
    let h2 = Arc::clone(&h);
    let order2 = Arc::clone(&order);
    let barrier2 = Arc::clone(&barrier);
    let waiter = std::thread::spawn(move || {
        let t2 = h2.txn.begin().expect("begin t2");
        barrier2.wait();
        // Same dmap page: blocks until t1 reaches end().
        let a2 = h2.map.alloc(&h2.txn, t2, Some(BlockAddr(16)), 8).expect("t2 alloc");
        order2.store(2, Ordering::Release);
        assert_eq!(a2, BlockAddr(16));
        h2.txn.commit(t2, CommitMode::Sync).expect("commit t2");
        h2.txn.end(t2).expect("end t2");
    });

    barrier.wait();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(order.load(Ordering::Acquire), 0, "t2 must be blocked");

    h.txn.commit(t1, CommitMode::Sync).expect("commit t1");
    h.txn.end(t1).expect("end t1");
    waiter.join().expect("no panic");
    assert_eq!(order.load(Ordering::Acquire), 2);
    assert_eq!(h.map.free_blocks(), 8192 - 16);
}

#[test]
fn log_carries_t1_records_strictly_before_t2() {
    init_tracing();
    let h = Harness::new(8192, 64).expect("harness");

    // Both transactions are alive together so they occupy distinct arena
    // slots (tblock slots are recycled after end, and the slot is the tid
    // the log records carry).
    let t1 = h.txn.begin().expect("begin t1");
    let t2 = h.txn.begin().expect("begin t2");

    let a1 = h.map.alloc(&h.txn, t1, None, 10).expect("t1 alloc");
    h.txn.commit(t1, CommitMode::Sync).expect("commit t1");
    h.txn.end(t1).expect("end t1");

    // Same dmap page as t1 — lock_page succeeds because t1 has ended.
    h.map
        .alloc(&h.txn, t2, Some(BlockAddr(a1.0 + 10)), 10)
        .expect("t2 alloc");
    h.txn.commit(t2, CommitMode::Sync).expect("commit t2");
    h.txn.end(t2).expect("end t2");

    let records = h.log_records().expect("decode log");
    let mut positions: BTreeMap<TxId, (usize, usize)> = BTreeMap::new();
    for (_, pos, _, tid) in &records {
        let entry = positions.entry(*tid).or_insert((*pos, *pos));
        entry.0 = entry.0.min(*pos);
        entry.1 = entry.1.max(*pos);
    }
    let tids: Vec<TxId> = positions.keys().copied().collect();
    assert_eq!(tids.len(), 2, "two transactions in the log");
    let (first, second) = (positions[&tids[0]], positions[&tids[1]]);
    assert!(
        first.1 < second.0 || second.1 < first.0,
        "record ranges of the two transactions must not interleave: {positions:?}"
    );

    // Each transaction's final record is its commit record.
    for (tid, (_, last)) in &positions {
        assert!(
            matches!(records[*last].2, LogRecord::Commit),
            "last record of {tid:?} must be its commit"
        );
    }
}

#[test]
fn crash_after_t1_checkpoint_shows_only_t1() {
    init_tracing();
    let total = 2 * 8192;
    let h = Harness::new(total, 64).expect("harness");

    // T1 commits durably and is checkpointed into home locations.
    let a1 = h.alloc_commit(None, 100, CommitMode::Sync).expect("t1");
    assert_eq!(a1, BlockAddr(0));
    h.txn.checkpoint().expect("checkpoint");

    // T2 allocates but never commits; then the machine "dies".
    let t2 = h.txn.begin().expect("begin t2");
    let a2 = h.map.alloc(&h.txn, t2, None, 200).expect("t2 alloc");
    assert_ne!(a2, a1);
    let image = h.crash_image();

    let recovered = Harness::reopen_map(image).expect("reopen");
    // Exactly T1's allocation is reflected; T2 left no trace on disk.
    assert_eq!(recovered.free_blocks(), total - 100);
    assert!(recovered.check_dmap(0).expect("tree exact"));
    assert!(recovered.check_dmap(1).expect("tree exact"));

    // Let T2 finish cleanly in the still-running instance.
    h.txn.abort(t2).expect("abort");
    h.txn.end(t2).expect("end");
}

#[test]
fn lazy_commits_share_log_pages() {
    init_tracing();
    let total = 3 * 8192;
    let h = Arc::new(Harness::new(total, 64).expect("harness"));
    let barrier = Arc::new(Barrier::new(3));

    let mut handles = Vec::new();
    for k in 0..3_u64 {
        let h = Arc::clone(&h);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            // Begin before the barrier so all three transactions hold
            // distinct arena slots (and thus distinct tids in the log).
            let tid = h.txn.begin().expect("begin");
            barrier.wait();
            let addr = h
                .map
                .alloc(&h.txn, tid, Some(BlockAddr(k * 8192)), 16)
                .expect("alloc");
            h.txn.commit(tid, CommitMode::Lazy).expect("commit");
            h.txn.end(tid).expect("end");
            addr
        }));
    }
    let addrs: Vec<BlockAddr> = handles
        .into_iter()
        .map(|jh| jh.join().expect("no panic"))
        .collect();
    assert_eq!(addrs.len(), 3);

    // Wait for the background committer to land all three.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let records = h.log_records().expect("decode");
        let commits = records
            .iter()
            .filter(|(_, _, r, _)| matches!(r, LogRecord::Commit))
            .count();
        let durable = h.log.durable_lsn();
        if commits == 3 && records.iter().all(|(seq, ..)| durable.page_seq() >= *seq) {
            break;
        }
        assert!(Instant::now() < deadline, "lazy commits never became durable");
        std::thread::sleep(Duration::from_millis(10));
    }

    // All three transactions packed their records onto the first log page.
    let records = h.log_records().expect("decode");
    assert!(records.iter().all(|(seq, ..)| *seq == 1), "one shared page");
    let tids: std::collections::BTreeSet<TxId> =
        records.iter().map(|(_, _, _, tid)| *tid).collect();
    assert_eq!(tids.len(), 3);

    let log = h.log.stats();
    assert!(log.group_commit_writes >= 1);
    assert!(
        log.group_commit_writes <= 3,
        "three commits must not need more than three flushes: {log:?}"
    );
    assert_eq!(h.map.free_blocks(), total - 48);
}

#[test]
fn scenario_report_serializes() {
    init_tracing();
    let h = Harness::new(8192, 64).expect("harness");
    let a = h.alloc_commit(None, 32, CommitMode::Sync).expect("alloc");
    h.free_commit(a, 32).expect("free");

    let report = h.report("smoke");
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&report).expect("serialize")).expect("write");

    let raw = std::fs::read_to_string(&path).expect("read");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("parse");
    assert_eq!(value["name"], "smoke");
    assert_eq!(value["total_blocks"], 8192);
    assert_eq!(value["free_blocks"], 8192);
    assert!(value["commits"].as_u64().expect("commits") >= 2);
}
