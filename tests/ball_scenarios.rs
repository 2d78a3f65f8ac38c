// ==============================================
// END-TO-END BALL SCENARIOS (integration)
// ==============================================
//
// Exercises the full pipeline: virtual addressing, residency, forced
// eviction, persistence round-trips, adaptive growth, volatile mode,
// frame locking, and large objects.

use std::sync::Arc;

use parking_lot::Mutex;

use pagekit::config::BallConfig;
use pagekit::{create_ball, Ball};

fn small_config() -> BallConfig {
    BallConfig::default()
        .with_page_size(4096)
        .with_initial_page_count(2)
        .with_capacity_limit(8192)
}

fn open_ball(dir: &tempfile::TempDir, config: BallConfig) -> Ball {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    create_ball(dir.path().join("db"), config, false).expect("ball creation")
}

#[test]
fn initial_window_hits_without_faulting() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());

    ball.write(0, &[0xAA; 4096]).unwrap();
    ball.write(4096, &[0xBB; 4096]).unwrap();
    ball.touch(0);

    let stats = ball.statistics();
    assert_eq!(stats.hit_count(), 2);
    assert_eq!(stats.miss_count(), 0);
    assert_eq!(stats.eviction_count(), 0);
}

#[test]
fn forced_eviction_flushes_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let evicted: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = evicted.clone();
    let config = small_config()
        .with_eviction_callback(Arc::new(move |page, bytes: &[u8]| {
            sink.lock().push((page, bytes.to_vec()));
        }));
    let ball = open_ball(&dir, config);

    ball.write(0, &[0xAA; 4096]).unwrap();
    ball.write(4096, &[0xBB; 4096]).unwrap();
    ball.touch(0);
    let hits_before = ball.statistics().hit_count();
    let misses_before = ball.statistics().miss_count();

    // Page 2 is one past the known window: materialised, evicting the
    // least-recently-touched resident (page 1).
    ball.write(8192, &[0xCC; 4096]).unwrap();
    assert_eq!(ball.statistics().eviction_count(), 1);
    assert_eq!(ball.statistics().miss_count() - misses_before, 1);
    assert!(!ball.is_resident(4096));
    assert!(ball.is_ghost(4096));

    // Ghost hit: reload from the store through the worker queue.
    let mut buf = [0u8; 4096];
    ball.read(4096, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xBB));
    assert_eq!(ball.statistics().hit_count() - hits_before, 1);

    // The flush job ran before our reload, so the callback has fired
    // with the outgoing bytes. (The reload itself may evict another
    // page whose callback is still queued.)
    let seen = evicted.lock();
    let first = seen.first().expect("page 1 eviction observed");
    assert_eq!(first.0, 1);
    assert!(first.1.iter().all(|&b| b == 0xBB));
    assert!(ball.statistics().flushed_buffer_size() >= 4096);
}

#[test]
fn adaptive_growth_is_capped_by_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = BallConfig::default()
        .with_page_size(4096)
        .with_initial_page_count(2)
        .with_capacity_limit(16384)
        .with_resize_threshold(2);
    let ball = open_ball(&dir, config);
    assert_eq!(ball.statistics().preallocated_slab_size(), 8192);

    // Two misses-with-eviction trigger the first growth step.
    ball.write(8192, &[1; 4096]).unwrap();
    ball.write(12288, &[2; 4096]).unwrap();
    assert_eq!(ball.statistics().preallocated_slab_size(), 12288);

    // Keep missing; the pool reaches the limit and then stays there.
    for page in 4..12u64 {
        ball.write(page * 4096, &[page as u8; 4096]).unwrap();
    }
    assert_eq!(ball.statistics().preallocated_slab_size(), 16384);
    assert!(ball.statistics().used_memory() <= 16384);
}

#[test]
fn volatile_eviction_loses_data() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config().volatile(true);
    let ball = open_ball(&dir, config);

    ball.write(0, &[0xAA; 4096]).unwrap();
    ball.write(4096, &[0xBB; 4096]).unwrap();
    ball.touch(0);
    ball.write(8192, &[0xCC; 4096]).unwrap(); // evicts dirty page 1

    assert_eq!(ball.statistics().eviction_count(), 1);
    assert!(ball.get(4096).is_none(), "volatile eviction discards data");
    assert_eq!(ball.statistics().flushed_buffer_size(), 0);
}

#[test]
fn concurrent_readers_never_observe_torn_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config().lockable(true);
    let ball = open_ball(&dir, config);
    ball.write(0, &[0x11; 4096]).unwrap();

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for round in 0..200 {
                let fill = if round % 2 == 0 { 0x11 } else { 0x22 };
                ball.write(0, &[fill; 4096]).unwrap();
            }
        });
        let mut readers = Vec::new();
        for _ in 0..8 {
            readers.push(scope.spawn(|| {
                let mut buf = [0u8; 4096];
                for _ in 0..200 {
                    ball.read(0, &mut buf).unwrap();
                    let first = buf[0];
                    assert!(first == 0x11 || first == 0x22);
                    assert!(
                        buf.iter().all(|&b| b == first),
                        "observed a torn page image"
                    );
                }
            }));
        }
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    });
}

#[test]
fn large_objects_borrow_the_callers_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());

    let data = vec![0x5A; 10_000]; // larger than one page
    let vaddr = unsafe { ball.store_large(data.as_ptr(), data.len()).unwrap() };

    let ptr = ball.get(vaddr).expect("large entry is resident");
    assert_eq!(ptr.as_ptr() as *const u8, data.as_ptr());

    let mut head = [0u8; 64];
    ball.read(vaddr, &mut head).unwrap();
    assert!(head.iter().all(|&b| b == 0x5A));

    // Age the large entry out: the reads above promoted it to the
    // frequent list, so empty the recency side and force a frequent
    // replacement.
    ball.write(8192, &[1; 4096]).unwrap();
    ball.touch(8192);
    ball.write(12288, &[2; 4096]).unwrap();
    assert!(!ball.is_resident(vaddr));

    // Eviction never frees or copies the caller's buffer, and the entry
    // cannot be re-faulted into a frame.
    assert!(ball.get(vaddr).is_none());
    assert!(data.iter().all(|&b| b == 0x5A));
}

#[test]
fn bytes_survive_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let ball = create_ball(&path, small_config(), false).unwrap();
        for page in 0..4u64 {
            ball.write(page * 4096, &[page as u8 + 1; 4096]).unwrap();
        }
        ball.close(); // flushes remaining dirty frames
    }

    let ball = create_ball(&path, small_config(), false).unwrap();
    let mut buf = [0u8; 4096];
    for page in 0..4u64 {
        ball.read(page * 4096, &mut buf).unwrap();
        assert!(
            buf.iter().all(|&b| b == page as u8 + 1),
            "page {page} lost its bytes across reopen"
        );
    }
}

#[test]
fn overwrite_discards_previous_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let ball = create_ball(&path, small_config(), false).unwrap();
        ball.write(0, &[0xEE; 4096]).unwrap();
        ball.close();
    }
    let ball = create_ball(&path, small_config(), true).unwrap();
    let mut buf = [0u8; 4096];
    ball.read(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0), "overwrite must start blank");
}

#[test]
fn far_addresses_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());

    let misses_before = ball.statistics().miss_count();
    assert!(ball.get(1 << 30).is_none());
    assert_eq!(ball.statistics().miss_count(), misses_before);

    // One page past the known window is still reachable.
    assert!(ball.get(8192).is_some());
}

#[test]
fn addresses_snap_to_page_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());

    let base = ball.get(4096).unwrap();
    let inside = ball.get(4096 + 123).unwrap();
    assert_eq!(
        inside.as_ptr() as usize,
        base.as_ptr() as usize + 123,
        "offsets must resolve inside the same frame"
    );
}

#[test]
fn eviction_callback_panics_are_contained() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config()
        .with_eviction_callback(Arc::new(|_page, _bytes: &[u8]| panic!("client bug")));
    let ball = open_ball(&dir, config);

    ball.write(0, &[0xAA; 4096]).unwrap();
    ball.write(4096, &[0xBB; 4096]).unwrap();
    ball.touch(0);
    ball.write(8192, &[0xCC; 4096]).unwrap(); // evicts page 1, callback panics

    // The reload serialises behind the flush job, proving the worker
    // survived the panic.
    let mut buf = [0u8; 4096];
    ball.read(4096, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xBB));
    assert!(ball.statistics().callback_panics() >= 1);
}

#[test]
fn reload_validation_accepts_intact_pages() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config().with_hash_function(Arc::new(|bytes: &[u8]| {
        bytes.iter().fold(0u64, |acc, &b| {
            acc.wrapping_mul(31).wrapping_add(b as u64)
        })
    }));
    let ball = open_ball(&dir, config);

    ball.write(0, &[0xAA; 4096]).unwrap();
    ball.write(4096, &[0xBB; 4096]).unwrap();
    ball.touch(0);
    ball.write(8192, &[0xCC; 4096]).unwrap(); // flush page 1 with its hash

    let mut buf = [0u8; 4096];
    ball.read(4096, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xBB));
    assert_eq!(ball.statistics().reload_validation_failures(), 0);
}

#[test]
fn burst_prefetch_warms_evicted_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BallConfig::default()
        .with_page_size(4096)
        .with_initial_page_count(2)
        .with_capacity_limit(16384)
        .with_resize_threshold(2);
    config.enable_burst_mode = true;
    let ball = open_ball(&dir, config);

    // Write pages 0..4; the early ones get evicted and flushed along
    // the way, then growth makes room to hold them all.
    for page in 0..4u64 {
        ball.write(page * 4096, &[page as u8 + 1; 4096]).unwrap();
    }
    let cold: Vec<u64> = (0..2u64)
        .map(|p| p * 4096)
        .filter(|&v| !ball.is_resident(v))
        .collect();
    ball.prefetch(&[0, 4096, 8192, 12288]).unwrap();

    for vaddr in cold {
        assert!(
            ball.is_resident(vaddr),
            "burst prefetch should have warmed {vaddr:#x}"
        );
    }
}

#[test]
fn compaction_hint_keeps_data_readable() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());

    ball.write(0, &[0xAB; 4096]).unwrap();
    ball.write(4096, &[0xCD; 4096]).unwrap();
    ball.touch(0);
    ball.write(8192, &[0xEF; 4096]).unwrap(); // flushes page 1
    ball.compact_hint().unwrap();

    let mut buf = [0u8; 4096];
    ball.read(4096, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xCD));
}

#[test]
fn register_thread_allocates_scratch_space() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());
    ball.register_thread(None).unwrap();
    std::thread::scope(|scope| {
        scope.spawn(|| ball.register_thread(Some(0)).unwrap());
    });
}

#[test]
fn statistics_track_latencies_and_memory() {
    let dir = tempfile::tempdir().unwrap();
    let ball = open_ball(&dir, small_config());

    ball.write(0, &[7; 4096]).unwrap();
    ball.write(8192, &[8; 4096]).unwrap(); // miss + eviction
    let snap = ball.statistics().snapshot();
    assert_eq!(snap.preallocated_slab_size, 8192);
    assert!(snap.used_memory <= snap.preallocated_slab_size);
    assert!(snap.avg_pointer_redirect_micros > 0.0);
    assert!(!snap.store_failed);

    // Flushes may still be queued; the ring only ever holds page-aligned
    // addresses.
    let addresses = ball.statistics().flushed_page_addresses();
    assert!(addresses.iter().all(|a| a % 4096 == 0));
}
