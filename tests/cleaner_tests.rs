mod common;

use bufpool::{CheckpointFile, Checkpointer, CleanerState, Lsn, PageCleaner, Setting};
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn fast_setting() -> Setting {
    Setting {
        cleaner_period: Duration::from_millis(10),
        ..Setting::default()
    }
}

#[test]
fn test_shutdown_flushes_everything() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let t = test_pool(64, fast_setting());
    let checkpointer = Arc::new(Checkpointer::new(
        t.pool.clone(),
        CheckpointFile::open(&dir.path().join("checkpoint")).unwrap(),
    ));
    t.redo.set_lsn(2000);
    let cleaner = PageCleaner::start(t.pool.clone(), Some(checkpointer.clone())).unwrap();
    assert!(PageCleaner::start(t.pool.clone(), None).is_err());

    for i in 0..40 {
        create_dirty(&t.pool, page(i), 1000 + i as u64);
    }
    cleaner.shutdown().unwrap();

    assert_eq!(t.pool.compute_checkpoint_lsn(), None);
    let mut written = t.storage.written();
    written.sort();
    written.dedup();
    assert_eq!(written.len(), 40);
    assert_eq!(
        checkpointer.last_checkpoint().unwrap().checkpoint_lsn,
        Lsn::new(2000)
    );
    assert!(t.pool.is_shutting_down());
    assert!(t.pool.read_page(page(0)).is_err());
}

#[test]
fn test_wait_with_cleaner_running() {
    setup();
    let setting = Setting {
        cleaner_period: Duration::from_secs(10),
        ..Setting::default()
    };
    let t = test_pool(64, setting);
    let cleaner = PageCleaner::start(t.pool.clone(), None).unwrap();
    for i in 0..30 {
        create_dirty(&t.pool, page(i), 1000 + i as u64 * 10);
    }
    t.redo.set_lsn(5000);

    t.pool.wait_until_flushed(Lsn::new(1105)).unwrap();
    assert!(t.pool.is_flushed_up_to(Lsn::new(1105)));
    assert!(t.pool.durable_lsn() >= Lsn::new(1105));
    assert!(t.storage.written().len() >= 11);
    drop(cleaner);
    assert_eq!(t.pool.compute_checkpoint_lsn(), None);
}

#[test]
fn test_furious_request() {
    setup();
    let setting = Setting {
        cleaner_period: Duration::from_secs(10),
        ..Setting::default()
    };
    let t = test_pool(64, setting);
    let cleaner = PageCleaner::start(t.pool.clone(), None).unwrap();
    for i in 0..20 {
        create_dirty(&t.pool, page(i), 1000 + i as u64);
    }
    t.pool.request_flush_sync(Lsn::new(1010));

    let mut rounds = 0;
    while !t.pool.is_flushed_up_to(Lsn::new(1010)) {
        rounds += 1;
        assert!(rounds < 500, "furious flush did not finish");
        std::thread::sleep(Duration::from_millis(10));
    }
    cleaner.shutdown().unwrap();
}

#[test]
fn test_idle_cleaner_drains_dirty_pages() {
    setup();
    let t = test_pool(64, fast_setting());
    for i in 0..10 {
        create_dirty(&t.pool, page(i), 1000 + i as u64);
    }
    let cleaner = PageCleaner::start(t.pool.clone(), None).unwrap();

    let mut rounds = 0;
    while t.pool.compute_checkpoint_lsn().is_some() {
        rounds += 1;
        assert!(rounds < 500, "idle flushing did not drain the pool");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(t.storage.written().len(), 10);
    cleaner.shutdown().unwrap();
}

#[test]
fn test_cleaner_idles_on_a_quiet_pool() {
    setup();
    let t = test_pool(64, fast_setting());
    let cleaner = PageCleaner::start(t.pool.clone(), None).unwrap();
    for i in 0..5 {
        create_dirty(&t.pool, page(i), 1000 + i as u64);
    }

    let mut rounds = 0;
    while cleaner.state() != CleanerState::Idle || t.pool.compute_checkpoint_lsn().is_some() {
        rounds += 1;
        assert!(rounds < 500, "page cleaner never went idle");
        std::thread::sleep(Duration::from_millis(10));
    }
    cleaner.shutdown().unwrap();
}

#[test]
fn test_cleaner_refills_free_list_from_lru() {
    setup();
    let setting = Setting {
        lru_scan_depth: 32,
        lru_min_len: 8,
        ..fast_setting()
    };
    let t = test_pool(64, setting);
    for i in 0..60 {
        drop(t.pool.create_page(page(i)).unwrap());
    }
    assert_eq!(t.pool.stats().free, 4);

    let cleaner = PageCleaner::start(t.pool.clone(), None).unwrap();
    let mut rounds = 0;
    while t.pool.stats().free < 32 {
        rounds += 1;
        assert!(rounds < 500, "page cleaner did not refill the free list");
        std::thread::sleep(Duration::from_millis(10));
    }
    cleaner.shutdown().unwrap();
    assert!(t.pool.stats().evicted >= 28);
    assert!(t.storage.written().is_empty());
    t.pool.validate().unwrap();
}
