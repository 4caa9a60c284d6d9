mod common;

use bufpool::{CheckpointFile, Checkpointer, Lsn, PageCleaner, Setting};
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_checkpoint_survives_restart() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint");
    {
        let t = test_pool(8, Setting::default());
        let checkpointer = Checkpointer::new(t.pool.clone(), CheckpointFile::open(&path).unwrap());
        assert_eq!(checkpointer.last_checkpoint(), None);
        checkpointer.write_checkpoint(Lsn::new(400)).unwrap();
        let record = checkpointer.write_checkpoint(Lsn::new(500)).unwrap();
        assert_eq!(record.checkpoint_lsn, Lsn::new(500));
    }

    let file = CheckpointFile::open(&path).unwrap();
    let record = file.recovered().unwrap();
    assert_eq!(record.checkpoint_lsn, Lsn::new(500));
    assert_eq!(record.end_lsn, Lsn::new(500));
}

#[test]
fn test_header_file_is_locked() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint");
    let file = CheckpointFile::open(&path).unwrap();
    assert!(CheckpointFile::open(&path).is_err());
    drop(file);
    CheckpointFile::open(&path).unwrap();
}

#[test]
fn test_checkpoint_follows_oldest_modification() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let t = test_pool(16, Setting::default());
    let checkpointer = Checkpointer::new(
        t.pool.clone(),
        CheckpointFile::open(&dir.path().join("checkpoint")).unwrap(),
    );
    create_dirty(&t.pool, page(0), 100);
    create_dirty(&t.pool, page(1), 200);
    t.redo.set_lsn(300);

    assert!(checkpointer.checkpoint(false).unwrap());
    let record = checkpointer.last_checkpoint().unwrap();
    assert_eq!(record.checkpoint_lsn, Lsn::new(100));
    assert_eq!(record.end_lsn, Lsn::new(300));
    assert!(t.redo.flushed() >= Lsn::new(100));
    assert!(t.storage.syncs() > 0);

    // nothing moved
    assert!(!checkpointer.checkpoint(false).unwrap());

    t.pool.flush_list_batch(usize::MAX, Lsn::MAX).unwrap().unwrap();
    assert!(checkpointer.checkpoint(false).unwrap());
    assert_eq!(
        checkpointer.last_checkpoint().unwrap().checkpoint_lsn,
        Lsn::new(300)
    );
}

#[test]
fn test_make_checkpoint_at() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let t = test_pool(16, Setting::default());
    let checkpointer = Checkpointer::new(
        t.pool.clone(),
        CheckpointFile::open(&dir.path().join("checkpoint")).unwrap(),
    );
    for i in 0..10 {
        create_dirty(&t.pool, page(i), 100 + i as u64 * 10);
    }
    t.redo.set_lsn(1000);

    checkpointer.make_checkpoint_at(Lsn::new(150)).unwrap();
    assert_eq!(t.storage.written().len(), 5);
    assert_eq!(
        checkpointer.last_checkpoint().unwrap().checkpoint_lsn,
        Lsn::new(150)
    );
}

#[test]
fn test_resize_log_checkpoints_first() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let t = test_pool(16, Setting::default());
    let checkpointer = Arc::new(Checkpointer::new(
        t.pool.clone(),
        CheckpointFile::open(&dir.path().join("checkpoint")).unwrap(),
    ));
    for i in 0..4 {
        create_dirty(&t.pool, page(i), 100 + i as u64);
    }
    t.redo.set_lsn(500);

    checkpointer.resize_log(4096).unwrap();
    assert_eq!(bufpool::RedoLog::capacity(t.redo.as_ref()), 4096);
    assert_eq!(t.pool.compute_checkpoint_lsn(), None);
    assert_eq!(
        checkpointer.last_checkpoint().unwrap().checkpoint_lsn,
        Lsn::new(500)
    );
}

#[test]
fn test_margins_raise_targets() {
    setup();
    let setting = Setting {
        cleaner_period: Duration::from_secs(10),
        ..Setting::default()
    };
    let t = test_pool(16, setting);
    create_dirty(&t.pool, page(0), 100);
    create_dirty(&t.pool, page(1), 500);
    let cleaner = PageCleaner::start(t.pool.clone(), None).unwrap();

    // checkpoint age just past the synchronous margin of a 1 GiB log
    t.redo.set_lsn(100 + (1u64 << 30) / 16 * 15 + 10);
    t.pool.check_margins();

    let mut rounds = 0;
    while t.storage.written().is_empty() {
        rounds += 1;
        assert!(rounds < 500, "margin flush did not happen");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(t.storage.written()[0], page(0));
    cleaner.shutdown().unwrap();
}
