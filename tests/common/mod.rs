#![allow(dead_code)]

use bufpool::{
    BufferPool, Collaborators, Crc64Pipeline, DoubleWrite, Lsn, PageId, PageStorage, RedoLog,
    Setting, Space, SpaceId, SpaceKind, SpaceOptions,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();
pub fn setup() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

pub const PAGE_SIZE: usize = 256;
pub const SPACE: SpaceId = SpaceId::new(1);

pub fn page(no: u32) -> PageId {
    PageId::new(SPACE, no)
}

/// In-memory page store that records every write in order.
#[derive(Default)]
pub struct MemStorage {
    pages: Mutex<HashMap<PageId, Vec<u8>>>,
    log: Mutex<Vec<PageId>>,
    holes: Mutex<Vec<PageId>>,
    failing: Mutex<HashSet<PageId>>,
    latency: Mutex<Duration>,
    syncs: AtomicUsize,
    fail_next_sync: AtomicBool,
}

impl MemStorage {
    fn page_of(space: &Space, offset: u64) -> PageId {
        PageId::new(space.id(), (offset / PAGE_SIZE as u64) as u32)
    }

    /// Pages in the order their writes reached storage.
    pub fn written(&self) -> Vec<PageId> {
        self.log.lock().clone()
    }

    pub fn holes(&self) -> Vec<PageId> {
        self.holes.lock().clone()
    }

    pub fn contents(&self, page: PageId) -> Option<Vec<u8>> {
        self.pages.lock().get(&page).cloned()
    }

    pub fn fail(&self, page: PageId) {
        self.failing.lock().insert(page);
    }

    pub fn heal(&self, page: PageId) {
        self.failing.lock().remove(&page);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::SeqCst);
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl PageStorage for MemStorage {
    fn read(&self, space: &Space, offset: u64, buff: &mut [u8]) -> anyhow::Result<bool> {
        match self.pages.lock().get(&Self::page_of(space, offset)) {
            Some(bytes) => {
                buff.copy_from_slice(bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write(&self, space: &Space, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        let page = Self::page_of(space, offset);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if self.failing.lock().contains(&page) {
            return Err(anyhow::anyhow!("injected write failure on {page}"));
        }
        self.pages.lock().insert(page, bytes.to_vec());
        self.log.lock().push(page);
        Ok(())
    }

    fn punch_hole(&self, space: &Space, range: Range<u64>) -> anyhow::Result<()> {
        let page = Self::page_of(space, range.start);
        self.pages.lock().remove(&page);
        self.holes.lock().push(page);
        self.log.lock().push(page);
        Ok(())
    }

    fn sync(&self, space: &Space) -> anyhow::Result<()> {
        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected sync failure on space {}", space.id()));
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Redo log that only tracks positions.
pub struct MemRedo {
    lsn: AtomicU64,
    flushed: AtomicU64,
    capacity: AtomicU64,
}

impl MemRedo {
    pub fn new(lsn: u64, capacity: u64) -> Self {
        Self {
            lsn: AtomicU64::new(lsn),
            flushed: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity),
        }
    }

    pub fn set_lsn(&self, lsn: u64) {
        self.lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn flushed(&self) -> Lsn {
        Lsn::new(self.flushed.load(Ordering::SeqCst))
    }
}

impl RedoLog for MemRedo {
    fn lsn_approx(&self) -> Lsn {
        Lsn::new(self.lsn.load(Ordering::SeqCst))
    }

    fn write_up_to(&self, lsn: Lsn, durable: bool) -> anyhow::Result<()> {
        if durable {
            self.flushed.fetch_max(lsn.get(), Ordering::SeqCst);
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    fn resize(&self, capacity: u64) -> anyhow::Result<()> {
        self.capacity.store(capacity, Ordering::SeqCst);
        Ok(())
    }
}

pub struct TestPool {
    pub pool: Arc<BufferPool>,
    pub storage: Arc<MemStorage>,
    pub redo: Arc<MemRedo>,
}

pub fn test_pool(n: usize, setting: Setting) -> TestPool {
    test_pool_with(n, setting, None, SpaceOptions::default())
}

pub fn test_pool_with(
    n: usize,
    setting: Setting,
    doublewrite: Option<Arc<dyn DoubleWrite>>,
    options: SpaceOptions,
) -> TestPool {
    let storage = Arc::new(MemStorage::default());
    let redo = Arc::new(MemRedo::new(0, 1 << 30));
    let pool = BufferPool::new(
        PAGE_SIZE,
        n,
        setting,
        Collaborators {
            storage: storage.clone(),
            pipeline: Arc::new(Crc64Pipeline),
            doublewrite,
            redo: redo.clone(),
        },
    )
    .unwrap();
    pool.register_space(SPACE, options).unwrap();
    TestPool {
        pool,
        storage,
        redo,
    }
}

pub fn temp_options() -> SpaceOptions {
    SpaceOptions {
        kind: SpaceKind::Temporary,
        ..SpaceOptions::default()
    }
}

/// Creates the page, stamps the lsn into its first bytes and marks it dirty.
pub fn create_dirty(pool: &BufferPool, page: PageId, lsn: u64) {
    let mut w = pool.create_page(page).unwrap();
    w[0..8].copy_from_slice(&lsn.to_be_bytes());
    w.mark_dirty(Lsn::new(lsn)).unwrap();
}

/// Rewrites a resident or stored page with a new stamp.
pub fn modify(pool: &BufferPool, page: PageId, lsn: u64) {
    let mut w = pool.write_page(page).unwrap();
    w[0..8].copy_from_slice(&lsn.to_be_bytes());
    w.mark_dirty(Lsn::new(lsn)).unwrap();
}

pub fn stamp(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[0..8]);
    u64::from_be_bytes(b)
}
