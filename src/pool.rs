use crate::cleaner::CleanerEvent;
use crate::error::{Error, Result};
use crate::flush_list::FlushList;
use crate::id::{Lsn, PageId, SpaceId};
use crate::list::{List, LruList};
use crate::page::{DirtyMarker, Frame, FrameMeta, IoState};
use crate::setting::Setting;
use crate::space::{Space, SpaceKind, SpaceOptions, SpaceRegistry};
use crate::storage::{DoubleWrite, PageStorage, RedoLog, WritePipeline};
use anyhow::anyhow;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MINIMUM_PAGE_SIZE: usize = 256;
pub const MAXIMUM_PAGE_SIZE: usize = 0x10000;

const READ_ATTEMPTS: usize = 3;

type ReadLatch = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Everything the pool calls out to.
pub struct Collaborators {
    pub storage: Arc<dyn PageStorage>,
    pub pipeline: Arc<dyn WritePipeline>,
    pub doublewrite: Option<Arc<dyn DoubleWrite>>,
    pub redo: Arc<dyn RedoLog>,
}

/// State guarded by the pool-wide lock.
pub(crate) struct PoolInner {
    pub(crate) page_hash: HashMap<PageId, usize>,
    pub(crate) metas: Box<[FrameMeta]>,
    pub(crate) free: List,
    pub(crate) lru: LruList,
    pub(crate) unzip: List,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) evicted: AtomicU64,
    pub(crate) lru_flushed: AtomicU64,
    pub(crate) list_flushed: AtomicU64,
    pub(crate) single_page_flushed: AtomicU64,
    pub(crate) neighbors_flushed: AtomicU64,
    pub(crate) write_failures: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub lru: usize,
    pub lru_old: usize,
    pub unzip: usize,
    pub dirty: usize,
    pub evicted: u64,
    pub lru_flushed: u64,
    pub list_flushed: u64,
    pub single_page_flushed: u64,
    pub neighbors_flushed: u64,
    pub write_failures: u64,
}

pub struct BufferPool {
    page_size: usize,
    capacity: usize,
    pub(crate) setting: RwLock<Setting>,

    pub(crate) frames: Box<[Frame]>,
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) flush: Mutex<FlushList>,
    pub(crate) free_available: Condvar,
    pub(crate) flushed: Condvar,

    pub(crate) spaces: SpaceRegistry,
    pub(crate) storage: Arc<dyn PageStorage>,
    pub(crate) pipeline: Arc<dyn WritePipeline>,
    pub(crate) doublewrite: Option<Arc<dyn DoubleWrite>>,
    pub(crate) doublewrite_lock: Mutex<()>,
    pub(crate) redo: Arc<dyn RedoLog>,

    pub(crate) cleaner: CleanerEvent,
    pub(crate) lru_batch_running: AtomicBool,
    pub(crate) list_batch_running: AtomicBool,
    pub(crate) lsn_avg_rate: AtomicU64,
    pub(crate) counters: Counters,
    shutting_down: AtomicBool,
}

impl BufferPool {
    pub fn new(
        page_size: usize,
        n: usize,
        setting: Setting,
        io: Collaborators,
    ) -> Result<Arc<Self>> {
        Self::check_page_size(page_size)?;
        if n == 0 {
            return Err(anyhow!("buffer pool needs at least one frame").into());
        }
        setting.validate()?;

        let frames = (0..n).map(|_| Frame::new(page_size)).collect();
        let metas = (0..n).map(|_| FrameMeta::empty()).collect();
        let mut free = List::new(n);
        for i in 0..n {
            free.push_back(i);
        }
        let inner = PoolInner {
            page_hash: HashMap::with_capacity(n),
            metas,
            free,
            lru: LruList::new(n, setting.old_blocks_pct),
            unzip: List::new(n),
        };

        log::debug!("buffer pool created, {n} frames of {page_size} bytes");
        Ok(Arc::new(Self {
            page_size,
            capacity: n,
            setting: RwLock::new(setting),

            frames,
            inner: Mutex::new(inner),
            flush: Mutex::new(FlushList::new(n)),
            free_available: Condvar::new(),
            flushed: Condvar::new(),

            spaces: SpaceRegistry::default(),
            storage: io.storage,
            pipeline: io.pipeline,
            doublewrite: io.doublewrite,
            doublewrite_lock: Mutex::new(()),
            redo: io.redo,

            cleaner: CleanerEvent::new(),
            lru_batch_running: AtomicBool::new(false),
            list_batch_running: AtomicBool::new(false),
            lsn_avg_rate: AtomicU64::new(0),
            counters: Counters::default(),
            shutting_down: AtomicBool::new(false),
        }))
    }

    fn check_page_size(page_size: usize) -> anyhow::Result<()> {
        if page_size.count_ones() != 1 {
            return Err(anyhow!(
                "page size must be a power of 2, but got {}",
                page_size
            ));
        }
        if page_size < MINIMUM_PAGE_SIZE {
            return Err(anyhow!(
                "page size must be at least {} bytes, but got {}",
                MINIMUM_PAGE_SIZE,
                page_size
            ));
        }
        if page_size > MAXIMUM_PAGE_SIZE {
            return Err(anyhow!(
                "page size must be at most {} bytes, but got {}",
                MAXIMUM_PAGE_SIZE,
                page_size
            ));
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn setting(&self) -> Setting {
        self.setting.read().clone()
    }

    /// Swaps the configuration. The coordinator picks it up on its next cycle.
    pub fn reload_setting(&self, setting: Setting) -> Result<()> {
        setting.validate()?;
        self.inner.lock().lru.set_old_pct(setting.old_blocks_pct);
        *self.setting.write() = setting;
        self.cleaner.wake();
        Ok(())
    }

    pub fn spaces(&self) -> &SpaceRegistry {
        &self.spaces
    }

    pub fn register_space(&self, id: SpaceId, options: SpaceOptions) -> Result<Arc<Space>> {
        Ok(self.spaces.register(id, options)?)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Refuses new foreground work and wakes every waiter.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            log::info!("buffer pool is shutting down");
        }
        self.cleaner.wake();
        self.free_available.notify_all();
        self.flushed.notify_all();
    }

    #[inline]
    pub(crate) fn page_offset(&self, page: PageId) -> u64 {
        page.page_no() as u64 * self.page_size as u64
    }

    pub fn read_page(&self, page: PageId) -> Result<PageRead<'_>> {
        let fixed = self.fix_page(page, false)?;
        let latch = match fixed.latch {
            Some(latch) => ArcRwLockWriteGuard::downgrade(latch),
            None => self.frames[fixed.frame].data.read_arc(),
        };
        Ok(PageRead {
            pool: self,
            frame: fixed.frame,
            page,
            latch,
        })
    }

    pub fn write_page(&self, page: PageId) -> Result<PageWrite<'_>> {
        let fixed = self.fix_page(page, false)?;
        let latch = match fixed.latch {
            Some(latch) => latch,
            None => self.frames[fixed.frame].data.write_arc(),
        };
        Ok(PageWrite {
            pool: self,
            frame: fixed.frame,
            page,
            kind: fixed.kind,
            latch,
        })
    }

    /// Allocates a page in memory without reading it. Its first write skips
    /// the doublewrite buffer.
    pub fn create_page(&self, page: PageId) -> Result<PageWrite<'_>> {
        let fixed = self.fix_page(page, true)?;
        let mut latch = match fixed.latch {
            Some(latch) => latch,
            None => self.frames[fixed.frame].data.write_arc(),
        };
        latch.fill(0);
        {
            let mut inner = self.inner.lock();
            let meta = &mut inner.metas[fixed.frame];
            if meta.io == IoState::Freed {
                meta.io = IoState::Unfixed;
                meta.reinit = true;
            }
        }
        Ok(PageWrite {
            pool: self,
            frame: fixed.frame,
            page,
            kind: fixed.kind,
            latch,
        })
    }

    fn fix_page(&self, page: PageId, create: bool) -> Result<Fixed> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let space = self
            .spaces
            .get(page.space())
            .filter(|space| !space.is_stopping())
            .ok_or(Error::SpaceNotFound(page.space()))?;

        loop {
            let mut inner = self.inner.lock();
            if let Some(&frame) = inner.page_hash.get(&page) {
                if inner.metas[frame].io == IoState::ReadInProgress {
                    drop(inner);
                    // the reader holds the exclusive latch until the page is in
                    drop(self.frames[frame].data.read());
                    continue;
                }
                inner.metas[frame].fix_count += 1;
                inner.lru.promote(frame);
                return Ok(Fixed {
                    frame,
                    kind: space.kind(),
                    latch: None,
                });
            }
            drop(inner);

            let frame = self.get_free_frame()?;
            let mut inner = self.inner.lock();
            if inner.page_hash.contains_key(&page) {
                inner.free.push_front(frame);
                continue;
            }
            let Some(latch) = self.frames[frame].data.try_write_arc() else {
                inner.free.push_front(frame);
                drop(inner);
                std::thread::yield_now();
                continue;
            };
            let io = if create {
                IoState::Unfixed
            } else {
                IoState::ReadInProgress
            };
            inner.metas[frame].assign(page, io, create);
            inner.page_hash.insert(page, frame);
            inner.lru.insert_midpoint(frame);
            drop(inner);

            if create {
                space.extend(page.page_no() + 1);
                return Ok(Fixed {
                    frame,
                    kind: space.kind(),
                    latch: Some(latch),
                });
            }
            return self.finish_read(&space, page, frame, latch);
        }
    }

    fn finish_read(
        &self,
        space: &Space,
        page: PageId,
        frame: usize,
        mut latch: WriteLatch,
    ) -> Result<Fixed> {
        match self.read_into(space, page, &mut latch[..]) {
            Ok(()) => {
                self.inner.lock().metas[frame].io = IoState::Unfixed;
                Ok(Fixed {
                    frame,
                    kind: space.kind(),
                    latch: Some(latch),
                })
            }
            Err(err) => {
                let mut inner = self.inner.lock();
                inner.page_hash.remove(&page);
                inner.lru.remove(frame);
                inner.metas[frame].release();
                inner.free.push_front(frame);
                drop(inner);
                drop(latch);
                self.free_available.notify_one();
                Err(err)
            }
        }
    }

    fn read_into(&self, space: &Space, page: PageId, buff: &mut [u8]) -> Result<()> {
        let offset = self.page_offset(page);
        for attempt in 1..=READ_ATTEMPTS {
            let found = self
                .storage
                .read(space, offset, buff)
                .map_err(|cause| Error::Io { page, cause })?;
            if !found {
                buff.fill(0);
                return Ok(());
            }
            if self.pipeline.verify_after_read(page, buff) {
                return Ok(());
            }
            log::warn!("page {page} failed verification, read attempt {attempt}");
        }
        let fatal = page.page_no() == 0;
        if fatal {
            space.stop_writes("page 0 is corrupted");
        }
        Err(Error::CorruptPage { page, fatal })
    }

    fn unfix(&self, frame: usize) {
        let mut inner = self.inner.lock();
        let meta = &mut inner.metas[frame];
        debug_assert!(meta.fix_count > 0);
        meta.fix_count -= 1;
    }

    /// Takes a frame off the free list, evicting or flushing from the LRU
    /// tail when the list is empty.
    pub(crate) fn get_free_frame(&self) -> Result<usize> {
        let rounds = self.setting.read().free_wait_rounds;
        let mut round = 0;
        loop {
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.free.pop_front() {
                    return Ok(frame);
                }
                if let Some(frame) = self.evict_candidate(&inner) {
                    if self.evict_frame(&mut inner, frame) {
                        if let Some(frame) = inner.free.pop_front() {
                            return Ok(frame);
                        }
                    }
                }
            }

            self.cleaner.wake();
            if self.flush_single_page_from_lru() {
                continue;
            }

            round += 1;
            if round > rounds {
                log::warn!("no free frame after {rounds} rounds of waiting");
                return Err(Error::Exhausted);
            }
            if round % 20 == 0 {
                log::warn!("waited {round} rounds for a free frame");
            }
            let mut inner = self.inner.lock();
            if inner.free.is_empty() {
                self.free_available.wait_for(&mut inner, Duration::from_millis(10));
            }
        }
    }

    pub(crate) fn mark_dirty(&self, frame: usize, kind: SpaceKind, lsn: Lsn) -> Result<()> {
        let f = &self.frames[frame];
        if kind == SpaceKind::Temporary {
            f.note_modification(lsn);
            f.replace_marker(DirtyMarker::Clean, DirtyMarker::TempDirty);
            return Ok(());
        }
        if DirtyMarker::is_reserved(lsn) {
            return Err(Error::ReservedLsn(lsn));
        }
        f.note_modification(lsn);
        if matches!(f.marker(), DirtyMarker::Dirty(_)) {
            return Ok(());
        }
        let dirty = self.insert_dirty(frame, lsn);
        self.maybe_wake_cleaner(dirty);
        Ok(())
    }

    /// Links the frame into the flush list unless it is already there with a
    /// live LSN. Returns the flush list length.
    pub(crate) fn insert_dirty(&self, frame: usize, lsn: Lsn) -> usize {
        let f = &self.frames[frame];
        let mut flush = self.flush.lock();
        match f.marker() {
            DirtyMarker::Dirty(_) => return flush.len(),
            DirtyMarker::PendingClear => flush.remove(frame),
            DirtyMarker::Clean | DirtyMarker::TempDirty => {}
        }
        flush.insert(frame, lsn);
        f.set_marker(DirtyMarker::Dirty(lsn));
        flush.len()
    }

    /// Unlinks the frame from the flush list and forgets its modification.
    pub(crate) fn remove_dirty(&self, frame: usize) {
        let f = &self.frames[frame];
        let mut flush = self.flush.lock();
        if flush.contains(frame) {
            flush.remove(frame);
        }
        f.set_marker(DirtyMarker::Clean);
    }

    fn maybe_wake_cleaner(&self, dirty: usize) {
        let setting = self.setting.read();
        let pct = if setting.max_dirty_pages_pct_lwm > 0.0 {
            setting.max_dirty_pages_pct_lwm
        } else {
            setting.max_dirty_pages_pct
        };
        if dirty as f64 * 100.0 >= pct * self.capacity as f64 {
            self.cleaner.wake();
        }
    }

    fn mark_freed(&self, frame: usize) {
        let mut inner = self.inner.lock();
        let meta = &mut inner.metas[frame];
        debug_assert_eq!(meta.io, IoState::Unfixed);
        meta.io = IoState::Freed;
        meta.zip = None;
        if inner.unzip.contains(frame) {
            inner.unzip.remove(frame);
        }
    }

    fn compressed_len(&self, frame: usize) -> Option<usize> {
        self.inner.lock().metas[frame].zip.as_ref().map(|zip| zip.len())
    }

    fn attach_compressed(&self, frame: usize, zip: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.metas[frame].zip = Some(zip.into_boxed_slice());
        if !inner.unzip.contains(frame) {
            inner.unzip.push_front(frame);
        }
    }

    /// Forgets every page of the tablespace without writing it, once its
    /// in-flight I/O has drained.
    pub fn drop_space(&self, id: SpaceId) -> Result<()> {
        if self.spaces.begin_drop(id).is_none() {
            return Err(Error::SpaceNotFound(id));
        }
        let mut inner = self.inner.lock();
        let frames = inner
            .page_hash
            .iter()
            .filter(|(page, _)| page.space() == id)
            .map(|(_, frame)| *frame)
            .collect::<Vec<_>>();
        let mut evicted = 0;
        for frame in frames.iter().copied() {
            self.remove_dirty(frame);
            if self.evict_frame(&mut inner, frame) {
                evicted += 1;
            }
        }
        drop(inner);
        self.spaces.remove(id);
        self.free_available.notify_all();
        log::debug!(
            "dropped tablespace {id}, evicted {evicted} of {} pages",
            frames.len()
        );
        Ok(())
    }

    /// Writes every dirty page of the tablespace, retrying until no page was
    /// skipped, then drops it from the pool.
    pub fn close_space(&self, id: SpaceId) -> Result<()> {
        loop {
            let outcome = self.flush_space(id)?;
            if !outcome.may_have_skipped {
                break;
            }
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.drop_space(id)
    }

    pub fn stats(&self) -> PoolStats {
        let (free, lru, lru_old, unzip) = {
            let inner = self.inner.lock();
            (
                inner.free.len(),
                inner.lru.len(),
                inner.lru.old_len(),
                inner.unzip.len(),
            )
        };
        let dirty = self.flush.lock().len();
        PoolStats {
            capacity: self.capacity,
            free,
            lru,
            lru_old,
            unzip,
            dirty,
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            lru_flushed: self.counters.lru_flushed.load(Ordering::Relaxed),
            list_flushed: self.counters.list_flushed.load(Ordering::Relaxed),
            single_page_flushed: self.counters.single_page_flushed.load(Ordering::Relaxed),
            neighbors_flushed: self.counters.neighbors_flushed.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Checks the structure of every list and the relations between them.
    pub fn validate(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.free.validate("free")?;
        inner.lru.validate()?;
        inner.unzip.validate("unzip")?;

        for (i, meta) in inner.metas.iter().enumerate() {
            let in_free = inner.free.contains(i);
            let in_lru = inner.lru.contains(i);
            if in_free && in_lru {
                return Err(anyhow!("frame {i} is both free and in the lru"));
            }
            if in_free && meta.page.is_some() {
                return Err(anyhow!("free frame {i} still holds a page"));
            }
            if in_lru != meta.page.is_some() {
                return Err(anyhow!("frame {i} lru membership disagrees with its page"));
            }
            if inner.unzip.contains(i) && !in_lru {
                return Err(anyhow!("frame {i} is in the unzip lru only"));
            }
            if let Some(page) = meta.page {
                if inner.page_hash.get(&page) != Some(&i) {
                    return Err(anyhow!("page {page} in frame {i} is missing from the hash"));
                }
            }
        }
        if inner.page_hash.len() != inner.lru.len() {
            return Err(anyhow!(
                "{} hashed pages but {} pages in the lru",
                inner.page_hash.len(),
                inner.lru.len()
            ));
        }

        let flush = self.flush.lock();
        flush.validate(&self.frames)?;
        for frame in flush.iter_from_tail() {
            if inner.metas[frame].page.is_none() {
                return Err(anyhow!("dirty frame {frame} holds no page"));
            }
        }
        Ok(())
    }
}

struct Fixed {
    frame: usize,
    kind: SpaceKind,
    latch: Option<WriteLatch>,
}

/// Shared access to a resident page. The page stays fixed in the pool until
/// the guard is dropped.
pub struct PageRead<'a> {
    pool: &'a BufferPool,
    frame: usize,
    page: PageId,
    latch: ReadLatch,
}

impl PageRead<'_> {
    pub fn id(&self) -> PageId {
        self.page
    }

    pub fn marker(&self) -> DirtyMarker {
        self.pool.frames[self.frame].marker()
    }

    /// Size of the attached compressed copy, if any.
    pub fn compressed_len(&self) -> Option<usize> {
        self.pool.compressed_len(self.frame)
    }
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.latch
    }
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        self.pool.unfix(self.frame);
    }
}

/// Exclusive access to a resident page.
pub struct PageWrite<'a> {
    pool: &'a BufferPool,
    frame: usize,
    page: PageId,
    kind: SpaceKind,
    latch: WriteLatch,
}

impl PageWrite<'_> {
    pub fn id(&self) -> PageId {
        self.page
    }

    pub fn marker(&self) -> DirtyMarker {
        self.pool.frames[self.frame].marker()
    }

    /// Records a modification at `lsn`. Only the first modification since
    /// the page was last clean positions it in the flush list.
    pub fn mark_dirty(&mut self, lsn: Lsn) -> Result<()> {
        self.pool.mark_dirty(self.frame, self.kind, lsn)
    }

    /// Frees the page: contents are zeroed and the next write punches a hole.
    pub fn free(&mut self, lsn: Lsn) -> Result<()> {
        self.latch.fill(0);
        self.pool.mark_freed(self.frame);
        self.pool.mark_dirty(self.frame, self.kind, lsn)
    }

    /// Keeps a compressed copy next to the frame until the page is evicted.
    pub fn attach_compressed(&mut self, zip: Vec<u8>) {
        self.pool.attach_compressed(self.frame, zip);
    }
}

impl Deref for PageWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.latch
    }
}

impl DerefMut for PageWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.latch
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        self.pool.unfix(self.frame);
    }
}
