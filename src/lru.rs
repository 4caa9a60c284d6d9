use crate::error::Result;
use crate::flush::{BatchFlag, FlushKind, WriteBatch};
use crate::page::DirtyMarker;
use crate::pool::{BufferPool, PoolInner};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LruOutcome {
    /// Pages returned to the free list, written ones included.
    pub evicted: usize,
    /// Pages queued for writing.
    pub flushed: usize,
    /// Pages evicted from the unzip_LRU tail.
    pub unzip_evicted: usize,
    pub scanned: usize,
}

impl BufferPool {
    /// Replenishes the free list from the old region of the LRU. Clean pages
    /// are evicted, dirty ones written and then evicted. Stops after `max`
    /// pages, once `free_target` frames are free, or when the LRU shrinks to
    /// its minimum length. Returns `None` when another LRU batch is running.
    pub fn lru_batch(&self, max: usize, free_target: usize) -> Result<Option<LruOutcome>> {
        let Some(_running) = BatchFlag::acquire(&self.lru_batch_running) else {
            return Ok(None);
        };
        let (min_len, write_batch_size) = {
            let setting = self.setting.read();
            (setting.lru_min_len, setting.write_batch_size)
        };
        let mut outcome = LruOutcome::default();
        let mut batch = WriteBatch::new(FlushKind::Lru, write_batch_size);
        let mut clean_evicted = 0;

        let mut inner = self.inner.lock();
        outcome.unzip_evicted = self.free_from_unzip_lru(&mut inner, max);
        let hp = inner.lru.register_hazard();
        let mut cur = inner.lru.tail();
        while let Some(frame) = cur {
            if outcome.flushed + clean_evicted >= max
                || inner.free.len() >= free_target
                || inner.lru.len() <= min_len
                || !inner.lru.is_old(frame)
            {
                break;
            }
            let prev = inner.lru.prev(frame);
            outcome.scanned += 1;
            let marker = self.frames[frame].marker();
            let meta = &inner.metas[frame];
            if meta.ready_for_replace(marker) {
                if self.evict_frame(&mut inner, frame) {
                    clean_evicted += 1;
                }
                cur = prev;
                continue;
            }
            if !(meta.ready_for_flush(marker) && meta.fix_count == 0) {
                cur = prev;
                continue;
            }
            inner.lru.set_hazard(hp, prev);
            outcome.flushed +=
                self.flush_page_and_try_neighbors(&mut inner, &mut batch, frame, outcome.flushed, max);
            if batch.is_full() {
                MutexGuard::unlocked(&mut inner, || {
                    outcome.evicted += batch.submit(self).evicted;
                });
            }
            cur = inner.lru.hazard(hp);
        }
        inner.lru.release_hazard(hp);
        drop(inner);

        let submitted = batch.finish(self);
        outcome.evicted = clean_evicted + submitted.evicted;
        self.counters
            .lru_flushed
            .fetch_add(submitted.written as u64, Ordering::Relaxed);
        if clean_evicted > 0 || outcome.unzip_evicted > 0 {
            self.free_available.notify_all();
        }
        if outcome.scanned > 0 {
            log::debug!(
                "lru batch: {} evicted, {} flushed, {} unzip evicted, {} scanned",
                outcome.evicted,
                outcome.flushed,
                outcome.unzip_evicted,
                outcome.scanned
            );
        }
        Ok(Some(outcome))
    }

    /// Evicts clean old pages from the unzip_LRU tail while it holds more
    /// than a tenth of the LRU.
    fn free_from_unzip_lru(&self, inner: &mut PoolInner, max: usize) -> usize {
        let depth = self.setting.read().lru_scan_depth;
        let mut evicted = 0;
        let mut scanned = 0;
        let mut cur = inner.unzip.tail();
        while let Some(frame) = cur {
            if evicted >= max || scanned >= depth || inner.unzip.len() <= inner.lru.len() / 10 {
                break;
            }
            scanned += 1;
            cur = inner.unzip.prev(frame);
            if inner.lru.is_old(frame) && self.evict_frame(inner, frame) {
                evicted += 1;
            }
        }
        evicted
    }

    /// First clean, unfixed and unlatched page in the old region of the LRU
    /// tail, looking at most `lru_scan_depth` pages deep.
    pub(crate) fn evict_candidate(&self, inner: &PoolInner) -> Option<usize> {
        let depth = self.setting.read().lru_scan_depth;
        inner
            .lru
            .iter_from_tail()
            .take(depth)
            .take_while(|&frame| inner.lru.is_old(frame))
            .find(|&frame| {
                let f = &self.frames[frame];
                inner.metas[frame].ready_for_replace(f.marker()) && !f.data.is_locked()
            })
    }

    /// Returns a clean page to the free list. Fails when the page is fixed,
    /// latched, under I/O or dirty.
    pub(crate) fn evict_frame(&self, inner: &mut PoolInner, frame: usize) -> bool {
        let f = &self.frames[frame];
        let Some(page) = inner.metas[frame].page else {
            return false;
        };
        let Some(_latch) = f.data.try_write() else {
            return false;
        };
        let marker = f.marker();
        if !inner.metas[frame].ready_for_replace(marker) {
            return false;
        }
        if marker == DirtyMarker::PendingClear {
            self.flush.lock().clear_pending(frame, f);
        }

        inner.page_hash.remove(&page);
        inner.lru.remove(frame);
        if inner.unzip.contains(frame) {
            inner.unzip.remove(frame);
        }
        inner.metas[frame].release();
        f.reset();
        inner.free.push_front(frame);
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        log::trace!("evicted {page} from frame {frame}");
        true
    }

    /// Frees one frame for a foreground thread: a clean page if there is one,
    /// otherwise a single dirty page written and evicted.
    pub(crate) fn flush_single_page_from_lru(&self) -> bool {
        let (depth, write_batch_size) = {
            let setting = self.setting.read();
            (setting.lru_scan_depth, setting.write_batch_size)
        };
        let mut inner = self.inner.lock();
        let mut victim = None;
        for frame in inner.lru.iter_from_tail().take(depth) {
            let meta = &inner.metas[frame];
            let marker = self.frames[frame].marker();
            if meta.ready_for_replace(marker) {
                victim = Some((frame, false));
                break;
            }
            if meta.ready_for_flush(marker) && meta.fix_count == 0 {
                victim = Some((frame, true));
                break;
            }
        }
        let Some((frame, dirty)) = victim else {
            return false;
        };
        if !dirty {
            let evicted = self.evict_frame(&mut inner, frame);
            drop(inner);
            if evicted {
                self.free_available.notify_one();
            }
            return evicted;
        }

        let mut batch = WriteBatch::new(FlushKind::SinglePage, write_batch_size);
        match self.try_begin_write(&mut inner, frame) {
            Ok(Some(w)) => batch.push(w),
            Ok(None) => return false,
            Err(err) => {
                log::trace!("single page flush skipped frame {frame}: {err}");
                return false;
            }
        }
        drop(inner);
        let submitted = batch.finish(self);
        self.counters
            .single_page_flushed
            .fetch_add(submitted.written as u64, Ordering::Relaxed);
        submitted.evicted > 0
    }
}

