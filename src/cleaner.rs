use crate::adaptive::{AdaptiveFlush, FlushSample};
use crate::checkpoint::Checkpointer;
use crate::error::Result;
use crate::id::Lsn;
use crate::pool::BufferPool;
use crate::setting::Setting;
use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SHUTDOWN_MAX_STALLS: usize = 100;
const STALL_SLEEP: Duration = Duration::from_millis(10);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CleanerState {
    Idle = 0,
    LruFlushing = 1,
    ListFlushing = 2,
    FuriousFlushing = 3,
    ShuttingDown = 4,
}

impl CleanerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CleanerState::LruFlushing,
            2 => CleanerState::ListFlushing,
            3 => CleanerState::FuriousFlushing,
            4 => CleanerState::ShuttingDown,
            _ => CleanerState::Idle,
        }
    }
}

/// Wake-up signal and status shared between the pool and its page cleaner.
pub(crate) struct CleanerEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
    running: AtomicBool,
    state: AtomicU8,
}

impl CleanerEvent {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            running: AtomicBool::new(false),
            state: AtomicU8::new(CleanerState::Idle as u8),
        }
    }

    pub(crate) fn wake(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Waits for a wake-up or the deadline. Returns true when woken.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *signaled, false)
    }

    fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: CleanerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> CleanerState {
        CleanerState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// Handle to the background flushing thread of one pool.
pub struct PageCleaner {
    pool: Arc<BufferPool>,
    handle: Option<JoinHandle<()>>,
}

impl PageCleaner {
    pub fn start(
        pool: Arc<BufferPool>,
        checkpointer: Option<Arc<Checkpointer>>,
    ) -> anyhow::Result<Self> {
        if !pool.cleaner.try_start() {
            return Err(anyhow!("the buffer pool already has a page cleaner"));
        }
        let coordinator = Coordinator {
            pool: pool.clone(),
            checkpointer,
            adaptive: AdaptiveFlush::new(),
            prev_lsn: pool.redo.lsn_approx(),
            last_flushed: 0,
        };
        let handle = std::thread::Builder::new()
            .name("page-cleaner".to_string())
            .spawn(move || coordinator.run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                pool.cleaner.stop();
                return Err(err.into());
            }
        };
        Ok(Self {
            pool,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> CleanerState {
        self.pool.cleaner.state()
    }

    pub fn wake(&self) {
        self.pool.cleaner.wake();
    }

    /// Shuts the pool down, waits for the cleaner to write every flushable
    /// page and the final checkpoint, and joins it.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        self.join()
    }

    fn join(&mut self) -> anyhow::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.pool.shutdown();
        handle
            .join()
            .map_err(|_| anyhow!("page cleaner thread panicked"))
    }
}

impl Drop for PageCleaner {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("cannot stop page cleaner: {err}");
        }
    }
}

struct Coordinator {
    pool: Arc<BufferPool>,
    checkpointer: Option<Arc<Checkpointer>>,
    adaptive: AdaptiveFlush,
    prev_lsn: Lsn,
    last_flushed: usize,
}

impl Coordinator {
    fn run(mut self) {
        log::info!("page cleaner started");
        let mut deadline = Instant::now() + self.pool.setting.read().cleaner_period;
        let mut busy = false;
        loop {
            let timed_out = !busy && !self.pool.cleaner.wait_until(deadline);
            if self.pool.is_shutting_down() {
                break;
            }
            let setting = self.pool.setting();
            if timed_out || Instant::now() >= deadline {
                deadline = Instant::now() + setting.cleaner_period;
            }
            busy = match self.cycle(&setting, timed_out) {
                Ok(busy) => busy,
                Err(err) => {
                    log::error!("page cleaner cycle failed: {err}");
                    false
                }
            };
        }
        self.shutdown_sweep();
        self.pool.cleaner.stop();
        log::info!("page cleaner stopped");
    }

    fn set_state(&self, state: CleanerState) {
        self.pool.cleaner.set_state(state);
    }

    /// One decision of the coordinator. Returns true when more work is
    /// pending and the next cycle should not wait.
    fn cycle(&mut self, setting: &Setting, timed_out: bool) -> Result<bool> {
        self.pool.check_margins();
        let cur_lsn = self.pool.redo.lsn_approx();
        let prev_lsn = std::mem::replace(&mut self.prev_lsn, cur_lsn);

        if let Some(target) = self.pool.take_sync_target() {
            if setting.flush_sync {
                self.set_state(CleanerState::FuriousFlushing);
                self.furious_flush(setting, target)?;
                return Ok(false);
            }
            self.pool.request_flush_async(target);
        }

        let (free, lru) = {
            let inner = self.pool.inner.lock();
            (inner.free.len(), inner.lru.len())
        };
        if free < setting.lru_scan_depth && lru > setting.lru_min_len {
            self.set_state(CleanerState::LruFlushing);
            let outcome = self
                .pool
                .lru_batch(setting.lru_scan_depth, setting.lru_scan_depth)?;
            return Ok(outcome.is_some_and(|outcome| outcome.evicted > 0));
        }

        let dirty = self.pool.flush.lock().len();
        if timed_out && cur_lsn == prev_lsn && dirty > 0 {
            self.set_state(CleanerState::ListFlushing);
            let outcome = self.pool.flush_list_batch(setting.io_capacity, Lsn::MAX)?;
            self.last_flushed = outcome.map_or(0, |outcome| outcome.written);
            log::debug!("idle flush wrote {} pages", self.last_flushed);
            self.try_checkpoint();
            return Ok(false);
        }

        let sample = FlushSample {
            cur_lsn,
            oldest: self.pool.compute_checkpoint_lsn(),
            dirty,
            lru,
            free,
            log_capacity: self.pool.redo.capacity(),
            last_flushed: self.last_flushed,
        };
        let pool = &self.pool;
        let rec = self.adaptive.recommend(setting, sample, Instant::now(), |lsn| {
            pool.flush.lock().count_up_to(&pool.frames, lsn)
        });
        self.pool
            .lsn_avg_rate
            .store(self.adaptive.lsn_avg_rate(), Ordering::Relaxed);

        let async_target = self.pool.take_async_target();
        let Some((n_pages, limit)) = rec.plan(setting, async_target) else {
            self.set_state(CleanerState::Idle);
            self.last_flushed = 0;
            self.try_checkpoint();
            return Ok(false);
        };

        self.set_state(CleanerState::ListFlushing);
        let outcome = self.pool.flush_list_batch(n_pages, limit)?;
        self.last_flushed = outcome.map_or(0, |outcome| outcome.written);
        let remaining = setting.io_capacity_max.saturating_sub(self.last_flushed);
        if remaining > 0 && free < setting.lru_scan_depth {
            self.set_state(CleanerState::LruFlushing);
            self.pool
                .lru_batch(remaining.min(setting.lru_scan_depth), setting.lru_scan_depth)?;
        }
        log::debug!(
            "adaptive flush wrote {} of {n_pages} pages, avg page rate {}",
            self.last_flushed,
            self.adaptive.avg_page_rate()
        );
        Ok(false)
    }

    /// Flushes up to `target` at full speed, keeping the free list topped up
    /// in between.
    fn furious_flush(&mut self, setting: &Setting, target: Lsn) -> Result<()> {
        log::debug!("furious flushing up to lsn {target}");
        let burst = setting.io_capacity_max.max(1);
        let mut stalls = 0;
        while !self.pool.is_flushed_up_to(target) && !self.pool.is_shutting_down() {
            let written = self
                .pool
                .flush_list_batch(burst, target)?
                .map_or(0, |outcome| outcome.written);
            let low_on_free = self.pool.inner.lock().free.len() < setting.lru_scan_depth;
            if low_on_free {
                self.pool
                    .lru_batch(setting.lru_scan_depth, setting.lru_scan_depth)?;
            }
            if written > 0 {
                stalls = 0;
                self.last_flushed += written;
                continue;
            }
            stalls += 1;
            if stalls > SHUTDOWN_MAX_STALLS {
                log::warn!("furious flush to lsn {target} made no progress");
                break;
            }
            std::thread::sleep(STALL_SLEEP);
        }
        Ok(())
    }

    fn try_checkpoint(&self) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        if let Err(err) = checkpointer.checkpoint(false) {
            log::error!("cannot perform checkpoint: {err}");
        }
    }

    fn shutdown_sweep(&mut self) {
        self.set_state(CleanerState::ShuttingDown);
        log::info!("page cleaner flushing remaining pages");
        let mut stalls = 0;
        while self.pool.compute_checkpoint_lsn().is_some() {
            match self.pool.flush_list_batch(usize::MAX, Lsn::MAX) {
                Ok(Some(outcome)) if outcome.written > 0 => stalls = 0,
                Ok(_) => {
                    stalls += 1;
                    if stalls > SHUTDOWN_MAX_STALLS {
                        let left = self.pool.flush.lock().len();
                        log::warn!("page cleaner leaves {left} dirty pages behind");
                        break;
                    }
                    std::thread::sleep(STALL_SLEEP);
                }
                Err(err) => {
                    log::error!("shutdown flush failed: {err}");
                    break;
                }
            }
        }
        if let Some(checkpointer) = &self.checkpointer {
            if let Err(err) = checkpointer.checkpoint(true) {
                log::error!("cannot write final checkpoint: {err}");
            }
        }
    }
}
