//! Single page write path shared by every batch engine.
//!
//! A batch collects pages whose latch it grabbed in shared-exclusive mode
//! (readers are still admitted, modifiers are not), then issues the writes
//! with no pool lock held and completes every page at once.

use crate::error::{Error, Result};
use crate::id::{Lsn, PageId};
use crate::page::{DirtyMarker, IoState, WriteIntent};
use crate::pool::{BufferPool, PoolInner};
use crate::space::{Space, SpaceIo};
use crate::storage::DoubleWrite;
use anyhow::anyhow;
use parking_lot::lock_api::ArcRwLockUpgradableReadGuard;
use parking_lot::RawRwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FlushKind {
    Lru,
    List,
    SinglePage,
    Space,
}

impl FlushKind {
    /// Written pages go straight back to the free list.
    fn evicts(self) -> bool {
        matches!(self, FlushKind::Lru | FlushKind::SinglePage)
    }
}

/// Only one batch per flag runs at a time.
pub(crate) struct BatchFlag<'a>(&'a AtomicBool);

impl<'a> BatchFlag<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BatchFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct PendingWrite {
    frame: usize,
    page: PageId,
    space: SpaceIo,
    intent: WriteIntent,
    written: DirtyMarker,
    newest: Lsn,
    latch: ArcRwLockUpgradableReadGuard<RawRwLock, Box<[u8]>>,
}

enum Prepared {
    Hole,
    Direct(Vec<u8>),
    Doublewrite(Vec<u8>),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SubmitOutcome {
    pub(crate) written: usize,
    pub(crate) failed: usize,
    pub(crate) evicted: usize,
}

impl SubmitOutcome {
    fn add(&mut self, other: SubmitOutcome) {
        self.written += other.written;
        self.failed += other.failed;
        self.evicted += other.evicted;
    }
}

pub(crate) struct WriteBatch {
    kind: FlushKind,
    limit: usize,
    pending: Vec<PendingWrite>,
    total: SubmitOutcome,
    pub(crate) skipped: usize,
}

impl WriteBatch {
    pub(crate) fn new(kind: FlushKind, limit: usize) -> Self {
        Self {
            kind,
            limit: limit.max(1),
            pending: Vec::new(),
            total: SubmitOutcome::default(),
            skipped: 0,
        }
    }

    #[inline]
    pub(crate) fn kind(&self) -> FlushKind {
        self.kind
    }

    pub(crate) fn push(&mut self, w: PendingWrite) {
        self.pending.push(w);
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.pending.len() >= self.limit
    }

    /// Writes and completes every queued page. Must be called without the
    /// pool lock.
    pub(crate) fn submit(&mut self, pool: &BufferPool) -> SubmitOutcome {
        let mut outcome = SubmitOutcome::default();
        if self.pending.is_empty() {
            return outcome;
        }
        let pending = std::mem::take(&mut self.pending);
        let mut ok = vec![false; pending.len()];
        let mut staged = Vec::new();
        for (i, w) in pending.iter().enumerate() {
            match pool.prepare_write(w) {
                Ok(Prepared::Hole) => ok[i] = pool.write_hole(w),
                Ok(Prepared::Direct(bytes)) => ok[i] = pool.write_direct(w, &bytes),
                Ok(Prepared::Doublewrite(bytes)) => staged.push((i, bytes)),
                Err(err) => log::error!("cannot prepare page {} for writing: {err:#}", w.page),
            }
        }
        if !staged.is_empty() {
            pool.write_through_doublewrite(&pending, staged, &mut ok);
        }

        let mut inner = pool.inner.lock();
        for (w, success) in pending.into_iter().zip(ok) {
            let frame = w.frame;
            pool.complete_write(&mut inner, w, success);
            if !success {
                outcome.failed += 1;
                continue;
            }
            outcome.written += 1;
            if self.kind.evicts() && pool.evict_frame(&mut inner, frame) {
                outcome.evicted += 1;
            }
        }
        drop(inner);
        if outcome.evicted > 0 {
            pool.free_available.notify_all();
        }
        log::trace!(
            "{:?} batch wrote {} pages, {} failed",
            self.kind,
            outcome.written,
            outcome.failed
        );
        self.total.add(outcome);
        outcome
    }

    pub(crate) fn finish(mut self, pool: &BufferPool) -> SubmitOutcome {
        self.submit(pool);
        self.total
    }
}

impl BufferPool {
    /// Latches the page for writing without blocking. `Ok(None)` means there
    /// is nothing to write; `Busy` means someone else holds the page.
    pub(crate) fn try_begin_write(
        &self,
        inner: &mut PoolInner,
        frame: usize,
    ) -> Result<Option<PendingWrite>> {
        let f = &self.frames[frame];
        let meta = &inner.metas[frame];
        let Some(page) = meta.page else {
            return Ok(None);
        };
        if !f.marker().is_dirty() {
            return Ok(None);
        }
        if !matches!(meta.io, IoState::Unfixed | IoState::Freed) {
            return Err(Error::Busy(page));
        }
        let Some(space) = self.spaces.acquire_for_io(page.space()) else {
            return Ok(None);
        };
        if space.writes_stopped() {
            return Err(Error::SpaceStopped(page.space()));
        }
        let Some(latch) = f.data.try_upgradable_read_arc() else {
            return Err(Error::Busy(page));
        };
        let written = f.marker();
        if !written.is_dirty() {
            return Ok(None);
        }
        let Some(intent) = inner.metas[frame].begin_write() else {
            return Err(Error::Busy(page));
        };
        Ok(Some(PendingWrite {
            frame,
            page,
            space,
            intent,
            written,
            newest: f.newest_modification(),
            latch,
        }))
    }

    pub(crate) fn complete_write(&self, inner: &mut PoolInner, w: PendingWrite, success: bool) {
        let f = &self.frames[w.frame];
        if success {
            match w.written {
                DirtyMarker::TempDirty => {
                    f.replace_marker(DirtyMarker::TempDirty, DirtyMarker::Clean);
                }
                DirtyMarker::Dirty(_) => {
                    f.replace_marker(w.written, DirtyMarker::PendingClear);
                }
                DirtyMarker::Clean | DirtyMarker::PendingClear => {}
            }
            w.space.note_write_success();
        } else {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            let max_failures = self.setting.read().max_space_write_failures;
            w.space.note_write_failure(w.page, max_failures);
        }
        inner.metas[w.frame].complete_write(&w.intent, success);
    }

    fn prepare_write(&self, w: &PendingWrite) -> anyhow::Result<Prepared> {
        if w.space.needs_redo() {
            let lsn = w.newest.max(w.written.lsn().unwrap_or(Lsn::ZERO));
            self.redo.write_up_to(lsn, true)?;
        }
        if w.intent.freed {
            return Ok(Prepared::Hole);
        }
        let bytes = self.pipeline.prepare_for_write(w.page, &w.latch)?;
        if bytes.len() != self.page_size() {
            return Err(anyhow!(
                "pipeline produced {} bytes for page {}, expected {}",
                bytes.len(),
                w.page,
                self.page_size()
            ));
        }
        if w.intent.reinit || !w.space.uses_doublewrite() || self.doublewrite.is_none() {
            Ok(Prepared::Direct(bytes))
        } else {
            Ok(Prepared::Doublewrite(bytes))
        }
    }

    fn report_write(page: PageId, result: anyhow::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                log::error!("write of page {page} failed: {err:#}");
                false
            }
        }
    }

    fn write_hole(&self, w: &PendingWrite) -> bool {
        let offset = self.page_offset(w.page);
        let result = if w.space.supports_punch_hole() {
            self.storage
                .punch_hole(&w.space, offset..offset + self.page_size() as u64)
        } else {
            self.storage
                .write(&w.space, offset, &vec![0u8; self.page_size()])
        };
        Self::report_write(w.page, result)
    }

    fn write_direct(&self, w: &PendingWrite, bytes: &[u8]) -> bool {
        let result = self.storage.write(&w.space, self.page_offset(w.page), bytes);
        Self::report_write(w.page, result)
    }

    fn write_through_doublewrite(
        &self,
        pending: &[PendingWrite],
        staged: Vec<(usize, Vec<u8>)>,
        ok: &mut [bool],
    ) {
        let Some(dblwr) = self.doublewrite.as_deref() else {
            for (i, bytes) in staged {
                ok[i] = self.write_direct(&pending[i], &bytes);
            }
            return;
        };

        // a concurrent batch must not flush our staged copies
        let _serial = self.doublewrite_lock.lock();
        let mut chunk = Vec::new();
        for (i, bytes) in staged {
            let page = pending[i].page;
            let mut added = dblwr.add_to_batch(page, &bytes);
            if matches!(added, Ok(false)) {
                self.flush_doublewrite(dblwr, pending, &chunk, ok);
                chunk.clear();
                added = dblwr.add_to_batch(page, &bytes);
            }
            match added {
                Ok(true) => chunk.push(i),
                Ok(false) => log::error!("doublewrite buffer has no room for page {page}"),
                Err(err) => {
                    log::error!("cannot stage page {page} in the doublewrite buffer: {err:#}")
                }
            }
        }
        self.flush_doublewrite(dblwr, pending, &chunk, ok);
    }

    fn flush_doublewrite(
        &self,
        dblwr: &dyn DoubleWrite,
        pending: &[PendingWrite],
        chunk: &[usize],
        ok: &mut [bool],
    ) {
        if chunk.is_empty() {
            return;
        }
        let index = chunk
            .iter()
            .map(|&i| (pending[i].page, i))
            .collect::<HashMap<_, _>>();
        let mut spaces: Vec<&Space> = Vec::new();
        for &i in chunk {
            let space: &Space = &pending[i].space;
            if !spaces.iter().any(|s| s.id() == space.id()) {
                spaces.push(space);
            }
        }

        let mut written = Vec::with_capacity(chunk.len());
        let result = {
            let mut home = |page: PageId, bytes: &[u8]| -> anyhow::Result<()> {
                let Some(&i) = index.get(&page) else {
                    log::warn!("skipping page {page}, it is not part of this doublewrite batch");
                    return Ok(());
                };
                let result = self
                    .storage
                    .write(&pending[i].space, self.page_offset(page), bytes);
                if Self::report_write(page, result) {
                    written.push(i);
                }
                Ok(())
            };
            let mut sync = || -> anyhow::Result<()> {
                for space in &spaces {
                    self.storage.sync(space)?;
                }
                Ok(())
            };
            dblwr.flush_buffered_writes(&mut home, &mut sync)
        };
        match result {
            Ok(()) => {
                for i in written {
                    ok[i] = true;
                }
            }
            Err(err) => log::error!(
                "doublewrite batch of {} pages failed: {err:#}",
                chunk.len()
            ),
        }
    }
}
