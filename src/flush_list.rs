use crate::error::{Error, Result};
use crate::flush::{BatchFlag, FlushKind, WriteBatch};
use crate::id::{Lsn, SpaceId};
use crate::list::{HazardId, List};
use crate::page::{DirtyMarker, Frame};
use crate::pool::BufferPool;
use anyhow::anyhow;
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;

/// Dirty pages ordered by the LSN of their first modification, newest at
/// the head. Also holds the checkpoint watermarks.
pub(crate) struct FlushList {
    list: List,
    /// LSN each node was positioned with; kept after a write so lazily
    /// removed nodes still order correctly.
    order: Box<[u64]>,
    pub(crate) sync_target_lsn: Lsn,
    pub(crate) async_target_lsn: Lsn,
    pub(crate) durable_lsn: Lsn,
}

impl FlushList {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            list: List::new(n),
            order: vec![0; n].into_boxed_slice(),
            sync_target_lsn: Lsn::ZERO,
            async_target_lsn: Lsn::ZERO,
            durable_lsn: Lsn::ZERO,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub(crate) fn contains(&self, frame: usize) -> bool {
        self.list.contains(frame)
    }

    #[inline]
    pub(crate) fn tail(&self) -> Option<usize> {
        self.list.tail()
    }

    #[inline]
    pub(crate) fn prev(&self, frame: usize) -> Option<usize> {
        self.list.prev(frame)
    }

    /// Lands at the head unless `lsn` is older than the head, in which case
    /// the page is walked to its sorted position.
    pub(crate) fn insert(&mut self, frame: usize, lsn: Lsn) {
        let mut at = self.list.head();
        while let Some(i) = at {
            if self.order[i] <= lsn.get() {
                break;
            }
            at = self.list.next(i);
        }
        match at {
            Some(i) => self.list.insert_before(i, frame),
            None => self.list.push_back(frame),
        }
        self.order[frame] = lsn.get();
    }

    pub(crate) fn remove(&mut self, frame: usize) {
        self.list.remove(frame);
        self.order[frame] = 0;
    }

    /// Performs the deferred removal of a written page.
    pub(crate) fn clear_pending(&mut self, frame: usize, f: &Frame) {
        if f.replace_marker(DirtyMarker::PendingClear, DirtyMarker::Clean) {
            self.remove(frame);
        }
    }

    /// Oldest live modification, dropping written pages found at the tail.
    pub(crate) fn oldest(&mut self, frames: &[Frame]) -> Option<Lsn> {
        while let Some(tail) = self.list.tail() {
            match frames[tail].marker() {
                DirtyMarker::Dirty(lsn) => return Some(lsn),
                DirtyMarker::PendingClear => self.clear_pending(tail, &frames[tail]),
                DirtyMarker::Clean | DirtyMarker::TempDirty => self.remove(tail),
            }
        }
        None
    }

    /// Number of live pages whose first modification is at or below `lsn`.
    pub(crate) fn count_up_to(&self, frames: &[Frame], lsn: Lsn) -> usize {
        self.list
            .iter_from_tail()
            .take_while(|&i| self.order[i] <= lsn.get())
            .filter(|&i| matches!(frames[i].marker(), DirtyMarker::Dirty(_)))
            .count()
    }

    pub(crate) fn iter_from_tail(&self) -> impl Iterator<Item = usize> + '_ {
        self.list.iter_from_tail()
    }

    pub(crate) fn register_hazard(&mut self) -> HazardId {
        self.list.register_hazard()
    }

    pub(crate) fn set_hazard(&mut self, hp: HazardId, node: Option<usize>) {
        self.list.set_hazard(hp, node)
    }

    pub(crate) fn hazard(&self, hp: HazardId) -> Option<usize> {
        self.list.hazard(hp)
    }

    pub(crate) fn release_hazard(&mut self, hp: HazardId) {
        self.list.release_hazard(hp)
    }

    pub(crate) fn validate(&self, frames: &[Frame]) -> anyhow::Result<()> {
        self.list.validate("flush")?;
        let mut prev = 0;
        for i in self.list.iter_from_tail() {
            if self.order[i] < prev {
                return Err(anyhow!(
                    "flush: frame {i} at lsn {} follows lsn {prev}",
                    self.order[i]
                ));
            }
            prev = self.order[i];
            match frames[i].marker() {
                DirtyMarker::Dirty(lsn) if lsn.get() == self.order[i] => {}
                DirtyMarker::PendingClear => {}
                marker => {
                    return Err(anyhow!("flush: frame {i} is linked with marker {marker:?}"))
                }
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Pages queued for writing, neighbors included.
    pub flushed: usize,
    pub written: usize,
    pub scanned: usize,
    pub skipped: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceFlushOutcome {
    pub flushed: usize,
    /// Some page was busy or failed; the pass is not a complete guarantee.
    pub may_have_skipped: bool,
}

impl BufferPool {
    /// Writes up to `max` of the oldest dirty pages whose first modification
    /// is below `lsn_limit`. Returns `None` when another flush-list batch is
    /// already running.
    pub fn flush_list_batch(&self, max: usize, lsn_limit: Lsn) -> Result<Option<FlushOutcome>> {
        let Some(_running) = BatchFlag::acquire(&self.list_batch_running) else {
            return Ok(None);
        };
        let write_batch_size = self.setting.read().write_batch_size;
        let mut outcome = FlushOutcome::default();
        let mut batch = WriteBatch::new(FlushKind::List, write_batch_size);

        let mut inner = self.inner.lock();
        let mut flush = self.flush.lock();
        let hp = flush.register_hazard();
        let mut cur = flush.tail();
        let mut remaining = flush.len();
        while outcome.flushed < max && remaining > 0 {
            let Some(frame) = cur else {
                break;
            };
            let prev = flush.prev(frame);
            match self.frames[frame].marker() {
                DirtyMarker::PendingClear => {
                    flush.clear_pending(frame, &self.frames[frame]);
                    cur = prev;
                    remaining -= 1;
                    continue;
                }
                DirtyMarker::Dirty(lsn) if lsn < lsn_limit => {}
                _ => break,
            }
            flush.set_hazard(hp, prev);
            MutexGuard::unlocked(&mut flush, || {
                outcome.scanned += 1;
                let ready = inner.metas[frame].ready_for_flush(self.frames[frame].marker());
                if ready {
                    outcome.flushed += self.flush_page_and_try_neighbors(
                        &mut inner,
                        &mut batch,
                        frame,
                        outcome.flushed,
                        max,
                    );
                } else {
                    batch.skipped += 1;
                }
                if batch.is_full() {
                    MutexGuard::unlocked(&mut inner, || {
                        outcome.written += batch.submit(self).written;
                    });
                }
            });
            cur = flush.hazard(hp);
            remaining -= 1;
        }
        flush.release_hazard(hp);
        drop(flush);
        drop(inner);

        outcome.skipped = batch.skipped;
        let submitted = batch.finish(self);
        outcome.written = submitted.written;
        self.counters
            .list_flushed
            .fetch_add(submitted.written as u64, Ordering::Relaxed);
        self.advance_durable();
        if outcome.flushed > 0 {
            log::debug!(
                "flush list batch: {} flushed, {} scanned, {} skipped, limit {lsn_limit}",
                outcome.flushed,
                outcome.scanned,
                outcome.skipped
            );
        }
        Ok(Some(outcome))
    }

    /// One pass over the flush list writing the pages of one tablespace.
    /// Runs alongside the global batch; busy pages are skipped and reported.
    pub fn flush_space(&self, id: SpaceId) -> Result<SpaceFlushOutcome> {
        if self.spaces.get(id).is_none() {
            return Err(Error::SpaceNotFound(id));
        }
        let write_batch_size = self.setting.read().write_batch_size;
        let mut outcome = SpaceFlushOutcome::default();
        let mut stopped = false;
        let mut batch = WriteBatch::new(FlushKind::Space, write_batch_size);

        let mut inner = self.inner.lock();
        let mut flush = self.flush.lock();
        let hp = flush.register_hazard();
        let mut cur = flush.tail();
        while let Some(frame) = cur {
            let prev = flush.prev(frame);
            if inner.metas[frame].page.map(|page| page.space()) != Some(id) {
                cur = prev;
                continue;
            }
            match self.frames[frame].marker() {
                DirtyMarker::PendingClear => {
                    flush.clear_pending(frame, &self.frames[frame]);
                    cur = prev;
                    continue;
                }
                DirtyMarker::Dirty(_) => {}
                _ => {
                    cur = prev;
                    continue;
                }
            }
            flush.set_hazard(hp, prev);
            MutexGuard::unlocked(&mut flush, || {
                match self.try_begin_write(&mut inner, frame) {
                    Ok(Some(w)) => {
                        batch.push(w);
                        outcome.flushed += 1;
                    }
                    Ok(None) => {}
                    Err(Error::SpaceStopped(_)) => stopped = true,
                    Err(err) => {
                        log::trace!("tablespace flush skipped frame {frame}: {err}");
                        outcome.may_have_skipped = true;
                    }
                }
                if batch.is_full() {
                    MutexGuard::unlocked(&mut inner, || {
                        let submitted = batch.submit(self);
                        if submitted.failed > 0 {
                            outcome.may_have_skipped = true;
                        }
                    });
                }
            });
            cur = flush.hazard(hp);
        }
        flush.release_hazard(hp);
        drop(flush);
        drop(inner);

        let submitted = batch.finish(self);
        if submitted.failed > 0 {
            outcome.may_have_skipped = true;
        }
        self.counters
            .list_flushed
            .fetch_add(submitted.written as u64, Ordering::Relaxed);
        self.advance_durable();
        if stopped {
            return Err(Error::SpaceStopped(id));
        }
        log::debug!(
            "tablespace {id} flush: {} pages, may have skipped: {}",
            outcome.flushed,
            outcome.may_have_skipped
        );
        Ok(outcome)
    }

    /// Repeats flush-list batches until nothing below `lsn` is left or no
    /// progress can be made.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<usize> {
        let mut total = 0;
        let mut stalls = 0;
        while !self.is_flushed_up_to(lsn) {
            match self.flush_list_batch(usize::MAX, lsn)? {
                Some(outcome) if outcome.written > 0 => {
                    total += outcome.written;
                    stalls = 0;
                }
                _ => {
                    stalls += 1;
                    if stalls > 100 {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
        Ok(total)
    }
}
