use crate::error::Error;
use crate::flush::{FlushKind, WriteBatch};
use crate::id::PageId;
use crate::pool::{BufferPool, PoolInner};
use crate::setting::FlushNeighbors;
use std::ops::Range;
use std::sync::atomic::Ordering;

/// Below this LRU length the neighbor heuristic is not worth its overhead.
pub(crate) const NEIGHBOR_MIN_LRU_LEN: usize = 512;

/// Aligned window of `area` pages containing `page_no`, clamped to the
/// tablespace. Bounds are widened so the last page number still fits.
pub(crate) fn neighbor_range(page_no: u32, area: u32, space_size: u32) -> Range<u64> {
    let area = u64::from(area.max(1));
    let page_no = u64::from(page_no);
    let low = page_no / area * area;
    let high = (low + area).min(u64::from(space_size).max(page_no + 1));
    low..high
}

fn single_page(page_no: u32) -> Range<u64> {
    let page_no = u64::from(page_no);
    page_no..page_no + 1
}

impl BufferPool {
    /// Pages per neighbor window for this pool.
    pub(crate) fn flush_area(&self, read_ahead_area: usize) -> u32 {
        read_ahead_area.min(self.capacity() / 16).max(1) as u32
    }

    /// A neighbor can join the batch when it is resident, dirty, not under
    /// I/O and nobody holds its latch exclusively.
    fn check_neighbor(&self, inner: &PoolInner, page: PageId, kind: FlushKind) -> bool {
        let Some(&frame) = inner.page_hash.get(&page) else {
            return false;
        };
        if kind == FlushKind::Lru && !inner.lru.is_old(frame) {
            return false;
        }
        let f = &self.frames[frame];
        inner.metas[frame].ready_for_flush(f.marker()) && !f.data.is_locked_exclusive()
    }

    /// Shrinks the window to the run of flushable pages around the victim.
    fn contiguous_range(
        &self,
        inner: &PoolInner,
        victim: PageId,
        kind: FlushKind,
        window: Range<u64>,
    ) -> Range<u64> {
        let Range { mut start, mut end } = single_page(victim.page_no());
        while start > window.start
            && self.check_neighbor(inner, victim.with_page_no((start - 1) as u32), kind)
        {
            start -= 1;
        }
        while end < window.end && self.check_neighbor(inner, victim.with_page_no(end as u32), kind) {
            end += 1;
        }
        start..end
    }

    /// Queues `frame` and, when the heuristic applies, its dirty neighbors.
    /// At most `n_to_flush - n_flushed` pages are queued, the victim always
    /// among them. Returns how many pages were queued.
    pub(crate) fn flush_page_and_try_neighbors(
        &self,
        inner: &mut PoolInner,
        batch: &mut WriteBatch,
        frame: usize,
        n_flushed: usize,
        n_to_flush: usize,
    ) -> usize {
        let Some(victim) = inner.metas[frame].page else {
            return 0;
        };
        let Some(space) = self.spaces.get(victim.space()) else {
            return 0;
        };
        let (mode, read_ahead_area) = {
            let setting = self.setting.read();
            (setting.flush_neighbors, setting.read_ahead_area)
        };

        let range = if mode == FlushNeighbors::Off
            || !space.is_rotational()
            || inner.lru.len() < NEIGHBOR_MIN_LRU_LEN
        {
            single_page(victim.page_no())
        } else {
            let window = neighbor_range(
                victim.page_no(),
                self.flush_area(read_ahead_area),
                space.size(),
            );
            if mode == FlushNeighbors::Contiguous {
                self.contiguous_range(inner, victim, batch.kind(), window)
            } else {
                window
            }
        };

        let mut count = 0;
        let mut neighbors = 0;
        let victim_no = u64::from(victim.page_no());
        let mut no = range.start;
        while no < range.end {
            if n_flushed + count >= n_to_flush {
                if no < victim_no {
                    no = victim_no;
                } else if no > victim_no {
                    break;
                }
            }
            let is_victim = no == victim_no;
            let page = victim.with_page_no(no as u32);
            no += 1;

            let Some(&candidate) = inner.page_hash.get(&page) else {
                continue;
            };
            if !is_victim {
                if inner.metas[candidate].fix_count > 0
                    || !self.check_neighbor(inner, page, batch.kind())
                {
                    continue;
                }
            }
            match self.try_begin_write(inner, candidate) {
                Ok(Some(w)) => {
                    batch.push(w);
                    count += 1;
                    if !is_victim {
                        neighbors += 1;
                    }
                }
                Ok(None) => {}
                Err(Error::SpaceStopped(id)) => {
                    log::trace!("tablespace {id} no longer accepts writes");
                    break;
                }
                Err(err) => {
                    if is_victim {
                        batch.skipped += 1;
                    }
                    log::trace!("not flushing {page}: {err}");
                }
            }
        }

        if neighbors > 0 {
            self.counters
                .neighbors_flushed
                .fetch_add(neighbors as u64, Ordering::Relaxed);
            log::trace!("flushed {neighbors} neighbors of {victim}");
        }
        count
    }
}
