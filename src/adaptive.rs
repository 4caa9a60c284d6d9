//! Flush rate control.
//!
//! The coordinator asks once per cycle how many pages to write. The answer
//! blends three signals: how dirty the pool is, how old the oldest dirty
//! page is relative to the redo log capacity, and a smoothed history of the
//! page rate and redo generation rate.

use crate::id::Lsn;
use crate::setting::Setting;
use std::time::Instant;

/// Checkpoint age distance, in flush-list scans, the adaptive target looks
/// ahead of the oldest modification.
pub(crate) const LSN_SCAN_FACTOR: u64 = 3;

/// Checkpoint ages at which flushing becomes asynchronous and synchronous.
pub(crate) fn log_margins(capacity: u64) -> (u64, u64) {
    (capacity / 8 * 7, capacity / 16 * 15)
}

/// Percent of `io_capacity` needed to keep the dirty ratio in check.
pub(crate) fn pct_for_dirty(setting: &Setting, dirty: usize, lru: usize, free: usize) -> usize {
    if dirty == 0 {
        return 0;
    }
    let dirty_pct = (100 * dirty) as f64 / (1 + lru + free) as f64;
    if setting.max_dirty_pages_pct_lwm == 0.0 {
        if dirty_pct >= setting.max_dirty_pages_pct {
            return 100;
        }
    } else if dirty_pct >= setting.max_dirty_pages_pct_lwm {
        return (dirty_pct * 100.0 / (setting.max_dirty_pages_pct + 1.0)) as usize;
    }
    0
}

/// Percent of `io_capacity` needed to keep the checkpoint age away from the
/// log capacity.
pub(crate) fn pct_for_lsn(setting: &Setting, age: u64, capacity: u64) -> usize {
    let lwm = (setting.adaptive_flushing_lwm * capacity as f64 / 100.0) as u64;
    if age < lwm {
        return 0;
    }
    let (max_async_age, _) = log_margins(capacity);
    if age < max_async_age && !setting.adaptive_flushing {
        return 0;
    }
    let factor = (age * 100 / max_async_age.max(1)) as f64;
    let io_ratio = (setting.io_capacity_max / setting.io_capacity.max(1)) as f64;
    (io_ratio * (factor * factor.sqrt()) / 7.5) as usize
}

/// Pool state sampled by the coordinator for one recommendation.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FlushSample {
    pub(crate) cur_lsn: Lsn,
    pub(crate) oldest: Option<Lsn>,
    pub(crate) dirty: usize,
    pub(crate) lru: usize,
    pub(crate) free: usize,
    pub(crate) log_capacity: u64,
    /// Pages written by the previous flush-list pass.
    pub(crate) last_flushed: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Recommendation {
    /// Pages to write this cycle.
    pub(crate) requested: usize,
    pub(crate) n_pages: usize,
    pub(crate) pct_for_dirty: usize,
    pub(crate) pct_for_lsn: usize,
}

impl Recommendation {
    /// Pages and LSN limit of the flush-list pass. `None` when neither the
    /// dirty ratio nor the checkpoint age asks for flushing and no
    /// asynchronous target is pending.
    pub(crate) fn plan(&self, setting: &Setting, async_target: Option<Lsn>) -> Option<(usize, Lsn)> {
        match async_target {
            Some(target) if self.requested == 0 => Some((setting.io_capacity, target)),
            Some(_) => Some((self.requested, Lsn::MAX)),
            None if self.pct_for_dirty == 0 && self.pct_for_lsn == 0 => None,
            None if self.requested == 0 => None,
            None => Some((self.requested, Lsn::MAX)),
        }
    }
}

/// Smoothed flushing history owned by the coordinator.
pub(crate) struct AdaptiveFlush {
    prev_lsn: Lsn,
    prev_time: Option<Instant>,
    sum_pages: usize,
    avg_page_rate: usize,
    lsn_avg_rate: u64,
    iterations: u32,
}

impl AdaptiveFlush {
    pub(crate) fn new() -> Self {
        Self {
            prev_lsn: Lsn::ZERO,
            prev_time: None,
            sum_pages: 0,
            avg_page_rate: 0,
            lsn_avg_rate: 0,
            iterations: 0,
        }
    }

    /// Redo bytes generated per second, smoothed.
    #[inline]
    pub(crate) fn lsn_avg_rate(&self) -> u64 {
        self.lsn_avg_rate
    }

    pub(crate) fn avg_page_rate(&self) -> usize {
        self.avg_page_rate
    }

    /// `count_up_to(lsn)` counts the dirty pages whose first modification is
    /// at or below `lsn`.
    pub(crate) fn recommend(
        &mut self,
        setting: &Setting,
        sample: FlushSample,
        now: Instant,
        count_up_to: impl FnOnce(Lsn) -> usize,
    ) -> Recommendation {
        let Some(prev_time) = self.prev_time else {
            self.prev_lsn = sample.cur_lsn;
            self.prev_time = Some(now);
            return Recommendation::default();
        };
        if self.prev_lsn == sample.cur_lsn {
            return Recommendation::default();
        }

        self.sum_pages += sample.last_flushed;
        let elapsed = now.duration_since(prev_time).as_secs_f64();
        self.iterations += 1;
        if self.iterations >= setting.flushing_avg_loops
            || elapsed >= setting.flushing_avg_loops as f64
        {
            let elapsed = elapsed.max(1.0);
            self.avg_page_rate =
                ((self.sum_pages as f64 / elapsed + self.avg_page_rate as f64) / 2.0) as usize;
            let lsn_rate = (sample.cur_lsn.age_since(self.prev_lsn) as f64 / elapsed) as u64;
            self.lsn_avg_rate = (self.lsn_avg_rate + lsn_rate) / 2;
            self.prev_lsn = sample.cur_lsn;
            self.prev_time = Some(now);
            self.iterations = 0;
            self.sum_pages = 0;
        }

        let oldest = sample.oldest.unwrap_or(sample.cur_lsn);
        let age = sample.cur_lsn.age_since(oldest);
        let pct_for_dirty = pct_for_dirty(setting, sample.dirty, sample.lru, sample.free);
        let pct_for_lsn = pct_for_lsn(setting, age, sample.log_capacity);
        let pct_total = pct_for_dirty.max(pct_for_lsn);

        let target = oldest.saturating_add(self.lsn_avg_rate * LSN_SCAN_FACTOR);
        let below_target = if sample.oldest.is_some() {
            count_up_to(target)
        } else {
            0
        };
        let pages_for_lsn = (below_target / LSN_SCAN_FACTOR as usize)
            .max(1)
            .min(setting.io_capacity_max * 2);

        let n_pages = ((setting.pct_io(pct_total) + self.avg_page_rate + pages_for_lsn) / 3)
            .min(setting.io_capacity_max);
        let requested = if pct_for_lsn > 30 {
            (below_target / LSN_SCAN_FACTOR as usize + 1) * (n_pages / pages_for_lsn + 1)
        } else {
            n_pages
        };
        log::trace!(
            "adaptive flush: {requested} requested, {n_pages} pages, dirty {pct_for_dirty}%, \
             lsn {pct_for_lsn}%, page rate {}, lsn rate {}",
            self.avg_page_rate,
            self.lsn_avg_rate
        );
        Recommendation {
            requested,
            n_pages,
            pct_for_dirty,
            pct_for_lsn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pct_for_dirty() {
        let mut setting = Setting::default();
        assert_eq!(pct_for_dirty(&setting, 0, 100, 0), 0);
        assert_eq!(pct_for_dirty(&setting, 50, 99, 0), 0);
        assert_eq!(pct_for_dirty(&setting, 95, 99, 0), 100);

        setting.max_dirty_pages_pct_lwm = 10.0;
        assert_eq!(pct_for_dirty(&setting, 5, 99, 0), 0);
        // 50% dirty is 5000 / 91
        assert_eq!(pct_for_dirty(&setting, 50, 99, 0), 54);
    }

    #[test]
    fn test_pct_for_lsn() {
        let mut setting = Setting::default();
        let capacity = 8000;
        assert_eq!(pct_for_lsn(&setting, 700, capacity), 0);
        // factor 100 at the async margin: 10 * 1000 / 7.5
        assert_eq!(pct_for_lsn(&setting, 7000, capacity), 1333);
        assert!(pct_for_lsn(&setting, 3500, capacity) > 0);

        setting.adaptive_flushing = false;
        assert_eq!(pct_for_lsn(&setting, 3500, capacity), 0);
        assert_eq!(pct_for_lsn(&setting, 7000, capacity), 1333);
    }

    #[test]
    fn test_log_margins() {
        assert_eq!(log_margins(1600), (1400, 1500));
    }

    fn sample(cur_lsn: u64, oldest: Option<u64>, dirty: usize) -> FlushSample {
        FlushSample {
            cur_lsn: Lsn::new(cur_lsn),
            oldest: oldest.map(Lsn::new),
            dirty,
            lru: 1000,
            free: 0,
            log_capacity: 1 << 30,
            last_flushed: 0,
        }
    }

    #[test]
    fn test_recommend_needs_history() {
        let setting = Setting::default();
        let mut af = AdaptiveFlush::new();
        let now = Instant::now();
        let first = af.recommend(&setting, sample(1000, Some(100), 10), now, |_| 10);
        assert_eq!(first, Recommendation::default());
        let unchanged = af.recommend(&setting, sample(1000, Some(100), 10), now, |_| 10);
        assert_eq!(unchanged, Recommendation::default());
    }

    #[test]
    fn test_recommend_follows_dirty_ratio() {
        let setting = Setting {
            flushing_avg_loops: 1,
            ..Setting::default()
        };
        let mut af = AdaptiveFlush::new();
        let start = Instant::now();
        af.recommend(&setting, sample(1000, Some(100), 950), start, |_| 0);
        let rec = af.recommend(
            &setting,
            sample(3000, Some(100), 950),
            start + Duration::from_secs(2),
            |_| 0,
        );
        assert_eq!(rec.pct_for_dirty, 100);
        assert_eq!(rec.pct_for_lsn, 0);
        // (io_capacity + avg_page_rate + 1) / 3
        assert_eq!(rec.n_pages, 67);
        assert_eq!(rec.requested, rec.n_pages);
        assert_eq!(af.lsn_avg_rate(), 500);
    }

    #[test]
    fn test_recommend_capped_by_io_capacity_max() {
        let setting = Setting {
            flushing_avg_loops: 1,
            io_capacity: 300,
            io_capacity_max: 300,
            ..Setting::default()
        };
        let mut af = AdaptiveFlush::new();
        let start = Instant::now();
        let mut s = sample(1000, Some(10), 950);
        s.log_capacity = 1600;
        af.recommend(&setting, s, start, |_| 0);
        s.cur_lsn = Lsn::new(1500);
        let rec = af.recommend(&setting, s, start + Duration::from_secs(1), |_| 100_000);
        assert!(rec.pct_for_lsn > 30);
        assert_eq!(rec.n_pages, 300);
        assert!(rec.requested > rec.n_pages);
    }

    #[test]
    fn test_quiet_pool_plans_no_flush() {
        let setting = Setting {
            flushing_avg_loops: 1,
            ..Setting::default()
        };
        let mut af = AdaptiveFlush::new();
        let start = Instant::now();
        let mut s = sample(1000, Some(100), 30);
        s.lru = 10_000;
        af.recommend(&setting, s, start, |_| 0);
        s.cur_lsn = Lsn::new(3000);
        s.last_flushed = 16;
        let rec = af.recommend(&setting, s, start + Duration::from_secs(1), |_| 0);
        assert_eq!(rec.pct_for_dirty, 0);
        assert_eq!(rec.pct_for_lsn, 0);
        // the page rate history alone still asks for a few pages
        assert_eq!(rec.requested, 3);
        assert_eq!(rec.plan(&setting, None), None);
        assert_eq!(
            rec.plan(&setting, Some(Lsn::new(5000))),
            Some((3, Lsn::MAX))
        );

        let idle = Recommendation::default();
        assert_eq!(
            idle.plan(&setting, Some(Lsn::new(5000))),
            Some((setting.io_capacity, Lsn::new(5000)))
        );
    }
}
