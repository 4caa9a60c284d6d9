use anyhow::anyhow;
use std::time::Duration;

/// How the neighbor heuristic widens a single page write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushNeighbors {
    Off,
    /// Only the run of dirty pages touching the victim.
    Contiguous,
    /// Every dirty page of the aligned flush area.
    Area,
}

#[derive(Clone, Debug)]
pub struct Setting {
    pub io_capacity: usize,
    pub io_capacity_max: usize,
    pub max_dirty_pages_pct: f64,
    pub max_dirty_pages_pct_lwm: f64,
    pub adaptive_flushing: bool,
    pub adaptive_flushing_lwm: f64,
    pub flushing_avg_loops: u32,
    /// Free-page target of the eviction engine and the LRU scan depth.
    pub lru_scan_depth: usize,
    /// The eviction batch leaves at least this many pages in the LRU.
    pub lru_min_len: usize,
    pub old_blocks_pct: usize,
    pub flush_neighbors: FlushNeighbors,
    pub read_ahead_area: usize,
    pub flush_sync: bool,
    /// Max pages queued before a batch issues its writes.
    pub write_batch_size: usize,
    pub cleaner_period: Duration,
    pub free_wait_rounds: usize,
    pub max_space_write_failures: u32,
}

impl std::default::Default for Setting {
    fn default() -> Self {
        Self {
            io_capacity: 200,
            io_capacity_max: 2000,
            max_dirty_pages_pct: 90.0,
            max_dirty_pages_pct_lwm: 0.0,
            adaptive_flushing: true,
            adaptive_flushing_lwm: 10.0,
            flushing_avg_loops: 30,
            lru_scan_depth: 1024,
            lru_min_len: 256,
            old_blocks_pct: 37,
            flush_neighbors: FlushNeighbors::Contiguous,
            read_ahead_area: 64,
            flush_sync: true,
            write_batch_size: 64,
            cleaner_period: Duration::from_secs(1),
            free_wait_rounds: 100,
            max_space_write_failures: 10,
        }
    }
}

impl Setting {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.io_capacity == 0 {
            return Err(anyhow!("io capacity must be positive"));
        }
        if self.io_capacity_max < self.io_capacity {
            return Err(anyhow!(
                "max io capacity {} is lower than io capacity {}",
                self.io_capacity_max,
                self.io_capacity
            ));
        }
        if !(0.0..100.0).contains(&self.max_dirty_pages_pct) {
            return Err(anyhow!("max dirty pages pct must be in [0, 100)"));
        }
        if self.max_dirty_pages_pct_lwm < 0.0
            || self.max_dirty_pages_pct_lwm > self.max_dirty_pages_pct
        {
            return Err(anyhow!(
                "dirty pages low water mark must be between 0 and max dirty pages pct"
            ));
        }
        if !(0.0..=70.0).contains(&self.adaptive_flushing_lwm) {
            return Err(anyhow!("adaptive flushing lwm must be in [0, 70]"));
        }
        if self.flushing_avg_loops == 0 {
            return Err(anyhow!("flushing avg loops must be positive"));
        }
        if !(5..=95).contains(&self.old_blocks_pct) {
            return Err(anyhow!("old blocks pct must be in [5, 95]"));
        }
        if self.read_ahead_area == 0 || !self.read_ahead_area.is_power_of_two() {
            return Err(anyhow!("read ahead area must be a power of two"));
        }
        if self.write_batch_size == 0 {
            return Err(anyhow!("write batch size must be positive"));
        }
        if self.cleaner_period < Duration::from_millis(10) {
            return Err(anyhow!("cleaner period can't be less than 10ms"));
        }
        Ok(())
    }

    /// `pct` percent of the configured io capacity.
    pub(crate) fn pct_io(&self, pct: usize) -> usize {
        self.io_capacity * pct / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Setting::default().validate().unwrap();
    }

    #[test]
    fn test_reject_lwm_above_max() {
        let setting = Setting {
            max_dirty_pages_pct: 50.0,
            max_dirty_pages_pct_lwm: 60.0,
            ..Setting::default()
        };
        assert!(setting.validate().is_err());
    }

    #[test]
    fn test_reject_max_below_io_capacity() {
        let setting = Setting {
            io_capacity: 400,
            io_capacity_max: 100,
            ..Setting::default()
        };
        assert!(setting.validate().is_err());
        assert_eq!(Setting::default().pct_io(50), 100);
    }
}
