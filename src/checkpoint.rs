use crate::adaptive::{log_margins, LSN_SCAN_FACTOR};
use crate::bins::SliceExt;
use crate::error::{Error, Result};
use crate::file_lock::FileLock;
use crate::id::{Lsn, SpaceId};
use crate::pool::BufferPool;
use crate::space::SpaceKind;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const CHECKPOINT_SLOT_SIZE: usize = 512;
const CHECKPOINT_RECORD_SIZE: usize = 24;
const CHECKSUM_SEED: u64 = 0x1d0f;

/// Redo before `checkpoint_lsn` is reflected in the data files; `end_lsn`
/// is the log end observed when the checkpoint was taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckpointRecord {
    pub checkpoint_lsn: Lsn,
    pub end_lsn: Lsn,
}

impl CheckpointRecord {
    fn decode(buff: &[u8]) -> Option<Self> {
        let stored_checksum = buff[16..24].read_u64();
        let calculated_checksum = crc64::crc64(CHECKSUM_SEED, &buff[0..16]);
        if stored_checksum != calculated_checksum {
            return None;
        }
        Some(CheckpointRecord {
            checkpoint_lsn: Lsn::new(buff[0..8].read_u64()),
            end_lsn: Lsn::new(buff[8..16].read_u64()),
        })
    }

    fn encode(&self, buff: &mut [u8]) {
        buff[0..8].copy_from_slice(&self.checkpoint_lsn.to_be_bytes());
        buff[8..16].copy_from_slice(&self.end_lsn.to_be_bytes());
        let checksum = crc64::crc64(CHECKSUM_SEED, &buff[0..16]);
        buff[16..24].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// Checkpoint header file with two redundant slots written alternately, so
/// a torn write leaves the previous record intact.
pub struct CheckpointFile {
    file: File,
    next_slot: usize,
    last: Option<CheckpointRecord>,
}

impl CheckpointFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?
            .lock_exclusive()?;

        if file.metadata()?.len() < 2 * CHECKPOINT_SLOT_SIZE as u64 {
            file.set_len(2 * CHECKPOINT_SLOT_SIZE as u64)?;
            file.sync_all()?;
            return Ok(Self {
                file,
                next_slot: 0,
                last: None,
            });
        }

        let mut buff = vec![0u8; 2 * CHECKPOINT_SLOT_SIZE];
        file.read_exact_at(&mut buff, 0)?;
        let first = CheckpointRecord::decode(&buff[..CHECKPOINT_RECORD_SIZE]);
        let second = CheckpointRecord::decode(
            &buff[CHECKPOINT_SLOT_SIZE..CHECKPOINT_SLOT_SIZE + CHECKPOINT_RECORD_SIZE],
        );
        let (last, next_slot) = match (first, second) {
            (Some(a), Some(b)) if b > a => (Some(b), 0),
            (Some(a), _) => (Some(a), 1),
            (None, Some(b)) => (Some(b), 0),
            (None, None) => (None, 0),
        };
        if let Some(record) = last {
            log::info!(
                "recovered checkpoint at lsn {}, log end {}",
                record.checkpoint_lsn,
                record.end_lsn
            );
        }
        Ok(Self {
            file,
            next_slot,
            last,
        })
    }

    /// Newest valid record.
    pub fn recovered(&self) -> Option<CheckpointRecord> {
        self.last
    }

    pub fn write(&mut self, record: CheckpointRecord) -> anyhow::Result<()> {
        let mut buff = [0u8; CHECKPOINT_RECORD_SIZE];
        record.encode(&mut buff);
        let offset = (self.next_slot * CHECKPOINT_SLOT_SIZE) as u64;
        self.file.write_all_at(&buff, offset)?;
        self.file.sync_data()?;
        self.next_slot ^= 1;
        self.last = Some(record);
        Ok(())
    }
}

/// Advances the persisted recovery point of one pool.
pub struct Checkpointer {
    pool: Arc<BufferPool>,
    file: Mutex<CheckpointFile>,
}

impl Checkpointer {
    pub fn new(pool: Arc<BufferPool>, file: CheckpointFile) -> Self {
        Self {
            pool,
            file: Mutex::new(file),
        }
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointRecord> {
        self.file.lock().recovered()
    }

    /// Persists the current checkpoint LSN, never above `end_lsn`.
    pub fn write_checkpoint(&self, end_lsn: Lsn) -> Result<CheckpointRecord> {
        let checkpoint_lsn = self
            .pool
            .compute_checkpoint_lsn()
            .map_or(end_lsn, |oldest| oldest.min(end_lsn));
        let record = CheckpointRecord {
            checkpoint_lsn,
            end_lsn,
        };
        self.file.lock().write(record)?;
        log::debug!("checkpoint written at lsn {checkpoint_lsn}, log end {end_lsn}");
        Ok(record)
    }

    /// Takes a checkpoint at the oldest modification still in the pool.
    /// Without `write_always` nothing is written when the checkpoint LSN has
    /// not moved. Returns whether a record was written.
    pub fn checkpoint(&self, write_always: bool) -> Result<bool> {
        let end_lsn = self.pool.redo.lsn_approx();
        let checkpoint_lsn = self
            .pool
            .compute_checkpoint_lsn()
            .map_or(end_lsn, |oldest| oldest.min(end_lsn));
        let mut file = self.file.lock();
        if !write_always
            && file
                .recovered()
                .is_some_and(|last| last.checkpoint_lsn >= checkpoint_lsn)
        {
            return Ok(false);
        }

        for space in self.pool.spaces.all() {
            if space.kind() != SpaceKind::Temporary {
                self.pool.storage.sync(&space)?;
            }
        }
        self.pool.redo.write_up_to(checkpoint_lsn, true)?;
        file.write(CheckpointRecord {
            checkpoint_lsn,
            end_lsn,
        })?;
        drop(file);
        log::debug!("checkpoint advanced to lsn {checkpoint_lsn}");
        Ok(true)
    }

    /// Flushes everything modified before `lsn`, then checkpoints.
    pub fn make_checkpoint_at(&self, lsn: Lsn) -> Result<bool> {
        self.pool.flush_up_to(lsn)?;
        if !self.pool.is_flushed_up_to(lsn) {
            log::warn!("could not flush every page below lsn {lsn} before checkpointing");
        }
        self.checkpoint(true)
    }

    /// Checkpoints at the current log end, then asks the redo log to resize.
    pub fn resize_log(&self, capacity: u64) -> Result<()> {
        let lsn = self.pool.redo.lsn_approx();
        self.make_checkpoint_at(lsn)?;
        self.pool.redo.resize(capacity)?;
        log::info!("redo log resized to {capacity}");
        Ok(())
    }
}

impl BufferPool {
    /// Oldest modification still waiting in the flush list, `None` when every
    /// page is clean.
    pub fn compute_checkpoint_lsn(&self) -> Option<Lsn> {
        self.flush.lock().oldest(&self.frames)
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.flush.lock().durable_lsn
    }

    pub fn is_flushed_up_to(&self, lsn: Lsn) -> bool {
        self.compute_checkpoint_lsn()
            .map_or(true, |oldest| oldest >= lsn)
    }

    /// Recomputes the durable LSN and wakes every flush waiter.
    pub(crate) fn advance_durable(&self) {
        let mut flush = self.flush.lock();
        let durable = match flush.oldest(&self.frames) {
            Some(oldest) => oldest,
            None => self.redo.lsn_approx(),
        };
        if durable > flush.durable_lsn {
            flush.durable_lsn = durable;
        }
        drop(flush);
        self.flushed.notify_all();
    }

    /// Blocks until every page modified before `target` is written. The page
    /// cleaner does the work when it runs; otherwise the caller flushes.
    pub fn wait_until_flushed(&self, target: Lsn) -> Result<()> {
        if target == Lsn::ZERO {
            return Ok(());
        }
        loop {
            if self.is_flushed_up_to(target) {
                self.advance_durable();
                return Ok(());
            }
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            if let Some(space) = self.stopped_space_below(target) {
                log::warn!("cannot flush up to lsn {target}: writes to space {space} are stopped");
                return Err(Error::SpaceStopped(space));
            }
            if self.cleaner.is_running() {
                {
                    let mut flush = self.flush.lock();
                    if flush.sync_target_lsn < target {
                        flush.sync_target_lsn = target;
                    }
                }
                self.cleaner.wake();
                let mut flush = self.flush.lock();
                if flush.oldest(&self.frames).is_some_and(|oldest| oldest < target) {
                    self.flushed.wait_for(&mut flush, Duration::from_millis(100));
                }
                continue;
            }
            match self.flush_list_batch(usize::MAX, target)? {
                Some(outcome) if outcome.written > 0 => {}
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    /// Tablespace holding the oldest modification below `target` when its
    /// writes are stopped.
    fn stopped_space_below(&self, target: Lsn) -> Option<SpaceId> {
        let space = {
            let inner = self.inner.lock();
            let mut flush = self.flush.lock();
            if flush.oldest(&self.frames)? >= target {
                return None;
            }
            inner.metas[flush.tail()?].page?.space()
        };
        self.spaces
            .get(space)
            .filter(|space| space.writes_stopped())
            .map(|space| space.id())
    }

    /// Asks for furious flushing up to `lsn` plus the headroom the log is
    /// expected to grow by meanwhile.
    pub fn request_flush_sync(&self, lsn: Lsn) {
        let rate = self.lsn_avg_rate.load(Ordering::Relaxed);
        let target = lsn.saturating_add(rate * LSN_SCAN_FACTOR);
        {
            let mut flush = self.flush.lock();
            if flush.sync_target_lsn < target {
                flush.sync_target_lsn = target;
            }
        }
        log::debug!("synchronous flush requested up to lsn {target}");
        self.cleaner.wake();
    }

    pub fn request_flush_async(&self, lsn: Lsn) {
        let mut flush = self.flush.lock();
        if flush.async_target_lsn < lsn {
            flush.async_target_lsn = lsn;
        }
    }

    /// Raises the flush targets when the checkpoint age nears the log
    /// capacity.
    pub fn check_margins(&self) {
        let Some(oldest) = self.compute_checkpoint_lsn() else {
            return;
        };
        let (async_margin, sync_margin) = log_margins(self.redo.capacity());
        let age = self.redo.lsn_approx().age_since(oldest);
        if age > sync_margin {
            self.request_flush_sync(oldest.saturating_add(age - sync_margin));
        } else if age > async_margin {
            self.request_flush_async(oldest.saturating_add(age - async_margin));
        }
    }

    /// Pending furious-flush target, reset once taken.
    pub(crate) fn take_sync_target(&self) -> Option<Lsn> {
        let mut flush = self.flush.lock();
        let target = std::mem::replace(&mut flush.sync_target_lsn, Lsn::ZERO);
        (target > Lsn::ZERO).then_some(target)
    }

    pub(crate) fn take_async_target(&self) -> Option<Lsn> {
        let mut flush = self.flush.lock();
        let target = std::mem::replace(&mut flush.async_target_lsn, Lsn::ZERO);
        (target > Lsn::ZERO).then_some(target)
    }
}
