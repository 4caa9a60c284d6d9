//! Collaborators the pool writes through, plus file-backed implementations.

use crate::bins::SliceExt;
use crate::id::{Lsn, PageId, SpaceId};
use crate::space::Space;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait PageStorage: Send + Sync {
    /// Reads one page. Returns `false` when the page lies beyond the end of
    /// the file, leaving `buff` untouched.
    fn read(&self, space: &Space, offset: u64, buff: &mut [u8]) -> anyhow::Result<bool>;
    fn write(&self, space: &Space, offset: u64, bytes: &[u8]) -> anyhow::Result<()>;
    fn punch_hole(&self, space: &Space, range: Range<u64>) -> anyhow::Result<()>;
    fn sync(&self, space: &Space) -> anyhow::Result<()>;
}

/// Checksum, encryption and compression applied right before a write.
pub trait WritePipeline: Send + Sync {
    /// Produces the bytes to persist. Must not depend on previous calls.
    fn prepare_for_write(&self, page: PageId, frame: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn verify_after_read(&self, page: PageId, bytes: &[u8]) -> bool;
}

pub type HomeWriter<'a> = dyn FnMut(PageId, &[u8]) -> anyhow::Result<()> + 'a;
pub type HomeSync<'a> = dyn FnMut() -> anyhow::Result<()> + 'a;

pub trait DoubleWrite: Send + Sync {
    /// Stages a page copy. Returns `Ok(false)` when the batch is full and
    /// must be flushed before anything else is staged.
    fn add_to_batch(&self, page: PageId, bytes: &[u8]) -> anyhow::Result<bool>;

    /// Persists the staged copies, hands every page to `home` for its real
    /// location, calls `sync` and only then forgets the batch.
    fn flush_buffered_writes(
        &self,
        home: &mut HomeWriter<'_>,
        sync: &mut HomeSync<'_>,
    ) -> anyhow::Result<()>;
}

pub trait RedoLog: Send + Sync {
    fn lsn_approx(&self) -> Lsn;
    fn write_up_to(&self, lsn: Lsn, durable: bool) -> anyhow::Result<()>;
    /// Usable log capacity in LSN units.
    fn capacity(&self) -> u64;
    fn resize(&self, capacity: u64) -> anyhow::Result<()>;
}

/// One file per tablespace under a directory.
pub struct FileStorage {
    dir: PathBuf,
    files: Mutex<HashMap<SpaceId, Arc<File>>>,
}

impl FileStorage {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
        if !dir.is_dir() {
            return Err(anyhow!("storage path is not a directory"));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::default()),
        })
    }

    fn file(&self, space: SpaceId) -> anyhow::Result<Arc<File>> {
        let mut files = self.files.lock();
        if let Some(f) = files.get(&space) {
            return Ok(f.clone());
        }
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(format!("space_{space}.ibd")))?;
        if !f.metadata()?.is_file() {
            return Err(anyhow!("tablespace {space} file is not a regular file"));
        }
        let f = Arc::new(f);
        files.insert(space, f.clone());
        Ok(f)
    }
}

impl PageStorage for FileStorage {
    fn read(&self, space: &Space, offset: u64, buff: &mut [u8]) -> anyhow::Result<bool> {
        let f = self.file(space.id())?;
        if f.metadata()?.len() < offset + buff.len() as u64 {
            return Ok(false);
        }
        f.read_exact_at(buff, offset)?;
        Ok(true)
    }

    fn write(&self, space: &Space, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        let f = self.file(space.id())?;
        f.write_all_at(bytes, offset)?;
        Ok(())
    }

    fn punch_hole(&self, space: &Space, range: Range<u64>) -> anyhow::Result<()> {
        let f = self.file(space.id())?;
        if let Err(err) = punch_hole(&f, range.clone()) {
            log::debug!("punch hole on tablespace {} failed, writing zeros: {err}", space.id());
            let zeros = vec![0u8; (range.end - range.start) as usize];
            f.write_all_at(&zeros, range.start)?;
        }
        Ok(())
    }

    fn sync(&self, space: &Space) -> anyhow::Result<()> {
        self.file(space.id())?.sync_data()?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn punch_hole(f: &File, range: Range<u64>) -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;
    use syscalls::{syscall4, Sysno};

    const FALLOC_FL_KEEP_SIZE: usize = 0x1;
    const FALLOC_FL_PUNCH_HOLE: usize = 0x2;
    let fd = f.as_raw_fd();
    let result = unsafe {
        syscall4(
            Sysno::fallocate,
            fd as usize,
            FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE,
            range.start as usize,
            (range.end - range.start) as usize,
        )
    };
    if let Err(err) = result {
        Err(anyhow!("cannot punch hole in file {fd} errno={err}"))
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_f: &File, _range: Range<u64>) -> anyhow::Result<()> {
    Err(anyhow!("punch hole is not supported on this platform"))
}

const CHECKSUM_SEED: u64 = 0x1d0f;
pub const PAGE_FOOTER_SIZE: usize = 8;

/// Stamps a crc64 of the payload into the last eight bytes of the page.
#[derive(Default)]
pub struct Crc64Pipeline;

impl Crc64Pipeline {
    fn checksum(page: PageId, payload: &[u8]) -> u64 {
        let mut id = [0u8; 8];
        page.encode(&mut id);
        crc64::crc64(crc64::crc64(CHECKSUM_SEED, &id), payload)
    }
}

impl WritePipeline for Crc64Pipeline {
    fn prepare_for_write(&self, page: PageId, frame: &[u8]) -> anyhow::Result<Vec<u8>> {
        if frame.len() <= PAGE_FOOTER_SIZE {
            return Err(anyhow!("page {page} is too small for a checksum footer"));
        }
        let mut bytes = frame.to_vec();
        let split = bytes.len() - PAGE_FOOTER_SIZE;
        let checksum = Self::checksum(page, &bytes[..split]);
        bytes[split..].copy_from_slice(&checksum.to_be_bytes());
        Ok(bytes)
    }

    fn verify_after_read(&self, page: PageId, bytes: &[u8]) -> bool {
        if bytes.len() <= PAGE_FOOTER_SIZE {
            return false;
        }
        // never written
        if bytes.iter().all(|b| *b == 0) {
            return true;
        }
        let split = bytes.len() - PAGE_FOOTER_SIZE;
        bytes[split..].read_u64() == Self::checksum(page, &bytes[..split])
    }
}
