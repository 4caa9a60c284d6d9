use crate::bins::SliceExt;
use crate::file_lock::FileLock;
use crate::id::{PageId, SpaceId};
use crate::storage::{DoubleWrite, HomeSync, HomeWriter};
use anyhow::anyhow;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const CHECKSUM_SEED: u64 = 0x1d0f;
const SLOT_HEADER_SIZE: usize = 16;

/// Doublewrite buffer backed by one file. A batch is written and synced here
/// before any page reaches its home location, so a torn home write can be
/// repaired from this copy after a crash.
pub struct FileDoubleWrite {
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    page_size: usize,
    n: usize,
    slots: Box<[u8]>,
    pgids: IndexSet<PageId>,
}

impl FileDoubleWrite {
    pub fn open(path: &Path, page_size: usize, n: usize) -> anyhow::Result<Self> {
        if n == 0 {
            return Err(anyhow!("doublewrite batch must hold at least one page"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?
            .lock_exclusive()?;
        if !file.metadata()?.is_file() {
            return Err(anyhow!("doublewrite file is not a regular file"));
        }
        let slot_size = SLOT_HEADER_SIZE + page_size;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                page_size,
                n,
                slots: vec![0u8; slot_size * n].into_boxed_slice(),
                pgids: IndexSet::with_capacity(n),
            }),
        })
    }

    /// Rewrites every intact page copy left over from an interrupted batch.
    /// Returns how many pages were handed to `home`.
    pub fn restore(&self, home: &mut HomeWriter<'_>) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let slot_size = SLOT_HEADER_SIZE + inner.page_size;
        let size = inner.file.metadata()?.len() as usize;
        let count = size / slot_size;

        let mut buff = vec![0u8; slot_size * count];
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.read_exact(&mut buff)?;

        let mut restored = 0;
        for slot in buff.chunks_exact(slot_size) {
            let Some(page) = decode_slot(slot) else {
                continue;
            };
            home(page, &slot[SLOT_HEADER_SIZE..])?;
            restored += 1;
        }
        if restored > 0 {
            log::info!("restored {restored} pages from the doublewrite buffer");
        }
        Ok(restored)
    }
}

fn slot_checksum(header: &[u8], payload: &[u8]) -> u64 {
    crc64::crc64(crc64::crc64(CHECKSUM_SEED, &header[0..8]), payload)
}

fn decode_slot(slot: &[u8]) -> Option<PageId> {
    let (header, payload) = slot.split_at(SLOT_HEADER_SIZE);
    if header[8..16].read_u64() != slot_checksum(header, payload) {
        return None;
    }
    let page = PageId::new(SpaceId::new(header[0..4].read_u32()), header[4..8].read_u32());
    Some(page)
}

impl DoubleWrite for FileDoubleWrite {
    fn add_to_batch(&self, page: PageId, bytes: &[u8]) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        if bytes.len() != inner.page_size {
            return Err(anyhow!(
                "page {page} has {} bytes, doublewrite slots hold {}",
                bytes.len(),
                inner.page_size
            ));
        }
        let index = if let Some(i) = inner.pgids.get_index_of(&page) {
            i
        } else {
            if inner.pgids.len() >= inner.n {
                return Ok(false);
            }
            inner.pgids.insert(page);
            inner.pgids.len() - 1
        };

        let slot_size = SLOT_HEADER_SIZE + inner.page_size;
        let slot = &mut inner.slots[index * slot_size..(index + 1) * slot_size];
        let (header, payload) = slot.split_at_mut(SLOT_HEADER_SIZE);
        page.encode(header);
        payload.copy_from_slice(bytes);
        let checksum = slot_checksum(header, payload);
        header[8..16].copy_from_slice(&checksum.to_be_bytes());
        Ok(true)
    }

    fn flush_buffered_writes(
        &self,
        home: &mut HomeWriter<'_>,
        sync: &mut HomeSync<'_>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.pgids.is_empty() {
            return Ok(());
        }
        let slot_size = SLOT_HEADER_SIZE + inner.page_size;
        let used = inner.pgids.len() * slot_size;
        // forgotten on every exit path, failed pages stay dirty in the pool
        let pgids = std::mem::take(&mut inner.pgids);

        let Inner { file, slots, .. } = &mut *inner;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&slots[..used])?;
        file.sync_all()?;

        for (i, page) in pgids.iter().enumerate() {
            let slot = &slots[i * slot_size..(i + 1) * slot_size];
            home(*page, &slot[SLOT_HEADER_SIZE..])?;
        }
        sync()?;

        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn page(n: u32) -> PageId {
        PageId::new(SpaceId::new(1), n)
    }

    #[test]
    fn test_batch_capacity_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let dblwr = FileDoubleWrite::open(&dir.path().join("dblwr"), 64, 2).unwrap();
        assert!(dblwr.add_to_batch(page(1), &[1u8; 64]).unwrap());
        assert!(dblwr.add_to_batch(page(2), &[2u8; 64]).unwrap());
        assert!(dblwr.add_to_batch(page(1), &[3u8; 64]).unwrap());
        assert!(!dblwr.add_to_batch(page(3), &[4u8; 64]).unwrap());
        assert!(dblwr.add_to_batch(page(4), &[4u8; 32]).is_err());

        let mut written = HashMap::new();
        let mut synced = 0;
        dblwr
            .flush_buffered_writes(
                &mut |page, bytes| {
                    written.insert(page, bytes.to_vec());
                    Ok(())
                },
                &mut || {
                    synced += 1;
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(synced, 1);
        assert_eq!(written.len(), 2);
        assert_eq!(written[&page(1)], vec![3u8; 64]);
        assert!(dblwr.add_to_batch(page(3), &[4u8; 64]).unwrap());
    }

    #[test]
    fn test_restore_after_interrupted_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dblwr");
        {
            let dblwr = FileDoubleWrite::open(&path, 64, 4).unwrap();
            dblwr.add_to_batch(page(7), &[7u8; 64]).unwrap();
            dblwr.add_to_batch(page(8), &[8u8; 64]).unwrap();
            // crash while writing the home location of the first page
            let result = dblwr.flush_buffered_writes(
                &mut |_, _| Err(anyhow!("power loss")),
                &mut || Ok(()),
            );
            assert!(result.is_err());
        }

        let dblwr = FileDoubleWrite::open(&path, 64, 4).unwrap();
        let mut restored = Vec::new();
        let n = dblwr
            .restore(&mut |page, bytes| {
                restored.push((page, bytes[0]));
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(restored, vec![(page(7), 7), (page(8), 8)]);
    }

    #[test]
    fn test_failed_batch_is_not_carried_over() {
        let dir = tempfile::tempdir().unwrap();
        let dblwr = FileDoubleWrite::open(&dir.path().join("dblwr"), 64, 4).unwrap();
        dblwr.add_to_batch(page(1), &[1u8; 64]).unwrap();
        let result = dblwr.flush_buffered_writes(
            &mut |_, _| Ok(()),
            &mut || Err(anyhow!("sync failed")),
        );
        assert!(result.is_err());

        let other = PageId::new(SpaceId::new(2), 1);
        dblwr.add_to_batch(other, &[2u8; 64]).unwrap();
        let mut written = Vec::new();
        dblwr
            .flush_buffered_writes(
                &mut |page, _| {
                    written.push(page);
                    Ok(())
                },
                &mut || Ok(()),
            )
            .unwrap();
        assert_eq!(written, vec![other]);
    }

    #[test]
    fn test_completed_batch_leaves_nothing_to_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dblwr");
        let dblwr = FileDoubleWrite::open(&path, 64, 4).unwrap();
        dblwr.add_to_batch(page(1), &[1u8; 64]).unwrap();
        dblwr
            .flush_buffered_writes(&mut |_, _| Ok(()), &mut || Ok(()))
            .unwrap();
        drop(dblwr);

        let dblwr = FileDoubleWrite::open(&path, 64, 4).unwrap();
        assert_eq!(dblwr.restore(&mut |_, _| Ok(())).unwrap(), 0);
    }
}
