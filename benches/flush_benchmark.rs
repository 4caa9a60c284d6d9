use bufpool::{
    BufferPool, Collaborators, Crc64Pipeline, Lsn, PageId, PageStorage, RedoLog, Setting, Space,
    SpaceId, SpaceOptions,
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

criterion_group!(benches, flush_list_benchmark);
criterion_main!(benches);

struct NullStorage;

impl PageStorage for NullStorage {
    fn read(&self, _space: &Space, _offset: u64, _buff: &mut [u8]) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn write(&self, _space: &Space, _offset: u64, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn punch_hole(&self, _space: &Space, _range: Range<u64>) -> anyhow::Result<()> {
        Ok(())
    }

    fn sync(&self, _space: &Space) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct NullRedo(AtomicU64);

impl RedoLog for NullRedo {
    fn lsn_approx(&self) -> Lsn {
        Lsn::new(self.0.load(Ordering::Relaxed))
    }

    fn write_up_to(&self, _lsn: Lsn, _durable: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn capacity(&self) -> u64 {
        1 << 30
    }

    fn resize(&self, _capacity: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn flush_list_benchmark(c: &mut Criterion) {
    const PAGES: u32 = 4096;
    let pool = BufferPool::new(
        4096,
        PAGES as usize,
        Setting::default(),
        Collaborators {
            storage: Arc::new(NullStorage),
            pipeline: Arc::new(Crc64Pipeline),
            doublewrite: None,
            redo: Arc::new(NullRedo::default()),
        },
    )
    .unwrap();
    let space = SpaceId::new(1);
    pool.register_space(space, SpaceOptions::default()).unwrap();

    let mut pages = (0..PAGES).collect::<Vec<_>>();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let mut lsn: u64 = 1000;

    c.bench_function("flush_list_batch", |b| {
        b.iter_batched(
            || {
                pages.shuffle(&mut rng);
                for no in pages.iter().take(1024) {
                    lsn += 1;
                    let mut page = pool.create_page(PageId::new(space, *no)).unwrap();
                    page[0..8].copy_from_slice(&lsn.to_be_bytes());
                    page.mark_dirty(Lsn::new(lsn)).unwrap();
                }
            },
            |_| pool.flush_list_batch(usize::MAX, Lsn::MAX).unwrap(),
            BatchSize::PerIteration,
        )
    });
}
