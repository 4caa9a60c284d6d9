mod adaptive;
mod bins;
mod checkpoint;
mod cleaner;
mod doublewrite;
mod error;
mod file_lock;
mod flush;
mod flush_list;
mod id;
mod list;
mod lru;
mod neighbor;
mod page;
mod pool;
mod setting;
mod space;
mod storage;

pub use checkpoint::{CheckpointFile, CheckpointRecord, Checkpointer};
pub use cleaner::{CleanerState, PageCleaner};
pub use doublewrite::FileDoubleWrite;
pub use error::{Error, Result};
pub use flush_list::{FlushOutcome, SpaceFlushOutcome};
pub use id::{Lsn, PageId, SpaceId};
pub use lru::LruOutcome;
pub use page::{DirtyMarker, IoState};
pub use pool::{
    BufferPool, Collaborators, PageRead, PageWrite, PoolStats, MAXIMUM_PAGE_SIZE,
    MINIMUM_PAGE_SIZE,
};
pub use setting::{FlushNeighbors, Setting};
pub use space::{Space, SpaceKind, SpaceOptions, SpaceRegistry};
pub use storage::{
    Crc64Pipeline, DoubleWrite, FileStorage, HomeSync, HomeWriter, PageStorage, RedoLog,
    WritePipeline, PAGE_FOOTER_SIZE,
};
