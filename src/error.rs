use crate::id::{Lsn, PageId, SpaceId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The page latch or its I/O slot is held by someone else. Batch scans
    /// treat this as "skip and continue".
    #[error("page {0} is busy")]
    Busy(PageId),

    #[error("i/o failure on page {page}: {cause:#}")]
    Io { page: PageId, cause: anyhow::Error },

    #[error("page {page} failed checksum verification")]
    CorruptPage { page: PageId, fatal: bool },

    #[error("buffer pool is shutting down")]
    ShuttingDown,

    #[error("tablespace {0} is not registered")]
    SpaceNotFound(SpaceId),

    #[error("tablespace {0} is stopped for writes")]
    SpaceStopped(SpaceId),

    #[error("all pages are pinned")]
    Exhausted,

    #[error("lsn {0} is reserved and cannot mark a modification")]
    ReservedLsn(Lsn),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
