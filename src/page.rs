use crate::id::{Lsn, PageId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CLEAN: u64 = 0;
const PENDING_CLEAR: u64 = 1;
const TEMP_DIRTY: u64 = 2;

/// Dirty state of a cached page.
///
/// Stored in a single word: `0` clean, `1` written but still linked in the
/// flush list, `2` dirty page of a temporary tablespace, anything larger is
/// the LSN of the first modification since the page was last clean.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirtyMarker {
    Clean,
    PendingClear,
    TempDirty,
    Dirty(Lsn),
}

impl DirtyMarker {
    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        match raw {
            CLEAN => DirtyMarker::Clean,
            PENDING_CLEAR => DirtyMarker::PendingClear,
            TEMP_DIRTY => DirtyMarker::TempDirty,
            lsn => DirtyMarker::Dirty(Lsn::new(lsn)),
        }
    }

    #[inline]
    pub(crate) fn into_raw(self) -> u64 {
        match self {
            DirtyMarker::Clean => CLEAN,
            DirtyMarker::PendingClear => PENDING_CLEAR,
            DirtyMarker::TempDirty => TEMP_DIRTY,
            DirtyMarker::Dirty(lsn) => {
                debug_assert!(lsn.get() > TEMP_DIRTY);
                lsn.get()
            }
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        matches!(self, DirtyMarker::TempDirty | DirtyMarker::Dirty(_))
    }

    #[inline]
    pub fn lsn(&self) -> Option<Lsn> {
        match self {
            DirtyMarker::Dirty(lsn) => Some(*lsn),
            _ => None,
        }
    }

    /// Whether `lsn` collides with one of the sentinel values.
    #[inline]
    pub(crate) fn is_reserved(lsn: Lsn) -> bool {
        lsn.get() <= TEMP_DIRTY
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoState {
    Unfixed,
    ReadInProgress,
    WriteInProgress,
    /// Write of a freshly created page, bypassing the doublewrite buffer.
    WriteInProgressReinit,
    /// Contents were freed; the next write punches a hole.
    Freed,
}

pub(crate) type Latch = Arc<RwLock<Box<[u8]>>>;

/// Memory frame of the pool together with the words that foreground threads
/// touch without taking the pool lock.
pub(crate) struct Frame {
    pub(crate) data: Latch,
    marker: AtomicU64,
    newest: AtomicU64,
}

impl Frame {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            marker: AtomicU64::new(CLEAN),
            newest: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn marker(&self) -> DirtyMarker {
        DirtyMarker::from_raw(self.marker.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_marker(&self, marker: DirtyMarker) {
        self.marker.store(marker.into_raw(), Ordering::Release);
    }

    /// Swap `from` for `to`, returning false if someone changed it first.
    #[inline]
    pub(crate) fn replace_marker(&self, from: DirtyMarker, to: DirtyMarker) -> bool {
        self.marker
            .compare_exchange(
                from.into_raw(),
                to.into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub(crate) fn newest_modification(&self) -> Lsn {
        Lsn::new(self.newest.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn note_modification(&self, lsn: Lsn) {
        self.newest.fetch_max(lsn.get(), Ordering::AcqRel);
    }

    pub(crate) fn reset(&self) {
        self.marker.store(CLEAN, Ordering::Release);
        self.newest.store(0, Ordering::Release);
    }
}

/// What `begin_write` decided about the page being written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct WriteIntent {
    pub(crate) freed: bool,
    pub(crate) reinit: bool,
}

/// Pool-lock protected part of a page descriptor.
pub(crate) struct FrameMeta {
    pub(crate) page: Option<PageId>,
    pub(crate) io: IoState,
    pub(crate) fix_count: u32,
    /// Created in memory; the first write needs no doublewrite copy.
    pub(crate) reinit: bool,
    pub(crate) zip: Option<Box<[u8]>>,
}

impl FrameMeta {
    pub(crate) fn empty() -> Self {
        Self {
            page: None,
            io: IoState::Unfixed,
            fix_count: 0,
            reinit: false,
            zip: None,
        }
    }

    pub(crate) fn assign(&mut self, page: PageId, io: IoState, reinit: bool) {
        debug_assert!(self.page.is_none());
        self.page = Some(page);
        self.io = io;
        self.fix_count = 1;
        self.reinit = reinit;
        self.zip = None;
    }

    pub(crate) fn release(&mut self) {
        self.page = None;
        self.io = IoState::Unfixed;
        self.fix_count = 0;
        self.reinit = false;
        self.zip = None;
    }

    #[inline]
    pub(crate) fn ready_for_replace(&self, marker: DirtyMarker) -> bool {
        self.page.is_some()
            && self.fix_count == 0
            && self.io == IoState::Unfixed
            && matches!(marker, DirtyMarker::Clean | DirtyMarker::PendingClear)
    }

    #[inline]
    pub(crate) fn ready_for_flush(&self, marker: DirtyMarker) -> bool {
        self.page.is_some()
            && marker.is_dirty()
            && matches!(self.io, IoState::Unfixed | IoState::Freed)
    }

    /// Moves the descriptor into a write state. Returns `None` when another
    /// I/O already owns the page.
    pub(crate) fn begin_write(&mut self) -> Option<WriteIntent> {
        match self.io {
            IoState::Unfixed => {
                let reinit = self.reinit;
                self.io = if reinit {
                    IoState::WriteInProgressReinit
                } else {
                    IoState::WriteInProgress
                };
                Some(WriteIntent {
                    freed: false,
                    reinit,
                })
            }
            IoState::Freed => {
                self.io = IoState::WriteInProgress;
                Some(WriteIntent {
                    freed: true,
                    reinit: false,
                })
            }
            _ => None,
        }
    }

    pub(crate) fn complete_write(&mut self, intent: &WriteIntent, success: bool) {
        debug_assert!(matches!(
            self.io,
            IoState::WriteInProgress | IoState::WriteInProgressReinit
        ));
        if success {
            self.io = IoState::Unfixed;
            self.reinit = false;
        } else if intent.freed {
            self.io = IoState::Freed;
        } else {
            self.io = IoState::Unfixed;
        }
    }
}
