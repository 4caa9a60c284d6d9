use crate::id::{PageId, SpaceId};
use anyhow::anyhow;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    /// Recoverable tablespace covered by the redo log.
    Persistent,
    /// Rebuilt on restart; pages are never checkpoint tracked.
    Temporary,
    /// Being imported: written without redo, still checkpoint tracked.
    Import,
}

#[derive(Clone, Debug)]
pub struct SpaceOptions {
    pub kind: SpaceKind,
    /// Size in pages; neighbor flushing never goes past it.
    pub size: u32,
    pub rotational: bool,
    pub doublewrite: bool,
    pub punch_hole: bool,
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self {
            kind: SpaceKind::Persistent,
            size: 0,
            rotational: false,
            doublewrite: true,
            punch_hole: false,
        }
    }
}

pub struct Space {
    id: SpaceId,
    kind: SpaceKind,
    size: AtomicU32,
    rotational: bool,
    doublewrite: bool,
    punch_hole: bool,

    pending_io: AtomicU32,
    io_lock: Mutex<()>,
    io_done: Condvar,
    stopping: AtomicBool,
    writes_stopped: AtomicBool,
    write_failures: AtomicU32,
}

impl Space {
    fn new(id: SpaceId, options: SpaceOptions) -> Self {
        Self {
            id,
            kind: options.kind,
            size: AtomicU32::new(options.size),
            rotational: options.rotational,
            doublewrite: options.doublewrite,
            punch_hole: options.punch_hole,
            pending_io: AtomicU32::new(0),
            io_lock: Mutex::new(()),
            io_done: Condvar::new(),
            stopping: AtomicBool::new(false),
            writes_stopped: AtomicBool::new(false),
            write_failures: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Grows the recorded size; it never shrinks.
    pub fn extend(&self, size: u32) {
        self.size.fetch_max(size, Ordering::AcqRel);
    }

    pub fn is_rotational(&self) -> bool {
        self.rotational
    }

    pub fn supports_punch_hole(&self) -> bool {
        self.punch_hole
    }

    /// Ordinary writes of this space go through the doublewrite buffer.
    pub fn uses_doublewrite(&self) -> bool {
        self.doublewrite && self.kind == SpaceKind::Persistent
    }

    pub(crate) fn needs_redo(&self) -> bool {
        self.kind == SpaceKind::Persistent
    }

    pub fn writes_stopped(&self) -> bool {
        self.writes_stopped.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn pending_io(&self) -> u32 {
        self.pending_io.load(Ordering::Acquire)
    }

    pub fn write_failures(&self) -> u32 {
        self.write_failures.load(Ordering::Acquire)
    }

    pub(crate) fn stop_writes(&self, reason: &str) {
        if !self.writes_stopped.swap(true, Ordering::AcqRel) {
            log::error!("tablespace {} is stopped for writes: {reason}", self.id);
        }
    }

    pub(crate) fn note_write_failure(&self, page: PageId, max_failures: u32) {
        let failures = self.write_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if page.page_no() == 0 {
            self.stop_writes("write of page 0 failed");
        } else if failures >= max_failures {
            self.stop_writes(&format!("{failures} write failures"));
        }
    }

    pub(crate) fn note_write_success(&self) {
        self.write_failures.store(0, Ordering::Release);
    }

    fn wait_for_io(&self) {
        let mut guard = self.io_lock.lock();
        while self.pending_io() > 0 {
            self.io_done.wait_for(&mut guard, Duration::from_millis(10));
        }
    }
}

/// Counted reference taken for the duration of a page I/O.
pub(crate) struct SpaceIo {
    space: Arc<Space>,
}

impl Deref for SpaceIo {
    type Target = Space;

    fn deref(&self) -> &Space {
        &self.space
    }
}

impl Drop for SpaceIo {
    fn drop(&mut self) {
        if self.space.pending_io.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.space.io_lock.lock();
            self.space.io_done.notify_all();
        }
    }
}

#[derive(Default)]
pub struct SpaceRegistry {
    spaces: RwLock<HashMap<SpaceId, Arc<Space>>>,
}

impl SpaceRegistry {
    pub fn register(&self, id: SpaceId, options: SpaceOptions) -> anyhow::Result<Arc<Space>> {
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&id) {
            return Err(anyhow!("tablespace {id} is already registered"));
        }
        let space = Arc::new(Space::new(id, options));
        spaces.insert(id, space.clone());
        Ok(space)
    }

    pub fn get(&self, id: SpaceId) -> Option<Arc<Space>> {
        self.spaces.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Space>> {
        self.spaces.read().values().cloned().collect()
    }

    pub(crate) fn acquire_for_io(&self, id: SpaceId) -> Option<SpaceIo> {
        let space = self.get(id)?;
        if space.is_stopping() {
            return None;
        }
        space.pending_io.fetch_add(1, Ordering::AcqRel);
        let io = SpaceIo { space };
        if io.is_stopping() {
            return None;
        }
        Some(io)
    }

    /// Refuses new I/O on the space and waits for the in-flight I/O to drain.
    pub(crate) fn begin_drop(&self, id: SpaceId) -> Option<Arc<Space>> {
        let space = self.get(id)?;
        space.stopping.store(true, Ordering::Release);
        space.wait_for_io();
        Some(space)
    }

    pub(crate) fn remove(&self, id: SpaceId) -> Option<Arc<Space>> {
        self.spaces.write().remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_refcount() {
        let registry = SpaceRegistry::default();
        let id = SpaceId::new(3);
        registry.register(id, SpaceOptions::default()).unwrap();
        assert!(registry.register(id, SpaceOptions::default()).is_err());

        let a = registry.acquire_for_io(id).unwrap();
        let b = registry.acquire_for_io(id).unwrap();
        assert_eq!(a.pending_io(), 2);
        drop(a);
        assert_eq!(b.pending_io(), 1);
        drop(b);
        assert_eq!(registry.get(id).unwrap().pending_io(), 0);
        assert!(registry.acquire_for_io(SpaceId::new(4)).is_none());
    }

    #[test]
    fn test_drop_waits_for_io() {
        let registry = Arc::new(SpaceRegistry::default());
        let id = SpaceId::new(1);
        registry.register(id, SpaceOptions::default()).unwrap();
        let io = registry.acquire_for_io(id).unwrap();

        let handle = std::thread::spawn({
            let registry = registry.clone();
            move || registry.begin_drop(id).map(|space| space.pending_io())
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(registry.acquire_for_io(id).is_none());
        drop(io);
        assert_eq!(handle.join().unwrap(), Some(0));
    }

    #[test]
    fn test_failures_stop_writes() {
        let registry = SpaceRegistry::default();
        let space = registry
            .register(SpaceId::new(1), SpaceOptions::default())
            .unwrap();
        let page = PageId::new(space.id(), 7);
        space.note_write_failure(page, 3);
        space.note_write_failure(page, 3);
        assert!(!space.writes_stopped());
        space.note_write_failure(page, 3);
        assert!(space.writes_stopped());

        let other = registry
            .register(SpaceId::new(2), SpaceOptions::default())
            .unwrap();
        other.note_write_failure(PageId::new(other.id(), 0), 100);
        assert!(other.writes_stopped());
    }
}
