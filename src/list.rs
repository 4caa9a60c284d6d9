//! Intrusive doubly linked lists over frame indices.
//!
//! Every frame owns one link slot per list, so membership tests and unlinks
//! are O(1). Scans that have to drop a lock half way register a hazard
//! pointer: when the node a hazard points at is removed, the hazard moves to
//! the node that the scan would have visited next (toward the head).

use anyhow::anyhow;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct NodeRef {
    index: usize,
    generation: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct HazardId(usize);

enum HazardSlot {
    Free,
    Active(Option<NodeRef>),
}

pub(crate) struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    prev: Box<[Option<usize>]>,
    next: Box<[Option<usize>]>,
    linked: Box<[bool]>,
    generation: Box<[u64]>,
    hazards: Vec<HazardSlot>,
}

impl List {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            prev: vec![None; n].into_boxed_slice(),
            next: vec![None; n].into_boxed_slice(),
            linked: vec![false; n].into_boxed_slice(),
            generation: vec![0; n].into_boxed_slice(),
            hazards: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<usize> {
        self.head
    }

    #[inline]
    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail
    }

    #[inline]
    pub(crate) fn contains(&self, i: usize) -> bool {
        self.linked[i]
    }

    /// Neighbor toward the head.
    #[inline]
    pub(crate) fn prev(&self, i: usize) -> Option<usize> {
        self.prev[i]
    }

    /// Neighbor toward the tail.
    #[inline]
    pub(crate) fn next(&self, i: usize) -> Option<usize> {
        self.next[i]
    }

    pub(crate) fn push_front(&mut self, i: usize) {
        debug_assert!(!self.linked[i]);
        self.prev[i] = None;
        self.next[i] = self.head;
        match self.head {
            Some(h) => self.prev[h] = Some(i),
            None => self.tail = Some(i),
        }
        self.head = Some(i);
        self.linked[i] = true;
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, i: usize) {
        debug_assert!(!self.linked[i]);
        self.next[i] = None;
        self.prev[i] = self.tail;
        match self.tail {
            Some(t) => self.next[t] = Some(i),
            None => self.head = Some(i),
        }
        self.tail = Some(i);
        self.linked[i] = true;
        self.len += 1;
    }

    /// Links `i` directly on the head side of `at`.
    pub(crate) fn insert_before(&mut self, at: usize, i: usize) {
        debug_assert!(self.linked[at] && !self.linked[i]);
        let Some(p) = self.prev[at] else {
            self.push_front(i);
            return;
        };
        self.prev[i] = Some(p);
        self.next[i] = Some(at);
        self.next[p] = Some(i);
        self.prev[at] = Some(i);
        self.linked[i] = true;
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<usize> {
        let h = self.head?;
        self.remove(h);
        Some(h)
    }

    pub(crate) fn remove(&mut self, i: usize) {
        debug_assert!(self.linked[i]);
        let prev = self.prev[i];
        let next = self.next[i];

        let removed = NodeRef {
            index: i,
            generation: self.generation[i],
        };
        let redirect = prev.map(|p| NodeRef {
            index: p,
            generation: self.generation[p],
        });
        for slot in self.hazards.iter_mut() {
            if let HazardSlot::Active(target) = slot {
                if *target == Some(removed) {
                    *target = redirect;
                }
            }
        }

        match prev {
            Some(p) => self.next[p] = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.prev[n] = prev,
            None => self.tail = prev,
        }
        self.prev[i] = None;
        self.next[i] = None;
        self.linked[i] = false;
        self.generation[i] += 1;
        self.len -= 1;
    }

    pub(crate) fn register_hazard(&mut self) -> HazardId {
        if let Some(i) = self
            .hazards
            .iter()
            .position(|slot| matches!(slot, HazardSlot::Free))
        {
            self.hazards[i] = HazardSlot::Active(None);
            HazardId(i)
        } else {
            self.hazards.push(HazardSlot::Active(None));
            HazardId(self.hazards.len() - 1)
        }
    }

    pub(crate) fn set_hazard(&mut self, hp: HazardId, node: Option<usize>) {
        let target = node.map(|index| NodeRef {
            index,
            generation: self.generation[index],
        });
        self.hazards[hp.0] = HazardSlot::Active(target);
    }

    /// The node the paused scan should resume from, if it is still linked.
    pub(crate) fn hazard(&self, hp: HazardId) -> Option<usize> {
        match self.hazards[hp.0] {
            HazardSlot::Active(Some(node))
                if self.linked[node.index] && self.generation[node.index] == node.generation =>
            {
                Some(node.index)
            }
            _ => None,
        }
    }

    pub(crate) fn release_hazard(&mut self, hp: HazardId) {
        self.hazards[hp.0] = HazardSlot::Free;
    }

    /// Iterates from the tail toward the head.
    pub(crate) fn iter_from_tail(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.tail, move |&i| self.prev[i])
    }

    pub(crate) fn validate(&self, name: &str) -> anyhow::Result<()> {
        let mut count = 0;
        let mut prev = None;
        let mut cur = self.head;
        while let Some(i) = cur {
            if !self.linked[i] {
                return Err(anyhow!("{name}: node {i} is reachable but not linked"));
            }
            if self.prev[i] != prev {
                return Err(anyhow!("{name}: broken back link at node {i}"));
            }
            count += 1;
            if count > self.len {
                return Err(anyhow!("{name}: cycle detected"));
            }
            prev = cur;
            cur = self.next[i];
        }
        if prev != self.tail {
            return Err(anyhow!("{name}: tail does not match the last node"));
        }
        if count != self.len {
            return Err(anyhow!("{name}: length is {} but {count} nodes are linked", self.len));
        }
        let linked = self.linked.iter().filter(|l| **l).count();
        if linked != self.len {
            return Err(anyhow!("{name}: {linked} nodes are flagged as linked"));
        }
        Ok(())
    }
}

/// Pages kept warm even when the list is tiny.
pub(crate) const LRU_NON_OLD_MIN_LEN: usize = 5;

/// LRU list split at a midpoint. The tail side is the "old" region that the
/// eviction scan works on; the head side holds recently promoted pages.
pub(crate) struct LruList {
    list: List,
    old: Box<[bool]>,
    old_len: usize,
    /// Head-most node of the old region.
    old_head: Option<usize>,
    old_pct: usize,
}

impl LruList {
    pub(crate) fn new(n: usize, old_pct: usize) -> Self {
        Self {
            list: List::new(n),
            old: vec![false; n].into_boxed_slice(),
            old_len: 0,
            old_head: None,
            old_pct,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub(crate) fn old_len(&self) -> usize {
        self.old_len
    }

    #[inline]
    pub(crate) fn contains(&self, i: usize) -> bool {
        self.list.contains(i)
    }

    #[inline]
    pub(crate) fn tail(&self) -> Option<usize> {
        self.list.tail()
    }

    #[inline]
    pub(crate) fn prev(&self, i: usize) -> Option<usize> {
        self.list.prev(i)
    }

    #[inline]
    pub(crate) fn is_old(&self, i: usize) -> bool {
        self.old[i]
    }

    pub(crate) fn set_old_pct(&mut self, pct: usize) {
        if self.old_pct != pct {
            self.old_pct = pct;
            self.rebalance();
        }
    }

    fn target_old_len(&self) -> usize {
        let len = self.list.len();
        (len * self.old_pct / 100).min(len.saturating_sub(LRU_NON_OLD_MIN_LEN))
    }

    fn mark_old(&mut self, i: usize) {
        self.old[i] = true;
        self.old_len += 1;
        self.old_head = Some(i);
    }

    fn rebalance(&mut self) {
        let target = self.target_old_len();
        while self.old_len < target {
            let candidate = match self.old_head {
                Some(h) => self.list.prev(h),
                None => self.list.tail(),
            };
            let Some(i) = candidate else {
                break;
            };
            self.mark_old(i);
        }
        while self.old_len > target {
            let Some(h) = self.old_head else {
                break;
            };
            self.old[h] = false;
            self.old_len -= 1;
            self.old_head = if self.old_len == 0 {
                None
            } else {
                self.list.next(h)
            };
        }
    }

    /// Midpoint insertion for pages that were just read or created.
    pub(crate) fn insert_midpoint(&mut self, i: usize) {
        match self.old_head {
            Some(h) => {
                self.list.insert_before(h, i);
                self.mark_old(i);
            }
            None => {
                self.list.push_front(i);
                self.old[i] = false;
            }
        }
        self.rebalance();
    }

    pub(crate) fn push_front(&mut self, i: usize) {
        self.list.push_front(i);
        self.old[i] = false;
        self.rebalance();
    }

    pub(crate) fn remove(&mut self, i: usize) {
        if self.old[i] {
            self.old[i] = false;
            self.old_len -= 1;
            if self.old_head == Some(i) {
                self.old_head = if self.old_len == 0 {
                    None
                } else {
                    self.list.next(i)
                };
            }
        }
        self.list.remove(i);
        self.rebalance();
    }

    /// Moves an old page to the head. Young pages stay where they are.
    pub(crate) fn promote(&mut self, i: usize) -> bool {
        if !self.old[i] {
            return false;
        }
        self.remove(i);
        self.push_front(i);
        true
    }

    pub(crate) fn register_hazard(&mut self) -> HazardId {
        self.list.register_hazard()
    }

    pub(crate) fn set_hazard(&mut self, hp: HazardId, node: Option<usize>) {
        self.list.set_hazard(hp, node)
    }

    pub(crate) fn hazard(&self, hp: HazardId) -> Option<usize> {
        self.list.hazard(hp)
    }

    pub(crate) fn release_hazard(&mut self, hp: HazardId) {
        self.list.release_hazard(hp)
    }

    pub(crate) fn iter_from_tail(&self) -> impl Iterator<Item = usize> + '_ {
        self.list.iter_from_tail()
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        self.list.validate("lru")?;
        let mut seen = 0;
        let mut young_seen = false;
        for i in self.list.iter_from_tail() {
            if self.old[i] {
                if young_seen {
                    return Err(anyhow!("lru: old page {i} sits inside the young region"));
                }
                seen += 1;
            } else {
                young_seen = true;
            }
        }
        if seen != self.old_len {
            return Err(anyhow!("lru: old length is {} but {seen} pages are old", self.old_len));
        }
        let head = self.list.iter_from_tail().take(self.old_len).last();
        if head != self.old_head {
            return Err(anyhow!("lru: old region head is out of place"));
        }
        Ok(())
    }
}
