use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    #[inline]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_be_bytes(lsn: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(lsn))
    }

    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[inline]
    pub fn saturating_add(&self, rhs: u64) -> Self {
        Self(self.0.saturating_add(rhs))
    }

    /// Distance from `older` to `self`, zero if `older` is ahead.
    #[inline]
    pub fn age_since(&self, older: Lsn) -> u64 {
        self.0.saturating_sub(older.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(u32);

impl SpaceId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a cached page. Never changes while a frame holds the page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    space: SpaceId,
    page_no: u32,
}

impl PageId {
    #[inline]
    pub const fn new(space: SpaceId, page_no: u32) -> Self {
        Self { space, page_no }
    }

    #[inline]
    pub fn space(&self) -> SpaceId {
        self.space
    }

    #[inline]
    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    #[inline]
    pub(crate) fn with_page_no(&self, page_no: u32) -> Self {
        Self {
            space: self.space,
            page_no,
        }
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        buff[0..4].copy_from_slice(&self.space.0.to_be_bytes());
        buff[4..8].copy_from_slice(&self.page_no.to_be_bytes());
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space.0, self.page_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_ordering() {
        let a = PageId::new(SpaceId::new(1), 10);
        let b = PageId::new(SpaceId::new(1), 11);
        let c = PageId::new(SpaceId::new(2), 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.with_page_no(11), b);
        assert_eq!(format!("{c}"), "2:0");
    }

    #[test]
    fn test_lsn_age() {
        let old = Lsn::new(100);
        let new = Lsn::new(250);
        assert_eq!(new.age_since(old), 150);
        assert_eq!(old.age_since(new), 0);
        assert_eq!(Lsn::from_be_bytes(new.to_be_bytes()), new);
    }
}
