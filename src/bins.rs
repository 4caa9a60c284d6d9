pub(crate) trait SliceExt {
    fn read_u32(&self) -> u32;
    fn read_u64(&self) -> u64;
}

impl SliceExt for [u8] {
    fn read_u32(&self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self[..4]);
        u32::from_be_bytes(b)
    }

    fn read_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self[..8]);
        u64::from_be_bytes(b)
    }
}
