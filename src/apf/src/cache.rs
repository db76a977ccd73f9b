// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::mem::size_of;

use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::{Error, Result};

/// A guest physical range the host reads and writes on the guest's behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApfCache {
    gpa: GuestAddress,
    len: usize,
}

impl ApfCache {
    /// Binds the cache to `[gpa, gpa + len)`, which must be backed by `mem`.
    pub fn new(mem: &GuestMemoryMmap, gpa: u64, len: usize) -> Result<Self> {
        let start = GuestAddress(gpa);
        let last = start
            .checked_add(len.saturating_sub(1) as u64)
            .ok_or(Error::InvalidControlBlock(gpa))?;
        if len == 0 || !mem.address_in_range(start) || !mem.address_in_range(last) {
            return Err(Error::InvalidControlBlock(gpa));
        }

        Ok(ApfCache { gpa: start, len })
    }

    pub fn gpa(&self) -> u64 {
        self.gpa.raw_value()
    }

    fn addr(&self, offset: usize) -> Result<GuestAddress> {
        match offset.checked_add(size_of::<u32>()) {
            Some(end) if end <= self.len => Ok(self.gpa.unchecked_add(offset as u64)),
            _ => Err(Error::CacheOffset(offset)),
        }
    }

    pub fn read(&self, mem: &GuestMemoryMmap, offset: usize) -> Result<u32> {
        Ok(mem.read_obj::<u32>(self.addr(offset)?)?)
    }

    pub fn write(&self, mem: &GuestMemoryMmap, offset: usize, val: u32) -> Result<()> {
        mem.write_obj(val, self.addr(offset)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uapi::{PV_APF_CACHE_LEN, PV_APF_REASON_OFFSET, PV_APF_TOKEN_OFFSET};

    fn memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    #[test]
    fn test_read_write() {
        let mem = memory();
        let cache = ApfCache::new(&mem, 0x2000, PV_APF_CACHE_LEN).unwrap();
        assert_eq!(cache.gpa(), 0x2000);

        cache.write(&mem, PV_APF_TOKEN_OFFSET, 0x1001).unwrap();
        cache.write(&mem, PV_APF_REASON_OFFSET, 1).unwrap();
        assert_eq!(cache.read(&mem, PV_APF_TOKEN_OFFSET).unwrap(), 0x1001);
        assert_eq!(cache.read(&mem, PV_APF_REASON_OFFSET).unwrap(), 1);
        assert_eq!(mem.read_obj::<u32>(GuestAddress(0x2004)).unwrap(), 0x1001);
    }

    #[test]
    fn test_bounds() {
        let mem = memory();
        assert!(matches!(
            ApfCache::new(&mem, 0x10000, PV_APF_CACHE_LEN),
            Err(Error::InvalidControlBlock(0x10000))
        ));
        assert!(matches!(
            ApfCache::new(&mem, 0xfffc, PV_APF_CACHE_LEN),
            Err(Error::InvalidControlBlock(_))
        ));

        let cache = ApfCache::new(&mem, 0xfff8, PV_APF_CACHE_LEN).unwrap();
        assert!(matches!(cache.read(&mem, 8), Err(Error::CacheOffset(8))));
        assert!(matches!(cache.write(&mem, 6, 0), Err(Error::CacheOffset(6))));
    }
}
