//! Memory Data Source Trait
//!
//! What a viewer needs from anything it can display: bounded reads, a size,
//! named regions and an optional address translation.

use super::Region;
use byteorder::{ByteOrder, LE};

pub trait MemoryDataSource: Send + Sync {
    /// Fill `out` from `address`; false when any part is unreadable
    fn read(&self, address: u64, out: &mut [u8]) -> bool;

    /// Size of the address space this source exposes
    fn size(&self) -> u64;

    /// Display name
    fn source_name(&self) -> String;

    /// Named regions, sorted by start
    fn regions(&self) -> Vec<Region>;

    fn is_valid(&self, address: u64, len: usize) -> bool {
        address
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.size())
    }

    /// Address as understood by the memory backend; identity unless the
    /// source lives in a translated space
    fn translate(&self, address: u64) -> u64 {
        address
    }

    fn available(&self) -> bool {
        true
    }

    fn read_vec(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(address, &mut out).then_some(out)
    }

    fn read_u32(&self, address: u64) -> Option<u32> {
        self.read_vec(address, 4).map(|b| LE::read_u32(&b))
    }

    fn read_u64(&self, address: u64) -> Option<u64> {
        self.read_vec(address, 8).map(|b| LE::read_u64(&b))
    }

    fn find_region(&self, address: u64) -> Option<Region> {
        self.regions().into_iter().find(|r| r.contains(address))
    }
}
