//! In-memory byte blob source

use super::{MemoryDataSource, Region};

/// Bytes held in memory at a base address (snapshots, test fixtures)
pub struct BlobSource {
    pub data: Vec<u8>,
    pub base_address: u64,
    name: String,
    regions: Vec<Region>,
}

impl BlobSource {
    pub fn new(data: Vec<u8>, base_address: u64, name: impl Into<String>) -> Self {
        let end = base_address + data.len() as u64;
        Self {
            data,
            base_address,
            name: name.into(),
            regions: vec![Region::new(base_address, end, "", "rw-p")],
        }
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }
}

impl MemoryDataSource for BlobSource {
    fn read(&self, address: u64, out: &mut [u8]) -> bool {
        let Some(offset) = address.checked_sub(self.base_address) else {
            return false;
        };
        let offset = offset as usize;
        match self.data.get(offset..offset + out.len()) {
            Some(bytes) => {
                out.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_valid(&self, address: u64, len: usize) -> bool {
        address >= self.base_address
            && address - self.base_address + len as u64 <= self.data.len() as u64
    }

    fn source_name(&self) -> String {
        self.name.clone()
    }

    fn regions(&self) -> Vec<Region> {
        self.regions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_reads() {
        let mut data = vec![0u8; 0x100];
        data[0x10..0x18].copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
        let source = BlobSource::new(data, 0x1000, "blob");

        assert_eq!(source.read_u64(0x1010), Some(0xDEAD_BEEF));
        assert_eq!(source.read_u32(0x1010), Some(0xDEAD_BEEF));
        assert!(source.read_u64(0x0ff8).is_none());
        assert!(source.read_u64(0x10fc).is_none());
        assert!(source.is_valid(0x1000, 0x100));
        assert!(!source.is_valid(0x1000, 0x101));
        assert_eq!(source.find_region(0x1080).unwrap().start, 0x1000);
    }
}
