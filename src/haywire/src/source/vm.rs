//! Guest physical memory as a data source

use super::{MemoryDataSource, Region};
use crate::backend::MemoryBackend;
use std::sync::Arc;

/// Guest-physical view over the memory backend. Addresses are GPAs.
pub struct VmMemorySource {
    backend: Arc<MemoryBackend>,
    regions: Vec<Region>,
}

impl VmMemorySource {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        let start = backend.ram_base();
        let end = start + backend.size();
        Self {
            backend,
            regions: vec![Region::new(start, end, "ram", "rw-p")],
        }
    }

    /// Use RAM ranges reported by the hypervisor instead of one flat range
    pub fn with_regions(backend: Arc<MemoryBackend>, mut regions: Vec<Region>) -> Self {
        regions.sort_by_key(|r| r.start);
        Self { backend, regions }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

impl MemoryDataSource for VmMemorySource {
    fn read(&self, address: u64, out: &mut [u8]) -> bool {
        self.backend.read(address, out).is_ok()
    }

    fn size(&self) -> u64 {
        self.backend.size()
    }

    fn is_valid(&self, address: u64, len: usize) -> bool {
        self.backend.offset_of(address, len).is_ok()
    }

    fn source_name(&self) -> String {
        format!("vm:{}", self.backend.path().display())
    }

    fn regions(&self) -> Vec<Region> {
        self.regions.clone()
    }
}
