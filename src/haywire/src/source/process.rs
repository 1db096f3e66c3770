//! One process's address space in flat coordinates

use super::{MemoryDataSource, Region};
use crate::crunched::CrunchedReader;

/// Gap-free view of a process; addresses are flat offsets
pub struct ProcessMemorySource {
    reader: CrunchedReader,
    name: String,
}

impl ProcessMemorySource {
    pub fn new(reader: CrunchedReader, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
        }
    }

    pub fn reader(&self) -> &CrunchedReader {
        &self.reader
    }
}

impl MemoryDataSource for ProcessMemorySource {
    /// Unmapped pages read as zeros and still succeed
    fn read(&self, address: u64, out: &mut [u8]) -> bool {
        self.reader.read(address, out) == out.len()
    }

    fn size(&self) -> u64 {
        self.reader.flat_size()
    }

    fn source_name(&self) -> String {
        format!("pid {} ({})", self.reader.pid(), self.name)
    }

    fn regions(&self) -> Vec<Region> {
        self.reader
            .flattener()
            .regions()
            .iter()
            .map(Region::from)
            .collect()
    }

    /// Flat offset to guest physical address, 0 when not present
    fn translate(&self, address: u64) -> u64 {
        self.reader.physical_address(address)
    }

    fn available(&self) -> bool {
        !self.reader.flattener().is_empty()
    }
}
