//! Region type shared by every data source

use crate::flatten::FlatRegion;
use crate::maps::MapsEntry;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub perms: String,
}

impl Region {
    pub fn new(start: u64, end: u64, name: impl Into<String>, perms: impl Into<String>) -> Self {
        Self {
            start,
            end,
            name: name.into(),
            perms: perms.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }
}

impl From<&MapsEntry> for Region {
    fn from(entry: &MapsEntry) -> Self {
        Region::new(entry.start, entry.end, entry.pathname.clone(), entry.perms.clone())
    }
}

/// A flattened region expressed in flat coordinates
impl From<&FlatRegion> for Region {
    fn from(region: &FlatRegion) -> Self {
        Region::new(
            region.flat_start,
            region.flat_end,
            region.name.clone(),
            region.perms.clone(),
        )
    }
}
