//! Memory image files on disk (`pmemsave` dumps, saved RAM images)

use super::{MemoryDataSource, Region};
use crate::error::{HaywireError, Result};
use crate::maps::parse_maps;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// Read-only file image where `file_offset = address - base_address`.
/// A sibling `<name>.maps` file, when present, supplies region names.
pub struct MappedFile {
    mmap: Mmap,
    base_address: u64,
    regions: Vec<Region>,
    pub path: PathBuf,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(path: P, base_address: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| HaywireError::backend(&path, e))?;
        // SAFETY: read-only mapping; concurrent truncation is the caller's problem
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| HaywireError::backend(&path, e))?;
        info!("Opened memory image {:?} ({} MB)", path, mmap.len() / 1_000_000);

        let maps_path = path.with_extension("maps");
        let regions = match std::fs::read_to_string(&maps_path) {
            Ok(text) => parse_maps(&text).iter().map(Region::from).collect(),
            Err(_) => vec![Region::new(
                base_address,
                base_address + mmap.len() as u64,
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                "r--p",
            )],
        };

        Ok(Self {
            mmap,
            base_address,
            regions,
            path,
        })
    }
}

impl MemoryDataSource for MappedFile {
    fn read(&self, address: u64, out: &mut [u8]) -> bool {
        let Some(offset) = address.checked_sub(self.base_address) else {
            return false;
        };
        let offset = offset as usize;
        match self.mmap.get(offset..offset + out.len()) {
            Some(bytes) => {
                out.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn is_valid(&self, address: u64, len: usize) -> bool {
        address >= self.base_address
            && address - self.base_address + len as u64 <= self.mmap.len() as u64
    }

    fn source_name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn regions(&self) -> Vec<Region> {
        self.regions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mapped_file_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("guest.raw");
        let mut data = vec![0u8; 0x2000];
        data[0x1000..0x1004].copy_from_slice(b"ELF!");
        File::create(&image).unwrap().write_all(&data).unwrap();
        std::fs::write(
            dir.path().join("guest.maps"),
            "00400000-00401000 r-xp 00000000 08:01 1 /bin/app\n",
        )
        .unwrap();

        let source = MappedFile::open(&image, 0x40_0000 - 0x1000).unwrap();
        assert_eq!(source.read_vec(0x40_0000, 4).unwrap(), b"ELF!");
        assert_eq!(source.regions().len(), 1);
        assert_eq!(source.regions()[0].name, "/bin/app");
        assert!(!source.is_valid(0, 1));
    }

    #[test]
    fn test_missing_file() {
        let err = MappedFile::open("/nonexistent/haywire.raw", 0).err().unwrap();
        assert!(matches!(err, HaywireError::BackendUnavailable { .. }));
    }
}
