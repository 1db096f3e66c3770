//! The companion's beacon arena.
//!
//! Continuous mode backs the arena with an anonymous mapping; single-shot
//! mode uses a POSIX shared-memory object so the pages outlive the
//! process and later invocations can refresh them in place.

use anyhow::{Context, Result};
use haywire::protocol::arena::{arena_size, initialize_arena, page_mut, page_offset};
use haywire::protocol::{Category, DiscoveryPage, PAGE_SIZE, SHM_NAME};
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;
use std::fs::File;
use tracing::{debug, info};

pub struct Arena {
    map: MmapMut,
    discovery: DiscoveryPage,
    /// True when this process created the shared object
    created: bool,
}

impl Arena {
    pub fn anonymous(session_id: u32, timestamp: u32) -> Result<Self> {
        let discovery = layout(session_id, timestamp);
        let map = MmapMut::map_anon(arena_size(&discovery)).context("Failed to map beacon arena")?;
        Ok(Self::install(map, discovery, true))
    }

    /// Open (or create) the shared-memory object and reinitialize it
    pub fn shared(session_id: u32, timestamp: u32) -> Result<Self> {
        let discovery = layout(session_id, timestamp);
        let mode = Mode::from_bits_truncate(0o666);

        let (fd, created) = match shm_open(SHM_NAME, OFlag::O_RDWR, mode) {
            Ok(fd) => (fd, false),
            Err(Errno::ENOENT) => {
                let fd = shm_open(SHM_NAME, OFlag::O_RDWR | OFlag::O_CREAT, mode)
                    .with_context(|| format!("Failed to create shared memory {}", SHM_NAME))?;
                (fd, true)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open shared memory {}", SHM_NAME))
            }
        };

        let file = File::from(fd);
        file.set_len(arena_size(&discovery) as u64)
            .context("Failed to size shared memory")?;
        // SAFETY: the object is private to haywire; concurrent writers are
        // other companion invocations publishing the same layout
        let map = unsafe { MmapMut::map_mut(&file) }.context("Failed to map shared memory")?;

        if created {
            info!("Created shared memory /dev/shm{}", SHM_NAME);
        } else {
            info!("Refreshing existing shared memory /dev/shm{}", SHM_NAME);
        }
        Ok(Self::install(map, discovery, created))
    }

    fn install(mut map: MmapMut, discovery: DiscoveryPage, created: bool) -> Self {
        initialize_arena(&mut map, &discovery);
        debug!(
            "Arena ready: {} pages, session {:#x}",
            map.len() / PAGE_SIZE,
            discovery.session_id
        );
        Self {
            map,
            discovery,
            created,
        }
    }

    pub fn discovery(&self) -> &DiscoveryPage {
        &self.discovery
    }

    pub fn session_id(&self) -> u32 {
        self.discovery.session_id
    }

    pub fn page_count(&self, category: Category) -> u32 {
        self.discovery.page_count(category)
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn page_mut(&mut self, category: Category, index: u32) -> Option<&mut [u8]> {
        page_mut(&mut self.map, &self.discovery, category, index)
    }

    /// Copy a page the host may be writing concurrently
    pub fn read_page(&self, category: Category, index: u32) -> Option<Vec<u8>> {
        let offset = page_offset(&self.discovery, category, index)?;
        let src = self.map.get(offset..offset + PAGE_SIZE)?.as_ptr();
        Some(
            (0..PAGE_SIZE)
                // SAFETY: src..src+PAGE_SIZE is inside the mapping (checked above)
                .map(|i| unsafe { std::ptr::read_volatile(src.add(i)) })
                .collect(),
        )
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush().context("Failed to flush beacon arena")
    }
}

fn layout(session_id: u32, timestamp: u32) -> DiscoveryPage {
    let mut discovery = DiscoveryPage::with_default_layout(session_id, timestamp);
    discovery.version = 1;
    discovery
}

#[cfg(test)]
mod tests {
    use super::*;
    use haywire::protocol::{validate_page, CameraControl, CameraStatus, TOTAL_BEACON_PAGES};

    #[test]
    fn test_anonymous_arena_is_initialized() {
        let arena = Arena::anonymous(0x1234, 7).unwrap();
        assert_eq!(arena.bytes().len(), TOTAL_BEACON_PAGES * PAGE_SIZE);
        assert_eq!(arena.session_id(), 0x1234);

        let discovery = DiscoveryPage::parse(&arena.bytes()[..PAGE_SIZE]).unwrap();
        assert_eq!(discovery.session_id, 0x1234);
        assert_eq!(discovery.timestamp, 7);

        let pid_page = arena.read_page(Category::Pid, 3).unwrap();
        assert!(validate_page(&pid_page, Category::Pid, Some(0x1234)).is_valid());

        let control = CameraControl::parse(&arena.read_page(Category::Camera2, 0).unwrap()).unwrap();
        assert_eq!(control.status, CameraStatus::Idle);
        assert!(arena.read_page(Category::Pid, 32).is_none());
    }
}
