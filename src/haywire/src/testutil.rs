//! Synthetic guest RAM images for tests.
//!
//! Images are assembled with the production page encoders, so a test that
//! reads them exercises the same bytes a live companion would publish.

use crate::backend::MemoryBackend;
use crate::protocol::arena::{arena_size, initialize_arena};
use crate::protocol::*;
use std::io::{Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

/// Where each arena page landed inside a [`GuestImage`]
#[derive(Debug, Clone)]
pub struct ArenaLayout {
    pub session_id: u32,
    pub discovery: DiscoveryPage,
    positions: Vec<Vec<u64>>,
}

impl ArenaLayout {
    /// Backend offset of `(category, index)`
    pub fn page_offset(&self, category: Category, index: u32) -> u64 {
        self.positions[category.index()][index as usize]
    }
}

pub struct GuestImage {
    pub data: Vec<u8>,
}

impl GuestImage {
    pub fn new(pages: usize) -> Self {
        Self {
            data: vec![0u8; pages * PAGE_SIZE],
        }
    }

    /// Materialize the image as a backend file (RAM base 0)
    pub fn backend(&self) -> MemoryBackend {
        self.backend_with_base(0)
    }

    pub fn backend_with_base(&self, ram_base: u64) -> MemoryBackend {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&self.data).unwrap();
        file.flush().unwrap();
        // The mapping outlives the unlinked file
        MemoryBackend::open_with_ram_base(file.path(), ram_base).unwrap()
    }

    /// Backend file of `total` bytes holding the image at offset 0 and
    /// `patches` further out; the gap stays a sparse hole
    pub fn sparse_backend(&self, total: u64, patches: &[(u64, &[u8])]) -> MemoryBackend {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&self.data).unwrap();
        for (offset, bytes) in patches {
            file.seek(SeekFrom::Start(*offset)).unwrap();
            file.write_all(bytes).unwrap();
        }
        file.as_file().set_len(total).unwrap();
        file.flush().unwrap();
        MemoryBackend::open(file.path()).unwrap()
    }

    /// Push the current image into an already-open backend
    pub fn sync(&self, backend: &MemoryBackend) {
        backend.write_at(0, &self.data).unwrap();
    }

    pub fn page_mut(&mut self, offset: u64) -> &mut [u8] {
        let offset = offset as usize;
        &mut self.data[offset..offset + PAGE_SIZE]
    }

    pub fn fill(&mut self, offset: u64, bytes: &[u8]) {
        let offset = offset as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Place a default-layout companion arena starting at `start_page`.
    /// Non-contiguous arenas are written in reverse order at a stride of
    /// two pages, the way a fragmented guest allocator scatters them.
    pub fn place_arena(&mut self, start_page: usize, session_id: u32, contiguous: bool) -> ArenaLayout {
        let mut discovery = DiscoveryPage::with_default_layout(session_id, 1000);
        discovery.version = 1;
        let mut arena = vec![0u8; arena_size(&discovery)];
        initialize_arena(&mut arena, &discovery);

        let total = arena.len() / PAGE_SIZE;
        let position = |k: usize| -> u64 {
            let slot = if contiguous {
                start_page + k
            } else {
                start_page + 2 * (total - 1 - k)
            };
            (slot * PAGE_SIZE) as u64
        };
        for (k, page) in arena.chunks_exact(PAGE_SIZE).enumerate() {
            let pos = position(k);
            self.page_mut(pos).copy_from_slice(page);
        }

        let positions = Category::ALL
            .iter()
            .map(|c| {
                let desc = discovery.descriptor(*c);
                let first = desc.base_offset as usize / PAGE_SIZE;
                (0..desc.page_count as usize).map(|i| position(first + i)).collect()
            })
            .collect();

        ArenaLayout {
            session_id,
            discovery,
            positions,
        }
    }

    /// A lone discovery page (stale sessions, uniqueness tests)
    pub fn place_discovery(&mut self, page: usize, session_id: u32, timestamp: u32) {
        let mut discovery = DiscoveryPage::with_default_layout(session_id, timestamp);
        discovery.version = 1;
        discovery.write(self.page_mut((page * PAGE_SIZE) as u64));
    }

    fn header(arena: &ArenaLayout, category: Category, index: u32, version: u32) -> PageHeader {
        let mut header = PageHeader::new(arena.session_id, category, index);
        header.version_top = version;
        header
    }

    pub fn process(pid: u32, comm: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            ppid: if pid > 1 { 1 } else { 0 },
            comm: comm.to_string(),
            state: b'S',
            num_threads: 1,
            exe_path: format!("/usr/bin/{comm}"),
            ..Default::default()
        }
    }

    /// PID generation spread over consecutive PID pages from `first_index`
    pub fn publish_pids(&mut self, arena: &ArenaLayout, first_index: u32, generation: u32, pids: &[u32]) {
        for (i, page) in paginate_pids(pids, generation).into_iter().enumerate() {
            let index = first_index + i as u32;
            let mut header = Self::header(arena, Category::Pid, index, generation);
            header.sequence = generation;
            let offset = arena.page_offset(Category::Pid, index);
            page.write(self.page_mut(offset), &header);
        }
    }

    /// Process entry and its sections starting at ROUNDROBIN `first_index`
    pub fn publish_process(
        &mut self,
        arena: &ArenaLayout,
        first_index: u32,
        sequence: u32,
        entry: &ProcessEntry,
        sections: &[SectionEntry],
    ) {
        let mut entry = entry.clone();
        entry.num_sections = sections.len() as u32;
        for (i, page) in paginate_process(&entry, sections).into_iter().enumerate() {
            let index = first_index + i as u32;
            let mut header = Self::header(arena, Category::RoundRobin, index, sequence);
            header.sequence = sequence;
            let offset = arena.page_offset(Category::RoundRobin, index);
            page.write(self.page_mut(offset), &header);
        }
    }

    pub fn publish_control(
        &mut self,
        arena: &ArenaLayout,
        cam: u8,
        version: u32,
        target_pid: u32,
        status: CameraStatus,
        current_pid: u32,
    ) {
        let category = Category::camera(cam).unwrap();
        let control = CameraControl {
            version,
            session_id: arena.session_id,
            target_pid,
            status,
            current_pid,
        };
        let header = Self::header(arena, category, 0, version);
        control.write(self.page_mut(arena.page_offset(category, 0)), &header);
    }

    /// Camera capture in the data pages after the control page
    pub fn publish_camera(
        &mut self,
        arena: &ArenaLayout,
        cam: u8,
        version: u32,
        target_pid: u32,
        entries: Vec<CameraEntry>,
    ) {
        self.publish_camera_at(arena, cam, 1, version, target_pid, entries);
    }

    pub fn publish_camera_at(
        &mut self,
        arena: &ArenaLayout,
        cam: u8,
        start_index: u32,
        version: u32,
        target_pid: u32,
        entries: Vec<CameraEntry>,
    ) {
        let category = Category::camera(cam).unwrap();
        let max_pages = (arena.discovery.page_count(category) - start_index) as usize;
        let (pages, _) = paginate_camera(target_pid, entries, max_pages);
        for (i, page) in pages.into_iter().enumerate() {
            let index = start_index + i as u32;
            let mut header = Self::header(arena, category, index, version);
            header.sequence = version;
            page.write(self.page_mut(arena.page_offset(category, index)), &header);
        }
    }
}

pub fn section(pid: u32, start: u64, size: u64) -> SectionEntry {
    SectionEntry {
        pid,
        start,
        end: start + size,
        perms: SectionPerms::from_maps("r-xp"),
        pathname: format!("/usr/lib/region-{start:x}"),
        ..Default::default()
    }
}

pub fn pte(va: u64, pa: u64) -> PteEntry {
    PteEntry {
        va,
        pa,
        flags: PteFlags(PteFlags::PRESENT),
    }
}
