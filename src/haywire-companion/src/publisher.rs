//! One publishing cycle: PID list, round-robin process detail and the
//! two cameras.

use crate::arena::Arena;
use crate::procfs::{fabricate_ptes, ProcFs, PteRead};
use haywire::protocol::{
    paginate_camera, paginate_pids, paginate_process, CameraControl, CameraEntry, CameraStatus,
    Category, PageHeader, SectionEntry, CAMERA_CONTROL_INDEX, CAMERA_STREAM_CAPACITY,
    MAX_PIDS_PER_PAGE, PIDS_PER_BATCH, PTE_ENTRY_SIZE,
};
use tracing::{debug, info, warn};

/// Per-camera capture bookkeeping
#[derive(Debug, Default, Clone, Copy)]
struct CameraState {
    /// Last control version acted on
    seen_version: u32,
    current_pid: u32,
    /// Version stamped on every page of the latest capture
    capture_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleStats {
    pub pids: usize,
    pub detailed: usize,
    pub captured: [Option<u32>; 2],
}

pub struct Publisher {
    arena: Arena,
    procfs: ProcFs,
    generation: u32,
    pids: Vec<u32>,
    rr_position: usize,
    rr_write_index: u32,
    rr_sequence: u32,
    cameras: [CameraState; 2],
}

impl Publisher {
    pub fn new(arena: Arena, procfs: ProcFs) -> Self {
        Self {
            arena,
            procfs,
            generation: 0,
            pids: Vec::new(),
            rr_position: 0,
            rr_write_index: 0,
            rr_sequence: 0,
            cameras: [CameraState::default(); 2],
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn into_arena(self) -> Arena {
        self.arena
    }

    /// Point camera 1 at `pid` without waiting for a host request
    pub fn set_initial_target(&mut self, pid: u32) {
        let version = 1;
        self.write_control(1, version, pid);
        self.cameras[0] = CameraState {
            seen_version: version,
            current_pid: pid,
            capture_version: 0,
        };
        info!("Camera 1 target set to PID {}", pid);
    }

    pub fn cycle(&mut self) -> CycleStats {
        let pids = self.publish_pids();
        let detailed = self.publish_round_robin();
        let captured = [self.run_camera(1), self.run_camera(2)];
        CycleStats {
            pids,
            detailed,
            captured,
        }
    }

    /// Write a new PID generation into the half of the PID category the
    /// previous generation does not occupy
    fn publish_pids(&mut self) -> usize {
        self.pids = self.procfs.pids();
        self.generation = self.generation.wrapping_add(1);

        let half = self.arena.page_count(Category::Pid) / 2;
        let max_pids = half as usize * MAX_PIDS_PER_PAGE;
        if self.pids.len() > max_pids {
            warn!("{} processes exceed PID capacity {}", self.pids.len(), max_pids);
            self.pids.truncate(max_pids);
        }

        let base = (self.generation % 2) * half;
        for (i, page) in paginate_pids(&self.pids, self.generation).iter().enumerate() {
            let index = base + i as u32;
            let header = self.header(Category::Pid, index, self.generation);
            if let Some(out) = self.arena.page_mut(Category::Pid, index) {
                page.write(out, &header);
            }
        }
        debug!("PID generation {}: {} processes", self.generation, self.pids.len());
        self.pids.len()
    }

    /// Detail the next batch of processes; vanished ones are skipped
    fn publish_round_robin(&mut self) -> usize {
        if self.pids.is_empty() {
            return 0;
        }
        let capacity = self.arena.page_count(Category::RoundRobin);
        let mut detailed = 0;

        for _ in 0..PIDS_PER_BATCH.min(self.pids.len()) {
            let pid = self.pids[self.rr_position % self.pids.len()];
            self.rr_position = (self.rr_position + 1) % self.pids.len();

            let (Some(mut entry), Some(sections)) =
                (self.procfs.process(pid), self.procfs.sections(pid))
            else {
                continue;
            };
            entry.num_sections = sections.len() as u32;
            let mut pages = paginate_process(&entry, &sections);
            pages.truncate(capacity as usize);
            if self.rr_write_index + pages.len() as u32 > capacity {
                self.rr_write_index = 0;
            }

            self.rr_sequence = self.rr_sequence.wrapping_add(1);
            for page in &pages {
                let index = self.rr_write_index;
                let header = self.header(Category::RoundRobin, index, self.rr_sequence);
                if let Some(out) = self.arena.page_mut(Category::RoundRobin, index) {
                    page.write(out, &header);
                }
                self.rr_write_index = (index + 1) % capacity;
            }
            detailed += 1;
        }
        detailed
    }

    fn header(&self, category: Category, index: u32, version: u32) -> PageHeader {
        let mut header = PageHeader::new(self.arena.session_id(), category, index);
        header.version_top = version;
        header.sequence = version;
        header
    }

    fn write_control(&mut self, cam: u8, version: u32, pid: u32) {
        let Some(category) = Category::camera(cam) else {
            return;
        };
        let control = CameraControl {
            version,
            session_id: self.arena.session_id(),
            target_pid: pid,
            status: if pid == 0 {
                CameraStatus::Idle
            } else {
                CameraStatus::Active
            },
            current_pid: pid,
        };
        let header = PageHeader::new(self.arena.session_id(), category, CAMERA_CONTROL_INDEX);
        if let Some(page) = self.arena.page_mut(category, CAMERA_CONTROL_INDEX) {
            control.write(page, &header);
        }
    }

    /// Adopt a new host request, then capture the current target.
    /// Returns the PID captured this cycle.
    fn run_camera(&mut self, cam: u8) -> Option<u32> {
        let category = Category::camera(cam)?;
        let slot = usize::from(cam - 1);

        let requested = self
            .arena
            .read_page(category, CAMERA_CONTROL_INDEX)
            .and_then(|p| CameraControl::parse(&p));
        if let Some(control) = requested {
            if control.version != self.cameras[slot].seen_version {
                self.cameras[slot].seen_version = control.version;
                if control.target_pid != self.cameras[slot].current_pid {
                    info!("Camera {} switching to PID {}", cam, control.target_pid);
                }
                self.cameras[slot].current_pid = control.target_pid;
                self.write_control(cam, control.version, control.target_pid);
            }
        }

        let pid = self.cameras[slot].current_pid;
        if pid == 0 {
            return None;
        }
        let Some(sections) = self.procfs.sections(pid) else {
            warn!("Camera {} target PID {} is gone", cam, pid);
            self.cameras[slot].current_pid = 0;
            let version = self.cameras[slot].seen_version;
            self.write_control(cam, version, 0);
            return None;
        };

        let data_pages = self.arena.page_count(category).saturating_sub(1) as usize;
        let entries = self.capture_entries(pid, &sections, data_pages);
        self.cameras[slot].capture_version = self.cameras[slot].capture_version.wrapping_add(1);
        let version = self.cameras[slot].capture_version;

        let (pages, dropped) = paginate_camera(pid, entries, data_pages);
        if dropped > 0 {
            debug!("Camera {} dropped {} entries for PID {}", cam, dropped, pid);
        }
        for (i, page) in pages.iter().enumerate() {
            let index = CAMERA_CONTROL_INDEX + 1 + i as u32;
            let header = self.header(category, index, version);
            if let Some(out) = self.arena.page_mut(category, index) {
                page.write(out, &header);
            }
        }
        Some(pid)
    }

    /// Sections first, then PTEs of every readable section
    fn capture_entries(&self, pid: u32, sections: &[SectionEntry], pages: usize) -> Vec<CameraEntry> {
        let mut budget = pages * (CAMERA_STREAM_CAPACITY / PTE_ENTRY_SIZE);
        let mut entries: Vec<CameraEntry> =
            sections.iter().cloned().map(CameraEntry::Section).collect();
        let mut fabricated = 0;

        for section in sections.iter().filter(|s| s.perms.is_readable()) {
            if budget == 0 {
                break;
            }
            let ptes = match self.procfs.ptes(pid, section.start, section.end, budget) {
                PteRead::Mapped(ptes) => ptes,
                PteRead::Unavailable => {
                    let ptes = fabricate_ptes(section);
                    fabricated += ptes.len();
                    ptes
                }
            };
            budget = budget.saturating_sub(ptes.len());
            entries.extend(ptes.into_iter().map(CameraEntry::Pte));
        }
        if fabricated > 0 {
            debug!("PID {}: pagemap unavailable, {} fabricated PTEs", pid, fabricated);
        }
        entries
    }
}
