//! Host-owned staging copies and the views decoded from them.
//!
//! A snapshot is built once per refresh and never mutated afterwards, so
//! readers can hold an `Arc` to it while the next refresh builds its
//! replacement.

use super::index::{check_layout, CategoryIndex, CategoryOffsets};
use crate::backend::MemoryBackend;
use crate::error::{HaywireError, Result};
use crate::protocol::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, trace};

/// Copies of one category's pages plus per-page validity
#[derive(Debug, Clone)]
pub struct CategoryStaging {
    pub category: Category,
    data: Vec<u8>,
    valid: Vec<bool>,
    present: Vec<bool>,
    torn: usize,
}

impl CategoryStaging {
    fn empty(category: Category, expected: usize) -> Self {
        Self {
            category,
            data: vec![0u8; expected * PAGE_SIZE],
            valid: vec![false; expected],
            present: vec![false; expected],
            torn: 0,
        }
    }

    /// Copy every present page and validate the copy
    pub fn stage(
        backend: &MemoryBackend,
        category: Category,
        offsets: &CategoryOffsets,
        session_id: u32,
    ) -> Result<Self> {
        let mut staging = Self::empty(category, offsets.expected());
        for index in 0..offsets.expected() {
            let Some(offset) = offsets.get(index) else {
                continue;
            };
            staging.present[index] = true;
            let page = &mut staging.data[index * PAGE_SIZE..(index + 1) * PAGE_SIZE];
            let stable = backend.read_versioned_page(offset, page)?;
            let status = validate_page(page, category, Some(session_id));
            let index_matches =
                PageHeader::parse(page).map(|h| h.category_index) == Some(index as u32);

            if stable && status.is_valid() && index_matches {
                staging.valid[index] = true;
            } else {
                if matches!(status, PageStatus::Torn { .. }) || !stable {
                    staging.torn += 1;
                }
                trace!("{} page {} rejected: {:?}", category, index, status);
            }
        }
        Ok(staging)
    }

    pub fn expected(&self) -> usize {
        self.valid.len()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    pub fn present_count(&self) -> usize {
        self.present.iter().filter(|v| **v).count()
    }

    pub fn torn_count(&self) -> usize {
        self.torn
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.valid.get(index).copied().unwrap_or(false)
    }

    /// The staged page if it passed validation
    pub fn page(&self, index: usize) -> Option<&[u8]> {
        self.is_valid(index)
            .then(|| &self.data[index * PAGE_SIZE..(index + 1) * PAGE_SIZE])
    }

    /// Valid pages in index order
    pub fn valid_pages(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        (0..self.expected()).filter_map(move |i| self.page(i).map(|p| (i, p)))
    }
}

/// Latest process entry for a PID with the sections published after it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub entry: ProcessEntry,
    pub sequence: u32,
    pub sections: Vec<SectionEntry>,
}

impl ProcessRecord {
    pub fn name(&self) -> &str {
        &self.entry.comm
    }
}

/// One decoded camera chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraCapture {
    pub target_pid: u32,
    pub version: u32,
    pub sections: Vec<SectionEntry>,
    pub ptes: Vec<PteEntry>,
    pub pages: usize,
    /// False when the chain broke before END (torn or stale page)
    pub complete: bool,
}

impl CameraCapture {
    /// Page-aligned VA -> page-aligned PA for present entries
    pub fn pte_map(&self, accept_fabricated: bool) -> HashMap<u64, u64> {
        self.ptes
            .iter()
            .filter(|p| p.flags.is_present() && (accept_fabricated || !p.flags.is_fabricated()))
            .map(|p| (p.va & !PAGE_OFFSET_MASK, p.pa & !PAGE_OFFSET_MASK))
            .collect()
    }
}

/// Per-category page counts for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub expected: usize,
    pub found: usize,
    pub valid: usize,
    pub torn: usize,
    pub contiguous: bool,
}

/// Immutable result of one refresh
#[derive(Debug, Clone)]
pub struct BeaconSnapshot {
    pub session_id: u32,
    pub discovery: DiscoveryPage,
    pub discovery_offset: u64,
    pub taken_at: Instant,
    staging: Vec<CategoryStaging>,
    stats: Vec<CategoryStats>,
    generations: Vec<PidGeneration>,
    processes: BTreeMap<u32, ProcessRecord>,
    controls: [Option<CameraControl>; 2],
    cameras: [Option<CameraCapture>; 2],
}

impl BeaconSnapshot {
    /// Stage every category and decode it. A structurally invalid camera
    /// stream fails the whole snapshot.
    pub fn build(
        backend: &MemoryBackend,
        discovery: &DiscoveryPage,
        discovery_offset: u64,
        index: &CategoryIndex,
    ) -> Result<Self> {
        check_layout(discovery)?;
        let session_id = index.session_id;
        let mut staging = Vec::with_capacity(NUM_CATEGORIES);
        let mut stats = Vec::with_capacity(NUM_CATEGORIES);
        for category in Category::ALL {
            let offsets = index.category(category);
            let staged = if category == Category::Master {
                // Discovery has its own layout and was validated on parse
                let mut s = CategoryStaging::empty(category, offsets.expected());
                if s.expected() > 0 {
                    backend.read_at(discovery_offset, &mut s.data[..PAGE_SIZE])?;
                    s.valid[0] = true;
                    s.present[0] = true;
                }
                s
            } else {
                CategoryStaging::stage(backend, category, offsets, session_id)?
            };
            stats.push(CategoryStats {
                expected: staged.expected(),
                found: staged.present_count(),
                valid: staged.valid_count(),
                torn: staged.torn_count(),
                contiguous: offsets.is_contiguous(),
            });
            staging.push(staged);
        }

        let generations = decode_generations(&staging[Category::Pid.index()]);
        let processes = decode_processes(&staging[Category::RoundRobin.index()]);
        let mut controls = [None, None];
        let mut cameras = [None, None];
        for (slot, category) in [Category::Camera1, Category::Camera2].into_iter().enumerate() {
            let cam = &staging[category.index()];
            controls[slot] = cam.page(0).and_then(CameraControl::parse);
            cameras[slot] = decode_camera(cam)?;
        }

        debug!(
            "Snapshot for session {:#x}: {} generations, {} processes",
            session_id,
            generations.len(),
            processes.len()
        );

        Ok(Self {
            session_id,
            discovery: discovery.clone(),
            discovery_offset,
            taken_at: Instant::now(),
            staging,
            stats,
            generations,
            processes,
            controls,
            cameras,
        })
    }

    pub fn staging(&self, category: Category) -> &CategoryStaging {
        &self.staging[category.index()]
    }

    pub fn stats(&self, category: Category) -> CategoryStats {
        self.stats[category.index()]
    }

    /// Every PID generation seen, newest first
    pub fn pid_generations(&self) -> &[PidGeneration] {
        &self.generations
    }

    /// Newest complete generation, falling back to the newest partial one
    pub fn pid_list(&self) -> Vec<u32> {
        select_pid_list(&self.generations)
    }

    pub fn processes(&self) -> &BTreeMap<u32, ProcessRecord> {
        &self.processes
    }

    pub fn process(&self, pid: u32) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    pub fn camera_control(&self, cam: u8) -> Option<&CameraControl> {
        camera_slot(cam).and_then(|slot| self.controls[slot].as_ref())
    }

    pub fn camera(&self, cam: u8) -> Option<&CameraCapture> {
        camera_slot(cam).and_then(|slot| self.cameras[slot].as_ref())
    }

    /// The camera's capture if it is focused on `pid`
    pub fn camera_for(&self, cam: u8, pid: u32) -> Option<&CameraCapture> {
        self.camera(cam).filter(|c| c.target_pid == pid)
    }
}

fn camera_slot(cam: u8) -> Option<usize> {
    Category::camera(cam).map(|c| c.index() - Category::Camera1.index())
}

fn decode_generations(staging: &CategoryStaging) -> Vec<PidGeneration> {
    assemble_generations(
        staging
            .valid_pages()
            // data_size 0: initialised but never written
            .filter(|(_, page)| PageHeader::parse(page).is_some_and(|h| h.data_size > 0))
            .filter_map(|(_, page)| PidListPage::parse(page)),
    )
}

/// Keep the highest-sequence process page per PID and attach the section
/// continuation pages that share its sequence.
fn decode_processes(staging: &CategoryStaging) -> BTreeMap<u32, ProcessRecord> {
    let mut processes: BTreeMap<u32, ProcessRecord> = BTreeMap::new();
    let mut continuations: HashMap<(u32, u32), Vec<(usize, Vec<SectionEntry>)>> = HashMap::new();

    for (index, page) in staging.valid_pages() {
        let Some(header) = PageHeader::parse(page) else {
            continue;
        };
        match RoundRobinPage::parse(page) {
            Some(RoundRobinPage::Process { entry, sections }) => {
                let newer = processes
                    .get(&entry.pid)
                    .map(|r| header.sequence > r.sequence)
                    .unwrap_or(true);
                if newer {
                    processes.insert(
                        entry.pid,
                        ProcessRecord {
                            entry,
                            sequence: header.sequence,
                            sections,
                        },
                    );
                }
            }
            Some(RoundRobinPage::Sections(sections)) => {
                if let Some(pid) = sections.first().map(|s| s.pid) {
                    continuations
                        .entry((pid, header.sequence))
                        .or_default()
                        .push((index, sections));
                }
            }
            None => {}
        }
    }

    for record in processes.values_mut() {
        if let Some(mut pages) = continuations.remove(&(record.entry.pid, record.sequence)) {
            pages.sort_by_key(|(index, _)| *index);
            record
                .sections
                .extend(pages.into_iter().flat_map(|(_, s)| s));
        }
        record.sections.sort_by_key(|s| s.start);
        record.sections.dedup_by_key(|s| s.start);
    }
    processes
}

/// Walk a camera chain from its first data page. Page 0 is the control
/// page when it parses as one, otherwise it is the first data page.
fn decode_camera(staging: &CategoryStaging) -> Result<Option<CameraCapture>> {
    let has_control = staging.page(0).and_then(CameraControl::parse).is_some();
    let start = usize::from(has_control);

    let Some(first) = staging.page(start) else {
        return Ok(None);
    };
    let Some(first_header) = PageHeader::parse(first) else {
        return Ok(None);
    };
    let Some(first_page) = CameraDataPage::parse(first)? else {
        return Ok(None);
    };
    // Freshly initialised page, nothing captured yet
    if first_page.target_pid == 0 && first_page.entries.is_empty() {
        return Ok(None);
    }

    let mut capture = CameraCapture {
        target_pid: first_page.target_pid,
        version: first_header.version_top,
        ..Default::default()
    };

    let mut page = first_page;
    let mut index = start;
    loop {
        capture.pages += 1;
        for entry in &page.entries {
            match entry {
                CameraEntry::Section(s) => capture.sections.push(s.clone()),
                CameraEntry::Pte(p) => capture.ptes.push(*p),
                CameraEntry::End => capture.complete = true,
            }
        }
        if capture.complete || !page.continuation {
            capture.complete = true;
            break;
        }

        index += 1;
        let Some(next) = staging.page(index) else {
            break;
        };
        let same_capture = PageHeader::parse(next)
            .map(|h| h.version_top == capture.version)
            .unwrap_or(false);
        if !same_capture {
            break;
        }
        match CameraDataPage::parse(next)? {
            Some(next_page) if next_page.target_pid == capture.target_pid => page = next_page,
            Some(next_page) => {
                return Err(HaywireError::ProtocolViolation(format!(
                    "{} page {} targets PID {} inside a capture of PID {}",
                    staging.category, index, next_page.target_pid, capture.target_pid
                )))
            }
            None => break,
        }
    }

    if !capture.complete {
        debug!(
            "{} capture of PID {} broken after {} pages",
            staging.category, capture.target_pid, capture.pages
        );
    }
    Ok(Some(capture))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::index::{build_index, scan_discovery};
    use crate::testutil::{pte, section, GuestImage};
    use byteorder::{ByteOrder, LE};
    use proptest::prelude::*;

    fn snapshot_of(image: &GuestImage) -> BeaconSnapshot {
        let backend = image.backend();
        let discovery = scan_discovery(&backend).unwrap();
        let index = build_index(&backend, &discovery).unwrap();
        BeaconSnapshot::build(&backend, &discovery.page, discovery.offset, &index).unwrap()
    }

    #[test]
    fn test_processes_with_continuations() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 1, true);
        let sections: Vec<_> = (0..20).map(|i| section(9, 0x1000_0000 + i * 0x10000, 0x1000)).collect();
        image.publish_process(&arena, 0, 3, &GuestImage::process(9, "bash"), &sections);

        let snap = snapshot_of(&image);
        let record = snap.process(9).unwrap();
        assert_eq!(record.name(), "bash");
        assert_eq!(record.sections.len(), 20);
        assert_eq!(snap.stats(Category::RoundRobin).valid, 500);
    }

    #[test]
    fn test_newer_sequence_wins() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 1, true);
        image.publish_process(&arena, 0, 1, &GuestImage::process(4, "old"), &[]);
        image.publish_process(&arena, 5, 2, &GuestImage::process(4, "new"), &[]);
        let snap = snapshot_of(&image);
        assert_eq!(snap.process(4).unwrap().name(), "new");
    }

    #[test]
    fn test_camera_chain_across_pages() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 1, true);
        image.publish_control(&arena, 1, 2, 77, CameraStatus::Active, 77);
        let mut entries = vec![CameraEntry::Section(section(77, 0x400000, 0x200000))];
        entries.extend((0..300).map(|i| CameraEntry::Pte(pte(0x400000 + i * 0x1000, 0x9000_0000 + i * 0x1000))));
        image.publish_camera(&arena, 1, 5, 77, entries);

        let snap = snapshot_of(&image);
        let capture = snap.camera_for(1, 77).unwrap();
        assert!(capture.complete);
        assert!(capture.pages > 1);
        assert_eq!(capture.sections.len(), 1);
        assert_eq!(capture.ptes.len(), 300);
        assert_eq!(snap.camera_control(1).unwrap().current_pid, 77);
        assert!(snap.camera_for(1, 78).is_none());
        assert!(snap.camera(2).is_none());
    }

    #[test]
    fn test_camera_without_control_page() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 1, true);
        image.publish_camera_at(&arena, 2, 0, 3, 55, vec![CameraEntry::Pte(pte(0x1000, 0x2000))]);
        let snap = snapshot_of(&image);
        assert!(snap.camera_control(2).is_none());
        assert_eq!(snap.camera_for(2, 55).unwrap().ptes.len(), 1);
    }

    #[test]
    fn test_stale_continuation_breaks_chain() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 1, true);
        let per_page = (CAMERA_STREAM_CAPACITY - 1) / PTE_ENTRY_SIZE;
        let entries: Vec<_> = (0..per_page as u64 + 5)
            .map(|i| CameraEntry::Pte(pte(i * 0x1000, 0x10_0000 + i * 0x1000)))
            .collect();
        image.publish_camera(&arena, 1, 8, 12, entries);
        // Second page rewritten by a later capture that has not finished
        image.publish_camera_at(&arena, 1, 2, 9, 12, vec![CameraEntry::Pte(pte(0, 0))]);

        let snap = snapshot_of(&image);
        let capture = snap.camera(1).unwrap();
        assert!(!capture.complete);
        assert_eq!(capture.ptes.len(), per_page);
    }

    #[test]
    fn test_pte_map_skips_fabricated() {
        let capture = CameraCapture {
            ptes: vec![
                pte(0x1234, 0x5678),
                PteEntry {
                    va: 0x9000,
                    pa: 0xA000,
                    flags: PteFlags(PteFlags::PRESENT | PteFlags::FABRICATED),
                },
            ],
            ..Default::default()
        };
        let map = capture.pte_map(false);
        assert_eq!(map.get(&0x1000), Some(&0x5000));
        assert!(!map.contains_key(&0x9000));
        assert_eq!(capture.pte_map(true).len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Pages whose bottom version lags the top never surface
        #[test]
        fn prop_lagging_pages_rejected(torn in prop::collection::btree_set(0u32..16, 1..8)) {
            let mut image = GuestImage::new(1024);
            let arena = image.place_arena(0, 3, true);
            let pids: Vec<u32> = (1..=(MAX_PIDS_PER_PAGE as u32 * 16)).collect();
            image.publish_pids(&arena, 0, 7, &pids);
            for index in &torn {
                let offset = arena.page_offset(Category::Pid, *index);
                let page = image.page_mut(offset);
                LE::write_u32(&mut page[OFF_VERSION_TOP..], 8);
                LE::write_u32(&mut page[OFF_VERSION_BOTTOM..], 7);
            }

            let snap = snapshot_of(&image);
            let staging = snap.staging(Category::Pid);
            for index in &torn {
                prop_assert!(staging.page(*index as usize).is_none());
            }
            for (_, page) in staging.valid_pages() {
                let header = PageHeader::parse(page).unwrap();
                prop_assert_eq!(header.version_top, version_bottom(page));
            }
            prop_assert_eq!(staging.torn_count(), torn.len());
            // Only the damaged generation exists, so it is returned partial
            let generation = &snap.pid_generations()[0];
            prop_assert!(!generation.is_complete());
            prop_assert_eq!(generation.pages, 16 - torn.len());
        }
    }

    #[test]
    fn test_concurrent_writer_never_accepted_mid_write() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;

        let image = GuestImage::new(2);
        let backend = Arc::new(image.backend());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let backend = backend.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut page = vec![0u8; PAGE_SIZE];
                let mut version = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    version = version.wrapping_add(1);
                    let fill = (version % 251) as u8;
                    write_versioned(&mut page, OFF_VERSION_TOP, version, |p| {
                        p[OFF_DATA..OFF_VERSION_BOTTOM].fill(fill);
                    });
                    backend.write_page_versioned(0, &page, OFF_VERSION_TOP).unwrap();
                }
            })
        };

        let mut accepted = 0;
        let mut page = vec![0u8; PAGE_SIZE];
        for _ in 0..2000 {
            if backend.read_versioned_page(0, &mut page).unwrap() {
                let version = LE::read_u32(&page[OFF_VERSION_TOP..]);
                let fill = (version % 251) as u8;
                assert!(page[OFF_DATA..OFF_VERSION_BOTTOM].iter().all(|&b| b == fill));
                accepted += 1;
            }
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        assert!(accepted > 0);
    }
}
