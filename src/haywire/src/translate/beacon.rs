//! VA to PA translation from camera PTE streams

use crate::protocol::PAGE_OFFSET_MASK;
use crate::reader::{BeaconReader, BeaconSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

const CAMERAS: [u8; 2] = [1, 2];

#[derive(Default)]
struct PteCache {
    /// Reader epoch the cache was built under
    epoch: u64,
    /// Snapshot last merged, to skip re-merging on repeated misses
    merged: Option<Arc<BeaconSnapshot>>,
    pages: HashMap<u32, HashMap<u64, u64>>,
}

/// Per-PID page cache fed by the companion's cameras. Entries only
/// accumulate within a session; a session change clears everything.
pub struct BeaconTranslator {
    reader: Arc<BeaconReader>,
    cache: RwLock<PteCache>,
}

impl BeaconTranslator {
    pub fn new(reader: Arc<BeaconReader>) -> Self {
        let epoch = reader.epoch();
        Self {
            reader,
            cache: RwLock::new(PteCache {
                epoch,
                ..Default::default()
            }),
        }
    }

    pub fn reader(&self) -> &Arc<BeaconReader> {
        &self.reader
    }

    fn lookup(&self, pid: u32, page: u64) -> Option<u64> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        if cache.epoch != self.reader.epoch() {
            return None;
        }
        cache.pages.get(&pid).and_then(|m| m.get(&page)).copied()
    }

    /// Physical address backing `va` in `pid`, or 0 when unknown
    pub fn translate(&self, pid: u32, va: u64) -> u64 {
        let page = va & !PAGE_OFFSET_MASK;
        let offset = va & PAGE_OFFSET_MASK;
        if let Some(pa) = self.lookup(pid, page) {
            return pa + offset;
        }
        self.update_from_beacon();
        self.lookup(pid, page).map(|pa| pa + offset).unwrap_or(0)
    }

    /// Merge both cameras' PTEs from the reader's current snapshot
    pub fn update_from_beacon(&self) {
        let snapshot = self.reader.snapshot();
        let epoch = self.reader.epoch();
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());

        if cache.epoch != epoch {
            debug!("Session changed; dropping {} cached PIDs", cache.pages.len());
            cache.pages.clear();
            cache.merged = None;
            cache.epoch = epoch;
        }

        let Some(snapshot) = snapshot else { return };
        if cache
            .merged
            .as_ref()
            .is_some_and(|m| Arc::ptr_eq(m, &snapshot))
        {
            return;
        }

        for cam in CAMERAS {
            let Some(capture) = snapshot.camera(cam) else {
                continue;
            };
            if capture.target_pid == 0 {
                continue;
            }
            let ptes = capture.pte_map(false);
            if ptes.is_empty() {
                continue;
            }
            let entry = cache.pages.entry(capture.target_pid).or_default();
            for (va, pa) in ptes {
                entry.insert(va & !PAGE_OFFSET_MASK, pa & !PAGE_OFFSET_MASK);
            }
            debug!(
                "Camera {cam}: {} cached pages for PID {}",
                entry.len(),
                capture.target_pid
            );
        }
        cache.merged = Some(snapshot);
    }

    /// Cached page count for `pid`
    pub fn cached_pages(&self, pid: u32) -> usize {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.pages.get(&pid).map(HashMap::len).unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.pages.clear();
        cache.merged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CameraEntry, PteEntry, PteFlags};
    use crate::testutil::{pte, section, ArenaLayout, GuestImage};
    use proptest::prelude::*;

    fn published(target: u32, ptes: &[(u64, u64)]) -> (GuestImage, ArenaLayout) {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 0x55, true);
        let mut entries = vec![CameraEntry::Section(section(target, 0x40_0000, 0x10_000))];
        entries.extend(ptes.iter().map(|(va, pa)| CameraEntry::Pte(pte(*va, *pa))));
        image.publish_camera(&arena, 1, 1, target, entries);
        (image, arena)
    }

    #[test]
    fn test_translate_applies_offset() {
        let (image, _) = published(1, &[(0x40_0000, 0x4000_1000)]);
        let reader = Arc::new(BeaconReader::new(Arc::new(image.backend())));
        assert!(reader.refresh());

        let translator = BeaconTranslator::new(reader);
        assert_eq!(translator.translate(1, 0x40_0123), 0x4000_1123);
        assert_eq!(translator.translate(1, 0x40_1000), 0);
        assert_eq!(translator.translate(2, 0x40_0000), 0);
        assert_eq!(translator.cached_pages(1), 1);
    }

    #[test]
    fn test_fabricated_ptes_ignored() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 0x55, true);
        let fake = PteEntry {
            va: 0x40_0000,
            pa: 0x9000,
            flags: PteFlags(PteFlags::PRESENT | PteFlags::FABRICATED),
        };
        image.publish_camera(&arena, 1, 1, 9, vec![CameraEntry::Pte(fake)]);
        let reader = Arc::new(BeaconReader::new(Arc::new(image.backend())));
        reader.refresh();
        let translator = BeaconTranslator::new(reader);
        assert_eq!(translator.translate(9, 0x40_0000), 0);
    }

    #[test]
    fn test_session_change_clears_cache() {
        let (mut image, _) = published(1, &[(0x40_0000, 0x4000_1000)]);
        let backend = Arc::new(image.backend());
        let reader = Arc::new(BeaconReader::new(backend.clone()));
        reader.refresh();
        let translator = BeaconTranslator::new(reader.clone());
        assert_eq!(translator.translate(1, 0x40_0000), 0x4000_1000);

        // New companion session with no camera data
        image = GuestImage::new(1024);
        image.place_arena(0, 0x66, true);
        image.sync(&backend);
        reader.refresh();
        assert_eq!(translator.translate(1, 0x40_0000), 0);
        assert_eq!(translator.cached_pages(1), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_merge_keeps_other_pids(pages in prop::collection::hash_map(0u64..512, 1u64..0x10000, 1..32)) {
            let (mut image, arena) = published(1, &[(0x40_0000, 0x4000_1000)]);
            let backend = Arc::new(image.backend());
            let reader = Arc::new(BeaconReader::new(backend.clone()));
            reader.refresh();
            let translator = BeaconTranslator::new(reader.clone());
            translator.update_from_beacon();
            let before = translator.translate(1, 0x40_0000);

            let entries = pages
                .iter()
                .map(|(vp, pp)| CameraEntry::Pte(pte(0x7f00_0000_0000 + vp * 4096, pp * 4096)))
                .collect();
            image.publish_camera(&arena, 2, 1, 2, entries);
            image.sync(&backend);
            reader.refresh();
            translator.update_from_beacon();

            prop_assert_eq!(translator.translate(1, 0x40_0000), before);
            prop_assert_eq!(translator.cached_pages(2), pages.len());
        }
    }
}
