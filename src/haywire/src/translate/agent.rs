//! VA to PA translation through the guest agent's pagemap reads

use crate::agent::AgentHandle;
use crate::error::Result;
use crate::pagemap::PagemapEntry;
use crate::protocol::{PAGE_OFFSET_MASK, PAGE_SIZE_U64};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Source of pagemap entries; the agent worker in production
pub trait PagemapSource: Send + Sync {
    fn pagemap(&self, pid: u32, start_va: u64, length: u64) -> Result<Vec<PagemapEntry>>;
}

impl PagemapSource for AgentHandle {
    fn pagemap(&self, pid: u32, start_va: u64, length: u64) -> Result<Vec<PagemapEntry>> {
        self.translate_range(pid, start_va, length)
    }
}

/// Caches mapped pages per PID. Unmapped pages are not cached, since
/// they may fault in later.
pub struct AgentTranslator {
    source: Box<dyn PagemapSource>,
    cache: Mutex<HashMap<u32, HashMap<u64, u64>>>,
}

impl AgentTranslator {
    pub fn new(source: impl PagemapSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, pid: u32, entries: &[PagemapEntry]) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let pages = cache.entry(pid).or_default();
        let mut added = 0;
        for entry in entries.iter().filter(|e| e.is_mapped()) {
            if let Some(frame) = entry.frame_address() {
                pages.insert(entry.va, frame);
                added += 1;
            }
        }
        added
    }

    fn cached(&self, pid: u32, page: u64) -> Option<u64> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&pid).and_then(|m| m.get(&page)).copied()
    }

    /// Physical address backing `va` in `pid`, or 0 when absent or the
    /// agent is unreachable
    pub fn translate(&self, pid: u32, va: u64) -> u64 {
        let page = va & !PAGE_OFFSET_MASK;
        let offset = va & PAGE_OFFSET_MASK;
        if let Some(pa) = self.cached(pid, page) {
            return pa + offset;
        }
        match self.source.pagemap(pid, page, PAGE_SIZE_U64) {
            Ok(entries) => {
                self.insert(pid, &entries);
                self.cached(pid, page).map(|pa| pa + offset).unwrap_or(0)
            }
            Err(e) => {
                debug!("Pagemap lookup for PID {pid} at {va:#x} failed: {e}");
                0
            }
        }
    }

    /// Bulk-load a range; returns the number of mapped pages cached
    pub fn prefetch(&self, pid: u32, start_va: u64, length: u64) -> Result<usize> {
        let entries = self.source.pagemap(pid, start_va, length)?;
        let added = self.insert(pid, &entries);
        debug!("Prefetched {added}/{} pages for PID {pid}", entries.len());
        Ok(added)
    }

    pub fn cached_pages(&self, pid: u32) -> usize {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&pid).map(HashMap::len).unwrap_or(0)
    }

    pub fn clear(&self, pid: Option<u32>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match pid {
            Some(pid) => {
                cache.remove(&pid);
            }
            None => cache.clear(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::HaywireError;
    use crate::pagemap::decode_pagemap;
    use crate::protocol::PAGEMAP_PRESENT;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Pages are present at even page numbers, PFN = page number + 0x100
    pub struct EvenPages {
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl PagemapSource for EvenPages {
        fn pagemap(&self, _pid: u32, start_va: u64, length: u64) -> Result<Vec<PagemapEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HaywireError::AgentUnavailable("down".into()));
            }
            let first = start_va / PAGE_SIZE_U64;
            let count = length.div_ceil(PAGE_SIZE_U64);
            let mut bytes = Vec::new();
            for page in first..first + count {
                let raw = if page % 2 == 0 {
                    PAGEMAP_PRESENT | (page + 0x100)
                } else {
                    0
                };
                bytes.extend_from_slice(&raw.to_le_bytes());
            }
            Ok(decode_pagemap(&bytes, start_va))
        }
    }

    fn translator() -> (AgentTranslator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let t = AgentTranslator::new(EvenPages {
            calls: calls.clone(),
            fail: false,
        });
        (t, calls)
    }

    #[test]
    fn test_translate_and_cache() {
        let (t, calls) = translator();
        assert_eq!(t.translate(5, 0x2010), (0x102 << 12) + 0x10);
        assert_eq!(t.translate(5, 0x2fff), (0x102 << 12) + 0xfff);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absent_not_cached() {
        let (t, calls) = translator();
        assert_eq!(t.translate(5, 0x3000), 0);
        assert_eq!(t.translate(5, 0x3000), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prefetch() {
        let (t, calls) = translator();
        assert_eq!(t.prefetch(5, 0, 16 * 4096).unwrap(), 8);
        assert_eq!(t.translate(5, 0xe000), 0x10e << 12);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        t.clear(Some(5));
        assert_eq!(t.cached_pages(5), 0);
    }

    /// Every page reports present with the widest PFN pagemap can carry
    struct HugeFrames;

    impl PagemapSource for HugeFrames {
        fn pagemap(&self, _pid: u32, start_va: u64, _length: u64) -> Result<Vec<PagemapEntry>> {
            let raw = PAGEMAP_PRESENT | crate::protocol::PAGEMAP_PFN_MASK;
            Ok(decode_pagemap(&raw.to_le_bytes(), start_va))
        }
    }

    #[test]
    fn test_unaddressable_frame_not_cached() {
        let t = AgentTranslator::new(HugeFrames);
        assert_eq!(t.translate(3, 0x4000), 0);
        assert_eq!(t.prefetch(3, 0x4000, 4096).unwrap(), 0);
        assert_eq!(t.cached_pages(3), 0);
    }

    #[test]
    fn test_unavailable_agent_reads_zero() {
        let t = AgentTranslator::new(EvenPages {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: true,
        });
        assert_eq!(t.translate(1, 0x2000), 0);
        assert!(t.prefetch(1, 0, 4096).is_err());
    }
}
