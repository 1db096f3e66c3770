//! Discovery scan and category index build.

use crate::backend::MemoryBackend;
use crate::error::{HaywireError, Result};
use crate::protocol::*;
use byteorder::{ByteOrder, LE};
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

/// A discovery page and where it lives in the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedDiscovery {
    pub offset: u64,
    pub page: DiscoveryPage,
}

impl LocatedDiscovery {
    pub fn session_id(&self) -> u32 {
        self.page.session_id
    }

}

/// Stride the backend at 4 KiB looking for discovery pages. When stale
/// sessions left several behind, the newest one wins.
pub fn scan_discovery(backend: &MemoryBackend) -> Result<LocatedDiscovery> {
    let mut best: Option<LocatedDiscovery> = None;
    let mut found = 0usize;
    let mut head = [0u8; 8];
    let mut page = vec![0u8; PAGE_SIZE];

    for offset in (0..backend.size().saturating_sub(PAGE_SIZE_U64 - 1)).step_by(PAGE_SIZE) {
        backend.read_at(offset, &mut head)?;
        if LE::read_u32(&head[0..]) != BEACON_MAGIC
            || LE::read_u32(&head[4..]) != BEACON_DISCOVERY_MAGIC
        {
            continue;
        }
        backend.read_at(offset, &mut page)?;
        let Some(parsed) = DiscoveryPage::parse(&page) else {
            debug!("Discovery candidate at {:#x} failed validation", offset);
            continue;
        };
        found += 1;
        let newer = best
            .as_ref()
            .map(|b| parsed.is_newer_than(&b.page))
            .unwrap_or(true);
        if newer {
            best = Some(LocatedDiscovery {
                offset,
                page: parsed,
            });
        }
    }

    match best {
        Some(discovery) => {
            if found > 1 {
                info!(
                    "{} discovery pages present; using session {:#x} at {:#x}",
                    found,
                    discovery.session_id(),
                    discovery.offset
                );
            } else {
                debug!(
                    "Discovery page for session {:#x} at {:#x}",
                    discovery.session_id(),
                    discovery.offset
                );
            }
            Ok(discovery)
        }
        None => Err(HaywireError::DiscoveryMissing),
    }
}

/// Backend offsets of every page of one category, by `category_index`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryOffsets {
    pub offsets: Vec<Option<u64>>,
}

impl CategoryOffsets {
    pub fn expected(&self) -> usize {
        self.offsets.len()
    }

    pub fn found(&self) -> usize {
        self.offsets.iter().filter(|o| o.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.found() == self.expected()
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied().flatten()
    }

    /// True when every page was found and offsets advance by exactly one page
    pub fn is_contiguous(&self) -> bool {
        self.is_complete()
            && self
                .offsets
                .windows(2)
                .all(|w| matches!(w, [Some(a), Some(b)] if *b == a + PAGE_SIZE_U64))
    }

    /// Runs of missing page indices
    pub fn missing_ranges(&self) -> Vec<RangeInclusive<usize>> {
        let mut ranges = Vec::new();
        let mut start = None;
        for (i, offset) in self.offsets.iter().enumerate() {
            match (offset, start) {
                (None, None) => start = Some(i),
                (Some(_), Some(s)) => {
                    ranges.push(s..=i - 1);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push(s..=self.offsets.len() - 1);
        }
        ranges
    }
}

/// Where each category's pages were found in the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryIndex {
    pub session_id: u32,
    pub categories: Vec<CategoryOffsets>,
}

impl CategoryIndex {
    pub fn category(&self, category: Category) -> &CategoryOffsets {
        &self.categories[category.index()]
    }

    pub fn is_complete(&self) -> bool {
        self.categories.iter().all(CategoryOffsets::is_complete)
    }
}

/// Reject discovery pages that declare more pages than any arena can hold
pub fn check_layout(discovery: &DiscoveryPage) -> Result<()> {
    for category in Category::ALL {
        let count = discovery.page_count(category);
        if count > MAX_CATEGORY_PAGES {
            return Err(HaywireError::ProtocolViolation(format!(
                "session {:#x} declares {} {} pages (limit {})",
                discovery.session_id, count, category, MAX_CATEGORY_PAGES
            )));
        }
    }
    Ok(())
}

/// Record the backend offset of every page belonging to the session
pub fn build_index(backend: &MemoryBackend, discovery: &LocatedDiscovery) -> Result<CategoryIndex> {
    check_layout(&discovery.page)?;
    let session = discovery.session_id();
    let mut categories: Vec<CategoryOffsets> = Category::ALL
        .iter()
        .map(|c| CategoryOffsets {
            offsets: vec![None; discovery.page.page_count(*c) as usize],
        })
        .collect();

    let mut head = [0u8; HEADER_SIZE];
    let mut beacons = 0usize;
    let mut foreign = 0usize;
    let mut legacy = 0usize;

    for offset in (0..backend.size().saturating_sub(PAGE_SIZE_U64 - 1)).step_by(PAGE_SIZE) {
        backend.read_at(offset, &mut head)?;
        if LE::read_u32(&head[OFF_MAGIC..]) != BEACON_MAGIC {
            continue;
        }
        beacons += 1;
        let second = LE::read_u32(&head[4..]);
        if second == LEGACY_BEACON_MAGIC2 {
            legacy += 1;
            continue;
        }
        if second == BEACON_DISCOVERY_MAGIC {
            continue;
        }
        let Some(header) = PageHeader::parse(&head) else {
            continue;
        };
        if header.session_id != session {
            foreign += 1;
            continue;
        }
        let Some(category) = header.category() else {
            debug!("Page at {:#x} has invalid category {}", offset, header.category);
            continue;
        };
        if category == Category::Master {
            continue;
        }
        let slots = &mut categories[category.index()].offsets;
        let declared = slots.len();
        match slots.get_mut(header.category_index as usize) {
            Some(slot) if slot.is_none() => *slot = Some(offset),
            Some(Some(existing)) => debug!(
                "Duplicate {} page {} at {:#x} (keeping {:#x})",
                category, header.category_index, offset, existing
            ),
            _ => warn!(
                "{} page index {} exceeds declared count {}",
                category,
                header.category_index,
                declared
            ),
        }
    }

    // The discovery page is MASTER page 0
    if let Some(slot) = categories[Category::Master.index()].offsets.first_mut() {
        *slot = Some(discovery.offset);
    }

    if legacy > 0 {
        warn!("Ignored {} pages in the unsupported legacy beacon format", legacy);
    }
    debug!(
        "Index build: {} beacon pages, {} from other sessions",
        beacons, foreign
    );
    for category in Category::ALL {
        let offsets = &categories[category.index()];
        if offsets.expected() == 0 {
            continue;
        }
        if offsets.is_contiguous() {
            debug!("{}: {} pages, contiguous", category, offsets.expected());
        } else if offsets.is_complete() {
            debug!("{}: {} pages, scattered", category, offsets.expected());
        } else {
            debug!(
                "{}: {}/{} pages found, missing {:?}",
                category,
                offsets.found(),
                offsets.expected(),
                offsets.missing_ranges()
            );
        }
    }

    Ok(CategoryIndex {
        session_id: session,
        categories,
    })
}
