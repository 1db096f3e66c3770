//! Address-space flattening.
//!
//! A process's mapped regions are laid end to end in a dense "flat"
//! coordinate space, so a viewer can scroll through a 47-bit address space
//! without the gaps.

use crate::maps::MapsEntry;
use crate::protocol::SectionEntry;
use serde::Serialize;
use tracing::{debug, warn};

/// Regions starting below this are shown as "Low Memory"
const LOW_MEMORY_LIMIT: u64 = 0x100_0000;

/// An input region in virtual-address space
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VaRegion {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub perms: String,
}

impl VaRegion {
    pub fn new(start: u64, end: u64, name: impl Into<String>) -> Self {
        Self {
            start,
            end,
            name: name.into(),
            perms: String::new(),
        }
    }
}

impl From<&MapsEntry> for VaRegion {
    fn from(entry: &MapsEntry) -> Self {
        Self {
            start: entry.start,
            end: entry.end,
            name: entry.pathname.clone(),
            perms: entry.perms.clone(),
        }
    }
}

impl From<&SectionEntry> for VaRegion {
    fn from(section: &SectionEntry) -> Self {
        Self {
            start: section.start,
            end: section.end,
            name: section.pathname.clone(),
            perms: section.perms.to_string(),
        }
    }
}

/// A region placed in flat space
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatRegion {
    pub va_start: u64,
    pub va_end: u64,
    pub flat_start: u64,
    pub flat_end: u64,
    pub name: String,
    pub perms: String,
}

impl FlatRegion {
    pub fn size(&self) -> u64 {
        self.va_end - self.va_start
    }

    pub fn contains_va(&self, va: u64) -> bool {
        va >= self.va_start && va < self.va_end
    }

    pub fn contains_flat(&self, flat: u64) -> bool {
        flat >= self.flat_start && flat < self.flat_end
    }
}

/// Landmark for quick jumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavHint {
    pub label: &'static str,
    pub flat_offset: u64,
    pub va: u64,
    /// Shown prominently
    pub major: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionStats {
    pub regions: usize,
    /// Bytes actually mapped
    pub mapped: u64,
    /// First region start to last region end
    pub va_span: u64,
    /// `va_span / mapped`; 1.0 for gap-free or empty layouts
    pub ratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Flattener {
    regions: Vec<FlatRegion>,
    flat_size: u64,
}

impl Flattener {
    /// Sort by start address and assign flat offsets. Empty regions are
    /// dropped; a region overlapping an earlier one is skipped.
    pub fn new(regions: impl IntoIterator<Item = VaRegion>) -> Self {
        let mut input: Vec<VaRegion> = regions.into_iter().filter(|r| r.end > r.start).collect();
        input.sort_by_key(|r| r.start);

        let mut placed: Vec<FlatRegion> = Vec::with_capacity(input.len());
        let mut cursor = 0u64;
        for region in input {
            if let Some(prev) = placed.last() {
                if region.start < prev.va_end {
                    warn!(
                        "Skipping region {:#x}-{:#x} {}: overlaps {:#x}-{:#x}",
                        region.start, region.end, region.name, prev.va_start, prev.va_end
                    );
                    continue;
                }
            }
            let size = region.end - region.start;
            placed.push(FlatRegion {
                va_start: region.start,
                va_end: region.end,
                flat_start: cursor,
                flat_end: cursor + size,
                name: region.name,
                perms: region.perms,
            });
            cursor += size;
        }

        let flattener = Self {
            regions: placed,
            flat_size: cursor,
        };
        let stats = flattener.stats();
        debug!(
            "Flattened {} regions: {:#x} bytes mapped, {:.1}:1 compression",
            stats.regions, stats.mapped, stats.ratio
        );
        flattener
    }

    pub fn from_maps(entries: &[MapsEntry]) -> Self {
        Self::new(entries.iter().map(VaRegion::from))
    }

    pub fn from_sections(sections: &[SectionEntry]) -> Self {
        Self::new(sections.iter().map(VaRegion::from))
    }

    pub fn regions(&self) -> &[FlatRegion] {
        &self.regions
    }

    pub fn flat_size(&self) -> u64 {
        self.flat_size
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_at_va(&self, va: u64) -> Option<&FlatRegion> {
        let idx = self.regions.partition_point(|r| r.va_start <= va);
        idx.checked_sub(1)
            .map(|i| &self.regions[i])
            .filter(|r| r.contains_va(va))
    }

    pub fn region_at_flat(&self, flat: u64) -> Option<&FlatRegion> {
        let idx = self.regions.partition_point(|r| r.flat_start <= flat);
        idx.checked_sub(1)
            .map(|i| &self.regions[i])
            .filter(|r| r.contains_flat(flat))
    }

    /// Map a VA into flat space. Addresses in a gap snap to the end of the
    /// region below; before the first region gives 0, past the last gives
    /// `flat_size`.
    pub fn virtual_to_flat(&self, va: u64) -> u64 {
        let idx = self.regions.partition_point(|r| r.va_start <= va);
        match idx.checked_sub(1).map(|i| &self.regions[i]) {
            None => 0,
            Some(r) if r.contains_va(va) => r.flat_start + (va - r.va_start),
            Some(r) => r.flat_end,
        }
    }

    /// Inverse of [`virtual_to_flat`](Self::virtual_to_flat) for
    /// `flat < flat_size`; larger offsets give the last region's end.
    pub fn flat_to_virtual(&self, flat: u64) -> u64 {
        match self.region_at_flat(flat) {
            Some(r) => r.va_start + (flat - r.flat_start),
            None => self.regions.last().map(|r| r.va_end).unwrap_or(0),
        }
    }

    pub fn navigation_hints(&self) -> Vec<NavHint> {
        let mut hints = Vec::new();
        let mut seen_library = false;
        let mut seen_program = false;

        for r in &self.regions {
            let hint = |label, major| NavHint {
                label,
                flat_offset: r.flat_start,
                va: r.va_start,
                major,
            };
            if r.name == "[heap]" {
                hints.push(hint("Heap", true));
            } else if r.name == "[stack]" {
                hints.push(hint("Stack", true));
            } else if r.name.contains("vdso") {
                hints.push(hint("VDSO", false));
            } else if r.va_start < LOW_MEMORY_LIMIT && hints.iter().all(|h| h.label != "Low Memory") {
                hints.push(hint("Low Memory", true));
            } else if r.name.starts_with("/lib") || r.name.contains(".so") {
                if !seen_library {
                    hints.push(hint("Libraries", true));
                    seen_library = true;
                }
            } else if r.name.contains("/bin/") && !seen_program {
                hints.push(hint("Program", true));
                seen_program = true;
            }
        }
        hints
    }

    pub fn stats(&self) -> CompressionStats {
        let va_span = match (self.regions.first(), self.regions.last()) {
            (Some(first), Some(last)) => last.va_end - first.va_start,
            _ => 0,
        };
        let ratio = if self.flat_size == 0 {
            1.0
        } else {
            va_span as f64 / self.flat_size as f64
        };
        CompressionStats {
            regions: self.regions.len(),
            mapped: self.flat_size,
            va_span,
            ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn two_regions() -> Flattener {
        Flattener::new(vec![
            VaRegion::new(0x7fff_0000_0000, 0x7fff_0001_0000, "[stack]"),
            VaRegion::new(0x40_0000, 0x40_1000, "/usr/bin/app"),
        ])
    }

    #[test]
    fn test_compression_scenario() {
        let f = two_regions();
        assert_eq!(f.flat_size(), 0x11000);
        assert_eq!(f.virtual_to_flat(0x7fff_0000_0800), 0x1800);
        assert_eq!(f.flat_to_virtual(0x1000), 0x7fff_0000_0000);
        assert_eq!(f.regions()[0].va_start, 0x40_0000);
        assert_eq!(f.regions()[0].flat_end, f.regions()[1].flat_start);
    }

    #[test]
    fn test_snapping() {
        let f = two_regions();
        assert_eq!(f.virtual_to_flat(0x1000), 0);
        assert_eq!(f.virtual_to_flat(0x50_0000), 0x1000);
        assert_eq!(f.virtual_to_flat(0xffff_ffff_0000), 0x11000);
        assert_eq!(f.flat_to_virtual(0x11000), 0x7fff_0001_0000);
    }

    #[test]
    fn test_overlap_keeps_first() {
        let f = Flattener::new(vec![
            VaRegion::new(0x1000, 0x3000, "a"),
            VaRegion::new(0x2000, 0x4000, "b"),
            VaRegion::new(0x5000, 0x6000, "c"),
            VaRegion::new(0x7000, 0x7000, "empty"),
        ]);
        let names: Vec<_> = f.regions().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
        assert_eq!(f.flat_size(), 0x3000);
    }

    #[test]
    fn test_empty() {
        let f = Flattener::new(Vec::new());
        assert!(f.is_empty());
        assert_eq!(f.virtual_to_flat(0x1234), 0);
        assert_eq!(f.flat_to_virtual(0), 0);
        assert!((f.stats().ratio - 1.0).abs() < f64::EPSILON);
        assert!(f.navigation_hints().is_empty());
    }

    #[test]
    fn test_navigation_hints() {
        let f = Flattener::new(vec![
            VaRegion::new(0x1_0000, 0x1_1000, ""),
            VaRegion::new(0x5555_0000_0000, 0x5555_0000_1000, "/usr/bin/app"),
            VaRegion::new(0x5555_0001_0000, 0x5555_0002_0000, "[heap]"),
            VaRegion::new(0x7f00_0000_0000, 0x7f00_0001_0000, "/usr/lib/libc.so.6"),
            VaRegion::new(0x7f00_0002_0000, 0x7f00_0003_0000, "/usr/lib/libm.so.6"),
            VaRegion::new(0x7ffc_0000_0000, 0x7ffc_0002_0000, "[stack]"),
            VaRegion::new(0x7ffc_0010_0000, 0x7ffc_0010_2000, "[vdso]"),
        ]);
        let labels: Vec<_> = f.navigation_hints().iter().map(|h| h.label).collect();
        assert_eq!(labels, ["Low Memory", "Program", "Heap", "Libraries", "Stack", "VDSO"]);
        let heap = f.navigation_hints()[2].clone();
        assert_eq!(heap.flat_offset, 0x2000);
    }

    #[test]
    fn test_stats() {
        let stats = two_regions().stats();
        assert_eq!(stats.regions, 2);
        assert_eq!(stats.mapped, 0x11000);
        assert_eq!(stats.va_span, 0x7fff_0001_0000 - 0x40_0000);
        assert!(stats.ratio > 1e6);
    }

    fn layout() -> impl Strategy<Value = Vec<VaRegion>> {
        // (gap pages, size pages) pairs laid out upwards, then reversed
        prop::collection::vec((0u64..4096, 1u64..64), 1..24).prop_map(|spans| {
            let mut cursor = 0x1000u64;
            let mut regions: Vec<VaRegion> = spans
                .into_iter()
                .map(|(gap, size)| {
                    let start = cursor + gap * 0x1000;
                    cursor = start + size * 0x1000;
                    VaRegion::new(start, cursor, "")
                })
                .collect();
            regions.reverse();
            regions
        })
    }

    proptest! {
        #[test]
        fn prop_va_round_trip(regions in layout(), pick in any::<prop::sample::Index>(), off in any::<u64>()) {
            let f = Flattener::new(regions);
            let r = &f.regions()[pick.index(f.regions().len())];
            let va = r.va_start + off % r.size();
            prop_assert_eq!(f.flat_to_virtual(f.virtual_to_flat(va)), va);
        }

        #[test]
        fn prop_flat_round_trip(regions in layout(), off in any::<u64>()) {
            let f = Flattener::new(regions);
            let flat = off % f.flat_size();
            prop_assert_eq!(f.virtual_to_flat(f.flat_to_virtual(flat)), flat);
        }

        #[test]
        fn prop_flat_continuity(regions in layout()) {
            let total: u64 = regions.iter().map(|r| r.end - r.start).sum();
            let f = Flattener::new(regions);
            prop_assert_eq!(f.flat_size(), total);
            prop_assert_eq!(f.regions()[0].flat_start, 0);
            for pair in f.regions().windows(2) {
                prop_assert_eq!(pair[0].flat_end, pair[1].flat_start);
                prop_assert!(pair[0].va_end <= pair[1].va_start);
            }
        }
    }
}
