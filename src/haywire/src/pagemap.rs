//! `/proc/<pid>/pagemap` entry decoding

use crate::protocol::{
    PteEntry, PteFlags, PAGEMAP_PFN_MASK, PAGEMAP_PRESENT, PAGEMAP_SWAPPED, PAGE_OFFSET_MASK,
    PAGE_SIZE_U64,
};
use byteorder::{ByteOrder, LE};
use serde::Serialize;

/// One decoded pagemap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PagemapEntry {
    /// Virtual address this entry describes (page-aligned)
    pub va: u64,
    pub raw: u64,
    pub present: bool,
    pub swapped: bool,
    pub pfn: u64,
    /// `pfn * 4096 + (va & 0xFFF)` when present with an addressable
    /// frame, else 0
    pub phys_addr: u64,
}

impl PagemapEntry {
    pub fn decode(raw: u64, va: u64) -> Self {
        let present = raw & PAGEMAP_PRESENT != 0;
        let swapped = raw & PAGEMAP_SWAPPED != 0;
        let pfn = raw & PAGEMAP_PFN_MASK;
        let phys_addr = match pfn.checked_mul(PAGE_SIZE_U64) {
            Some(frame) if present => frame | (va & PAGE_OFFSET_MASK),
            _ => 0,
        };
        Self {
            va,
            raw,
            present,
            swapped,
            pfn,
            phys_addr,
        }
    }

    /// Physical address of the frame, `None` when the PFN does not fit
    /// a 64-bit address
    pub fn frame_address(&self) -> Option<u64> {
        self.pfn.checked_mul(PAGE_SIZE_U64)
    }

    /// Present with a usable frame number (unprivileged readers see PFN 0)
    pub fn is_mapped(&self) -> bool {
        self.present && self.pfn != 0 && self.frame_address().is_some()
    }

    pub fn to_pte(&self) -> PteEntry {
        PteEntry {
            va: self.va,
            pa: self.frame_address().unwrap_or(0),
            flags: PteFlags::from_pagemap(self.raw),
        }
    }
}

/// Decode consecutive 8-byte little-endian entries starting at `start_va`
pub fn decode_pagemap(bytes: &[u8], start_va: u64) -> Vec<PagemapEntry> {
    let base = start_va & !PAGE_OFFSET_MASK;
    bytes
        .chunks_exact(8)
        .enumerate()
        .map(|(i, chunk)| {
            let va = base.wrapping_add(i as u64 * PAGE_SIZE_U64);
            PagemapEntry::decode(LE::read_u64(chunk), va)
        })
        .collect()
}
