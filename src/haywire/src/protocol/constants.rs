//! Beacon protocol constants
//!
//! Page geometry, magic numbers and field offsets shared by the in-guest
//! companion and the host-side reader. Every value here is part of the wire
//! format; changing one breaks compatibility with running companions.

/// Size of every beacon page
pub const PAGE_SIZE: usize = 4096;

/// Page size as u64 for address arithmetic
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Mask selecting the in-page offset of an address
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Identifies any beacon page (first word)
pub const BEACON_MAGIC: u32 = 0x3142_FACE;

/// Second word of the discovery page ("HayD" little-endian)
pub const BEACON_DISCOVERY_MAGIC: u32 = 0x4479_6148;

/// Second word of deprecated 64-byte-header beacons; never accepted
pub const LEGACY_BEACON_MAGIC2: u32 = 0xCAFE_BABE;

/// Protocol revision written into the discovery page
pub const PROTOCOL_VERSION: u32 = 2;

// Generic page header offsets
pub const OFF_MAGIC: usize = 0;
pub const OFF_VERSION_TOP: usize = 4;
pub const OFF_SESSION_ID: usize = 8;
pub const OFF_CATEGORY: usize = 12;
pub const OFF_CATEGORY_INDEX: usize = 16;
pub const OFF_SEQUENCE: usize = 20;
pub const OFF_DATA_SIZE: usize = 24;
pub const OFF_RESERVED: usize = 28;
pub const OFF_DATA: usize = 32;
pub const OFF_VERSION_BOTTOM: usize = PAGE_SIZE - 4;

/// Header size in bytes
pub const HEADER_SIZE: usize = OFF_DATA;

/// Bytes of payload in a generic beacon page (4096 - 32 - 4)
pub const PAGE_DATA_SIZE: usize = OFF_VERSION_BOTTOM - OFF_DATA;

// Discovery page offsets
pub const DISC_OFF_DISCOVERY_MAGIC: usize = 4;
pub const DISC_OFF_VERSION: usize = 8;
pub const DISC_OFF_SESSION_ID: usize = 12;
pub const DISC_OFF_CATEGORIES: usize = 16;
pub const DISC_CATEGORY_STRIDE: usize = 16;
pub const DISC_OFF_TIMESTAMP: usize = DISC_OFF_CATEGORIES + NUM_CATEGORIES * DISC_CATEGORY_STRIDE;
pub const DISC_OFF_CATEGORY: usize = DISC_OFF_TIMESTAMP + 4;
pub const DISC_OFF_CATEGORY_INDEX: usize = DISC_OFF_CATEGORY + 4;

/// Page kinds stored in the header's reserved word
pub const PAGE_KIND_PLAIN: u32 = 0;
pub const PAGE_KIND_RR_PROCESS: u32 = 1;
pub const PAGE_KIND_RR_SECTIONS: u32 = 2;
/// "CTRL" little-endian; marks a camera control page
pub const PAGE_KIND_CAMERA_CONTROL: u32 = 0x4C52_5443;

/// Number of categories
pub const NUM_CATEGORIES: usize = 5;

/// Default pages per category: MASTER, ROUNDROBIN, PID, CAMERA1, CAMERA2
pub const DEFAULT_PAGE_COUNTS: [u32; NUM_CATEGORIES] = [1, 500, 32, 200, 200];

/// Largest page count a discovery page may declare for one category
pub const MAX_CATEGORY_PAGES: u32 = 10_000;

/// Total pages in a default beacon arena
pub const TOTAL_BEACON_PAGES: usize = 1 + 500 + 32 + 200 + 200;

// PID list page
pub const PID_OFF_GENERATION: usize = OFF_DATA;
pub const PID_OFF_TOTAL_PIDS: usize = OFF_DATA + 4;
pub const PID_OFF_PAGE_NUMBER: usize = OFF_DATA + 8;
pub const PID_OFF_PIDS_IN_PAGE: usize = OFF_DATA + 12;
pub const PID_OFF_PIDS: usize = OFF_DATA + 16;

/// PIDs that fit in one PID list page
pub const MAX_PIDS_PER_PAGE: usize = (OFF_VERSION_BOTTOM - PID_OFF_PIDS) / 4;

// Camera pages
pub const CAM_OFF_TARGET_PID: usize = OFF_DATA;
pub const CAM_OFF_STATUS: usize = OFF_DATA + 4;
pub const CAM_OFF_CURRENT_PID: usize = OFF_DATA + 8;
pub const CAM_OFF_ENTRY_COUNT: usize = OFF_DATA + 4;
pub const CAM_OFF_CONTINUATION: usize = OFF_DATA + 6;
pub const CAM_OFF_STREAM: usize = OFF_DATA + 8;

/// Bytes available for typed entries in one camera data page
pub const CAMERA_STREAM_CAPACITY: usize = OFF_VERSION_BOTTOM - CAM_OFF_STREAM;

/// Camera category page holding the control block
pub const CAMERA_CONTROL_INDEX: u32 = 0;

// Camera stream entry discriminators
pub const ENTRY_TYPE_SECTION: u8 = 0x01;
pub const ENTRY_TYPE_PTE: u8 = 0x02;
pub const ENTRY_TYPE_END: u8 = 0xFF;

/// Leading type byte plus reserved padding before a stream entry body
pub const STREAM_ENTRY_PREFIX: usize = 8;

// Fixed record sizes
pub const PROCESS_ENTRY_SIZE: usize = 336;
pub const SECTION_ENTRY_SIZE: usize = 304;
pub const PTE_ENTRY_SIZE: usize = 32;
pub const STREAM_SECTION_SIZE: usize = STREAM_ENTRY_PREFIX + SECTION_ENTRY_SIZE;

/// Kernel TASK_COMM_LEN
pub const PROCESS_NAME_LEN: usize = 16;

/// Stored path length (truncated, NUL terminated)
pub const PATH_MAX_STORED: usize = 256;

/// Processes the companion details per round-robin cycle
pub const PIDS_PER_BATCH: usize = 5;

// /proc/<pid>/pagemap entry bits
pub const PAGEMAP_ENTRY_SIZE: u64 = 8;
pub const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;
pub const PAGEMAP_SOFT_DIRTY: u64 = 1 << 55;
pub const PAGEMAP_EXCLUSIVE: u64 = 1 << 56;
pub const PAGEMAP_SWAPPED: u64 = 1 << 62;
pub const PAGEMAP_PRESENT: u64 = 1 << 63;

/// Name of the POSIX shared-memory object used in single-shot mode
pub const SHM_NAME: &str = "/haywire_beacon";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_geometry() {
        assert_eq!(HEADER_SIZE + PAGE_DATA_SIZE + 4, PAGE_SIZE);
        assert_eq!(PAGE_DATA_SIZE, 4060);
        assert_eq!(MAX_PIDS_PER_PAGE, 1011);
        assert_eq!(CAMERA_STREAM_CAPACITY, 4052);
    }

    #[test]
    fn test_discovery_magic_is_hayd() {
        assert_eq!(&BEACON_DISCOVERY_MAGIC.to_le_bytes(), b"HayD");
    }

    #[test]
    fn test_discovery_trailer_inside_padding() {
        assert_eq!(DISC_OFF_TIMESTAMP, 96);
        assert_eq!(DISC_OFF_CATEGORY_INDEX, 104);
    }

    #[test]
    fn test_total_pages_matches_defaults() {
        let sum: u32 = DEFAULT_PAGE_COUNTS.iter().sum();
        assert_eq!(sum as usize, TOTAL_BEACON_PAGES);
    }
}
