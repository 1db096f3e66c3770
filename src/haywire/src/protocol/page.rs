//! Generic beacon page header, categories and tear-detection discipline.

use super::constants::*;
use byteorder::{ByteOrder, LE};
use std::fmt;
use std::sync::atomic::{fence, Ordering};

/// Beacon category (each a contiguous run of pages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Master,
    RoundRobin,
    Pid,
    Camera1,
    Camera2,
}

impl Category {
    pub const ALL: [Category; NUM_CATEGORIES] = [
        Category::Master,
        Category::RoundRobin,
        Category::Pid,
        Category::Camera1,
        Category::Camera2,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn default_page_count(self) -> u32 {
        DEFAULT_PAGE_COUNTS[self.index()]
    }

    /// Camera category for a 1-based camera id
    pub fn camera(id: u8) -> Option<Self> {
        match id {
            1 => Some(Category::Camera1),
            2 => Some(Category::Camera2),
            _ => None,
        }
    }

    pub fn is_camera(self) -> bool {
        matches!(self, Category::Camera1 | Category::Camera2)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Master => "MASTER",
            Category::RoundRobin => "ROUNDROBIN",
            Category::Pid => "PID",
            Category::Camera1 => "CAMERA1",
            Category::Camera2 => "CAMERA2",
        };
        f.write_str(name)
    }
}

/// Header present at the start of every non-discovery beacon page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    pub magic: u32,
    pub version_top: u32,
    pub session_id: u32,
    pub category: u32,
    pub category_index: u32,
    pub sequence: u32,
    pub data_size: u32,
    /// Page kind (see `PAGE_KIND_*`)
    pub reserved: u32,
}

impl PageHeader {
    pub fn new(session_id: u32, category: Category, category_index: u32) -> Self {
        Self {
            magic: BEACON_MAGIC,
            version_top: 0,
            session_id,
            category: category.as_u32(),
            category_index,
            sequence: 0,
            data_size: 0,
            reserved: PAGE_KIND_PLAIN,
        }
    }

    /// Parse the header from the first 32 bytes of a page
    pub fn parse(page: &[u8]) -> Option<Self> {
        if page.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: LE::read_u32(&page[OFF_MAGIC..]),
            version_top: LE::read_u32(&page[OFF_VERSION_TOP..]),
            session_id: LE::read_u32(&page[OFF_SESSION_ID..]),
            category: LE::read_u32(&page[OFF_CATEGORY..]),
            category_index: LE::read_u32(&page[OFF_CATEGORY_INDEX..]),
            sequence: LE::read_u32(&page[OFF_SEQUENCE..]),
            data_size: LE::read_u32(&page[OFF_DATA_SIZE..]),
            reserved: LE::read_u32(&page[OFF_RESERVED..]),
        })
    }

    /// Write every header word except the version
    fn write_body_fields(&self, page: &mut [u8]) {
        LE::write_u32(&mut page[OFF_MAGIC..], self.magic);
        LE::write_u32(&mut page[OFF_SESSION_ID..], self.session_id);
        LE::write_u32(&mut page[OFF_CATEGORY..], self.category);
        LE::write_u32(&mut page[OFF_CATEGORY_INDEX..], self.category_index);
        LE::write_u32(&mut page[OFF_SEQUENCE..], self.sequence);
        LE::write_u32(&mut page[OFF_DATA_SIZE..], self.data_size);
        LE::write_u32(&mut page[OFF_RESERVED..], self.reserved);
    }

    pub fn category(&self) -> Option<Category> {
        Category::from_u32(self.category)
    }
}

/// Outcome of validating one beacon page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Valid,
    BadMagic,
    Legacy,
    Torn { top: u32, bottom: u32 },
    WrongCategory { found: u32 },
    WrongSession { found: u32 },
    TooShort,
}

impl PageStatus {
    pub fn is_valid(self) -> bool {
        self == PageStatus::Valid
    }
}

pub fn version_bottom(page: &[u8]) -> u32 {
    LE::read_u32(&page[OFF_VERSION_BOTTOM..])
}

/// Deprecated two-magic beacon format
pub fn is_legacy_page(page: &[u8]) -> bool {
    page.len() >= 8
        && LE::read_u32(&page[0..]) == BEACON_MAGIC
        && LE::read_u32(&page[4..]) == LEGACY_BEACON_MAGIC2
}

/// Validate magic, version pair, category and (optionally) session
pub fn validate_page(page: &[u8], expected: Category, session_id: Option<u32>) -> PageStatus {
    if page.len() < PAGE_SIZE {
        return PageStatus::TooShort;
    }
    if is_legacy_page(page) {
        return PageStatus::Legacy;
    }
    let Some(header) = PageHeader::parse(page) else {
        return PageStatus::TooShort;
    };
    if header.magic != BEACON_MAGIC {
        return PageStatus::BadMagic;
    }
    let bottom = version_bottom(page);
    if header.version_top != bottom {
        return PageStatus::Torn {
            top: header.version_top,
            bottom,
        };
    }
    if header.category != expected.as_u32() {
        return PageStatus::WrongCategory {
            found: header.category,
        };
    }
    if let Some(session) = session_id {
        if header.session_id != session {
            return PageStatus::WrongSession {
                found: header.session_id,
            };
        }
    }
    PageStatus::Valid
}

/// Store a version word so it is not merged or elided by the compiler
fn store_version(page: &mut [u8], offset: usize, version: u32) {
    let bytes = version.to_le_bytes();
    let dst = page[offset..offset + 4].as_mut_ptr();
    for (i, b) in bytes.iter().enumerate() {
        // SAFETY: dst..dst+4 lies inside the bounds-checked slice above.
        unsafe { std::ptr::write_volatile(dst.add(i), *b) };
    }
}

/// Publish a page: `version_top` first, header and body next,
/// `version_bottom` last. `fill` writes the data area (bytes 32..4092).
pub fn write_page<F>(page: &mut [u8], header: &PageHeader, fill: F)
where
    F: FnOnce(&mut [u8]),
{
    write_versioned(page, OFF_VERSION_TOP, header.version_top, |page| {
        header.write_body_fields(page);
        fill(&mut page[OFF_DATA..OFF_VERSION_BOTTOM]);
    });
}

/// Tear-disciplined write with an arbitrary top-version offset
pub fn write_versioned<F>(page: &mut [u8], top_offset: usize, version: u32, body: F)
where
    F: FnOnce(&mut [u8]),
{
    assert!(page.len() >= PAGE_SIZE, "beacon page must be {PAGE_SIZE} bytes");
    store_version(page, top_offset, version);
    fence(Ordering::Release);
    body(page);
    fence(Ordering::Release);
    store_version(page, OFF_VERSION_BOTTOM, version);
}

/// Read a NUL-terminated string from a fixed-width field
pub fn read_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Write `s` into a fixed-width field, truncated and NUL terminated
pub fn write_cstr(out: &mut [u8], s: &str) {
    out.fill(0);
    if out.is_empty() {
        return;
    }
    let max = out.len() - 1;
    let mut len = s.len().min(max);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
}
