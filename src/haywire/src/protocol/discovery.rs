//! Discovery page (first page of the MASTER category)

use super::constants::*;
use super::page::{write_versioned, Category};
use byteorder::{ByteOrder, LE};

/// Per-category descriptor carried by the discovery page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryDescriptor {
    /// Byte offset of the category's first page from the start of the arena
    pub base_offset: u32,
    pub page_count: u32,
    pub write_index: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPage {
    pub version: u32,
    pub session_id: u32,
    pub timestamp: u32,
    pub categories: [CategoryDescriptor; NUM_CATEGORIES],
}

impl DiscoveryPage {
    /// Discovery page for the default arena layout (categories back to back)
    pub fn with_default_layout(session_id: u32, timestamp: u32) -> Self {
        let mut categories = [CategoryDescriptor::default(); NUM_CATEGORIES];
        let mut offset = 0u32;
        for (desc, count) in categories.iter_mut().zip(DEFAULT_PAGE_COUNTS) {
            desc.base_offset = offset;
            desc.page_count = count;
            offset += count * PAGE_SIZE as u32;
        }
        Self {
            version: 0,
            session_id,
            timestamp,
            categories,
        }
    }

    pub fn descriptor(&self, category: Category) -> &CategoryDescriptor {
        &self.categories[category.index()]
    }

    pub fn descriptor_mut(&mut self, category: Category) -> &mut CategoryDescriptor {
        &mut self.categories[category.index()]
    }

    pub fn page_count(&self, category: Category) -> u32 {
        self.descriptor(category).page_count
    }

    /// Parse a discovery page, returning `None` unless the magic pair,
    /// MASTER category and version pair all check out.
    pub fn parse(page: &[u8]) -> Option<Self> {
        if !is_discovery_candidate(page) {
            return None;
        }
        let version = LE::read_u32(&page[DISC_OFF_VERSION..]);
        if LE::read_u32(&page[OFF_VERSION_BOTTOM..]) != version {
            return None;
        }
        if LE::read_u32(&page[DISC_OFF_CATEGORY..]) != Category::Master.as_u32()
            || LE::read_u32(&page[DISC_OFF_CATEGORY_INDEX..]) != 0
        {
            return None;
        }

        let mut categories = [CategoryDescriptor::default(); NUM_CATEGORIES];
        for (i, desc) in categories.iter_mut().enumerate() {
            let base = DISC_OFF_CATEGORIES + i * DISC_CATEGORY_STRIDE;
            *desc = CategoryDescriptor {
                base_offset: LE::read_u32(&page[base..]),
                page_count: LE::read_u32(&page[base + 4..]),
                write_index: LE::read_u32(&page[base + 8..]),
                sequence: LE::read_u32(&page[base + 12..]),
            };
        }

        Some(Self {
            version,
            session_id: LE::read_u32(&page[DISC_OFF_SESSION_ID..]),
            timestamp: LE::read_u32(&page[DISC_OFF_TIMESTAMP..]),
            categories,
        })
    }

    /// Write the page in tear order: version, body, trailing version
    pub fn write(&self, page: &mut [u8]) {
        write_versioned(page, DISC_OFF_VERSION, self.version, |page| {
            LE::write_u32(&mut page[OFF_MAGIC..], BEACON_MAGIC);
            LE::write_u32(&mut page[DISC_OFF_DISCOVERY_MAGIC..], BEACON_DISCOVERY_MAGIC);
            LE::write_u32(&mut page[DISC_OFF_SESSION_ID..], self.session_id);
            for (i, desc) in self.categories.iter().enumerate() {
                let base = DISC_OFF_CATEGORIES + i * DISC_CATEGORY_STRIDE;
                LE::write_u32(&mut page[base..], desc.base_offset);
                LE::write_u32(&mut page[base + 4..], desc.page_count);
                LE::write_u32(&mut page[base + 8..], desc.write_index);
                LE::write_u32(&mut page[base + 12..], desc.sequence);
            }
            LE::write_u32(&mut page[DISC_OFF_TIMESTAMP..], self.timestamp);
            LE::write_u32(&mut page[DISC_OFF_CATEGORY..], Category::Master.as_u32());
            LE::write_u32(&mut page[DISC_OFF_CATEGORY_INDEX..], 0);
        });
    }

    /// Ordering used when several discovery pages survive in RAM
    pub fn is_newer_than(&self, other: &DiscoveryPage) -> bool {
        (self.timestamp, self.version) > (other.timestamp, other.version)
    }
}

/// Cheap two-word check used by the 4 KiB stride scan
pub fn is_discovery_candidate(page: &[u8]) -> bool {
    page.len() >= PAGE_SIZE
        && LE::read_u32(&page[OFF_MAGIC..]) == BEACON_MAGIC
        && LE::read_u32(&page[DISC_OFF_DISCOVERY_MAGIC..]) == BEACON_DISCOVERY_MAGIC
}
