//! Contiguous beacon arena as allocated by the companion: the categories
//! laid out back to back at the offsets the discovery page declares.

use super::camera::{CameraControl, CameraStatus};
use super::constants::*;
use super::discovery::DiscoveryPage;
use super::page::{write_page, Category, PageHeader};

/// Bytes needed for an arena described by `discovery`
pub fn arena_size(discovery: &DiscoveryPage) -> usize {
    discovery
        .categories
        .iter()
        .map(|d| d.base_offset as usize + d.page_count as usize * PAGE_SIZE)
        .max()
        .unwrap_or(0)
}

/// Byte offset of `(category, index)` inside the arena
pub fn page_offset(discovery: &DiscoveryPage, category: Category, index: u32) -> Option<usize> {
    let desc = discovery.descriptor(category);
    (index < desc.page_count).then(|| desc.base_offset as usize + index as usize * PAGE_SIZE)
}

pub fn page_mut<'a>(
    arena: &'a mut [u8],
    discovery: &DiscoveryPage,
    category: Category,
    index: u32,
) -> Option<&'a mut [u8]> {
    let offset = page_offset(discovery, category, index)?;
    arena.get_mut(offset..offset + PAGE_SIZE)
}

pub fn page<'a>(
    arena: &'a [u8],
    discovery: &DiscoveryPage,
    category: Category,
    index: u32,
) -> Option<&'a [u8]> {
    let offset = page_offset(discovery, category, index)?;
    arena.get(offset..offset + PAGE_SIZE)
}

/// Zero every page (forcing physical backing), stamp each with its header
/// and session, install idle camera control pages and finally publish the
/// discovery page.
pub fn initialize_arena(arena: &mut [u8], discovery: &DiscoveryPage) {
    arena.fill(0);
    let session = discovery.session_id;

    for category in Category::ALL {
        if category == Category::Master {
            continue;
        }
        for index in 0..discovery.page_count(category) {
            let Some(page) = page_mut(arena, discovery, category, index) else {
                continue;
            };
            let header = PageHeader::new(session, category, index);
            if category.is_camera() && index == CAMERA_CONTROL_INDEX {
                CameraControl {
                    version: 0,
                    session_id: session,
                    target_pid: 0,
                    status: CameraStatus::Idle,
                    current_pid: 0,
                }
                .write(page, &header);
            } else {
                write_page(page, &header, |_| {});
            }
        }
    }

    if let Some(page) = page_mut(arena, discovery, Category::Master, 0) {
        discovery.write(page);
    }
}
