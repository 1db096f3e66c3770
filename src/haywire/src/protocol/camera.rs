//! Camera categories: host-writable control page plus a chain of data
//! pages carrying a typed SECTION/PTE stream for one focused process.

use super::constants::*;
use super::entries::{PteEntry, SectionEntry};
use super::page::{version_bottom, write_page, PageHeader};
use crate::error::{HaywireError, Result};
use byteorder::{ByteOrder, LE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    Idle,
    Switching,
    Active,
}

impl CameraStatus {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => CameraStatus::Switching,
            2 => CameraStatus::Active,
            _ => CameraStatus::Idle,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CameraStatus::Idle => 0,
            CameraStatus::Switching => 1,
            CameraStatus::Active => 2,
        }
    }
}

/// Control block at camera page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraControl {
    pub version: u32,
    pub session_id: u32,
    pub target_pid: u32,
    pub status: CameraStatus,
    pub current_pid: u32,
}

impl CameraControl {
    /// Parse a control page; `None` if the page is torn or is not a
    /// control page (a companion that uses page 0 for data).
    pub fn parse(page: &[u8]) -> Option<Self> {
        let header = PageHeader::parse(page)?;
        if page.len() < PAGE_SIZE
            || header.magic != BEACON_MAGIC
            || header.reserved != PAGE_KIND_CAMERA_CONTROL
            || header.version_top != version_bottom(page)
        {
            return None;
        }
        Some(Self {
            version: header.version_top,
            session_id: header.session_id,
            target_pid: LE::read_u32(&page[CAM_OFF_TARGET_PID..]),
            status: CameraStatus::from_u32(LE::read_u32(&page[CAM_OFF_STATUS..])),
            current_pid: LE::read_u32(&page[CAM_OFF_CURRENT_PID..]),
        })
    }

    pub fn write(&self, page: &mut [u8], header: &PageHeader) {
        let mut header = *header;
        header.version_top = self.version;
        header.session_id = self.session_id;
        header.category_index = CAMERA_CONTROL_INDEX;
        header.reserved = PAGE_KIND_CAMERA_CONTROL;
        header.data_size = 12;
        write_page(page, &header, |data| {
            LE::write_u32(&mut data[CAM_OFF_TARGET_PID - OFF_DATA..], self.target_pid);
            LE::write_u32(&mut data[CAM_OFF_STATUS - OFF_DATA..], self.status.as_u32());
            LE::write_u32(&mut data[CAM_OFF_CURRENT_PID - OFF_DATA..], self.current_pid);
        });
    }
}

/// One record of the camera stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEntry {
    Section(SectionEntry),
    Pte(PteEntry),
    End,
}

impl CameraEntry {
    pub fn encoded_len(&self) -> usize {
        match self {
            CameraEntry::Section(_) => STREAM_SECTION_SIZE,
            CameraEntry::Pte(_) => PTE_ENTRY_SIZE,
            CameraEntry::End => 1,
        }
    }

    fn write(&self, out: &mut [u8]) {
        match self {
            CameraEntry::Section(section) => {
                out[..STREAM_ENTRY_PREFIX].fill(0);
                out[0] = ENTRY_TYPE_SECTION;
                section.write(&mut out[STREAM_ENTRY_PREFIX..STREAM_SECTION_SIZE]);
            }
            CameraEntry::Pte(pte) => pte.write(out),
            CameraEntry::End => out[0] = ENTRY_TYPE_END,
        }
    }
}

/// Decode up to `count` entries (plus a trailing END) from a stream
pub fn decode_stream(stream: &[u8], count: usize) -> Result<Vec<CameraEntry>> {
    let mut entries = Vec::with_capacity(count);
    let mut cursor = 0;
    while cursor < stream.len() {
        let remaining = &stream[cursor..];
        match remaining[0] {
            ENTRY_TYPE_END => {
                entries.push(CameraEntry::End);
                break;
            }
            _ if entries.len() >= count => break,
            ENTRY_TYPE_SECTION => {
                let section = remaining
                    .get(STREAM_ENTRY_PREFIX..STREAM_SECTION_SIZE)
                    .and_then(SectionEntry::parse)
                    .ok_or_else(|| truncated("section", cursor))?;
                entries.push(CameraEntry::Section(section));
                cursor += STREAM_SECTION_SIZE;
            }
            ENTRY_TYPE_PTE => {
                let pte = PteEntry::parse(remaining).ok_or_else(|| truncated("PTE", cursor))?;
                entries.push(CameraEntry::Pte(pte));
                cursor += PTE_ENTRY_SIZE;
            }
            other => {
                return Err(HaywireError::ProtocolViolation(format!(
                    "unknown camera entry type {other:#04x} at stream offset {cursor}"
                )))
            }
        }
    }
    Ok(entries)
}

fn truncated(kind: &str, offset: usize) -> HaywireError {
    HaywireError::ProtocolViolation(format!("truncated {kind} entry at stream offset {offset}"))
}

/// One camera data page
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CameraDataPage {
    pub target_pid: u32,
    pub continuation: bool,
    pub entries: Vec<CameraEntry>,
}

impl CameraDataPage {
    /// Decode a validated data page. Control pages are rejected with `None`.
    pub fn parse(page: &[u8]) -> Result<Option<Self>> {
        let Some(header) = PageHeader::parse(page) else {
            return Ok(None);
        };
        if header.reserved == PAGE_KIND_CAMERA_CONTROL || page.len() < PAGE_SIZE {
            return Ok(None);
        }
        let count = LE::read_u16(&page[CAM_OFF_ENTRY_COUNT..]) as usize;
        let continuation = LE::read_u16(&page[CAM_OFF_CONTINUATION..]) != 0;
        let entries = decode_stream(&page[CAM_OFF_STREAM..OFF_VERSION_BOTTOM], count)?;
        Ok(Some(Self {
            target_pid: LE::read_u32(&page[CAM_OFF_TARGET_PID..]),
            continuation,
            entries,
        }))
    }

    pub fn ends_chain(&self) -> bool {
        !self.continuation || self.entries.last() == Some(&CameraEntry::End)
    }

    fn stream_len(&self) -> usize {
        self.entries.iter().map(CameraEntry::encoded_len).sum()
    }

    /// Write the page; `data_size` is filled in here
    pub fn write(&self, page: &mut [u8], header: &PageHeader) {
        let mut header = *header;
        header.reserved = PAGE_KIND_PLAIN;
        header.data_size = (CAM_OFF_STREAM - OFF_DATA + self.stream_len()) as u32;
        let records = self
            .entries
            .iter()
            .filter(|e| **e != CameraEntry::End)
            .count();
        write_page(page, &header, |data| {
            data.fill(0);
            LE::write_u32(&mut data[CAM_OFF_TARGET_PID - OFF_DATA..], self.target_pid);
            LE::write_u16(&mut data[CAM_OFF_ENTRY_COUNT - OFF_DATA..], records as u16);
            LE::write_u16(
                &mut data[CAM_OFF_CONTINUATION - OFF_DATA..],
                u16::from(self.continuation),
            );
            let mut cursor = CAM_OFF_STREAM - OFF_DATA;
            for entry in &self.entries {
                let len = entry.encoded_len();
                entry.write(&mut data[cursor..cursor + len]);
                cursor += len;
            }
        });
    }
}

/// Pack a capture into at most `max_pages` data pages. The final page
/// always ends with END; entries that do not fit are dropped.
pub fn paginate_camera(
    target_pid: u32,
    entries: impl IntoIterator<Item = CameraEntry>,
    max_pages: usize,
) -> (Vec<CameraDataPage>, usize) {
    // Every page keeps one byte spare so END always fits
    let capacity = CAMERA_STREAM_CAPACITY - 1;
    let mut pages = Vec::new();
    let mut current = CameraDataPage {
        target_pid,
        ..Default::default()
    };
    let mut used = 0;
    let mut dropped = 0;

    if max_pages == 0 {
        return (pages, entries.into_iter().count());
    }

    for entry in entries {
        if entry == CameraEntry::End {
            continue;
        }
        let len = entry.encoded_len();
        if used + len > capacity {
            if pages.len() + 1 >= max_pages {
                dropped += 1;
                continue;
            }
            current.continuation = true;
            pages.push(std::mem::replace(
                &mut current,
                CameraDataPage {
                    target_pid,
                    ..Default::default()
                },
            ));
            used = 0;
        }
        current.entries.push(entry);
        used += len;
    }

    current.entries.push(CameraEntry::End);
    current.continuation = false;
    pages.push(current);
    (pages, dropped)
}
