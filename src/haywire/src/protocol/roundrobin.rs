//! ROUNDROBIN category pages
//!
//! Each detailed process occupies a run of consecutive pages sharing one
//! `sequence`: a process page (kind 1) holding the entry and the first
//! sections, then section continuation pages (kind 2). Section counts are
//! implied by `data_size`.

use super::constants::*;
use super::entries::{ProcessEntry, SectionEntry};
use super::page::{write_page, PageHeader};

/// Sections that fit after the process entry on a process page
pub const RR_FIRST_PAGE_SECTIONS: usize = (PAGE_DATA_SIZE - PROCESS_ENTRY_SIZE) / SECTION_ENTRY_SIZE;

/// Sections that fit on a continuation page
pub const RR_CONTINUATION_SECTIONS: usize = PAGE_DATA_SIZE / SECTION_ENTRY_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundRobinPage {
    Process {
        entry: ProcessEntry,
        sections: Vec<SectionEntry>,
    },
    Sections(Vec<SectionEntry>),
}

impl RoundRobinPage {
    pub fn kind(&self) -> u32 {
        match self {
            RoundRobinPage::Process { .. } => PAGE_KIND_RR_PROCESS,
            RoundRobinPage::Sections(_) => PAGE_KIND_RR_SECTIONS,
        }
    }

    pub fn sections(&self) -> &[SectionEntry] {
        match self {
            RoundRobinPage::Process { sections, .. } => sections,
            RoundRobinPage::Sections(sections) => sections,
        }
    }

    pub fn process(&self) -> Option<&ProcessEntry> {
        match self {
            RoundRobinPage::Process { entry, .. } => Some(entry),
            RoundRobinPage::Sections(_) => None,
        }
    }

    fn data_size(&self) -> usize {
        match self {
            RoundRobinPage::Process { sections, .. } => {
                PROCESS_ENTRY_SIZE + sections.len() * SECTION_ENTRY_SIZE
            }
            RoundRobinPage::Sections(sections) => sections.len() * SECTION_ENTRY_SIZE,
        }
    }

    /// Decode a validated ROUNDROBIN page. Pages of an unknown kind are
    /// treated as process pages when large enough to hold an entry.
    pub fn parse(page: &[u8]) -> Option<Self> {
        let header = PageHeader::parse(page)?;
        let data_size = (header.data_size as usize).min(PAGE_DATA_SIZE);
        let data = &page[OFF_DATA..OFF_DATA + data_size];

        if header.reserved == PAGE_KIND_RR_SECTIONS {
            return Some(RoundRobinPage::Sections(parse_sections(data)));
        }
        if data_size < PROCESS_ENTRY_SIZE {
            return None;
        }
        let entry = ProcessEntry::parse(data)?;
        let sections = parse_sections(&data[PROCESS_ENTRY_SIZE..]);
        Some(RoundRobinPage::Process { entry, sections })
    }

    /// Write the page; `header.reserved` and `data_size` are filled in here
    pub fn write(&self, page: &mut [u8], header: &PageHeader) {
        let mut header = *header;
        header.reserved = self.kind();
        header.data_size = self.data_size() as u32;
        write_page(page, &header, |data| {
            data.fill(0);
            let mut cursor = 0;
            if let RoundRobinPage::Process { entry, .. } = self {
                entry.write(&mut data[..PROCESS_ENTRY_SIZE]);
                cursor = PROCESS_ENTRY_SIZE;
            }
            for section in self.sections() {
                section.write(&mut data[cursor..cursor + SECTION_ENTRY_SIZE]);
                cursor += SECTION_ENTRY_SIZE;
            }
        });
    }
}

fn parse_sections(data: &[u8]) -> Vec<SectionEntry> {
    data.chunks_exact(SECTION_ENTRY_SIZE)
        .filter_map(SectionEntry::parse)
        .collect()
}

/// Split one process and its sections into round-robin pages
pub fn paginate_process(entry: &ProcessEntry, sections: &[SectionEntry]) -> Vec<RoundRobinPage> {
    let first = sections.len().min(RR_FIRST_PAGE_SECTIONS);
    let mut pages = vec![RoundRobinPage::Process {
        entry: entry.clone(),
        sections: sections[..first].to_vec(),
    }];
    pages.extend(
        sections[first..]
            .chunks(RR_CONTINUATION_SECTIONS)
            .map(|chunk| RoundRobinPage::Sections(chunk.to_vec())),
    );
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::page::Category;

    fn section(pid: u32, i: u64) -> SectionEntry {
        SectionEntry {
            pid,
            start: 0x10000 * (i + 1),
            end: 0x10000 * (i + 1) + 0x1000,
            pathname: format!("/lib/{i}.so"),
            ..Default::default()
        }
    }

    #[test]
    fn test_capacities() {
        assert_eq!(RR_FIRST_PAGE_SECTIONS, 12);
        assert_eq!(RR_CONTINUATION_SECTIONS, 13);
    }

    #[test]
    fn test_paginate_spills_into_continuations() {
        let entry = ProcessEntry {
            pid: 9,
            comm: "bash".into(),
            ..Default::default()
        };
        let sections: Vec<_> = (0..30).map(|i| section(9, i)).collect();
        let pages = paginate_process(&entry, &sections);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].sections().len(), 12);
        assert_eq!(pages[1].sections().len(), 13);
        assert_eq!(pages[2].sections().len(), 5);
        assert_eq!(pages[1].kind(), PAGE_KIND_RR_SECTIONS);
    }

    #[test]
    fn test_page_write_parse() {
        let entry = ProcessEntry {
            pid: 3,
            comm: "sshd".into(),
            num_sections: 2,
            ..Default::default()
        };
        let sections = vec![section(3, 0), section(3, 1)];
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = PageHeader::new(1, Category::RoundRobin, 4);
        header.version_top = 2;
        let page = paginate_process(&entry, &sections).remove(0);
        page.write(&mut buf, &header);

        let parsed_header = PageHeader::parse(&buf).unwrap();
        assert_eq!(parsed_header.reserved, PAGE_KIND_RR_PROCESS);
        assert_eq!(
            parsed_header.data_size as usize,
            PROCESS_ENTRY_SIZE + 2 * SECTION_ENTRY_SIZE
        );
        assert_eq!(RoundRobinPage::parse(&buf), Some(page));
    }

    #[test]
    fn test_short_plain_page_is_not_a_process() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = PageHeader::new(1, Category::RoundRobin, 0);
        header.data_size = 100;
        write_page(&mut buf, &header, |_| {});
        assert!(RoundRobinPage::parse(&buf).is_none());
    }
}
