//! PID list pages and generation assembly

use super::constants::*;
use super::page::{write_page, PageHeader};
use byteorder::{ByteOrder, LE};
use std::collections::BTreeMap;

/// Body of one PID list page
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PidListPage {
    pub generation: u32,
    pub total_pids: u32,
    pub page_number: u32,
    pub pids: Vec<u32>,
}

impl PidListPage {
    /// Parse the body of a validated PID page
    pub fn parse(page: &[u8]) -> Option<Self> {
        if page.len() < PAGE_SIZE {
            return None;
        }
        let count = LE::read_u32(&page[PID_OFF_PIDS_IN_PAGE..]) as usize;
        if count > MAX_PIDS_PER_PAGE {
            return None;
        }
        let pids = (0..count)
            .map(|i| LE::read_u32(&page[PID_OFF_PIDS + i * 4..]))
            .collect();
        Some(Self {
            generation: LE::read_u32(&page[PID_OFF_GENERATION..]),
            total_pids: LE::read_u32(&page[PID_OFF_TOTAL_PIDS..]),
            page_number: LE::read_u32(&page[PID_OFF_PAGE_NUMBER..]),
            pids,
        })
    }

    pub fn write(&self, page: &mut [u8], header: &PageHeader) {
        let mut header = *header;
        header.data_size = (16 + self.pids.len() * 4) as u32;
        write_page(page, &header, |data| {
            let base = OFF_DATA;
            LE::write_u32(&mut data[PID_OFF_GENERATION - base..], self.generation);
            LE::write_u32(&mut data[PID_OFF_TOTAL_PIDS - base..], self.total_pids);
            LE::write_u32(&mut data[PID_OFF_PAGE_NUMBER - base..], self.page_number);
            LE::write_u32(
                &mut data[PID_OFF_PIDS_IN_PAGE - base..],
                self.pids.len() as u32,
            );
            for (i, pid) in self.pids.iter().enumerate() {
                LE::write_u32(&mut data[PID_OFF_PIDS - base + i * 4..], *pid);
            }
        });
    }
}

/// Split a PID snapshot into pages for one generation
pub fn paginate_pids(pids: &[u32], generation: u32) -> Vec<PidListPage> {
    let total = pids.len() as u32;
    if pids.is_empty() {
        return vec![PidListPage {
            generation,
            total_pids: 0,
            page_number: 0,
            pids: Vec::new(),
        }];
    }
    pids.chunks(MAX_PIDS_PER_PAGE)
        .enumerate()
        .map(|(i, chunk)| PidListPage {
            generation,
            total_pids: total,
            page_number: i as u32,
            pids: chunk.to_vec(),
        })
        .collect()
}

/// All pages seen for one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidGeneration {
    pub generation: u32,
    pub total_pids: u32,
    pub pages: usize,
    pub pids: Vec<u32>,
}

impl PidGeneration {
    pub fn is_complete(&self) -> bool {
        self.pids.len() as u32 == self.total_pids
    }
}

/// Group pages by generation, newest first. Pages repeating a page number
/// within a generation are ignored after the first.
pub fn assemble_generations<I>(pages: I) -> Vec<PidGeneration>
where
    I: IntoIterator<Item = PidListPage>,
{
    let mut grouped: BTreeMap<u32, BTreeMap<u32, PidListPage>> = BTreeMap::new();
    for page in pages {
        grouped
            .entry(page.generation)
            .or_default()
            .entry(page.page_number)
            .or_insert(page);
    }

    grouped
        .into_iter()
        .rev()
        .map(|(generation, pages)| {
            let total_pids = pages.values().map(|p| p.total_pids).max().unwrap_or(0);
            let count = pages.len();
            let pids = pages.into_values().flat_map(|p| p.pids).collect();
            PidGeneration {
                generation,
                total_pids,
                pages: count,
                pids,
            }
        })
        .collect()
}

/// Newest complete generation, else the newest partial one
pub fn select_pid_list(generations: &[PidGeneration]) -> Vec<u32> {
    generations
        .iter()
        .find(|g| g.is_complete())
        .or_else(|| generations.first())
        .map(|g| g.pids.clone())
        .unwrap_or_default()
}
