//! Reading process state out of `/proc`.
//!
//! Processes may exit between any two reads; every accessor returns
//! `None` for a vanished process rather than an error.

use haywire::maps::parse_maps;
use haywire::pagemap::decode_pagemap;
use haywire::protocol::{
    ProcessEntry, PteEntry, PteFlags, SectionEntry, PAGEMAP_ENTRY_SIZE, PAGE_SIZE_U64,
};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Pages read from pagemap per syscall
const PAGEMAP_READ_PAGES: u64 = 1024;

/// Synthetic PTEs emitted per section when pagemap is unreadable
pub const FABRICATED_PER_SECTION: u64 = 3;

/// Physical base used for synthetic PTEs
const FABRICATED_PA_BASE: u64 = 0x4000_0000;

/// Outcome of reading one section's page table entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PteRead {
    /// Present pages with real frame numbers
    Mapped(Vec<PteEntry>),
    /// Pagemap could not be opened, or hid frame numbers
    Unavailable,
}

/// Fields of `/proc/<pid>/stat` the beacon carries
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub state: u8,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub nice: i8,
    pub num_threads: u16,
    pub start_time: u64,
    pub vsize: u64,
    pub rss: u64,
}

impl ProcStat {
    /// Parse a stat line. `comm` may contain spaces and parentheses, so
    /// it runs to the last `)`.
    pub fn parse(line: &str) -> Option<Self> {
        let open = line.find('(')?;
        let close = line.rfind(')')?;
        let pid = line[..open].trim().parse().ok()?;
        let comm = line.get(open + 1..close)?.to_string();
        let rest: Vec<&str> = line[close + 1..].split_whitespace().collect();
        let field = |i: usize| rest.get(i).and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);

        Some(Self {
            pid,
            comm,
            state: rest.first().and_then(|s| s.bytes().next()).unwrap_or(b'?'),
            ppid: field(1) as u32,
            utime: field(11) as u64,
            stime: field(12) as u64,
            nice: field(16) as i8,
            num_threads: field(17) as u16,
            start_time: field(19) as u64,
            vsize: field(20) as u64,
            rss: field(21) as u64,
        })
    }
}

/// Real uid and gid from `/proc/<pid>/status`
fn parse_ids(status: &str) -> (u32, u32) {
    let first = |key: &str| {
        status
            .lines()
            .find_map(|l| l.strip_prefix(key))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    (first("Uid:"), first("Gid:"))
}

/// A `/proc` tree; tests point it at a scratch directory
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, pid: u32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    /// Numeric entries of the root, ascending
    pub fn pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn stat(&self, pid: u32) -> Option<ProcStat> {
        let line = fs::read_to_string(self.path(pid, "stat")).ok()?;
        ProcStat::parse(&line)
    }

    /// Process entry; `num_sections` is left for the caller to fill
    pub fn process(&self, pid: u32) -> Option<ProcessEntry> {
        let stat = self.stat(pid)?;
        let (uid, gid) = fs::read_to_string(self.path(pid, "status"))
            .map(|s| parse_ids(&s))
            .unwrap_or((0, 0));
        let exe_path = fs::read_link(self.path(pid, "exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        Some(ProcessEntry {
            pid: stat.pid,
            ppid: stat.ppid,
            uid,
            gid,
            comm: stat.comm,
            state: stat.state,
            nice: stat.nice,
            num_threads: stat.num_threads,
            vsize: stat.vsize,
            rss: stat.rss,
            start_time: stat.start_time,
            utime: stat.utime,
            stime: stat.stime,
            num_sections: 0,
            exe_path,
        })
    }

    pub fn sections(&self, pid: u32) -> Option<Vec<SectionEntry>> {
        let text = fs::read_to_string(self.path(pid, "maps")).ok()?;
        Some(parse_maps(&text).iter().map(|m| m.to_section(pid)).collect())
    }

    /// Present PTEs of `[start, end)`, at most `limit` of them
    pub fn ptes(&self, pid: u32, start: u64, end: u64, limit: usize) -> PteRead {
        let Ok(mut file) = File::open(self.path(pid, "pagemap")) else {
            return PteRead::Unavailable;
        };
        read_ptes(&mut file, start, end, limit)
    }
}

fn read_ptes(file: &mut File, start: u64, end: u64, limit: usize) -> PteRead {
    let mut ptes = Vec::new();
    let mut hidden = false;
    let mut page = start / PAGE_SIZE_U64;
    let last = end.div_ceil(PAGE_SIZE_U64);
    let mut buf = vec![0u8; (PAGEMAP_READ_PAGES * PAGEMAP_ENTRY_SIZE) as usize];

    while page < last && ptes.len() < limit {
        let count = (last - page).min(PAGEMAP_READ_PAGES);
        let bytes = &mut buf[..(count * PAGEMAP_ENTRY_SIZE) as usize];
        if file.seek(SeekFrom::Start(page * PAGEMAP_ENTRY_SIZE)).is_err() {
            break;
        }
        let read = read_full(file, bytes);
        if read == 0 {
            break;
        }
        for entry in decode_pagemap(&bytes[..read], page * PAGE_SIZE_U64) {
            if entry.is_mapped() {
                ptes.push(entry.to_pte());
            } else if entry.present {
                hidden = true;
            }
        }
        page += count;
    }

    ptes.truncate(limit);
    if ptes.is_empty() && hidden {
        PteRead::Unavailable
    } else {
        PteRead::Mapped(ptes)
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> usize {
    let mut done = 0;
    while done < buf.len() {
        match file.read(&mut buf[done..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => done += n,
        }
    }
    done - done % PAGEMAP_ENTRY_SIZE as usize
}

/// Stand-in PTEs for the first pages of a section, flagged so the host
/// never trusts them for translation
pub fn fabricate_ptes(section: &SectionEntry) -> Vec<PteEntry> {
    (0..FABRICATED_PER_SECTION)
        .map(|i| section.start + i * PAGE_SIZE_U64)
        .take_while(|va| *va < section.end)
        .map(|va| PteEntry {
            va,
            pa: FABRICATED_PA_BASE + (va & 0xFFFF_F000),
            flags: PteFlags(PteFlags::PRESENT | PteFlags::FABRICATED),
        })
        .collect()
}
