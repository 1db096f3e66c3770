//! Fixed-layout process, section and PTE records

use super::constants::*;
use super::page::{read_cstr, write_cstr};
use byteorder::{ByteOrder, LE};
use serde::Serialize;
use std::fmt;

/// One process as published by the companion (336 bytes on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    /// Single-letter state from `/proc/<pid>/stat`
    pub state: u8,
    pub nice: i8,
    pub num_threads: u16,
    pub vsize: u64,
    pub rss: u64,
    pub start_time: u64,
    pub utime: u64,
    pub stime: u64,
    pub num_sections: u32,
    pub exe_path: String,
}

impl ProcessEntry {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROCESS_ENTRY_SIZE {
            return None;
        }
        Some(Self {
            pid: LE::read_u32(&buf[0..]),
            ppid: LE::read_u32(&buf[4..]),
            uid: LE::read_u32(&buf[8..]),
            gid: LE::read_u32(&buf[12..]),
            comm: read_cstr(&buf[16..16 + PROCESS_NAME_LEN]),
            state: buf[32],
            nice: buf[33] as i8,
            num_threads: LE::read_u16(&buf[34..]),
            vsize: LE::read_u64(&buf[36..]),
            rss: LE::read_u64(&buf[44..]),
            start_time: LE::read_u64(&buf[52..]),
            utime: LE::read_u64(&buf[60..]),
            stime: LE::read_u64(&buf[68..]),
            num_sections: LE::read_u32(&buf[76..]),
            exe_path: read_cstr(&buf[80..80 + PATH_MAX_STORED]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let out = &mut out[..PROCESS_ENTRY_SIZE];
        LE::write_u32(&mut out[0..], self.pid);
        LE::write_u32(&mut out[4..], self.ppid);
        LE::write_u32(&mut out[8..], self.uid);
        LE::write_u32(&mut out[12..], self.gid);
        write_cstr(&mut out[16..16 + PROCESS_NAME_LEN], &self.comm);
        out[32] = self.state;
        out[33] = self.nice as u8;
        LE::write_u16(&mut out[34..], self.num_threads);
        LE::write_u64(&mut out[36..], self.vsize);
        LE::write_u64(&mut out[44..], self.rss);
        LE::write_u64(&mut out[52..], self.start_time);
        LE::write_u64(&mut out[60..], self.utime);
        LE::write_u64(&mut out[68..], self.stime);
        LE::write_u32(&mut out[76..], self.num_sections);
        write_cstr(&mut out[80..80 + PATH_MAX_STORED], &self.exe_path);
    }

    pub fn name(&self) -> &str {
        &self.comm
    }

    pub fn state_char(&self) -> char {
        if self.state.is_ascii_graphic() {
            self.state as char
        } else {
            '?'
        }
    }
}

/// Permission bits of a mapped section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
pub struct SectionPerms(pub u32);

impl SectionPerms {
    pub const EXEC: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const READ: u32 = 0x4;
    pub const PRIVATE: u32 = 0x8;
    pub const SHARED: u32 = 0x10;

    /// Parse the `rwxp` column of `/proc/<pid>/maps`
    pub fn from_maps(perms: &str) -> Self {
        let b = perms.as_bytes();
        let mut bits = 0;
        if b.first() == Some(&b'r') {
            bits |= Self::READ;
        }
        if b.get(1) == Some(&b'w') {
            bits |= Self::WRITE;
        }
        if b.get(2) == Some(&b'x') {
            bits |= Self::EXEC;
        }
        match b.get(3) {
            Some(b'p') => bits |= Self::PRIVATE,
            Some(b's') => bits |= Self::SHARED,
            _ => {}
        }
        Self(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn is_executable(self) -> bool {
        self.0 & Self::EXEC != 0
    }

    pub fn is_shared(self) -> bool {
        self.0 & Self::SHARED != 0
    }
}

impl fmt::Display for SectionPerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: u32, c: char| if self.0 & bit != 0 { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXEC, 'x'),
            if self.is_shared() { 's' } else { 'p' }
        )
    }
}

/// One row of `/proc/<pid>/maps` (304 bytes on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SectionEntry {
    pub pid: u32,
    pub start: u64,
    pub end: u64,
    pub perms: SectionPerms,
    pub offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub pathname: String,
}

impl SectionEntry {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SECTION_ENTRY_SIZE {
            return None;
        }
        Some(Self {
            pid: LE::read_u32(&buf[0..]),
            start: LE::read_u64(&buf[4..]),
            end: LE::read_u64(&buf[12..]),
            perms: SectionPerms(LE::read_u32(&buf[20..])),
            offset: LE::read_u64(&buf[24..]),
            major: LE::read_u32(&buf[32..]),
            minor: LE::read_u32(&buf[36..]),
            inode: LE::read_u64(&buf[40..]),
            pathname: read_cstr(&buf[48..48 + PATH_MAX_STORED]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let out = &mut out[..SECTION_ENTRY_SIZE];
        LE::write_u32(&mut out[0..], self.pid);
        LE::write_u64(&mut out[4..], self.start);
        LE::write_u64(&mut out[12..], self.end);
        LE::write_u32(&mut out[20..], self.perms.0);
        LE::write_u64(&mut out[24..], self.offset);
        LE::write_u32(&mut out[32..], self.major);
        LE::write_u32(&mut out[36..], self.minor);
        LE::write_u64(&mut out[40..], self.inode);
        write_cstr(&mut out[48..48 + PATH_MAX_STORED], &self.pathname);
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.start && va < self.end
    }
}

/// Flags carried by a PTE entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
pub struct PteFlags(pub u32);

impl PteFlags {
    pub const PRESENT: u32 = 0x1;
    pub const SWAPPED: u32 = 0x2;
    /// Synthetic entry emitted when pagemap was unreadable
    pub const FABRICATED: u32 = 0x4;
    pub const EXCLUSIVE: u32 = 0x8;
    pub const SOFT_DIRTY: u32 = 0x10;

    pub fn from_pagemap(raw: u64) -> Self {
        let mut bits = 0;
        if raw & PAGEMAP_PRESENT != 0 {
            bits |= Self::PRESENT;
        }
        if raw & PAGEMAP_SWAPPED != 0 {
            bits |= Self::SWAPPED;
        }
        if raw & PAGEMAP_EXCLUSIVE != 0 {
            bits |= Self::EXCLUSIVE;
        }
        if raw & PAGEMAP_SOFT_DIRTY != 0 {
            bits |= Self::SOFT_DIRTY;
        }
        Self(bits)
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn is_fabricated(self) -> bool {
        self.0 & Self::FABRICATED != 0
    }
}

/// Virtual page to physical page mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PteEntry {
    pub va: u64,
    pub pa: u64,
    pub flags: PteFlags,
}

impl PteEntry {
    /// Parse a full stream record (type byte included)
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PTE_ENTRY_SIZE || buf[0] != ENTRY_TYPE_PTE {
            return None;
        }
        Some(Self {
            va: LE::read_u64(&buf[8..]),
            pa: LE::read_u64(&buf[16..]),
            flags: PteFlags(LE::read_u32(&buf[24..])),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let out = &mut out[..PTE_ENTRY_SIZE];
        out.fill(0);
        out[0] = ENTRY_TYPE_PTE;
        LE::write_u64(&mut out[8..], self.va);
        LE::write_u64(&mut out[16..], self.pa);
        LE::write_u32(&mut out[24..], self.flags.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_process() -> ProcessEntry {
        ProcessEntry {
            pid: 1,
            ppid: 0,
            uid: 0,
            gid: 0,
            comm: "init".into(),
            state: b'S',
            nice: -5,
            num_threads: 3,
            vsize: 0x1000_0000,
            rss: 512,
            start_time: 12,
            utime: 100,
            stime: 50,
            num_sections: 7,
            exe_path: "/sbin/init".into(),
        }
    }

    #[test]
    fn test_process_entry_layout() {
        let mut buf = vec![0u8; PROCESS_ENTRY_SIZE];
        let entry = sample_process();
        entry.write(&mut buf);
        assert_eq!(&buf[16..20], b"init");
        assert_eq!(buf[33], 0xFB);
        assert_eq!(LE::read_u32(&buf[76..]), 7);
        assert_eq!(ProcessEntry::parse(&buf), Some(entry));
    }

    #[test]
    fn test_process_entry_short_buffer() {
        assert!(ProcessEntry::parse(&[0u8; 100]).is_none());
    }

    #[test]
    fn test_section_entry_layout() {
        let section = SectionEntry {
            pid: 42,
            start: 0x400000,
            end: 0x401000,
            perms: SectionPerms::from_maps("r-xp"),
            offset: 0x1000,
            major: 8,
            minor: 1,
            inode: 1234,
            pathname: "/usr/bin/cat".into(),
        };
        let mut buf = vec![0u8; SECTION_ENTRY_SIZE];
        section.write(&mut buf);
        assert_eq!(LE::read_u64(&buf[4..]), 0x400000);
        assert_eq!(LE::read_u32(&buf[20..]), 0x4 | 0x1 | 0x8);
        assert_eq!(SectionEntry::parse(&buf), Some(section.clone()));
        assert_eq!(section.size(), 0x1000);
        assert!(section.contains(0x400fff));
        assert!(!section.contains(0x401000));
    }

    #[test]
    fn test_perms_display() {
        assert_eq!(SectionPerms::from_maps("rw-s").to_string(), "rw-s");
        assert_eq!(SectionPerms::from_maps("---p").to_string(), "---p");
        let rx = SectionPerms::from_maps("r-xp");
        assert!(rx.is_readable() && rx.is_executable() && !rx.is_writable());
    }

    #[test]
    fn test_pte_entry_layout() {
        let pte = PteEntry {
            va: 0x400000,
            pa: 0x4000_1000,
            flags: PteFlags(PteFlags::PRESENT | PteFlags::EXCLUSIVE),
        };
        let mut buf = [0xAAu8; PTE_ENTRY_SIZE];
        pte.write(&mut buf);
        assert_eq!(buf[0], ENTRY_TYPE_PTE);
        assert_eq!(&buf[1..8], &[0u8; 7]);
        assert_eq!(PteEntry::parse(&buf), Some(pte));
    }

    #[test]
    fn test_pte_flags_from_pagemap() {
        let raw = PAGEMAP_PRESENT | PAGEMAP_SOFT_DIRTY | 0x1234;
        let flags = PteFlags::from_pagemap(raw);
        assert!(flags.is_present());
        assert_eq!(flags.0, PteFlags::PRESENT | PteFlags::SOFT_DIRTY);
        assert!(!flags.is_fabricated());
    }
}
