//! `/proc/<pid>/maps` parsing, shared by the guest-agent path (text fetched
//! through `cat`) and the companion (read locally).

use crate::protocol::{SectionEntry, SectionPerms};
use serde::Serialize;

/// One row of a maps file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MapsEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    /// File path, `[heap]`-style pseudo name, or empty for anonymous
    pub pathname: String,
}

impl MapsEntry {
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    pub fn is_writable(&self) -> bool {
        self.perms.chars().nth(1) == Some('w')
    }

    pub fn is_executable(&self) -> bool {
        self.perms.chars().nth(2) == Some('x')
    }

    pub fn to_section(&self, pid: u32) -> SectionEntry {
        SectionEntry {
            pid,
            start: self.start,
            end: self.end,
            perms: SectionPerms::from_maps(&self.perms),
            offset: self.offset,
            major: self.major,
            minor: self.minor,
            inode: self.inode,
            pathname: self.pathname.clone(),
        }
    }
}

/// Parse one line: `start-end perms offset major:minor inode [pathname]`
pub fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let perms = fields.next().unwrap_or("").to_string();
    let offset = fields
        .next()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .unwrap_or(0);
    let (major, minor) = fields
        .next()
        .and_then(|dev| dev.split_once(':'))
        .map(|(ma, mi)| {
            (
                u32::from_str_radix(ma, 16).unwrap_or(0),
                u32::from_str_radix(mi, 16).unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    let inode = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    // Paths may contain spaces
    let pathname = fields.collect::<Vec<_>>().join(" ");

    Some(MapsEntry {
        start,
        end,
        perms,
        offset,
        major,
        minor,
        inode,
        pathname,
    })
}

pub fn parse_maps(text: &str) -> Vec<MapsEntry> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_maps_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
00400000-00452000 r-xp 00000000 08:01 1234 /usr/bin/program
00651000-00652000 rw-p 00051000 08:01 1234 /usr/bin/program
01b5c000-01b7d000 rw-p 00000000 00:00 0 [heap]
7f0000000000-7f0000021000 rw-p 00000000 00:00 0
7ffc8a1e0000-7ffc8a201000 rw-p 00000000 00:00 0 [stack]
7ffd00000000-7ffd00001000 r--p 00000000 fd:02 99 /home/user/My Documents/file.bin
";

    #[test]
    fn test_parse_maps_sample() {
        let entries = parse_maps(SAMPLE);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].start, 0x400000);
        assert_eq!(entries[0].end, 0x452000);
        assert!(entries[0].is_executable());
        assert_eq!(entries[1].offset, 0x51000);
        assert_eq!(entries[2].pathname, "[heap]");
        assert!(entries[3].pathname.is_empty());
        assert_eq!(entries[5].pathname, "/home/user/My Documents/file.bin");
        assert_eq!((entries[5].major, entries[5].minor), (0xfd, 2));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let entries = parse_maps("garbage\nzzzz-0000 r--p\n00001000-00002000 r--p 0 00:00 0\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size(), 0x1000);
    }

    #[test]
    fn test_to_section() {
        let entry = parse_maps_line("00400000-00401000 rw-s 00000000 08:01 7 /dev/shm/x").unwrap();
        let section = entry.to_section(12);
        assert_eq!(section.pid, 12);
        assert!(section.perms.is_shared());
        assert!(section.perms.is_writable());
        assert_eq!(section.inode, 7);
    }
}
