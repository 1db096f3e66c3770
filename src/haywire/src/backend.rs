//! Memory Backend
//!
//! The guest-physical RAM image (QEMU `memory-backend-file`) mapped into the
//! host. The guest keeps writing while we read, so every access goes through
//! raw pointer copies on a `MmapRaw` instead of Rust references into the
//! mapping: torn bytes are possible, undefined behavior is not.

use crate::error::{HaywireError, Result};
use crate::protocol::{OFF_VERSION_BOTTOM, OFF_VERSION_TOP, PAGE_SIZE};
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use sysinfo::System;
use tracing::{debug, info, warn};

/// Smallest file considered a plausible RAM image during auto-detection
const MIN_BACKEND_SIZE: u64 = 1024 * 1024;

/// Directories searched for shared memory-backend files
const SEARCH_DIRS: &[&str] = &["/dev/shm", "/tmp", "/var/tmp", "."];

pub struct MemoryBackend {
    map: MmapRaw,
    path: PathBuf,
    /// Guest-physical address of file offset 0
    ram_base: u64,
    writable: bool,
}

// SAFETY: the mapping is only touched through copying accessors, and the
// guest already mutates it concurrently; host threads add nothing new.
unsafe impl Send for MemoryBackend {}
unsafe impl Sync for MemoryBackend {}

impl MemoryBackend {
    /// Open a memory-backend file with guest RAM starting at GPA 0
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_ram_base(path, 0)
    }

    /// Open a memory-backend file whose first byte is guest-physical `ram_base`
    pub fn open_with_ram_base<P: AsRef<Path>>(path: P, ram_base: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (file, writable) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let file = File::open(&path).map_err(|e| HaywireError::backend(&path, e))?;
                warn!("{} is read-only; camera focus changes disabled", path.display());
                (file, false)
            }
            Err(e) => return Err(HaywireError::backend(&path, e)),
        };

        let len = file
            .metadata()
            .map_err(|e| HaywireError::backend(&path, e))?
            .len();
        if len == 0 {
            return Err(HaywireError::backend(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "memory backend is empty"),
            ));
        }

        let map = if writable {
            MmapOptions::new().map_raw(&file)
        } else {
            MmapOptions::new().map_raw_read_only(&file)
        }
        .map_err(|e| HaywireError::backend(&path, e))?;

        info!(
            "Opened memory backend {} ({} MB, RAM base {:#x})",
            path.display(),
            len / (1024 * 1024),
            ram_base
        );

        Ok(Self {
            map,
            path,
            ram_base,
            writable,
        })
    }

    /// Open the first backend found by [`auto_detect`]
    pub fn open_auto(ram_base: u64) -> Result<Self> {
        let path = auto_detect().ok_or_else(|| {
            HaywireError::backend(
                "<auto>",
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no QEMU memory-backend file found",
                ),
            )
        })?;
        Self::open_with_ram_base(path, ram_base)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the image in bytes
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn ram_base(&self) -> u64 {
        self.ram_base
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// File offset of `gpa`, bounds-checked for `len` bytes
    pub fn offset_of(&self, gpa: u64, len: usize) -> Result<usize> {
        let out_of_range = || HaywireError::OutOfRange {
            gpa,
            len,
            size: self.size(),
        };
        let offset = gpa.checked_sub(self.ram_base).ok_or_else(out_of_range)?;
        self.check_offset(offset, len).map_err(|_| out_of_range())
    }

    fn check_offset(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.size() => Ok(offset as usize),
            _ => Err(HaywireError::OutOfRange {
                gpa: offset,
                len,
                size: self.size(),
            }),
        }
    }

    /// Copy `out.len()` bytes from guest-physical `gpa`
    pub fn read(&self, gpa: u64, out: &mut [u8]) -> Result<()> {
        let offset = self.offset_of(gpa, out.len())?;
        self.copy_out(offset, out);
        Ok(())
    }

    /// Copy `out.len()` bytes from a file offset (beacon scanning works in
    /// file offsets, independent of the RAM base)
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let offset = self.check_offset(offset, out.len())?;
        self.copy_out(offset, out);
        Ok(())
    }

    pub fn read_vec(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(gpa, &mut buf)?;
        Ok(buf)
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        // SAFETY: offset + out.len() was bounds-checked against the mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    fn load_u32(&self, offset: usize) -> u32 {
        // SAFETY: callers pass offsets inside a bounds-checked page.
        let raw = unsafe {
            ptr::read_volatile(self.map.as_ptr().add(offset) as *const [u8; 4])
        };
        u32::from_le_bytes(raw)
    }

    /// Copy one beacon page at a file offset, accepting it only if the
    /// version words agree before, inside and after the copy.
    pub fn read_versioned_page(&self, offset: u64, out: &mut [u8]) -> Result<bool> {
        let page = &mut out[..PAGE_SIZE];
        let base = self.check_offset(offset, PAGE_SIZE)?;

        let bottom_before = self.load_u32(base + OFF_VERSION_BOTTOM);
        fence(Ordering::Acquire);
        self.copy_out(base, page);
        fence(Ordering::Acquire);
        let top_after = self.load_u32(base + OFF_VERSION_TOP);

        let top = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
        let bottom = u32::from_le_bytes([
            page[OFF_VERSION_BOTTOM],
            page[OFF_VERSION_BOTTOM + 1],
            page[OFF_VERSION_BOTTOM + 2],
            page[OFF_VERSION_BOTTOM + 3],
        ]);
        Ok(top == bottom && top == bottom_before && top == top_after)
    }

    /// True if any byte in `[gpa, gpa+len)` is non-zero. Nothing is copied
    /// out; out-of-range spans report false.
    pub fn test_page_nonzero(&self, gpa: u64, len: usize) -> bool {
        let Ok(offset) = self.offset_of(gpa, len) else {
            return false;
        };
        let base = self.map.as_ptr();
        let mut i = 0;
        // SAFETY: every access stays inside [offset, offset + len), which
        // was bounds-checked above.
        unsafe {
            while i < len && (base as usize + offset + i) % 8 != 0 {
                if ptr::read_volatile(base.add(offset + i)) != 0 {
                    return true;
                }
                i += 1;
            }
            while i + 8 <= len {
                if ptr::read_volatile(base.add(offset + i) as *const u64) != 0 {
                    return true;
                }
                i += 8;
            }
            while i < len {
                if ptr::read_volatile(base.add(offset + i)) != 0 {
                    return true;
                }
                i += 1;
            }
        }
        false
    }

    /// Raw pointer to `gpa` for zero-copy consumers.
    ///
    /// The memory may change at any time; dereference only with volatile or
    /// copying reads, never through a Rust reference.
    pub fn ptr(&self, gpa: u64, len: usize) -> Result<*const u8> {
        let offset = self.offset_of(gpa, len)?;
        // SAFETY: offset is inside the mapping.
        Ok(unsafe { self.map.as_ptr().add(offset) })
    }

    fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(HaywireError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} was opened read-only", self.path.display()),
            )))
        }
    }

    /// Write raw bytes at a file offset
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.require_writable()?;
        let offset = self.check_offset(offset, data.len())?;
        // SAFETY: bounds-checked above and the mapping is writable.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Publish a whole page at a file offset in tear order: the version
    /// word at `top_offset` first, the body next, `version_bottom` last.
    pub fn write_page_versioned(&self, offset: u64, page: &[u8], top_offset: usize) -> Result<()> {
        self.require_writable()?;
        let base = self.check_offset(offset, PAGE_SIZE)?;
        let page = &page[..PAGE_SIZE];
        let dst = self.map.as_mut_ptr();

        // SAFETY: every span below lies within the bounds-checked page.
        unsafe {
            ptr::write_volatile(
                dst.add(base + top_offset) as *mut [u8; 4],
                copy4(&page[top_offset..]),
            );
            fence(Ordering::Release);
            ptr::copy_nonoverlapping(page.as_ptr(), dst.add(base), top_offset);
            let after = top_offset + 4;
            ptr::copy_nonoverlapping(
                page.as_ptr().add(after),
                dst.add(base + after),
                OFF_VERSION_BOTTOM - after,
            );
            fence(Ordering::Release);
            ptr::write_volatile(
                dst.add(base + OFF_VERSION_BOTTOM) as *mut [u8; 4],
                copy4(&page[OFF_VERSION_BOTTOM..]),
            );
        }
        debug!("Published page at offset {:#x}", offset);
        Ok(())
    }
}

fn copy4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Locate a QEMU memory-backend file: well-known directories first, then
/// the `mem-path=` argument of a running QEMU.
pub fn auto_detect() -> Option<PathBuf> {
    for dir in SEARCH_DIRS {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        let mut candidates: Vec<(PathBuf, u64)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_lowercase();
                let meta = e.metadata().ok()?;
                (meta.is_file() && meta.len() >= MIN_BACKEND_SIZE && looks_like_backend(&name))
                    .then(|| (e.path(), meta.len()))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some((path, size)) = candidates.into_iter().next() {
            info!("Auto-detected memory backend {} ({} bytes)", path.display(), size);
            return Some(path);
        }
    }

    find_qemu_mem_path()
}

fn looks_like_backend(name: &str) -> bool {
    name.contains("mem") && ["qemu", "vm", "haywire"].iter().any(|k| name.contains(k))
}

fn find_qemu_mem_path() -> Option<PathBuf> {
    let mut system = System::new_all();
    system.refresh_all();

    for process in system.processes().values() {
        let name = process.name().to_string_lossy();
        if !name.contains("qemu") {
            continue;
        }
        let pid = process.pid().as_u32();
        let Ok(cmdline) = std::fs::read_to_string(format!("/proc/{}/cmdline", pid)) else {
            continue;
        };
        if let Some(path) = parse_mem_path(&cmdline) {
            info!("Found mem-path {} on QEMU PID {}", path.display(), pid);
            return Some(path);
        }
    }
    None
}

/// Extract `mem-path=<path>` from a NUL- or space-separated command line
fn parse_mem_path(cmdline: &str) -> Option<PathBuf> {
    cmdline
        .split(['\0', ' '])
        .flat_map(|arg| arg.split(','))
        .find_map(|opt| opt.strip_prefix("mem-path="))
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}
