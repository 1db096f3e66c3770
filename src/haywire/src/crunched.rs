//! Reads in flat coordinates.
//!
//! A crunched read walks the flattener's regions, translates every page
//! and copies it from the memory backend. Untranslatable pages read as
//! zeros but still count, so a viewer's layout never shifts.

use crate::backend::MemoryBackend;
use crate::flatten::Flattener;
use crate::protocol::{PAGE_OFFSET_MASK, PAGE_SIZE_U64};
use crate::translate::Translator;
use std::sync::Arc;

/// One process's flat view over guest physical memory
#[derive(Clone)]
pub struct CrunchedReader {
    backend: Arc<MemoryBackend>,
    translator: Arc<Translator>,
    flattener: Arc<Flattener>,
    pid: u32,
}

/// A page-bounded piece of a traversal
struct Slice {
    /// Offset into the caller's buffer
    at: usize,
    len: usize,
    /// 0 when the page has no translation
    pa: u64,
}

impl CrunchedReader {
    pub fn new(
        backend: Arc<MemoryBackend>,
        translator: Arc<Translator>,
        flattener: Arc<Flattener>,
        pid: u32,
    ) -> Self {
        Self {
            backend,
            translator,
            flattener,
            pid,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn flattener(&self) -> &Flattener {
        &self.flattener
    }

    pub fn flat_size(&self) -> u64 {
        self.flattener.flat_size()
    }

    /// Guest physical address behind a flat offset, 0 when not present
    pub fn physical_address(&self, flat_offset: u64) -> u64 {
        match self.flattener.region_at_flat(flat_offset) {
            Some(r) => self
                .translator
                .translate(self.pid, r.va_start + (flat_offset - r.flat_start)),
            None => 0,
        }
    }

    /// Visit page slices of `[flat_offset, flat_offset+len)` until `visit`
    /// returns false or the flat space ends. Returns bytes covered.
    fn walk(&self, flat_offset: u64, len: usize, mut visit: impl FnMut(Slice) -> bool) -> usize {
        let mut cursor = flat_offset;
        let mut done = 0usize;

        while done < len {
            let Some(region) = self.flattener.region_at_flat(cursor) else {
                break;
            };
            let remaining = (len - done) as u64;
            let chunk = remaining.min(region.flat_end - cursor);
            let mut va = region.va_start + (cursor - region.flat_start);
            let chunk_end = va + chunk;

            while va < chunk_end {
                let page_left = PAGE_SIZE_U64 - (va & PAGE_OFFSET_MASK);
                let slice_len = page_left.min(chunk_end - va) as usize;
                let pa = self.translator.translate(self.pid, va);
                if !visit(Slice {
                    at: done,
                    len: slice_len,
                    pa,
                }) {
                    return done + slice_len;
                }
                done += slice_len;
                va += slice_len as u64;
            }
            cursor += chunk;
        }
        done
    }

    /// Fill `out` from flat offset `flat_offset`. Returns the number of
    /// bytes produced; anything past that (end of flat space) is zeroed.
    pub fn read(&self, flat_offset: u64, out: &mut [u8]) -> usize {
        let len = out.len();
        let produced = self.walk(flat_offset, len, |slice| {
            let dst = &mut out[slice.at..slice.at + slice.len];
            if slice.pa == 0 || self.backend.read(slice.pa, dst).is_err() {
                dst.fill(0);
            }
            true
        });
        out[produced..].fill(0);
        produced
    }

    pub fn read_vec(&self, flat_offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let produced = self.read(flat_offset, &mut out);
        out.truncate(produced);
        out
    }

    /// True if any translated page in the range holds a non-zero byte
    pub fn test_nonzero(&self, flat_offset: u64, len: usize) -> bool {
        let mut found = false;
        self.walk(flat_offset, len, |slice| {
            if slice.pa != 0 && self.backend.test_page_nonzero(slice.pa, slice.len) {
                found = true;
            }
            !found
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::VaRegion;
    use crate::protocol::CameraEntry;
    use crate::reader::BeaconReader;
    use crate::testutil::{pte, section, GuestImage};
    use crate::translate::BeaconTranslator;
    use proptest::prelude::*;

    fn beacon_translator(backend: Arc<MemoryBackend>) -> Arc<Translator> {
        let reader = Arc::new(BeaconReader::new(backend));
        reader.refresh();
        Arc::new(Translator::Beacon(BeaconTranslator::new(reader)))
    }

    #[test]
    fn test_empty_guest_reads_zeros() {
        let backend = Arc::new(GuestImage::new(64).backend());
        let translator = beacon_translator(backend.clone());
        let flattener = Arc::new(Flattener::new(vec![VaRegion::new(0x40_0000, 0x40_1000, "")]));
        let reader = CrunchedReader::new(backend, translator, flattener, 1);

        let mut buf = vec![0xAAu8; 4096];
        assert_eq!(reader.read(0, &mut buf), 4096);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(!reader.test_nonzero(0, 4096));
    }

    #[test]
    fn test_single_process_capture() {
        let mut image = GuestImage::new(1024);
        let arena = image.place_arena(0, 0x11, true);
        image.publish_pids(&arena, 0, 1, &[1]);
        image.publish_process(&arena, 0, 1, &GuestImage::process(1, "init"), &[]);
        image.publish_camera(
            &arena,
            1,
            1,
            1,
            vec![
                CameraEntry::Section(section(1, 0x40_0000, 0x1000)),
                CameraEntry::Pte(pte(0x40_0000, 0x4000_1000)),
            ],
        );
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8 + 1).collect();

        let backend = Arc::new(image.sparse_backend(0x4000_2000, &[(0x4000_1000, payload.as_slice())]));
        let translator = beacon_translator(backend.clone());
        assert_eq!(translator.translate(1, 0x40_0123), 0x4000_1123);

        let flattener = Arc::new(Flattener::new(vec![VaRegion::new(0x40_0000, 0x40_1000, "/sbin/init")]));
        let reader = CrunchedReader::new(backend, translator, flattener, 1);
        let mut buf = vec![0u8; 4096];
        assert_eq!(reader.read(0, &mut buf), 4096);
        assert_eq!(buf, payload);
        assert!(reader.test_nonzero(0, 4096));
    }

    #[test]
    fn test_read_spans_regions_and_pages() {
        let mut image = GuestImage::new(16);
        image.fill(0x3000, &[7u8; 4096]);
        image.fill(0x5000, &[9u8; 4096]);
        let backend = Arc::new(image.backend());
        let flattener = Arc::new(Flattener::new(vec![
            VaRegion::new(0x3000, 0x4000, "a"),
            VaRegion::new(0x5000, 0x6000, "b"),
        ]));
        let reader = CrunchedReader::new(backend, Arc::new(Translator::Identity), flattener, 0);

        let data = reader.read_vec(0x0ff0, 0x20);
        assert_eq!(&data[..0x10], &[7u8; 0x10]);
        assert_eq!(&data[0x10..], &[9u8; 0x10]);

        // Past the end of flat space
        let mut buf = vec![0xFFu8; 0x20];
        assert_eq!(reader.read(0x1ff0, &mut buf), 0x10);
        assert_eq!(&buf[0x10..], &[0u8; 0x10]);
        assert!(reader.test_nonzero(0x1000, 8));
        assert!(!reader.test_nonzero(0x2000, 8));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_read_length(
            sizes in prop::collection::vec(1u64..4, 1..6),
            off in any::<u64>(),
            len in 0usize..0x6000,
        ) {
            let mut regions = Vec::new();
            let mut va = 0x1_0000u64;
            for s in &sizes {
                regions.push(VaRegion::new(va, va + s * 0x1000, ""));
                va += s * 0x1000 + 0x10_0000;
            }
            let flattener = Arc::new(Flattener::new(regions));
            let size = flattener.flat_size();
            let off = off % size;
            let len = len.min((size - off) as usize);

            // Nothing translates: every byte is an unmapped zero
            let backend = Arc::new(GuestImage::new(4).backend());
            let translator = beacon_translator(backend.clone());
            let reader = CrunchedReader::new(backend, translator, flattener, 1);
            let mut buf = vec![0x5Au8; len];
            prop_assert_eq!(reader.read(off, &mut buf), len);
            prop_assert!(buf.iter().all(|&b| b == 0));
        }
    }
}
