//! Beacon Reader
//!
//! Host-side consumer of the companion's beacon pages:
//! - `index` - discovery scan and per-category page offsets
//! - `snapshot` - staging copies and decoded views, swapped per refresh
//! - `lifecycle` - starting and stopping the companion through the agent

mod index;
mod lifecycle;
mod snapshot;

pub use index::{
    build_index, check_layout, scan_discovery, CategoryIndex, CategoryOffsets, LocatedDiscovery,
};
pub use lifecycle::{CompanionLauncher, CompanionStatus, DEFAULT_COMPANION_PATH};
pub use snapshot::{BeaconSnapshot, CameraCapture, CategoryStaging, CategoryStats, ProcessRecord};

use crate::backend::MemoryBackend;
use crate::error::{HaywireError, Result};
use crate::protocol::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts while waiting for the companion to adopt a new camera target
pub const FOCUS_ATTEMPTS: u32 = 30;

/// Delay between focus polls
pub const FOCUS_INTERVAL: Duration = Duration::from_millis(100);

/// Retries when a page tears under a single read
const PAGE_READ_RETRIES: usize = 3;

/// What a successful refresh did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Known offsets re-copied
    Updated,
    /// Backend re-scanned to rebuild the category index
    Reindexed,
    /// A different companion session took over; caches were reset
    SessionChanged { old: u32, new: u32 },
}

#[derive(Default)]
struct ReaderState {
    discovery: Option<LocatedDiscovery>,
    index: Option<CategoryIndex>,
}

pub struct BeaconReader {
    backend: Arc<MemoryBackend>,
    state: Mutex<ReaderState>,
    snapshot: RwLock<Option<Arc<BeaconSnapshot>>>,
    diagnostic: Mutex<Option<String>>,
    /// Bumped whenever cached translations must be dropped
    epoch: AtomicU64,
}

impl BeaconReader {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(ReaderState::default()),
            snapshot: RwLock::new(None),
            diagnostic: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Scan for the discovery page without staging anything
    pub fn discover(&self) -> Result<LocatedDiscovery> {
        scan_discovery(&self.backend)
    }

    /// Re-index and re-copy. Returns false when discovery failed, the
    /// data was structurally invalid, or the session changed (the new
    /// session's snapshot is installed, but caches must be dropped);
    /// [`last_diagnostic`](Self::last_diagnostic) carries the detail.
    pub fn refresh(&self) -> bool {
        match self.try_refresh() {
            Ok(RefreshOutcome::SessionChanged { old, new }) => {
                let err = HaywireError::SessionChanged { old, new };
                info!("{}", err);
                self.set_diagnostic(Some(err.to_string()));
                false
            }
            Ok(_) => {
                self.set_diagnostic(None);
                true
            }
            Err(e) => {
                warn!("Beacon refresh failed: {}", e);
                self.set_diagnostic(Some(e.to_string()));
                false
            }
        }
    }

    pub fn try_refresh(&self) -> Result<RefreshOutcome> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = state.discovery.as_ref().map(LocatedDiscovery::session_id);

        // Always rescan: a restarted companion leaves its old discovery
        // page behind, and only the scan sees the newer one
        let located = match scan_discovery(&self.backend) {
            Ok(found) => found,
            Err(e) => {
                state.discovery = None;
                state.index = None;
                return Err(e);
            }
        };
        check_layout(&located.page)?;

        let mut outcome = RefreshOutcome::Updated;
        if let Some(old) = previous.filter(|old| *old != located.session_id()) {
            outcome = RefreshOutcome::SessionChanged {
                old,
                new: located.session_id(),
            };
            state.index = None;
            *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = None;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }

        let needs_index = state
            .index
            .as_ref()
            .map(|i| i.session_id != located.session_id() || !i.is_complete())
            .unwrap_or(true);
        if needs_index {
            state.index = Some(build_index(&self.backend, &located)?);
            if outcome == RefreshOutcome::Updated {
                outcome = RefreshOutcome::Reindexed;
            }
        }
        let Some(index) = state.index.as_ref() else {
            return Err(HaywireError::DiscoveryMissing);
        };

        let snapshot = BeaconSnapshot::build(&self.backend, &located.page, located.offset, index)?;
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(snapshot));
        state.discovery = Some(located);
        debug!("Refresh complete: {:?}", outcome);
        Ok(outcome)
    }

    fn set_diagnostic(&self, message: Option<String>) {
        *self.diagnostic.lock().unwrap_or_else(|e| e.into_inner()) = message;
    }

    /// Detail behind the last `refresh()` that returned false
    pub fn last_diagnostic(&self) -> Option<String> {
        self.diagnostic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Counter bumped on every session change
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The current snapshot; stable for as long as the caller holds it
    pub fn snapshot(&self) -> Option<Arc<BeaconSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.snapshot().map(|s| s.session_id)
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn get_pid_list(&self) -> Vec<u32> {
        self.snapshot().map(|s| s.pid_list()).unwrap_or_default()
    }

    pub fn pid_generations(&self) -> Vec<PidGeneration> {
        self.snapshot()
            .map(|s| s.pid_generations().to_vec())
            .unwrap_or_default()
    }

    pub fn get_all_process_info(&self) -> BTreeMap<u32, ProcessEntry> {
        self.snapshot()
            .map(|s| {
                s.processes()
                    .iter()
                    .map(|(pid, r)| (*pid, r.entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sections published in ROUNDROBIN after the PID's process entry
    pub fn process_sections(&self, pid: u32) -> Vec<SectionEntry> {
        self.snapshot()
            .and_then(|s| s.process(pid).map(|r| r.sections.clone()))
            .unwrap_or_default()
    }

    pub fn camera_capture(&self, cam: u8) -> Option<CameraCapture> {
        self.snapshot().and_then(|s| s.camera(cam).cloned())
    }

    pub fn get_camera_sections(&self, cam: u8, pid: u32) -> Vec<SectionEntry> {
        self.snapshot()
            .and_then(|s| s.camera_for(cam, pid).map(|c| c.sections.clone()))
            .unwrap_or_default()
    }

    /// Page-aligned VA -> page-aligned PA from the camera's PTE stream;
    /// fabricated entries are excluded
    pub fn get_camera_ptes(&self, cam: u8, pid: u32) -> HashMap<u64, u64> {
        self.snapshot()
            .and_then(|s| s.camera_for(cam, pid).map(|c| c.pte_map(false)))
            .unwrap_or_default()
    }

    fn control_offset(&self, cam: u8) -> Result<u64> {
        let category = Category::camera(cam)
            .ok_or_else(|| HaywireError::ProtocolViolation(format!("no camera {cam}")))?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .index
            .as_ref()
            .and_then(|i| i.category(category).get(CAMERA_CONTROL_INDEX as usize))
            .ok_or(HaywireError::DiscoveryMissing)
    }

    fn read_stable_page(&self, offset: u64) -> Result<Vec<u8>> {
        let mut page = vec![0u8; PAGE_SIZE];
        for _ in 0..PAGE_READ_RETRIES {
            if self.backend.read_versioned_page(offset, &mut page)? {
                return Ok(page);
            }
            thread::yield_now();
        }
        Err(HaywireError::TornPage {
            category: PageHeader::parse(&page).map(|h| h.category).unwrap_or(0),
            index: CAMERA_CONTROL_INDEX,
        })
    }

    /// Live control block of a camera, read straight from the backend
    pub fn camera_focus(&self, cam: u8) -> Option<CameraControl> {
        let offset = self.control_offset(cam).ok()?;
        let page = self.read_stable_page(offset).ok()?;
        CameraControl::parse(&page)
    }

    /// Ask the companion to point a camera at `pid`
    pub fn set_camera_focus(&self, cam: u8, pid: u32) -> bool {
        match self.try_set_camera_focus(cam, pid) {
            Ok(()) => true,
            Err(e) => {
                warn!("Camera {} focus change to PID {} failed: {}", cam, pid, e);
                self.set_diagnostic(Some(e.to_string()));
                false
            }
        }
    }

    pub fn try_set_camera_focus(&self, cam: u8, pid: u32) -> Result<()> {
        let offset = self.control_offset(cam)?;
        let page = self.read_stable_page(offset)?;
        let control = CameraControl::parse(&page).ok_or_else(|| {
            HaywireError::ProtocolViolation(format!("camera {cam} has no control page"))
        })?;
        let header = PageHeader::parse(&page).ok_or_else(|| {
            HaywireError::ProtocolViolation(format!("camera {cam} control header unreadable"))
        })?;

        let updated = CameraControl {
            version: control.version.wrapping_add(1),
            target_pid: pid,
            status: CameraStatus::Switching,
            ..control
        };
        let mut out = page;
        updated.write(&mut out, &header);
        self.backend
            .write_page_versioned(offset, &out, OFF_VERSION_TOP)?;
        info!(
            "Camera {} focus requested: PID {} (version {})",
            cam, pid, updated.version
        );
        Ok(())
    }

    /// Poll until the companion reports `pid` as the camera's current
    /// target and a capture of it is staged
    pub fn wait_for_focus(&self, cam: u8, pid: u32) -> bool {
        self.wait_for_focus_with(cam, pid, FOCUS_ATTEMPTS, FOCUS_INTERVAL)
    }

    pub fn wait_for_focus_with(&self, cam: u8, pid: u32, attempts: u32, interval: Duration) -> bool {
        for attempt in 0..attempts {
            let adopted = self
                .camera_focus(cam)
                .map(|c| c.current_pid == pid && c.status == CameraStatus::Active)
                .unwrap_or(false);
            if adopted {
                self.refresh();
                if self
                    .snapshot()
                    .map(|s| s.camera_for(cam, pid).is_some())
                    .unwrap_or(false)
                {
                    debug!("Camera {} focused on PID {} after {} polls", cam, pid, attempt + 1);
                    return true;
                }
            }
            thread::sleep(interval);
        }
        self.set_diagnostic(Some(format!(
            "camera {cam} did not focus on PID {pid} within {attempts} attempts"
        )));
        false
    }
}
