//! # haywire
//!
//! Live memory introspection for QEMU guests.
//!
//! A companion inside the guest publishes process, section and page-table
//! information into a page arena ("beacon"). On the host that arena is
//! read straight out of the VM's shared RAM file, without stopping the
//! guest. This library provides:
//! - The beacon wire format (`protocol`) and the host-side reader (`reader`)
//! - Access to guest physical memory (`backend`)
//! - Virtual to physical translation, through the beacon or the guest
//!   agent (`translate`, `agent`)
//! - The flattened address space used by viewers (`flatten`, `crunched`)
//! - Uniform data sources for visualizers (`source`)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! # fn main() -> haywire::Result<()> {
//! let backend = Arc::new(haywire::MemoryBackend::open("/dev/shm/haywire-vm")?);
//! let reader = Arc::new(haywire::BeaconReader::new(backend));
//!
//! if reader.refresh() {
//!     for (pid, process) in reader.get_all_process_info() {
//!         println!("{:>6} {}", pid, process.name());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod backend;
pub mod crunched;
pub mod error;
pub mod flatten;
pub mod maps;
pub mod monitor;
pub mod pagemap;
pub mod protocol;
pub mod reader;
pub mod refresh;
pub mod source;
pub mod translate;

#[cfg(test)]
mod testutil;

#[doc(inline)]
pub use agent::{AgentHandle, AgentWorker, GuestAgent, GuestProcess, GuestShell};
#[doc(inline)]
pub use backend::MemoryBackend;
#[doc(inline)]
pub use crunched::CrunchedReader;
#[doc(inline)]
pub use error::{HaywireError, Result};
#[doc(inline)]
pub use flatten::{Flattener, VaRegion};
#[doc(inline)]
pub use maps::{parse_maps, MapsEntry};
#[doc(inline)]
pub use pagemap::{decode_pagemap, PagemapEntry};
#[doc(inline)]
pub use reader::{BeaconReader, BeaconSnapshot, CompanionLauncher};
#[doc(inline)]
pub use refresh::BackgroundRefresher;
#[doc(inline)]
pub use source::{MemoryDataSource, Region};
#[doc(inline)]
pub use translate::Translator;
