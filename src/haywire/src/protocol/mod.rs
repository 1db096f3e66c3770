//! Beacon Protocol
//!
//! Bit-exact 4 KiB page layouts shared by the in-guest companion (writer)
//! and the host-side reader:
//! - `page` - generic header, categories, tear-ordered writes
//! - `discovery` - the MASTER discovery page
//! - `pid_list` - PID list pages grouped into generations
//! - `entries` - process, section and PTE records
//! - `roundrobin` - bulk process detail pages
//! - `camera` - control page and focused-process stream
//! - `arena` - the companion's contiguous page arena

pub mod arena;
pub mod camera;
pub mod constants;
pub mod discovery;
pub mod entries;
pub mod page;
pub mod pid_list;
pub mod roundrobin;

pub use camera::{
    decode_stream, paginate_camera, CameraControl, CameraDataPage, CameraEntry, CameraStatus,
};
pub use constants::*;
pub use discovery::{is_discovery_candidate, CategoryDescriptor, DiscoveryPage};
pub use entries::{ProcessEntry, PteEntry, PteFlags, SectionEntry, SectionPerms};
pub use page::{
    is_legacy_page, read_cstr, validate_page, version_bottom, write_cstr, write_page,
    write_versioned, Category, PageHeader, PageStatus,
};
pub use pid_list::{
    assemble_generations, paginate_pids, select_pid_list, PidGeneration, PidListPage,
};
pub use roundrobin::{paginate_process, RoundRobinPage};
