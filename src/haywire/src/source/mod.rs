//! Memory Data Sources
//!
//! Everything a viewer can display:
//! - `VmMemorySource` - guest physical memory through the backend
//! - `ProcessMemorySource` - one process, crunched into flat coordinates
//! - `MappedFile` - memory images on disk
//! - `BlobSource` - bytes already in memory

mod blob;
mod mapped_file;
mod process;
mod region;
mod traits;
mod vm;

pub use blob::BlobSource;
pub use mapped_file::MappedFile;
pub use process::ProcessMemorySource;
pub use region::Region;
pub use traits::MemoryDataSource;
pub use vm::VmMemorySource;
