//! Regular-file I/O for a storage engine whose data cache is not the host
//! page cache.
//!
//! Ordinary reads and writes go through [`file::FileHandleOps`] straight to
//! the engine. Memory-mapped files additionally need the page cache, and
//! [`bridge::MappedPageBridge`] keeps the two caches consistent for them.

#[macro_use]
extern crate log;

pub mod attr;
pub mod bridge;
pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod file;
pub mod flags;
pub mod inode;
pub mod mapping;
pub mod ops;
pub mod page;
pub mod uio;

pub use attr::{AttributeFlagBridge, EngineAttrFlags, HostFlags};
pub use bridge::MappedPageBridge;
pub use config::BridgeConfig;
pub use engine::{DirEntry, MemoryEngine, StorageEngine};
pub use error::{EngineError, FileOpsError, Result};
pub use file::{FileHandle, FileHandleOps};
pub use flags::{Credential, FileMode, OpenFlags, VmArea, VmFlags, Whence};
pub use inode::{FileKind, Inode, MapState};
pub use ops::{AddressSpaceOperations, FileOperations, OperationTable};
pub use page::{CachePage, LockedPage, PageState};
