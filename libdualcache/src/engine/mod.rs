//! The storage engine as seen from the file layer.
//!
//! Everything behind this trait (transaction log, allocator, backing cache,
//! permission policy) is the engine's business. The file layer hands it
//! transfer descriptors and locked pages and forwards whatever it reports.
//!
//! Contract for engines serving mapped files: once [`Inode::is_mapped`]
//! is true, `write` must lock the covered pages with
//! [`AddressSpace::lock_range`](crate::mapping::AddressSpace::lock_range)
//! before touching its own cache and push the new bytes into them before
//! unlocking. `read` must lay resident pages over its result with
//! [`AddressSpace::overlay_range`](crate::mapping::AddressSpace::overlay_range).
//! `putpage` is called with the page locked and must not do either.

pub mod memory;

use async_trait::async_trait;

use crate::attr::EngineAttrFlags;
use crate::error::EngineError;
use crate::flags::{Credential, FileMode, OpenFlags, VmFlags};
use crate::inode::{FileKind, Inode};
use crate::mapping::WritebackControl;
use crate::page::LockedPage;
use crate::uio::Uio;

pub use memory::{DEFAULT_MAX_FILE_SIZE, EngineOp, MemoryEngine};

/// One directory entry produced by [`StorageEngine::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
    /// Cursor value that resumes enumeration after this entry.
    pub next: u64,
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn open(
        &self,
        inode: &Inode,
        mode: FileMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<(), EngineError>;

    async fn close(&self, inode: &Inode, flags: OpenFlags, cred: &Credential)
    -> Result<(), EngineError>;

    /// Fill `uio` from the file, stopping early at end of file.
    async fn read(
        &self,
        inode: &Inode,
        uio: &mut Uio<'_>,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<(), EngineError>;

    async fn write(
        &self,
        inode: &Inode,
        uio: &mut Uio<'_>,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<(), EngineError>;

    /// Emit entries starting at `cursor`, advancing it past every entry
    /// `emit` accepted. `emit` returns `false` to stop.
    async fn readdir(
        &self,
        inode: &Inode,
        cursor: &mut u64,
        emit: &mut (dyn for<'e> FnMut(&'e DirEntry) -> bool + Send),
        cred: &Credential,
    ) -> Result<(), EngineError>;

    async fn fsync(&self, inode: &Inode, datasync: bool, cred: &Credential)
    -> Result<(), EngineError>;

    /// Validate a mapping request before the host installs it.
    async fn map(
        &self,
        inode: &Inode,
        pgoff: u64,
        addr: usize,
        len: usize,
        vm_flags: VmFlags,
    ) -> Result<(), EngineError>;

    /// Copy current file contents into every page of `pages`.
    async fn getpage(&self, inode: &Inode, pages: &mut [LockedPage]) -> Result<(), EngineError>;

    /// Store the contents of a dirty mapped page.
    async fn putpage(
        &self,
        inode: &Inode,
        page: &LockedPage,
        wbc: &WritebackControl,
    ) -> Result<(), EngineError>;

    async fn getflags(&self, inode: &Inode) -> Result<EngineAttrFlags, EngineError>;

    async fn setflags(
        &self,
        inode: &Inode,
        flags: EngineAttrFlags,
        cred: &Credential,
    ) -> Result<(), EngineError>;
}
