//! Per-file attribute flags: the engine keeps a wide semantic bit-set, the
//! host exposes a 32-bit `chattr`-style word through two ioctls.
//!
//! The mapping is not one-to-one. Only six engine attributes have a host
//! counterpart; the rest (read-only, hidden, no-unlink, ...) never show up
//! in the host word and are left untouched when the host sets flags. So
//! engine -> host is faithful for display, while host -> engine -> host is
//! not guaranteed to round-trip the engine's full state.

use std::sync::Arc;

use bitflags::bitflags;

use crate::engine::StorageEngine;
use crate::error::{FileOpsError, Result, surface};
use crate::file::FileHandle;
use crate::flags::Credential;
use crate::inode::Inode;

bitflags! {
    /// Engine-native attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EngineAttrFlags: u64 {
        const READONLY = 0x0000_0001_0000_0000;
        const HIDDEN = 0x0000_0002_0000_0000;
        const SYSTEM = 0x0000_0004_0000_0000;
        const ARCHIVE = 0x0000_0008_0000_0000;
        const IMMUTABLE = 0x0000_0010_0000_0000;
        const NOUNLINK = 0x0000_0020_0000_0000;
        const APPENDONLY = 0x0000_0040_0000_0000;
        const NODUMP = 0x0000_0080_0000_0000;
        const OPAQUE = 0x0000_0100_0000_0000;
        const AV_QUARANTINED = 0x0000_0200_0000_0000;
        const AV_MODIFIED = 0x0000_0400_0000_0000;
        const REPARSE = 0x0000_0800_0000_0000;
        const OFFLINE = 0x0000_1000_0000_0000;
        const SPARSE = 0x0000_2000_0000_0000;
        // Host compatibility bits; no other engine meaning.
        const DIRSYNC = 0x0000_4000_0000_0000;
        const SYNC = 0x0000_8000_0000_0000;
        const NOATIME = 0x0001_0000_0000_0000;
    }
}

/// Host bits visible to `GET_FLAGS` callers.
pub const FS_FL_USER_VISIBLE: u32 = 0x0003_DFFF;
/// Host bits an unprivileged owner may change.
pub const FS_FL_USER_MODIFIABLE: u32 = 0x0003_80FF;

bitflags! {
    /// Host `chattr` flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostFlags: u32 {
        const SECRM = 0x0000_0001;
        const UNRM = 0x0000_0002;
        const COMPR = 0x0000_0004;
        const SYNC = 0x0000_0008;
        const IMMUTABLE = 0x0000_0010;
        const APPEND = 0x0000_0020;
        const NODUMP = 0x0000_0040;
        const NOATIME = 0x0000_0080;
        const INDEX = 0x0000_1000;
        const IMAGIC = 0x0000_2000;
        const JOURNAL_DATA = 0x0000_4000;
        const NOTAIL = 0x0000_8000;
        const DIRSYNC = 0x0001_0000;
        const TOPDIR = 0x0002_0000;
    }
}

const FLAG_MAP: [(EngineAttrFlags, HostFlags); 6] = [
    (EngineAttrFlags::IMMUTABLE, HostFlags::IMMUTABLE),
    (EngineAttrFlags::APPENDONLY, HostFlags::APPEND),
    (EngineAttrFlags::NODUMP, HostFlags::NODUMP),
    (EngineAttrFlags::DIRSYNC, HostFlags::DIRSYNC),
    (EngineAttrFlags::SYNC, HostFlags::SYNC),
    (EngineAttrFlags::NOATIME, HostFlags::NOATIME),
];

/// `FS_IOC_GETFLAGS`
pub const IOC_GETFLAGS: u32 = 0x8008_6601;
/// `FS_IOC_SETFLAGS`
pub const IOC_SETFLAGS: u32 = 0x4008_6602;

/// Host flags that have an engine counterpart.
pub fn recognized_host_flags() -> HostFlags {
    FLAG_MAP
        .iter()
        .fold(HostFlags::empty(), |acc, (_, host)| acc | *host)
}

/// Engine attribute bits the host word can express.
pub fn mapped_engine_flags() -> EngineAttrFlags {
    FLAG_MAP
        .iter()
        .fold(EngineAttrFlags::empty(), |acc, (engine, _)| acc | *engine)
}

pub fn to_host_flags(engine: EngineAttrFlags) -> HostFlags {
    let host = FLAG_MAP
        .iter()
        .filter(|(e, _)| engine.contains(*e))
        .fold(HostFlags::empty(), |acc, (_, h)| acc | *h);
    host & HostFlags::from_bits_retain(FS_FL_USER_VISIBLE)
}

pub fn from_host_flags(host: HostFlags) -> EngineAttrFlags {
    FLAG_MAP
        .iter()
        .filter(|(_, h)| host.contains(*h))
        .fold(EngineAttrFlags::empty(), |acc, (e, _)| acc | *e)
}

pub struct AttributeFlagBridge<E: ?Sized> {
    engine: Arc<E>,
}

impl<E: StorageEngine + ?Sized> AttributeFlagBridge<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub async fn get_flags(&self, inode: &Inode) -> Result<HostFlags> {
        let flags = surface("getflags", self.engine.getflags(inode).await)?;
        Ok(to_host_flags(flags))
    }

    /// Apply a host flag word to the file behind `file`.
    pub async fn set_from_host(
        &self,
        file: &FileHandle,
        requested: u32,
        cred: &Credential,
    ) -> Result<()> {
        let inode = file.inode();

        if requested & !FS_FL_USER_MODIFIABLE != 0 && !cred.is_owner_or_cap(inode.uid()) {
            debug!(
                "set flags {requested:#x} on inode {} refused for uid {}",
                inode.ino(),
                cred.uid
            );
            return Err(FileOpsError::PermissionDenied);
        }

        let requested = HostFlags::from_bits_retain(requested);
        let unknown = requested - recognized_host_flags();
        if !unknown.is_empty() {
            return Err(FileOpsError::Unsupported(format!(
                "attribute flags {:#x}",
                unknown.bits()
            )));
        }

        let current = surface("getflags", self.engine.getflags(inode).await)?;
        let updated = (current - mapped_engine_flags()) | from_host_flags(requested);
        trace!(
            "inode {} attribute flags {:#x} -> {:#x}",
            inode.ino(),
            current.bits(),
            updated.bits()
        );
        surface("setflags", self.engine.setflags(inode, updated, cred).await)
    }

    pub async fn ioctl(
        &self,
        file: &FileHandle,
        cmd: u32,
        arg: &mut u32,
        cred: &Credential,
    ) -> Result<()> {
        match cmd {
            IOC_GETFLAGS => {
                *arg = self.get_flags(file.inode()).await?.bits();
                Ok(())
            }
            IOC_SETFLAGS => self.set_from_host(file, *arg, cred).await,
            _ => Err(FileOpsError::NotTty(cmd)),
        }
    }
}
