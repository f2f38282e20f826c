//! Dispatch tables the host calls into, one per file kind, plus the
//! page-cache operations shared by every regular file.

use std::sync::Arc;

use async_trait::async_trait;

use crate::attr::AttributeFlagBridge;
use crate::bridge::MappedPageBridge;
use crate::config::BridgeConfig;
use crate::engine::{DirEntry, StorageEngine};
use crate::error::{FileOpsError, Result};
use crate::file::{FileHandle, FileHandleOps};
use crate::flags::{Credential, FileMode, OpenFlags, VmArea, VmFlags, Whence};
use crate::inode::{FileKind, Inode};
use crate::mapping::WritebackControl;
use crate::page::LockedPage;

/// Per-open entry points (`file_operations`).
#[async_trait]
pub trait FileOperations: Send + Sync {
    async fn open(
        &self,
        inode: Arc<Inode>,
        mode: FileMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<FileHandle>;

    async fn release(&self, file: FileHandle, cred: &Credential) -> Result<()>;

    fn llseek(&self, file: &FileHandle, offset: i64, whence: Whence) -> Result<u64>;

    async fn read(
        &self,
        _file: &FileHandle,
        _buf: &mut [u8],
        _ppos: &mut u64,
        _cred: &Credential,
    ) -> Result<usize> {
        Err(FileOpsError::Unsupported("read".into()))
    }

    async fn write(
        &self,
        _file: &FileHandle,
        _buf: &[u8],
        _ppos: &mut u64,
        _cred: &Credential,
    ) -> Result<usize> {
        Err(FileOpsError::Unsupported("write".into()))
    }

    async fn readdir(
        &self,
        _file: &FileHandle,
        _emit: &mut (dyn for<'e> FnMut(&'e DirEntry) -> bool + Send),
        _cred: &Credential,
    ) -> Result<()> {
        Err(FileOpsError::Unsupported("readdir".into()))
    }

    async fn mmap(&self, _file: &FileHandle, _vma: &VmArea) -> Result<()> {
        Err(FileOpsError::Unsupported("mmap".into()))
    }

    async fn fsync(&self, _file: &FileHandle, _datasync: bool, _cred: &Credential) -> Result<()> {
        Err(FileOpsError::Unsupported("fsync".into()))
    }

    async fn ioctl(
        &self,
        _file: &FileHandle,
        cmd: u32,
        _arg: &mut u32,
        _cred: &Credential,
    ) -> Result<()> {
        Err(FileOpsError::NotTty(cmd))
    }
}

/// Page-cache entry points for a file's mapping (`address_space_operations`).
#[async_trait]
pub trait AddressSpaceOperations: Send + Sync {
    async fn readpage(&self, inode: &Inode, page: LockedPage) -> Result<()>;

    async fn readpages(&self, inode: &Inode, pages: Vec<LockedPage>) -> Result<()>;

    async fn writepage(
        &self,
        inode: &Inode,
        page: LockedPage,
        wbc: &WritebackControl,
    ) -> Result<()>;

    /// Returns the number of pages written.
    async fn writepages(&self, inode: &Inode, wbc: &WritebackControl) -> Result<usize>;
}

pub struct RegularFileOps<E: ?Sized> {
    fops: FileHandleOps<E>,
    bridge: Arc<MappedPageBridge<E>>,
    attrs: AttributeFlagBridge<E>,
}

#[async_trait]
impl<E: StorageEngine + ?Sized> FileOperations for RegularFileOps<E> {
    async fn open(
        &self,
        inode: Arc<Inode>,
        mode: FileMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<FileHandle> {
        self.fops.open(inode, mode, flags, cred).await
    }

    async fn release(&self, file: FileHandle, cred: &Credential) -> Result<()> {
        self.fops.close(file, cred).await
    }

    fn llseek(&self, file: &FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        self.fops.llseek(file, offset, whence)
    }

    async fn read(
        &self,
        file: &FileHandle,
        buf: &mut [u8],
        ppos: &mut u64,
        cred: &Credential,
    ) -> Result<usize> {
        self.fops.read(file, buf, ppos, cred).await
    }

    async fn write(
        &self,
        file: &FileHandle,
        buf: &[u8],
        ppos: &mut u64,
        cred: &Credential,
    ) -> Result<usize> {
        self.fops.write(file, buf, ppos, cred).await
    }

    async fn mmap(&self, file: &FileHandle, vma: &VmArea) -> Result<()> {
        if vma.flags.contains(VmFlags::SHARED | VmFlags::WRITE)
            && !file.mode().contains(FileMode::WRITE)
        {
            return Err(FileOpsError::PermissionDenied);
        }
        self.bridge.map_region(file.inode(), vma).await
    }

    async fn fsync(&self, file: &FileHandle, datasync: bool, cred: &Credential) -> Result<()> {
        self.fops.fsync(file, datasync, cred).await
    }

    async fn ioctl(
        &self,
        file: &FileHandle,
        cmd: u32,
        arg: &mut u32,
        cred: &Credential,
    ) -> Result<()> {
        self.attrs.ioctl(file, cmd, arg, cred).await
    }
}

pub struct DirectoryOps<E: ?Sized> {
    fops: FileHandleOps<E>,
    attrs: AttributeFlagBridge<E>,
}

#[async_trait]
impl<E: StorageEngine + ?Sized> FileOperations for DirectoryOps<E> {
    async fn open(
        &self,
        inode: Arc<Inode>,
        mode: FileMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<FileHandle> {
        self.fops.open(inode, mode, flags, cred).await
    }

    async fn release(&self, file: FileHandle, cred: &Credential) -> Result<()> {
        self.fops.close(file, cred).await
    }

    fn llseek(&self, file: &FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        self.fops.llseek(file, offset, whence)
    }

    async fn read(
        &self,
        _file: &FileHandle,
        _buf: &mut [u8],
        _ppos: &mut u64,
        _cred: &Credential,
    ) -> Result<usize> {
        Err(FileOpsError::IsDirectory)
    }

    async fn readdir(
        &self,
        file: &FileHandle,
        emit: &mut (dyn for<'e> FnMut(&'e DirEntry) -> bool + Send),
        cred: &Credential,
    ) -> Result<()> {
        self.fops.readdir(file, emit, cred).await
    }

    async fn fsync(&self, file: &FileHandle, datasync: bool, cred: &Credential) -> Result<()> {
        self.fops.fsync(file, datasync, cred).await
    }

    async fn ioctl(
        &self,
        file: &FileHandle,
        cmd: u32,
        arg: &mut u32,
        cred: &Credential,
    ) -> Result<()> {
        self.attrs.ioctl(file, cmd, arg, cred).await
    }
}

/// The tables installed on inodes served by one engine.
pub struct OperationTable<E: ?Sized> {
    regular: RegularFileOps<E>,
    directory: DirectoryOps<E>,
    bridge: Arc<MappedPageBridge<E>>,
}

impl<E: StorageEngine + ?Sized> OperationTable<E> {
    pub fn new(engine: Arc<E>, config: BridgeConfig) -> Self {
        let bridge = Arc::new(MappedPageBridge::new(engine.clone(), config));
        Self {
            regular: RegularFileOps {
                fops: FileHandleOps::new(engine.clone()),
                bridge: bridge.clone(),
                attrs: AttributeFlagBridge::new(engine.clone()),
            },
            directory: DirectoryOps {
                fops: FileHandleOps::new(engine.clone()),
                attrs: AttributeFlagBridge::new(engine),
            },
            bridge,
        }
    }

    pub fn file_operations(&self, inode: &Inode) -> &dyn FileOperations {
        match inode.kind() {
            FileKind::Regular => &self.regular,
            FileKind::Directory => &self.directory,
        }
    }

    pub fn address_space_operations(&self) -> &dyn AddressSpaceOperations {
        self.bridge.as_ref()
    }

    pub fn bridge(&self) -> &Arc<MappedPageBridge<E>> {
        &self.bridge
    }
}
