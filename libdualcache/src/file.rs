//! Per-open file handles and the ordinary (non-mapped) file operations.
//!
//! Reads and writes here go straight to the engine's backing cache and never
//! touch the page cache, mapped file or not. Keeping resident pages coherent
//! with this traffic is the engine's half of the dual-cache protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::{DirEntry, StorageEngine};
use crate::error::{FileOpsError, Result, surface};
use crate::flags::{Credential, FileMode, OpenFlags, Whence};
use crate::inode::Inode;
use crate::uio::{self, MAXOFFSET, UioSeg};

/// Largest size a file opened without `O_LARGEFILE` may have.
pub const MAX_NON_LFS: u64 = i32::MAX as u64;

/// One open of a file.
pub struct FileHandle {
    inode: Arc<Inode>,
    mode: FileMode,
    flags: OpenFlags,
    /// `f_pos`: byte cursor for regular files, enumeration cookie for
    /// directories.
    pos: AtomicU64,
}

impl FileHandle {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("ino", &self.inode.ino())
            .field("mode", &self.mode)
            .field("flags", &self.flags)
            .field("pos", &self.pos())
            .finish()
    }
}

pub struct FileHandleOps<E: ?Sized> {
    engine: Arc<E>,
}

impl<E: StorageEngine + ?Sized> FileHandleOps<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub async fn open(
        &self,
        inode: Arc<Inode>,
        mode: FileMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<FileHandle> {
        surface("open", self.engine.open(&inode, mode, flags, cred).await)?;

        if !flags.contains(OpenFlags::LARGEFILE) && inode.size() > MAX_NON_LFS {
            debug!(
                "inode {} is {} bytes, refusing open without O_LARGEFILE",
                inode.ino(),
                inode.size()
            );
            if let Err(e) = self.engine.close(&inode, flags, cred).await {
                warn!("close after refused open of inode {} failed: {e}", inode.ino());
            }
            return Err(FileOpsError::Overflow);
        }

        trace!("opened inode {} mode {mode:?} flags {flags:?}", inode.ino());
        Ok(FileHandle {
            inode,
            mode,
            flags,
            pos: AtomicU64::new(0),
        })
    }

    pub async fn close(&self, file: FileHandle, cred: &Credential) -> Result<()> {
        let res = self.engine.close(&file.inode, file.flags, cred).await;
        surface("close", res)
    }

    /// Read at `*ppos`, advancing it by the count returned.
    pub async fn read(
        &self,
        file: &FileHandle,
        buf: &mut [u8],
        ppos: &mut u64,
        cred: &Credential,
    ) -> Result<usize> {
        if !file.mode.contains(FileMode::READ) {
            return Err(FileOpsError::BadFileMode("reading"));
        }
        let n = uio::read_common(
            self.engine.as_ref(),
            &file.inode,
            buf,
            *ppos,
            UioSeg::UserSpace,
            file.flags,
            cred,
        )
        .await?;
        *ppos += n as u64;
        Ok(n)
    }

    /// Write at `*ppos`, advancing it by the count returned.
    pub async fn write(
        &self,
        file: &FileHandle,
        buf: &[u8],
        ppos: &mut u64,
        cred: &Credential,
    ) -> Result<usize> {
        if !file.mode.contains(FileMode::WRITE) {
            return Err(FileOpsError::BadFileMode("writing"));
        }
        let n = uio::write_common(
            self.engine.as_ref(),
            &file.inode,
            buf,
            *ppos,
            UioSeg::UserSpace,
            file.flags,
            cred,
        )
        .await?;
        *ppos += n as u64;
        Ok(n)
    }

    /// Enumerate directory entries from the handle cursor. `emit` returns
    /// `false` to stop; the cursor is left after the last accepted entry.
    pub async fn readdir(
        &self,
        file: &FileHandle,
        emit: &mut (dyn for<'e> FnMut(&'e DirEntry) -> bool + Send),
        cred: &Credential,
    ) -> Result<()> {
        let mut cursor = file.pos();
        let res = self
            .engine
            .readdir(&file.inode, &mut cursor, emit, cred)
            .await;
        file.set_pos(cursor);
        surface("readdir", res)
    }

    /// Flush the engine's state for the file. Dirty page-cache pages are
    /// left to writeback.
    pub async fn fsync(&self, file: &FileHandle, datasync: bool, cred: &Credential) -> Result<()> {
        surface("fsync", self.engine.fsync(&file.inode, datasync, cred).await)
    }

    pub fn llseek(&self, file: &FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.pos(),
            Whence::End => file.inode.size(),
        };
        let pos = (base as i128) + offset as i128;
        if pos < 0 || pos > MAXOFFSET as i128 {
            return Err(FileOpsError::InvalidArgument(format!(
                "seek to {pos} ({whence:?} {offset:+})"
            )));
        }
        file.set_pos(pos as u64);
        Ok(pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::{EngineOp, MemoryEngine};
    use crate::error::EngineError;

    fn setup() -> (Arc<MemoryEngine>, FileHandleOps<MemoryEngine>, Arc<Inode>) {
        let engine = Arc::new(MemoryEngine::new(BridgeConfig::default()));
        let inode = engine
            .create_file(&engine.root(), "data", 0o644, &Credential::root())
            .unwrap();
        (engine.clone(), FileHandleOps::new(engine), inode)
    }

    #[tokio::test]
    async fn test_read_write_advance_position() {
        let (_engine, fops, inode) = setup();
        let cred = Credential::root();
        let file = fops
            .open(inode, FileMode::READ | FileMode::WRITE, OpenFlags::RDWR, &cred)
            .await
            .unwrap();

        let mut pos = 0;
        assert_eq!(fops.write(&file, b"hello ", &mut pos, &cred).await.unwrap(), 6);
        assert_eq!(fops.write(&file, b"world", &mut pos, &cred).await.unwrap(), 5);
        assert_eq!(pos, 11);

        let mut pos = 3;
        let mut buf = [0u8; 64];
        let n = fops.read(&file, &mut buf, &mut pos, &cred).await.unwrap();
        assert_eq!(&buf[..n], b"lo world");
        assert_eq!(pos, 11);
        assert_eq!(fops.read(&file, &mut buf, &mut pos, &cred).await.unwrap(), 0);
        assert_eq!(pos, 11);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_position() {
        let (engine, fops, inode) = setup();
        let cred = Credential::root();
        let file = fops
            .open(inode, FileMode::WRITE, OpenFlags::WRONLY, &cred)
            .await
            .unwrap();
        engine.fail_next(EngineOp::Write, EngineError::QuotaExceeded);

        let mut pos = 7;
        let err = fops.write(&file, b"x", &mut pos, &cred).await.unwrap_err();
        assert_eq!(err.errno(), libc::EDQUOT);
        assert_eq!(pos, 7);
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_bad_file() {
        let (engine, fops, inode) = setup();
        let cred = Credential::root();
        let file = fops
            .open(inode, FileMode::READ, OpenFlags::empty(), &cred)
            .await
            .unwrap();
        let mut pos = 0;
        let err = fops.write(&file, b"x", &mut pos, &cred).await.unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
        assert_eq!(engine.calls(EngineOp::Write), 0);
    }

    #[tokio::test]
    async fn test_large_file_needs_largefile_flag() {
        let (engine, fops, inode) = setup();
        let cred = Credential::root();
        inode.set_size(MAX_NON_LFS + 1);

        let err = fops
            .open(inode.clone(), FileMode::READ, OpenFlags::empty(), &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, FileOpsError::Overflow));
        assert_eq!(engine.open_count(inode.ino()), 0);

        let file = fops
            .open(inode.clone(), FileMode::READ, OpenFlags::LARGEFILE, &cred)
            .await
            .unwrap();
        assert_eq!(engine.open_count(inode.ino()), 1);
        fops.close(file, &cred).await.unwrap();
        assert_eq!(engine.open_count(inode.ino()), 0);
    }

    #[tokio::test]
    async fn test_close_out_of_contract_status() {
        let (engine, fops, inode) = setup();
        let cred = Credential::root();
        let file = fops
            .open(inode, FileMode::READ, OpenFlags::empty(), &cred)
            .await
            .unwrap();
        engine.fail_next(EngineOp::Close, EngineError::Status(-5));
        let err = fops.close(file, &cred).await.unwrap_err();
        assert!(matches!(err, FileOpsError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_llseek() {
        let (_engine, fops, inode) = setup();
        let cred = Credential::root();
        let file = fops
            .open(inode, FileMode::WRITE, OpenFlags::WRONLY, &cred)
            .await
            .unwrap();
        let mut pos = 0;
        fops.write(&file, &[0u8; 100], &mut pos, &cred).await.unwrap();

        assert_eq!(fops.llseek(&file, 10, Whence::Set).unwrap(), 10);
        assert_eq!(fops.llseek(&file, 5, Whence::Cur).unwrap(), 15);
        assert_eq!(fops.llseek(&file, -20, Whence::End).unwrap(), 80);
        assert_eq!(file.pos(), 80);
        let err = fops.llseek(&file, -81, Whence::Cur).unwrap_err();
        assert!(matches!(err, FileOpsError::InvalidArgument(_)));
        assert_eq!(file.pos(), 80);
    }

    #[tokio::test]
    async fn test_readdir_uses_handle_cursor() {
        let (engine, fops, _inode) = setup();
        let cred = Credential::root();
        engine.create_file(&engine.root(), "more", 0o644, &cred).unwrap();
        let dir = fops
            .open(engine.root(), FileMode::READ, OpenFlags::DIRECTORY, &cred)
            .await
            .unwrap();

        let mut names = Vec::new();
        fops.readdir(
            &dir,
            &mut |e: &DirEntry| {
                names.push(e.name.clone());
                names.len() < 2
            },
            &cred,
        )
        .await
        .unwrap();
        assert_eq!(dir.pos(), 1);
        fops.readdir(
            &dir,
            &mut |e: &DirEntry| {
                names.push(e.name.clone());
                true
            },
            &cred,
        )
        .await
        .unwrap();
        assert_eq!(names, vec![".", "..", "..", "data", "more"]);
        assert_eq!(dir.pos(), 4);
    }
}
