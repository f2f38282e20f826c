//! Single-segment transfer descriptors and the read/write translation
//! through them.

use crate::engine::StorageEngine;
use crate::error::{Result, surface};
use crate::flags::{Credential, OpenFlags};
use crate::inode::Inode;

/// Largest file offset a transfer may reach.
pub const MAXOFFSET: u64 = i64::MAX as u64;

/// Address space the caller buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UioSeg {
    UserSpace,
    SysSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UioRw {
    Read,
    Write,
}

enum IoVec<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// One linear transfer between a caller buffer and the engine.
///
/// The engine moves data with [`Uio::copy_out`] (read) or [`Uio::copy_in`]
/// (write); each move advances the file offset and shrinks the residual.
pub struct Uio<'a> {
    iov: IoVec<'a>,
    offset: u64,
    resid: usize,
    limit: u64,
    segflg: UioSeg,
}

impl<'a> Uio<'a> {
    pub fn for_read(buf: &'a mut [u8], offset: u64, segflg: UioSeg) -> Self {
        let resid = buf.len();
        Self {
            iov: IoVec::Read(buf),
            offset,
            resid,
            limit: MAXOFFSET,
            segflg,
        }
    }

    pub fn for_write(buf: &'a [u8], offset: u64, segflg: UioSeg) -> Self {
        let resid = buf.len();
        Self {
            iov: IoVec::Write(buf),
            offset,
            resid,
            limit: MAXOFFSET,
            segflg,
        }
    }

    pub fn rw(&self) -> UioRw {
        match self.iov {
            IoVec::Read(_) => UioRw::Read,
            IoVec::Write(_) => UioRw::Write,
        }
    }

    /// Total length of the request.
    pub fn len(&self) -> usize {
        match &self.iov {
            IoVec::Read(buf) => buf.len(),
            IoVec::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current absolute file offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes not yet transferred.
    pub fn resid(&self) -> usize {
        self.resid
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn segment(&self) -> UioSeg {
        self.segflg
    }

    fn done(&self) -> usize {
        self.len() - self.resid
    }

    /// Copy engine bytes into the caller buffer. Returns the count moved.
    pub fn copy_out(&mut self, src: &[u8]) -> usize {
        let done = self.done();
        let n = src.len().min(self.resid);
        match &mut self.iov {
            IoVec::Read(buf) => buf[done..done + n].copy_from_slice(&src[..n]),
            IoVec::Write(_) => return 0,
        }
        self.offset += n as u64;
        self.resid -= n;
        n
    }

    /// Copy caller bytes into `dst`. Returns the count moved.
    pub fn copy_in(&mut self, dst: &mut [u8]) -> usize {
        let done = self.done();
        let n = dst.len().min(self.resid);
        match &self.iov {
            IoVec::Write(buf) => dst[..n].copy_from_slice(&buf[done..done + n]),
            IoVec::Read(_) => return 0,
        }
        self.offset += n as u64;
        self.resid -= n;
        n
    }
}

/// Caller side of one transfer.
pub enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run one transfer at `pos` through the engine and return the number of
/// bytes moved. Nothing is recorded on failure; advancing any cursor is the
/// caller's business.
pub async fn transfer<E: StorageEngine + ?Sized>(
    engine: &E,
    inode: &Inode,
    xfer: Transfer<'_>,
    pos: u64,
    segflg: UioSeg,
    flags: OpenFlags,
    cred: &Credential,
) -> Result<usize> {
    let len = xfer.len();
    if len == 0 {
        return Ok(0);
    }

    let mut uio = match xfer {
        Transfer::Read(buf) => Uio::for_read(buf, pos, segflg),
        Transfer::Write(buf) => Uio::for_write(buf, pos, segflg),
    };
    match uio.rw() {
        UioRw::Read => surface("read", engine.read(inode, &mut uio, flags, cred).await)?,
        UioRw::Write => surface("write", engine.write(inode, &mut uio, flags, cred).await)?,
    }
    Ok(len - uio.resid())
}

pub async fn read_common<E: StorageEngine + ?Sized>(
    engine: &E,
    inode: &Inode,
    buf: &mut [u8],
    pos: u64,
    segflg: UioSeg,
    flags: OpenFlags,
    cred: &Credential,
) -> Result<usize> {
    transfer(engine, inode, Transfer::Read(buf), pos, segflg, flags, cred).await
}

pub async fn write_common<E: StorageEngine + ?Sized>(
    engine: &E,
    inode: &Inode,
    buf: &[u8],
    pos: u64,
    segflg: UioSeg,
    flags: OpenFlags,
    cred: &Credential,
) -> Result<usize> {
    transfer(engine, inode, Transfer::Write(buf), pos, segflg, flags, cred).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::{EngineOp, MemoryEngine};
    use crate::error::{EngineError, FileOpsError};

    #[test]
    fn test_copy_out_advances() {
        let mut buf = [0u8; 6];
        let mut uio = Uio::for_read(&mut buf, 100, UioSeg::SysSpace);
        assert_eq!(uio.copy_out(b"abcd"), 4);
        assert_eq!(uio.offset(), 104);
        assert_eq!(uio.resid(), 2);
        assert_eq!(uio.copy_out(b"efgh"), 2);
        assert_eq!(uio.resid(), 0);
        assert_eq!(uio.copy_in(&mut [0u8; 4]), 0);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_copy_in_advances() {
        let src = *b"hello";
        let mut uio = Uio::for_write(&src, 0, UioSeg::UserSpace);
        let mut dst = [0u8; 3];
        assert_eq!(uio.copy_in(&mut dst), 3);
        assert_eq!(&dst, b"hel");
        assert_eq!(uio.copy_out(b"xx"), 0);
        let mut rest = [0u8; 8];
        assert_eq!(uio.copy_in(&mut rest), 2);
        assert_eq!(&rest[..2], b"lo");
        assert_eq!(uio.offset(), 5);
    }

    #[tokio::test]
    async fn test_zero_length_does_not_reach_engine() {
        let engine = MemoryEngine::new(BridgeConfig::default());
        let cred = Credential::root();
        let inode = engine.create_file(&engine.root(), "f", 0o644, &cred).unwrap();

        let n = read_common(&engine, &inode, &mut [], 4096, UioSeg::UserSpace, OpenFlags::empty(), &cred)
            .await
            .unwrap();
        assert_eq!(n, 0);
        let n = write_common(&engine, &inode, &[], 1 << 40, UioSeg::UserSpace, OpenFlags::empty(), &cred)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(engine.calls(EngineOp::Read), 0);
        assert_eq!(engine.calls(EngineOp::Write), 0);
    }

    #[tokio::test]
    async fn test_short_read_at_eof() {
        let engine = MemoryEngine::new(BridgeConfig::default());
        let cred = Credential::root();
        let inode = engine.create_file(&engine.root(), "f", 0o644, &cred).unwrap();
        let flags = OpenFlags::RDWR;

        let n = write_common(&engine, &inode, b"0123456789", 0, UioSeg::SysSpace, flags, &cred)
            .await
            .unwrap();
        assert_eq!(n, 10);
        let mut buf = [0u8; 8];
        let n = read_common(&engine, &inode, &mut buf, 6, UioSeg::SysSpace, flags, &cred)
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"6789");
    }

    #[tokio::test]
    async fn test_engine_error_returned_untouched() {
        let engine = MemoryEngine::new(BridgeConfig::default());
        let cred = Credential::root();
        let inode = engine.create_file(&engine.root(), "f", 0o644, &cred).unwrap();
        engine.fail_next(EngineOp::Write, EngineError::NoSpace);

        let err = write_common(&engine, &inode, b"data", 0, UioSeg::UserSpace, OpenFlags::WRONLY, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, FileOpsError::Engine(EngineError::NoSpace)));
        assert_eq!(inode.size(), 0);
    }
}
