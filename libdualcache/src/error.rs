use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised by a [`StorageEngine`](crate::engine::StorageEngine).
///
/// This layer never interprets them; they are carried to the host inside
/// [`FileOpsError::Engine`] and converted to an errno at the boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("disk quota exceeded")]
    QuotaExceeded,

    #[error("no space left on device")]
    NoSpace,

    #[error("file too large")]
    FileTooLarge,

    #[error("checksum mismatch: {0}")]
    Corrupted(String),

    #[error("no such device")]
    NoDevice,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Raw status code handed back by the engine. Must be a positive errno.
    #[error("engine status {0} ({desc})", desc = Errno::from_raw(*.0).desc())]
    Status(i32),
}

impl EngineError {
    pub fn errno(&self) -> i32 {
        match self {
            EngineError::NotFound => libc::ENOENT,
            EngineError::PermissionDenied => libc::EACCES,
            EngineError::NotPermitted => libc::EPERM,
            EngineError::QuotaExceeded => libc::EDQUOT,
            EngineError::NoSpace => libc::ENOSPC,
            EngineError::FileTooLarge => libc::EFBIG,
            EngineError::Corrupted(_) => libc::EIO,
            EngineError::NoDevice => libc::ENODEV,
            EngineError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            EngineError::Status(code) => *code,
        }
    }

    /// An engine may only ever report positive errno values.
    fn within_contract(&self) -> bool {
        match self {
            EngineError::Status(code) => *code > 0,
            _ => true,
        }
    }
}

impl From<Errno> for EngineError {
    fn from(e: Errno) -> Self {
        EngineError::Status(e as i32)
    }
}

/// Errors surfaced to the host by the file and page operations.
#[derive(Debug, Error)]
pub enum FileOpsError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("cannot allocate a page vector for {requested} pages")]
    ResourceExhausted { requested: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The engine answered outside its documented contract. Unreachable
    /// with a correct engine.
    #[error("storage engine contract violation: {0}")]
    ProtocolViolation(String),

    #[error("is a directory")]
    IsDirectory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("value too large for defined data type")]
    Overflow,

    #[error("inappropriate ioctl {0:#x}")]
    NotTty(u32),

    #[error("file not open for {0}")]
    BadFileMode(&'static str),
}

impl FileOpsError {
    pub fn errno(&self) -> i32 {
        match self {
            FileOpsError::PermissionDenied => libc::EACCES,
            FileOpsError::Unsupported(_) => libc::EOPNOTSUPP,
            FileOpsError::ResourceExhausted { .. } => libc::ENOMEM,
            FileOpsError::Engine(e) => e.errno(),
            FileOpsError::ProtocolViolation(_) => libc::EIO,
            FileOpsError::IsDirectory => libc::EISDIR,
            FileOpsError::InvalidArgument(_) => libc::EINVAL,
            FileOpsError::Overflow => libc::EOVERFLOW,
            FileOpsError::NotTty(_) => libc::ENOTTY,
            FileOpsError::BadFileMode(_) => libc::EBADF,
        }
    }
}

impl From<FileOpsError> for io::Error {
    fn from(e: FileOpsError) -> Self {
        io::Error::from_raw_os_error(e.errno())
    }
}

pub type Result<T, E = FileOpsError> = std::result::Result<T, E>;

/// Host return convention: byte count on success, negative errno on failure.
pub fn to_host_ret(res: &Result<usize>) -> isize {
    match res {
        Ok(n) => *n as isize,
        Err(e) => -(e.errno() as isize),
    }
}

/// Forward an engine result to the host unchanged, unless the engine broke
/// its contract by reporting a non-positive status code.
pub(crate) fn surface<T>(op: &str, res: Result<T, EngineError>) -> Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(e) if !e.within_contract() => {
            error!("{op}: storage engine returned out-of-contract status: {e:?}");
            Err(FileOpsError::ProtocolViolation(format!(
                "{op} returned status {}",
                e.errno()
            )))
        }
        Err(e) => Err(FileOpsError::Engine(e)),
    }
}
