use bitflags::bitflags;

// Open flags as the host passes them (Linux generic encoding).
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;
const O_NONBLOCK: u32 = 0o4000;
const O_DSYNC: u32 = 0o10000;
const O_DIRECT: u32 = 0o40000;
const O_LARGEFILE: u32 = 0o100000;
const O_DIRECTORY: u32 = 0o200000;
const O_SYNC: u32 = 0o4010000;

bitflags! {
    /// Flags the file was opened with (`f_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = O_WRONLY;
        const RDWR = O_RDWR;
        const CREAT = O_CREAT;
        const EXCL = O_EXCL;
        const TRUNC = O_TRUNC;
        const APPEND = O_APPEND;
        const NONBLOCK = O_NONBLOCK;
        const DSYNC = O_DSYNC;
        /// Caller asked to bypass caching.
        const DIRECT = O_DIRECT;
        /// Required to open files larger than the non-LFS limit.
        const LARGEFILE = O_LARGEFILE;
        const DIRECTORY = O_DIRECTORY;
        const SYNC = O_SYNC;
    }
}

bitflags! {
    /// Access mode derived from the open flags (`f_mode`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u8 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl FileMode {
    pub fn from_open_flags(flags: OpenFlags) -> Self {
        if flags.contains(OpenFlags::RDWR) {
            FileMode::READ | FileMode::WRITE
        } else if flags.contains(OpenFlags::WRONLY) {
            FileMode::WRITE
        } else {
            FileMode::READ
        }
    }
}

bitflags! {
    /// Protection and sharing bits of a mapping request (`vm_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        const SHARED = 0x8;
    }
}

/// One virtual memory area the host wants backed by a file.
#[derive(Debug, Clone, Copy)]
pub struct VmArea {
    pub start: usize,
    pub end: usize,
    /// File offset of `start`, in pages.
    pub pgoff: u64,
    pub flags: VmFlags,
}

impl VmArea {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Identity of the caller, valid for the duration of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    /// Holds the owner-override capability.
    pub privileged: bool,
}

impl Credential {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            privileged: true,
        }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            privileged: false,
        }
    }

    pub fn is_owner_or_cap(&self, owner: u32) -> bool {
        self.privileged || self.uid == owner
    }
}
