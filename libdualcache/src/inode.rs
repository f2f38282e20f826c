use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::mapping::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

/// Whether the file has ever been mapped into an address space.
///
/// Moves `Unmapped -> Mapped` once and never back: unmapping is tracked by
/// the host VM, and a file that was mapped once keeps honouring the
/// dual-cache protocol for the rest of the inode's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    Mapped,
}

pub struct Inode {
    ino: u64,
    kind: FileKind,
    uid: u32,
    gid: u32,
    mode: u32,
    size: AtomicU64,
    map_state: Mutex<MapState>,
    mapping: AddressSpace,
}

impl Inode {
    pub fn new(ino: u64, kind: FileKind, uid: u32, gid: u32, mode: u32, page_size: usize) -> Self {
        Self {
            ino,
            kind,
            uid,
            gid,
            mode,
            size: AtomicU64::new(0),
            map_state: Mutex::new(MapState::Unmapped),
            mapping: AddressSpace::new(page_size),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Permission bits (`0o777` mask).
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Grow the size to `end` if it is smaller.
    pub fn extend_size(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }

    pub fn mapping(&self) -> &AddressSpace {
        &self.mapping
    }

    pub fn map_state(&self) -> MapState {
        *self.map_state.lock().unwrap()
    }

    pub fn is_mapped(&self) -> bool {
        self.map_state() == MapState::Mapped
    }

    /// Record that the file is mapped. Returns `true` on the first call.
    pub(crate) fn mark_mapped(&self) -> bool {
        let mut state = self.map_state.lock().unwrap();
        let first = *state == MapState::Unmapped;
        *state = MapState::Mapped;
        first
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("map_state", &self.map_state())
            .finish()
    }
}
