//! Page-cache pages and the host page lock.
//!
//! A [`CachePage`] is owned by the host's [`AddressSpace`](crate::mapping::AddressSpace).
//! Whoever holds the page lock holds a [`LockedPage`]; releasing the lock
//! consumes the guard, so a page cannot be unlocked twice, and a guard that
//! goes out of scope on an error path still unlocks exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tokio::sync::{Mutex as PageLock, OwnedMutexGuard};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const LOCKED = 0x1;
        const UPTODATE = 0x2;
        const ERROR = 0x4;
        const DIRTY = 0x8;
    }
}

/// Coarse view of a page for callers that do not care about the raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Absent,
    Fetching,
    Uptodate,
    Error,
    Dirty,
}

pub struct CachePage {
    index: u64,
    flags: Mutex<PageFlags>,
    data: Arc<PageLock<Box<[u8]>>>,
    unlocks: AtomicU64,
}

impl CachePage {
    pub(crate) fn new(index: u64, page_size: usize) -> Self {
        Self {
            index,
            flags: Mutex::new(PageFlags::empty()),
            data: Arc::new(PageLock::new(vec![0u8; page_size].into_boxed_slice())),
            unlocks: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn flags(&self) -> PageFlags {
        *self.flags.lock().unwrap()
    }

    pub fn state(&self) -> PageState {
        let flags = self.flags();
        if flags.contains(PageFlags::ERROR) {
            PageState::Error
        } else if flags.contains(PageFlags::DIRTY) {
            PageState::Dirty
        } else if flags.contains(PageFlags::UPTODATE) {
            PageState::Uptodate
        } else if flags.contains(PageFlags::LOCKED) {
            PageState::Fetching
        } else {
            PageState::Absent
        }
    }

    pub fn is_locked(&self) -> bool {
        self.flags().contains(PageFlags::LOCKED)
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags().contains(PageFlags::UPTODATE)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    pub fn has_error(&self) -> bool {
        self.flags().contains(PageFlags::ERROR)
    }

    /// Whether the page bytes are current: fetched from the engine, or
    /// holding stores that have not reached it yet.
    pub fn holds_data(&self) -> bool {
        self.flags()
            .intersects(PageFlags::UPTODATE | PageFlags::DIRTY)
    }

    /// How many times the page lock has been released over the page's life.
    pub fn unlock_count(&self) -> u64 {
        self.unlocks.load(Ordering::Acquire)
    }

    /// Copy of the page bytes as a process mapping it would see them.
    pub async fn contents(&self) -> Vec<u8> {
        self.data.lock().await.to_vec()
    }

    fn update(&self, set: PageFlags, clear: PageFlags) {
        let mut flags = self.flags.lock().unwrap();
        flags.remove(clear);
        flags.insert(set);
    }
}

impl std::fmt::Debug for CachePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePage")
            .field("index", &self.index)
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page whose host lock is held by the current owner of this value.
pub struct LockedPage {
    page: Arc<CachePage>,
    guard: Option<OwnedMutexGuard<Box<[u8]>>>,
}

impl LockedPage {
    /// Sleep until the page lock is available (`lock_page`).
    pub async fn lock(page: Arc<CachePage>) -> Self {
        let guard = page.data.clone().lock_owned().await;
        page.update(PageFlags::LOCKED, PageFlags::empty());
        Self {
            page,
            guard: Some(guard),
        }
    }

    pub fn try_lock(page: Arc<CachePage>) -> Option<Self> {
        let guard = page.data.clone().try_lock_owned().ok()?;
        page.update(PageFlags::LOCKED, PageFlags::empty());
        Some(Self {
            page,
            guard: Some(guard),
        })
    }

    pub fn index(&self) -> u64 {
        self.page.index
    }

    pub fn page(&self) -> &Arc<CachePage> {
        &self.page
    }

    pub fn data(&self) -> &[u8] {
        self.guard.as_deref().map(|b| &b[..]).unwrap_or(&[])
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.guard.as_deref_mut().map(|b| &mut b[..]).unwrap_or(&mut [])
    }

    pub fn set_uptodate(&self) {
        self.page.update(PageFlags::UPTODATE, PageFlags::ERROR);
    }

    pub fn set_error(&self) {
        self.page.update(PageFlags::ERROR, PageFlags::UPTODATE);
    }

    pub fn set_dirty(&self) {
        self.page.update(PageFlags::DIRTY, PageFlags::empty());
    }

    pub fn clear_dirty(&self) {
        self.page.update(PageFlags::empty(), PageFlags::DIRTY);
    }

    /// Clear the dirty bit before handing the page to writeback.
    /// Returns whether the page was dirty.
    pub fn clear_dirty_for_io(&self) -> bool {
        let mut flags = self.page.flags.lock().unwrap();
        let was_dirty = flags.contains(PageFlags::DIRTY);
        flags.remove(PageFlags::DIRTY);
        was_dirty
    }

    /// Release the page lock (`unlock_page`).
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.page.update(PageFlags::empty(), PageFlags::LOCKED);
            drop(guard);
            self.page.unlocks.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for LockedPage {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LockedPage").field(&self.page).finish()
    }
}
