//! Host side of the page cache for one file (`address_space`).
//!
//! The host owns pages, creates them locked when a process faults or reads
//! ahead, and runs the generic multi-page writer. The bridge only ever sees
//! pages through [`LockedPage`]s handed to it by the functions in here.
//!
//! Engines use [`AddressSpace::lock_range`] (or
//! [`AddressSpace::update_range`]) and [`AddressSpace::overlay_range`] to
//! keep ordinary read/write traffic coherent with resident pages of a
//! mapped file. A page holds valid bytes when it is uptodate or dirty: a
//! dirty page whose commit failed has lost its uptodate bit but still
//! carries the only copy of the stores made through the mapping.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::inode::Inode;
use crate::ops::AddressSpaceOperations;
use crate::page::{CachePage, LockedPage};

pub struct AddressSpace {
    page_size: usize,
    pages: Mutex<BTreeMap<u64, Arc<CachePage>>>,
}

impl AddressSpace {
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_index(&self, offset: u64) -> u64 {
        offset / self.page_size as u64
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn find_page(&self, index: u64) -> Option<Arc<CachePage>> {
        self.pages.lock().unwrap().get(&index).cloned()
    }

    pub async fn find_lock_page(&self, index: u64) -> Option<LockedPage> {
        let page = self.find_page(index)?;
        Some(LockedPage::lock(page).await)
    }

    /// Look up a page, inserting an empty one if absent, and lock it.
    pub async fn grab_page(&self, index: u64) -> LockedPage {
        let page = {
            let mut pages = self.pages.lock().unwrap();
            pages
                .entry(index)
                .or_insert_with(|| Arc::new(CachePage::new(index, self.page_size)))
                .clone()
        };
        LockedPage::lock(page).await
    }

    /// Insert a fresh page for `index` and return it locked, or `None` if a
    /// page already exists there.
    fn add_locked_page(&self, index: u64) -> Option<LockedPage> {
        let mut pages = self.pages.lock().unwrap();
        if pages.contains_key(&index) {
            return None;
        }
        let page = Arc::new(CachePage::new(index, self.page_size));
        let locked = LockedPage::try_lock(page.clone())?;
        pages.insert(index, page);
        Some(locked)
    }

    /// Lock every page covering `[offset, offset + len)` in ascending index
    /// order, inserting empty placeholders for pages that are not resident.
    /// While the returned guard lives no fault can fetch and no commit can
    /// store any page of the range.
    pub async fn lock_range(&self, offset: u64, len: usize) -> RangeLock<'_> {
        let mut pages = Vec::new();
        if len > 0 {
            let first = self.page_index(offset);
            let last = self.page_index(offset + len as u64 - 1);
            for index in first..=last {
                pages.push(self.grab_page(index).await);
            }
        }
        RangeLock {
            mapping: self,
            offset,
            len,
            pages,
        }
    }

    /// Remove a placeholder nobody else is holding or waiting on.
    fn discard_unused(&self, index: u64) {
        let mut pages = self.pages.lock().unwrap();
        let unused = pages.get(&index).is_some_and(|page| {
            Arc::strong_count(page) == 1 && !page.is_locked() && !page.holds_data()
        });
        if unused {
            pages.remove(&index);
        }
    }

    /// Drop a clean, unlocked page (host reclaim). Returns whether it went.
    pub fn evict(&self, index: u64) -> bool {
        let mut pages = self.pages.lock().unwrap();
        match pages.get(&index) {
            Some(page) if !page.is_locked() && !page.is_dirty() => {
                pages.remove(&index);
                true
            }
            _ => false,
        }
    }

    pub fn dirty_indices(&self, range: Range<u64>) -> Vec<u64> {
        self.pages
            .lock()
            .unwrap()
            .range(range)
            .filter(|(_, page)| page.is_dirty())
            .map(|(index, _)| *index)
            .collect()
    }

    fn resident_in(&self, offset: u64, len: usize) -> Vec<Arc<CachePage>> {
        if len == 0 {
            return Vec::new();
        }
        let first = self.page_index(offset);
        let last = self.page_index(offset + len as u64 - 1);
        self.pages
            .lock()
            .unwrap()
            .range(first..=last)
            .map(|(_, page)| page.clone())
            .collect()
    }

    /// Byte span of `page_index` that overlaps `[offset, offset + len)`, as
    /// `(offset within page, offset within range, length)`.
    fn overlap(&self, page_index: u64, offset: u64, len: usize) -> (usize, usize, usize) {
        let page_start = page_index * self.page_size as u64;
        let start = offset.max(page_start);
        let end = (offset + len as u64).min(page_start + self.page_size as u64);
        (
            (start - page_start) as usize,
            (start - offset) as usize,
            (end - start) as usize,
        )
    }

    /// Copy bytes just written through the ordinary path into every resident
    /// page holding data. Pages are not dirtied: the engine already holds
    /// the data. Pages are locked one at a time, after the engine's update.
    pub async fn update_range(&self, offset: u64, data: &[u8]) -> usize {
        let mut copied = 0;
        for page in self.resident_in(offset, data.len()) {
            let mut locked = LockedPage::lock(page).await;
            if locked.page().holds_data() {
                let (in_page, in_range, n) = self.overlap(locked.index(), offset, data.len());
                locked.data_mut()[in_page..in_page + n]
                    .copy_from_slice(&data[in_range..in_range + n]);
                copied += n;
            }
            locked.unlock();
        }
        copied
    }

    /// Copy resident page bytes over `buf`, which holds the engine's view of
    /// `[offset, offset + buf.len())`. Pages may carry stores made through a
    /// mapping that have not been written back yet.
    pub async fn overlay_range(&self, offset: u64, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for page in self.resident_in(offset, buf.len()) {
            let locked = LockedPage::lock(page).await;
            if locked.page().holds_data() {
                let (in_page, in_range, n) = self.overlap(locked.index(), offset, buf.len());
                buf[in_range..in_range + n].copy_from_slice(&locked.data()[in_page..in_page + n]);
                copied += n;
            }
            locked.unlock();
        }
        copied
    }
}

/// Locked pages covering one ordinary write, from
/// [`AddressSpace::lock_range`]. Dropping it unlocks every page and removes
/// the placeholders it inserted.
pub struct RangeLock<'a> {
    mapping: &'a AddressSpace,
    offset: u64,
    len: usize,
    pages: Vec<LockedPage>,
}

impl RangeLock<'_> {
    /// Copy `data`, the bytes written at the locked offset, into the pages
    /// that hold data. Returns the number of bytes copied.
    pub fn update(&mut self, data: &[u8]) -> usize {
        debug_assert_eq!(data.len(), self.len);
        let mut copied = 0;
        for locked in self.pages.iter_mut() {
            if !locked.page().holds_data() {
                continue;
            }
            let (in_page, in_range, n) = self.mapping.overlap(locked.index(), self.offset, self.len);
            locked.data_mut()[in_page..in_page + n].copy_from_slice(&data[in_range..in_range + n]);
            copied += n;
        }
        copied
    }
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        for locked in self.pages.drain(..) {
            let index = locked.index();
            let placeholder = !locked.page().holds_data();
            locked.unlock();
            if placeholder {
                self.mapping.discard_unused(index);
            }
        }
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("page_size", &self.page_size)
            .field("nr_pages", &self.nr_pages())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Background writeback: skip busy pages, stop at the first error.
    None,
    /// Data-integrity writeback: wait for every page, keep going on errors.
    All,
}

/// Writeback request from the host's flusher.
#[derive(Debug, Clone)]
pub struct WritebackControl {
    pub sync_mode: SyncMode,
    pub nr_to_write: Option<usize>,
    /// Page index range to consider.
    pub range: Range<u64>,
}

impl WritebackControl {
    pub fn integrity() -> Self {
        Self {
            sync_mode: SyncMode::All,
            nr_to_write: None,
            range: 0..u64::MAX,
        }
    }

    pub fn background(nr_to_write: usize) -> Self {
        Self {
            sync_mode: SyncMode::None,
            nr_to_write: Some(nr_to_write),
            range: 0..u64::MAX,
        }
    }
}

/// Per-page callback of [`write_cache_pages`]. Receives a locked page whose
/// dirty bit was just cleared and must release it.
#[async_trait]
pub trait PageWriter: Send + Sync {
    async fn write_page(&self, page: LockedPage, wbc: &WritebackControl) -> Result<()>;
}

/// Generic multi-page writer: walk dirty pages in index order and hand each
/// one, locked, to `writer`. Returns the number of pages written.
pub async fn write_cache_pages(
    mapping: &AddressSpace,
    wbc: &WritebackControl,
    writer: &dyn PageWriter,
) -> Result<usize> {
    let mut written = 0;
    let mut first_err = None;

    for index in mapping.dirty_indices(wbc.range.clone()) {
        if wbc.nr_to_write.is_some_and(|limit| written >= limit) {
            break;
        }
        let Some(page) = mapping.find_page(index) else {
            continue;
        };
        let locked = match wbc.sync_mode {
            SyncMode::All => LockedPage::lock(page).await,
            SyncMode::None => match LockedPage::try_lock(page) {
                Some(locked) => locked,
                None => continue,
            },
        };
        if !locked.clear_dirty_for_io() {
            locked.unlock();
            continue;
        }
        match writer.write_page(locked, wbc).await {
            Ok(()) => written += 1,
            Err(e) => {
                warn!("writeback of page {index} failed: {e}");
                first_err.get_or_insert(e);
                if wbc.sync_mode == SyncMode::None {
                    break;
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

/// Generic fault path: return the page at `index`, populating it through
/// `aops` unless it already holds data. A dirty page is never fetched over.
pub async fn filemap_fault(
    aops: &dyn AddressSpaceOperations,
    inode: &Inode,
    index: u64,
) -> Result<Arc<CachePage>> {
    let locked = inode.mapping().grab_page(index).await;
    let page = locked.page().clone();
    if page.holds_data() {
        locked.unlock();
        return Ok(page);
    }
    aops.readpage(inode, locked).await?;
    Ok(page)
}

/// Generic read-ahead: allocate the non-resident pages of
/// `[start, start + nr)` and populate them with one batched call.
/// Returns how many pages were submitted.
pub async fn page_cache_readahead(
    aops: &dyn AddressSpaceOperations,
    inode: &Inode,
    start: u64,
    nr: usize,
) -> Result<usize> {
    let pages: Vec<LockedPage> = (start..start + nr as u64)
        .filter_map(|index| inode.mapping().add_locked_page(index))
        .collect();
    let submitted = pages.len();
    if submitted == 0 {
        return Ok(0);
    }
    aops.readpages(inode, pages).await?;
    Ok(submitted)
}

/// A process storing `data` at `offset` through a shared mapping: fault the
/// covered pages in, modify them, and mark them dirty.
pub async fn filemap_store(
    aops: &dyn AddressSpaceOperations,
    inode: &Inode,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let mapping = inode.mapping();
    if data.is_empty() {
        return Ok(());
    }
    let first = mapping.page_index(offset);
    let last = mapping.page_index(offset + data.len() as u64 - 1);
    for index in first..=last {
        let page = filemap_fault(aops, inode, index).await?;
        let mut locked = LockedPage::lock(page).await;
        let (in_page, in_range, n) = mapping.overlap(index, offset, data.len());
        locked.data_mut()[in_page..in_page + n].copy_from_slice(&data[in_range..in_range + n]);
        locked.set_dirty();
        locked.unlock();
    }
    Ok(())
}
