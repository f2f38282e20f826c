//! The page-cache side of the dual-cache protocol.
//!
//! For a mapped file the engine's backing cache and the host page cache both
//! hold copies of the same bytes. Pages come in through [`fetch_page`] and
//! [`fetch_pages`], which always copy the engine's current data, and go out
//! through [`commit_page`], the only path by which a dirty page reaches the
//! engine. Every page handed to the bridge arrives locked and is released
//! exactly once before the call returns, on every path.
//!
//! [`fetch_page`]: MappedPageBridge::fetch_page
//! [`fetch_pages`]: MappedPageBridge::fetch_pages
//! [`commit_page`]: MappedPageBridge::commit_page

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BridgeConfig;
use crate::engine::StorageEngine;
use crate::error::{FileOpsError, Result, surface};
use crate::flags::VmArea;
use crate::inode::Inode;
use crate::mapping::{PageWriter, WritebackControl, write_cache_pages};
use crate::ops::AddressSpaceOperations;
use crate::page::LockedPage;

pub struct MappedPageBridge<E: ?Sized> {
    engine: Arc<E>,
    config: BridgeConfig,
}

impl<E: StorageEngine + ?Sized> MappedPageBridge<E> {
    pub fn new(engine: Arc<E>, config: BridgeConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Let the engine validate a new mapping, then switch the inode into
    /// mapped mode.
    pub async fn map_region(&self, inode: &Inode, vma: &VmArea) -> Result<()> {
        let res = self
            .engine
            .map(inode, vma.pgoff, vma.start, vma.len(), vma.flags)
            .await;
        surface("map", res)?;
        if inode.mark_mapped() {
            debug!("inode {} is now mapped", inode.ino());
        }
        Ok(())
    }

    /// Fill one locked page from the engine.
    pub async fn fetch_page(&self, inode: &Inode, page: LockedPage) -> Result<()> {
        let mut pages = [page];
        let res = self.engine.getpage(inode, &mut pages).await;
        let [page] = pages;
        match &res {
            Ok(()) => page.set_uptodate(),
            Err(e) => {
                debug!("inode {} page {} fault failed: {e}", inode.ino(), page.index());
                page.set_error();
            }
        }
        page.unlock();
        surface("getpage", res)
    }

    /// Fill a batch of locked pages with a single engine call. Either every
    /// page ends up uptodate or every page ends up in error.
    pub async fn fetch_pages(&self, inode: &Inode, pages: Vec<LockedPage>) -> Result<()> {
        let requested = pages.len();
        if requested == 0 {
            return Ok(());
        }
        // Dropping `pages` on the early returns releases every lock with
        // the page state untouched.
        if requested > self.config.max_readahead_pages {
            debug!(
                "inode {}: batch of {requested} pages exceeds read-ahead window {}",
                inode.ino(),
                self.config.max_readahead_pages
            );
            return Err(FileOpsError::ResourceExhausted { requested });
        }
        let mut batch: Vec<LockedPage> = Vec::new();
        if batch.try_reserve_exact(requested).is_err() {
            return Err(FileOpsError::ResourceExhausted { requested });
        }
        batch.extend(pages);

        let res = self.engine.getpage(inode, &mut batch).await;
        if let Err(e) = &res {
            debug!(
                "inode {} batch fault of {requested} pages at {} failed: {e}",
                inode.ino(),
                batch[0].index()
            );
        }
        for page in batch {
            if res.is_ok() {
                page.set_uptodate();
            } else {
                page.set_error();
            }
            page.unlock();
        }
        surface("getpage", res)
    }

    /// Hand one dirty page to the engine. A committed page is left clean
    /// whether or not the caller cleared its dirty bit. A page the engine
    /// refused is dirtied again so a later writeback pass picks it up.
    pub async fn commit_page(
        &self,
        inode: &Inode,
        page: LockedPage,
        wbc: &WritebackControl,
    ) -> Result<()> {
        let res = self.engine.putpage(inode, &page, wbc).await;
        match &res {
            Ok(()) => {
                trace!("inode {} page {} committed", inode.ino(), page.index());
                page.set_uptodate();
                page.clear_dirty();
            }
            Err(e) => {
                warn!("inode {} page {} commit failed: {e}", inode.ino(), page.index());
                page.set_error();
                page.set_dirty();
            }
        }
        page.unlock();
        surface("putpage", res)
    }
}

struct CommitWriter<'a, E: ?Sized> {
    bridge: &'a MappedPageBridge<E>,
    inode: &'a Inode,
}

#[async_trait]
impl<E: StorageEngine + ?Sized> PageWriter for CommitWriter<'_, E> {
    async fn write_page(&self, page: LockedPage, wbc: &WritebackControl) -> Result<()> {
        self.bridge.commit_page(self.inode, page, wbc).await
    }
}

#[async_trait]
impl<E: StorageEngine + ?Sized> AddressSpaceOperations for MappedPageBridge<E> {
    async fn readpage(&self, inode: &Inode, page: LockedPage) -> Result<()> {
        self.fetch_page(inode, page).await
    }

    async fn readpages(&self, inode: &Inode, pages: Vec<LockedPage>) -> Result<()> {
        self.fetch_pages(inode, pages).await
    }

    async fn writepage(
        &self,
        inode: &Inode,
        page: LockedPage,
        wbc: &WritebackControl,
    ) -> Result<()> {
        self.commit_page(inode, page, wbc).await
    }

    async fn writepages(&self, inode: &Inode, wbc: &WritebackControl) -> Result<usize> {
        let writer = CommitWriter {
            bridge: self,
            inode,
        };
        let written = write_cache_pages(inode.mapping(), wbc, &writer).await?;
        debug!("inode {}: wrote back {written} pages", inode.ino());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOp, MemoryEngine};
    use crate::error::EngineError;
    use crate::flags::{Credential, OpenFlags, VmFlags};
    use crate::inode::MapState;
    use crate::page::PageState;
    use crate::uio::{UioSeg, write_common};

    const PAGE: usize = 64;

    async fn setup(len: usize) -> (Arc<MemoryEngine>, MappedPageBridge<MemoryEngine>, Arc<Inode>) {
        let config = BridgeConfig {
            page_size: PAGE,
            max_readahead_pages: 4,
        };
        let engine = Arc::new(MemoryEngine::new(config.clone()));
        let cred = Credential::root();
        let inode = engine.create_file(&engine.root(), "m", 0o644, &cred).unwrap();
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        write_common(engine.as_ref(), &inode, &data, 0, UioSeg::SysSpace, OpenFlags::WRONLY, &cred)
            .await
            .unwrap();
        (engine.clone(), MappedPageBridge::new(engine, config), inode)
    }

    fn vma(flags: VmFlags) -> VmArea {
        VmArea {
            start: 0x7f00_0000_0000,
            end: 0x7f00_0000_0000 + 4 * PAGE,
            pgoff: 0,
            flags,
        }
    }

    #[tokio::test]
    async fn test_map_region_sets_mapped_once() {
        let (engine, bridge, inode) = setup(10).await;
        assert_eq!(inode.map_state(), MapState::Unmapped);
        bridge.map_region(&inode, &vma(VmFlags::READ)).await.unwrap();
        assert_eq!(inode.map_state(), MapState::Mapped);
        bridge.map_region(&inode, &vma(VmFlags::READ)).await.unwrap();
        assert_eq!(inode.map_state(), MapState::Mapped);
        assert_eq!(engine.calls(EngineOp::Map), 2);
    }

    #[tokio::test]
    async fn test_map_refused_leaves_unmapped() {
        let (engine, bridge, inode) = setup(10).await;
        engine.fail_next(EngineOp::Map, EngineError::NoDevice);
        let err = bridge
            .map_region(&inode, &vma(VmFlags::READ))
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENODEV);
        assert_eq!(inode.map_state(), MapState::Unmapped);
    }

    #[tokio::test]
    async fn test_fetch_page_fills_and_unlocks() {
        let (_engine, bridge, inode) = setup(PAGE + 10).await;
        let page = inode.mapping().grab_page(1).await;
        let cache_page = page.page().clone();
        bridge.fetch_page(&inode, page).await.unwrap();

        assert_eq!(cache_page.state(), PageState::Uptodate);
        assert_eq!(cache_page.unlock_count(), 1);
        let contents = cache_page.contents().await;
        assert_eq!(contents[0], PAGE as u8);
        assert_eq!(contents[9], PAGE as u8 + 9);
        assert!(contents[10..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_fetch_page_failure_marks_error() {
        let (engine, bridge, inode) = setup(10).await;
        engine.fail_next(EngineOp::GetPage, EngineError::Corrupted("bad block".into()));
        let page = inode.mapping().grab_page(0).await;
        let cache_page = page.page().clone();

        let err = bridge.fetch_page(&inode, page).await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(cache_page.state(), PageState::Error);
        assert!(!cache_page.is_locked());
        assert_eq!(cache_page.unlock_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_over_window_is_resource_exhausted() {
        let (engine, bridge, inode) = setup(10).await;
        let mut pages = Vec::new();
        for index in 0..5 {
            pages.push(inode.mapping().grab_page(index).await);
        }
        let handles: Vec<_> = pages.iter().map(|p| p.page().clone()).collect();

        let err = bridge.fetch_pages(&inode, pages).await.unwrap_err();
        assert!(matches!(err, FileOpsError::ResourceExhausted { requested: 5 }));
        assert_eq!(engine.calls(EngineOp::GetPage), 0);
        for page in handles {
            assert_eq!(page.state(), PageState::Absent);
            assert_eq!(page.unlock_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_commit_failure_redirties() {
        let (engine, bridge, inode) = setup(PAGE).await;
        let mut page = inode.mapping().grab_page(0).await;
        page.data_mut().fill(0xaa);
        page.set_uptodate();
        let cache_page = page.page().clone();
        engine.fail_next(EngineOp::PutPage, EngineError::NoSpace);

        let err = bridge
            .commit_page(&inode, page, &WritebackControl::integrity())
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        assert!(cache_page.has_error());
        assert!(cache_page.is_dirty());
        assert!(!cache_page.is_uptodate());
        assert_eq!(cache_page.unlock_count(), 1);
        assert_eq!(engine.contents(inode.ino()).unwrap()[0], 0);
    }
}
