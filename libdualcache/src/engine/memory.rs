//! In-memory engine: backing cache and durable copy held in process
//! memory. Used by the demo binary and the tests, and as the reference for
//! the engine-side half of the dual-cache contract.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use super::{DirEntry, StorageEngine};
use crate::attr::EngineAttrFlags;
use crate::config::BridgeConfig;
use crate::error::EngineError;
use crate::flags::{Credential, FileMode, OpenFlags, VmFlags};
use crate::inode::{FileKind, Inode};
use crate::mapping::WritebackControl;
use crate::page::LockedPage;
use crate::uio::Uio;

pub const ROOT_INO: u64 = 1;

/// Default cap on the size a write may grow a file to.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// Engine entry points, for call accounting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Open,
    Close,
    Read,
    Write,
    Readdir,
    Fsync,
    Map,
    GetPage,
    PutPage,
    GetFlags,
    SetFlags,
}

struct Node {
    inode: Arc<Inode>,
    /// Backing cache contents.
    data: Vec<u8>,
    /// Contents as of the last fsync.
    durable: Vec<u8>,
    attrs: EngineAttrFlags,
    children: BTreeMap<String, u64>,
    parent: u64,
    opens: u32,
}

impl Node {
    fn new(inode: Arc<Inode>, parent: u64) -> Self {
        Self {
            inode,
            data: Vec::new(),
            durable: Vec::new(),
            attrs: EngineAttrFlags::empty(),
            children: BTreeMap::new(),
            parent,
            opens: 0,
        }
    }
}

pub struct MemoryEngine {
    config: BridgeConfig,
    max_file_size: u64,
    next_ino: AtomicU64,
    nodes: RwLock<HashMap<u64, Node>>,
    /// Held across a write and its page update so resident pages see
    /// writes in the same order as the backing cache. Taken before any
    /// page lock.
    write_lock: tokio::sync::Mutex<()>,
    calls: Mutex<HashMap<EngineOp, usize>>,
    faults: Mutex<HashMap<EngineOp, VecDeque<EngineError>>>,
}

impl MemoryEngine {
    pub fn new(config: BridgeConfig) -> Self {
        let root = Arc::new(Inode::new(
            ROOT_INO,
            FileKind::Directory,
            0,
            0,
            0o777,
            config.page_size,
        ));
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(root, ROOT_INO));
        Self {
            config,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            next_ino: AtomicU64::new(ROOT_INO + 1),
            nodes: RwLock::new(nodes),
            write_lock: tokio::sync::Mutex::new(()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Largest size a write may grow a file to; larger writes fail with
    /// `EFBIG`.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn root(&self) -> Arc<Inode> {
        self.nodes.read().unwrap()[&ROOT_INO].inode.clone()
    }

    pub fn lookup(&self, parent: &Inode, name: &str) -> Option<Arc<Inode>> {
        let nodes = self.nodes.read().unwrap();
        let ino = nodes.get(&parent.ino())?.children.get(name)?;
        nodes.get(ino).map(|n| n.inode.clone())
    }

    pub fn create_file(
        &self,
        parent: &Inode,
        name: &str,
        mode: u32,
        cred: &Credential,
    ) -> Result<Arc<Inode>, EngineError> {
        self.create(parent, name, FileKind::Regular, mode, cred)
    }

    pub fn mkdir(
        &self,
        parent: &Inode,
        name: &str,
        mode: u32,
        cred: &Credential,
    ) -> Result<Arc<Inode>, EngineError> {
        self.create(parent, name, FileKind::Directory, mode, cred)
    }

    fn create(
        &self,
        parent: &Inode,
        name: &str,
        kind: FileKind,
        mode: u32,
        cred: &Credential,
    ) -> Result<Arc<Inode>, EngineError> {
        if !parent.is_dir() {
            return Err(EngineError::Status(libc::ENOTDIR));
        }
        access(parent, FileMode::WRITE, cred)?;
        let mut nodes = self.nodes.write().unwrap();
        let dir = nodes.get(&parent.ino()).ok_or(EngineError::NotFound)?;
        if dir.children.contains_key(name) {
            return Err(EngineError::Status(libc::EEXIST));
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let inode = Arc::new(Inode::new(
            ino,
            kind,
            cred.uid,
            cred.gid,
            mode & 0o777,
            self.config.page_size,
        ));
        nodes.insert(ino, Node::new(inode.clone(), parent.ino()));
        if let Some(dir) = nodes.get_mut(&parent.ino()) {
            dir.children.insert(name.to_string(), ino);
        }
        debug!("created {kind:?} {name} as inode {ino}");
        Ok(inode)
    }

    /// Number of times `op` was entered.
    pub fn calls(&self, op: EngineOp) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: EngineOp, err: EngineError) {
        self.faults
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Backing cache contents of `ino`.
    pub fn contents(&self, ino: u64) -> Option<Vec<u8>> {
        self.nodes.read().unwrap().get(&ino).map(|n| n.data.clone())
    }

    /// Contents of `ino` as of its last fsync.
    pub fn durable_contents(&self, ino: u64) -> Option<Vec<u8>> {
        self.nodes.read().unwrap().get(&ino).map(|n| n.durable.clone())
    }

    pub fn open_count(&self, ino: u64) -> u32 {
        self.nodes
            .read()
            .unwrap()
            .get(&ino)
            .map(|n| n.opens)
            .unwrap_or(0)
    }

    fn enter(&self, op: EngineOp) -> Result<(), EngineError> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
        match self
            .faults
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(|q| q.pop_front())
        {
            Some(err) => {
                debug!("injected {op:?} failure: {err}");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn attrs_of(&self, inode: &Inode) -> Result<EngineAttrFlags, EngineError> {
        self.nodes
            .read()
            .unwrap()
            .get(&inode.ino())
            .map(|n| n.attrs)
            .ok_or(EngineError::NotFound)
    }
}

fn access(inode: &Inode, want: FileMode, cred: &Credential) -> Result<(), EngineError> {
    if cred.privileged {
        return Ok(());
    }
    let bits = if cred.uid == inode.uid() {
        inode.mode() >> 6
    } else if cred.gid == inode.gid() {
        inode.mode() >> 3
    } else {
        inode.mode()
    };
    let mut need = 0;
    if want.contains(FileMode::READ) {
        need |= 0o4;
    }
    if want.contains(FileMode::WRITE) {
        need |= 0o2;
    }
    if want.contains(FileMode::EXEC) {
        need |= 0o1;
    }
    if bits & need == need {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied)
    }
}

fn check_writable(attrs: EngineAttrFlags, flags: OpenFlags) -> Result<(), EngineError> {
    if attrs.intersects(EngineAttrFlags::IMMUTABLE | EngineAttrFlags::READONLY) {
        return Err(EngineError::NotPermitted);
    }
    if attrs.contains(EngineAttrFlags::APPENDONLY) && !flags.contains(OpenFlags::APPEND) {
        return Err(EngineError::NotPermitted);
    }
    Ok(())
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open(
        &self,
        inode: &Inode,
        mode: FileMode,
        flags: OpenFlags,
        cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Open)?;
        let attrs = self.attrs_of(inode)?;
        if mode.contains(FileMode::WRITE) {
            if inode.is_dir() {
                return Err(EngineError::Status(libc::EISDIR));
            }
            check_writable(attrs, flags)?;
        }
        access(inode, mode, cred)?;
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.get_mut(&inode.ino()).ok_or(EngineError::NotFound)?;
        node.opens += 1;
        Ok(())
    }

    async fn close(
        &self,
        inode: &Inode,
        _flags: OpenFlags,
        _cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Close)?;
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.get_mut(&inode.ino()).ok_or(EngineError::NotFound)?;
        node.opens = node.opens.saturating_sub(1);
        Ok(())
    }

    async fn read(
        &self,
        inode: &Inode,
        uio: &mut Uio<'_>,
        _flags: OpenFlags,
        _cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Read)?;
        if inode.is_dir() {
            return Err(EngineError::Status(libc::EISDIR));
        }
        let offset = uio.offset();
        let mut chunk = {
            let nodes = self.nodes.read().unwrap();
            let node = nodes.get(&inode.ino()).ok_or(EngineError::NotFound)?;
            let size = node.data.len() as u64;
            if offset >= size {
                return Ok(());
            }
            let n = (uio.resid() as u64).min(size - offset) as usize;
            node.data[offset as usize..offset as usize + n].to_vec()
        };
        if inode.is_mapped() {
            inode.mapping().overlay_range(offset, &mut chunk).await;
        }
        uio.copy_out(&chunk);
        Ok(())
    }

    async fn write(
        &self,
        inode: &Inode,
        uio: &mut Uio<'_>,
        flags: OpenFlags,
        _cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Write)?;
        if inode.is_dir() {
            return Err(EngineError::Status(libc::EISDIR));
        }
        let offset = uio.offset();
        let end = offset
            .checked_add(uio.resid() as u64)
            .filter(|end| *end <= uio.limit() && *end <= self.max_file_size)
            .ok_or(EngineError::FileTooLarge)?;
        check_writable(self.attrs_of(inode)?, flags)?;

        let mut chunk = vec![0u8; uio.resid()];
        uio.copy_in(&mut chunk);
        let _serial = self.write_lock.lock().await;
        // Pages stay locked until both caches hold the bytes, so a commit
        // cannot store an older page image over this write.
        let mut range = if inode.is_mapped() {
            Some(inode.mapping().lock_range(offset, chunk.len()).await)
        } else {
            None
        };
        {
            let mut nodes = self.nodes.write().unwrap();
            let node = nodes.get_mut(&inode.ino()).ok_or(EngineError::NotFound)?;
            let len = node.data.len();
            if len < end as usize {
                node.data.try_reserve(end as usize - len).map_err(|e| {
                    warn!("inode {}: cannot grow to {end} bytes: {e}", inode.ino());
                    EngineError::NoSpace
                })?;
                node.data.resize(end as usize, 0);
            }
            node.data[offset as usize..end as usize].copy_from_slice(&chunk);
            inode.extend_size(end);
        }
        let copied = match range.as_mut() {
            Some(range) => range.update(&chunk),
            // mapped while this write was in flight
            None if inode.is_mapped() => inode.mapping().update_range(offset, &chunk).await,
            None => 0,
        };
        if copied > 0 {
            trace!("inode {}: {copied} bytes pushed into resident pages", inode.ino());
        }
        Ok(())
    }

    async fn readdir(
        &self,
        inode: &Inode,
        cursor: &mut u64,
        emit: &mut (dyn for<'e> FnMut(&'e DirEntry) -> bool + Send),
        _cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Readdir)?;
        if !inode.is_dir() {
            return Err(EngineError::Status(libc::ENOTDIR));
        }
        let entries: Vec<DirEntry> = {
            let nodes = self.nodes.read().unwrap();
            let node = nodes.get(&inode.ino()).ok_or(EngineError::NotFound)?;
            let dots = [(".", inode.ino()), ("..", node.parent)];
            dots.into_iter()
                .map(|(name, ino)| (name.to_string(), ino, FileKind::Directory))
                .chain(node.children.iter().filter_map(|(name, ino)| {
                    nodes.get(ino).map(|n| (name.clone(), *ino, n.inode.kind()))
                }))
                .enumerate()
                .map(|(pos, (name, ino, kind))| DirEntry {
                    name,
                    ino,
                    kind,
                    next: pos as u64 + 1,
                })
                .collect()
        };
        for entry in entries.iter().skip(*cursor as usize) {
            if !emit(entry) {
                break;
            }
            *cursor = entry.next;
        }
        Ok(())
    }

    async fn fsync(
        &self,
        inode: &Inode,
        _datasync: bool,
        _cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Fsync)?;
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.get_mut(&inode.ino()).ok_or(EngineError::NotFound)?;
        node.durable = node.data.clone();
        Ok(())
    }

    async fn map(
        &self,
        inode: &Inode,
        pgoff: u64,
        _addr: usize,
        len: usize,
        vm_flags: VmFlags,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::Map)?;
        if inode.is_dir() {
            return Err(EngineError::NoDevice);
        }
        let attrs = self.attrs_of(inode)?;
        if vm_flags.contains(VmFlags::SHARED | VmFlags::WRITE)
            && attrs.intersects(
                EngineAttrFlags::IMMUTABLE
                    | EngineAttrFlags::READONLY
                    | EngineAttrFlags::APPENDONLY,
            )
        {
            return Err(EngineError::NotPermitted);
        }
        pgoff
            .checked_mul(self.config.page_size as u64)
            .and_then(|start| start.checked_add(len as u64))
            .filter(|end| *end <= crate::uio::MAXOFFSET)
            .ok_or(EngineError::Status(libc::ENXIO))?;
        Ok(())
    }

    async fn getpage(&self, inode: &Inode, pages: &mut [LockedPage]) -> Result<(), EngineError> {
        self.enter(EngineOp::GetPage)?;
        let page_size = inode.mapping().page_size() as u64;
        let nodes = self.nodes.read().unwrap();
        let node = nodes.get(&inode.ino()).ok_or(EngineError::NotFound)?;
        let size = node.data.len() as u64;
        for page in pages.iter_mut() {
            let start = page.index() * page_size;
            let buf = page.data_mut();
            buf.fill(0);
            if start < size {
                let n = (size - start).min(page_size) as usize;
                buf[..n].copy_from_slice(&node.data[start as usize..start as usize + n]);
            }
        }
        Ok(())
    }

    async fn putpage(
        &self,
        inode: &Inode,
        page: &LockedPage,
        _wbc: &WritebackControl,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::PutPage)?;
        let page_size = inode.mapping().page_size() as u64;
        let start = page.index() * page_size;
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.get_mut(&inode.ino()).ok_or(EngineError::NotFound)?;
        let size = node.data.len() as u64;
        // Stores past EOF through a mapping are dropped; putpage never extends.
        if start >= size {
            return Ok(());
        }
        let n = (size - start).min(page_size) as usize;
        node.data[start as usize..start as usize + n].copy_from_slice(&page.data()[..n]);
        Ok(())
    }

    async fn getflags(&self, inode: &Inode) -> Result<EngineAttrFlags, EngineError> {
        self.enter(EngineOp::GetFlags)?;
        self.attrs_of(inode)
    }

    async fn setflags(
        &self,
        inode: &Inode,
        flags: EngineAttrFlags,
        cred: &Credential,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::SetFlags)?;
        if !cred.is_owner_or_cap(inode.uid()) {
            return Err(EngineError::NotPermitted);
        }
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.get_mut(&inode.ino()).ok_or(EngineError::NotFound)?;
        node.attrs = flags;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uio::UioSeg;

    fn engine() -> MemoryEngine {
        MemoryEngine::new(BridgeConfig {
            page_size: 16,
            ..BridgeConfig::default()
        })
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let engine = engine();
        let root = engine.root();
        let cred = Credential::user(1000, 1000);
        let file = engine.create_file(&root, "a", 0o640, &cred).unwrap();
        assert_eq!(file.uid(), 1000);
        assert_eq!(engine.lookup(&root, "a").unwrap().ino(), file.ino());
        assert!(engine.lookup(&root, "b").is_none());
        let err = engine.create_file(&root, "a", 0o640, &cred).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
        let err = engine.create_file(&file, "x", 0o640, &cred).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
    }

    #[tokio::test]
    async fn test_open_checks_mode_bits() {
        let engine = engine();
        let owner = Credential::user(1000, 1000);
        let file = engine.create_file(&engine.root(), "a", 0o640, &owner).unwrap();

        engine
            .open(&file, FileMode::READ | FileMode::WRITE, OpenFlags::RDWR, &owner)
            .await
            .unwrap();
        let group = Credential::user(2000, 1000);
        engine
            .open(&file, FileMode::READ, OpenFlags::empty(), &group)
            .await
            .unwrap();
        let err = engine
            .open(&file, FileMode::WRITE, OpenFlags::WRONLY, &group)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied));
        assert_eq!(engine.open_count(file.ino()), 2);
    }

    #[tokio::test]
    async fn test_immutable_blocks_writes_and_shared_maps() {
        let engine = engine();
        let root = Credential::root();
        let file = engine.create_file(&engine.root(), "a", 0o644, &root).unwrap();
        engine
            .setflags(&file, EngineAttrFlags::IMMUTABLE, &root)
            .await
            .unwrap();

        let mut uio = Uio::for_write(b"x", 0, UioSeg::SysSpace);
        let err = engine
            .write(&file, &mut uio, OpenFlags::WRONLY, &root)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotPermitted));
        let err = engine
            .map(&file, 0, 0x1000, 16, VmFlags::SHARED | VmFlags::WRITE)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotPermitted));
        engine.map(&file, 0, 0x1000, 16, VmFlags::READ).await.unwrap();
    }

    #[tokio::test]
    async fn test_readdir_resumes_from_cursor() {
        let engine = engine();
        let root = engine.root();
        let cred = Credential::root();
        for name in ["c", "a", "b"] {
            engine.create_file(&root, name, 0o644, &cred).unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = 0;
        engine
            .readdir(
                &root,
                &mut cursor,
                &mut |e: &DirEntry| {
                    seen.push(e.name.clone());
                    seen.len() < 3
                },
                &cred,
            )
            .await
            .unwrap();
        assert_eq!(cursor, 2);
        engine
            .readdir(
                &root,
                &mut cursor,
                &mut |e: &DirEntry| {
                    seen.push(e.name.clone());
                    true
                },
                &cred,
            )
            .await
            .unwrap();
        assert_eq!(seen, vec![".", "..", "a", "a", "b", "c"]);
        assert_eq!(cursor, 5);
    }

    #[tokio::test]
    async fn test_write_past_size_cap_is_too_large() {
        let engine = engine().with_max_file_size(1 << 20);
        let cred = Credential::root();
        let file = engine.create_file(&engine.root(), "a", 0o644, &cred).unwrap();
        let mut uio = Uio::for_write(b"head", 0, UioSeg::SysSpace);
        engine.write(&file, &mut uio, OpenFlags::WRONLY, &cred).await.unwrap();

        let mut uio = Uio::for_write(b"x", 1 << 40, UioSeg::SysSpace);
        let err = engine
            .write(&file, &mut uio, OpenFlags::WRONLY, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FileTooLarge));
        assert_eq!(err.errno(), libc::EFBIG);
        assert_eq!(file.size(), 4);
        assert_eq!(engine.contents(file.ino()).unwrap(), b"head");

        let mut uio = Uio::for_write(b"x", (1 << 20) - 1, UioSeg::SysSpace);
        engine.write(&file, &mut uio, OpenFlags::WRONLY, &cred).await.unwrap();
        assert_eq!(file.size(), 1 << 20);
    }

    #[tokio::test]
    async fn test_write_waits_for_locked_page() {
        let engine = Arc::new(engine());
        let cred = Credential::root();
        let file = engine.create_file(&engine.root(), "a", 0o644, &cred).unwrap();
        let mut uio = Uio::for_write(&[0u8; 16], 0, UioSeg::SysSpace);
        engine.write(&file, &mut uio, OpenFlags::WRONLY, &cred).await.unwrap();
        assert!(file.mark_mapped());

        let mut page = file.mapping().grab_page(0).await;
        page.set_uptodate();
        let writer = {
            let engine = engine.clone();
            let file = file.clone();
            tokio::spawn(async move {
                let mut uio = Uio::for_write(b"new", 4, UioSeg::SysSpace);
                engine
                    .write(&file, &mut uio, OpenFlags::WRONLY, &Credential::root())
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.contents(file.ino()).unwrap(), vec![0u8; 16]);

        page.data_mut()[..4].copy_from_slice(b"page");
        engine
            .putpage(&file, &page, &WritebackControl::integrity())
            .await
            .unwrap();
        page.unlock();
        writer.await.unwrap().unwrap();

        let data = engine.contents(file.ino()).unwrap();
        assert_eq!(&data[..7], b"pagenew");
        let cached = file.mapping().find_page(0).unwrap().contents().await;
        assert_eq!(&cached[..7], b"pagenew");
    }

    #[tokio::test]
    async fn test_putpage_never_extends_file() {
        let engine = engine();
        let cred = Credential::root();
        let file = engine.create_file(&engine.root(), "a", 0o644, &cred).unwrap();
        let mut uio = Uio::for_write(&[1u8; 20], 0, UioSeg::SysSpace);
        engine.write(&file, &mut uio, OpenFlags::WRONLY, &cred).await.unwrap();

        let mut page = file.mapping().grab_page(1).await;
        page.data_mut().fill(9);
        engine
            .putpage(&file, &page, &WritebackControl::integrity())
            .await
            .unwrap();
        page.unlock();
        let data = engine.contents(file.ino()).unwrap();
        assert_eq!(data.len(), 20);
        assert_eq!(&data[16..], &[9u8; 4]);

        let far = file.mapping().grab_page(5).await;
        engine
            .putpage(&file, &far, &WritebackControl::integrity())
            .await
            .unwrap();
        far.unlock();
        assert_eq!(engine.contents(file.ino()).unwrap().len(), 20);
    }
}
