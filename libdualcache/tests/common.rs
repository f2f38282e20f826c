use std::sync::Arc;

use libdualcache::engine::MemoryEngine;
use libdualcache::{
    BridgeConfig, Credential, FileHandle, FileMode, Inode, OpenFlags, OperationTable, VmArea,
    VmFlags,
};

pub struct Fixture {
    pub engine: Arc<MemoryEngine>,
    pub table: OperationTable<MemoryEngine>,
    pub config: BridgeConfig,
    pub cred: Credential,
}

impl Fixture {
    pub fn new(page_size: usize, max_readahead_pages: usize) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = BridgeConfig {
            page_size,
            max_readahead_pages,
        };
        let engine = Arc::new(MemoryEngine::new(config.clone()));
        let table = OperationTable::new(engine.clone(), config.clone());
        Self {
            engine,
            table,
            config,
            cred: Credential::root(),
        }
    }

    /// Create `name` holding `contents` and open it read-write.
    pub async fn file_with(&self, name: &str, contents: &[u8]) -> (Arc<Inode>, FileHandle) {
        let inode = self
            .engine
            .create_file(&self.engine.root(), name, 0o644, &self.cred)
            .unwrap();
        let ops = self.table.file_operations(&inode);
        let file = ops
            .open(
                inode.clone(),
                FileMode::READ | FileMode::WRITE,
                OpenFlags::RDWR,
                &self.cred,
            )
            .await
            .unwrap();
        let mut pos = 0;
        ops.write(&file, contents, &mut pos, &self.cred).await.unwrap();
        (inode, file)
    }

    pub fn shared_vma(&self, pages: usize) -> VmArea {
        VmArea {
            start: 0x7f00_0000_0000,
            end: 0x7f00_0000_0000 + pages * self.config.page_size,
            pgoff: 0,
            flags: VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED,
        }
    }

    pub async fn read_at(&self, file: &FileHandle, pos: u64, len: usize) -> Vec<u8> {
        let ops = self.table.file_operations(file.inode());
        let mut buf = vec![0u8; len];
        let mut pos = pos;
        let n = ops.read(file, &mut buf, &mut pos, &self.cred).await.unwrap();
        buf.truncate(n);
        buf
    }
}
