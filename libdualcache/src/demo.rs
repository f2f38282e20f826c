//! End-to-end walkthroughs against [`MemoryEngine`], run by the `dualcache`
//! binary.

use std::sync::Arc;

use anyhow::{Context, ensure};

use crate::config::BridgeConfig;
use crate::engine::MemoryEngine;
use crate::flags::{Credential, FileMode, OpenFlags, VmArea, VmFlags};
use crate::mapping::{WritebackControl, filemap_fault, filemap_store};
use crate::ops::OperationTable;

/// Names of the scenarios [`run`] knows.
pub const SCENARIOS: [&str; 3] = ["reopen", "map-then-write", "store-writeback"];

pub async fn run(name: &str, config: BridgeConfig) -> anyhow::Result<()> {
    match name {
        "reopen" => reopen(config).await,
        "map-then-write" => map_then_write(config).await,
        "store-writeback" => store_writeback(config).await,
        other => anyhow::bail!("unknown scenario {other:?}"),
    }
}

fn setup(config: BridgeConfig) -> (Arc<MemoryEngine>, OperationTable<MemoryEngine>) {
    let engine = Arc::new(MemoryEngine::new(config.clone()));
    let table = OperationTable::new(engine.clone(), config);
    (engine, table)
}

fn shared_rw(config: &BridgeConfig, pages: usize) -> VmArea {
    VmArea {
        start: 0x7f00_0000_0000,
        end: 0x7f00_0000_0000 + pages * config.page_size,
        pgoff: 0,
        flags: VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED,
    }
}

/// Write through one open, read it back through another.
pub async fn reopen(config: BridgeConfig) -> anyhow::Result<()> {
    let (engine, table) = setup(config);
    let cred = Credential::user(1000, 1000);
    let root = engine.root();
    let inode = engine.create_file(&root, "notes", 0o644, &cred)?;
    let ops = table.file_operations(&inode);

    let file = ops
        .open(inode.clone(), FileMode::WRITE, OpenFlags::WRONLY, &cred)
        .await?;
    let mut pos = 0;
    let n = ops.write(&file, b"hello, world", &mut pos, &cred).await?;
    ops.release(file, &cred).await?;
    info!("reopen: wrote {n} bytes to inode {}", inode.ino());

    let file = ops
        .open(inode.clone(), FileMode::READ, OpenFlags::empty(), &cred)
        .await?;
    let mut buf = vec![0u8; 64];
    let mut pos = 0;
    let n = ops.read(&file, &mut buf, &mut pos, &cred).await?;
    ops.release(file, &cred).await?;
    ensure!(&buf[..n] == b"hello, world", "read back {:?}", &buf[..n]);
    Ok(())
}

/// Map a file, fault a page, then write through the ordinary path: the
/// resident page and a fresh fault both see the write.
pub async fn map_then_write(config: BridgeConfig) -> anyhow::Result<()> {
    let (engine, table) = setup(config.clone());
    let cred = Credential::root();
    let inode = engine.create_file(&engine.root(), "mapped", 0o644, &cred)?;
    let ops = table.file_operations(&inode);
    let aops = table.address_space_operations();

    let file = ops
        .open(
            inode.clone(),
            FileMode::READ | FileMode::WRITE,
            OpenFlags::RDWR,
            &cred,
        )
        .await?;
    let mut pos = 0;
    ops.write(&file, b"abcdef", &mut pos, &cred).await?;
    ops.mmap(&file, &shared_rw(&config, 1)).await?;

    let page = filemap_fault(aops, &inode, 0).await?;
    ensure!(page.contents().await.starts_with(b"abcdef"), "first fault");

    let mut pos = 1;
    ops.write(&file, b"XY", &mut pos, &cred).await?;
    ensure!(
        page.contents().await.starts_with(b"aXYdef"),
        "resident page missed the write"
    );

    drop(page);
    ensure!(inode.mapping().evict(0), "page 0 still busy");
    let page = filemap_fault(aops, &inode, 0).await?;
    ensure!(
        page.contents().await.starts_with(b"aXYdef"),
        "refault missed the write"
    );
    info!("map-then-write: both caches agree on inode {}", inode.ino());
    ops.release(file, &cred).await?;
    Ok(())
}

/// Store through a shared mapping, write back, and read through the
/// ordinary path.
pub async fn store_writeback(config: BridgeConfig) -> anyhow::Result<()> {
    let (engine, table) = setup(config.clone());
    let cred = Credential::root();
    let inode = engine.create_file(&engine.root(), "stored", 0o644, &cred)?;
    let ops = table.file_operations(&inode);
    let aops = table.address_space_operations();

    let file = ops
        .open(
            inode.clone(),
            FileMode::READ | FileMode::WRITE,
            OpenFlags::RDWR,
            &cred,
        )
        .await?;
    let mut pos = 0;
    let data = vec![b'.'; 2 * config.page_size];
    ops.write(&file, &data, &mut pos, &cred).await?;
    ops.mmap(&file, &shared_rw(&config, 2)).await?;

    let at = config.page_size as u64 - 2;
    filemap_store(aops, &inode, at, b"SPAN").await?;
    let written = aops
        .writepages(&inode, &WritebackControl::integrity())
        .await
        .context("writeback")?;
    ensure!(written == 2, "expected two pages written back, got {written}");

    let mut buf = [0u8; 4];
    let mut pos = at;
    ops.read(&file, &mut buf, &mut pos, &cred).await?;
    ensure!(&buf == b"SPAN", "ordinary read saw {buf:?}");
    ops.fsync(&file, false, &cred).await?;
    let durable = engine
        .durable_contents(inode.ino())
        .context("inode vanished")?;
    ensure!(&durable[at as usize..at as usize + 4] == b"SPAN");
    info!("store-writeback: {written} pages committed to inode {}", inode.ino());
    ops.release(file, &cred).await?;
    Ok(())
}
