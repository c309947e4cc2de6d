//! Shared harness for the ordering scenarios: an in-memory buffer cache
//! with a backing disk image, a recording block allocator, and a small
//! in-core inode table standing in for the VFS layer.
#![allow(dead_code)] // not every scenario binary uses every helper

use ordfs_buf::{BufferCache, MemBufCache};
use ordfs_core::{
    BlockAllocator, FreedInode, InodeVfs, LinkCounts, SoftdepConfig, SoftdepEngine,
};
use ordfs_error::Result;
use ordfs_ondisk::DiskInode;
use ordfs_types::{
    BlockNo, BufId, FsGeometry, FsId, InodeNum, LogicalBlock, MountId, NDADDR, NIADDR,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

pub const FS: FsId = FsId(1);
pub const MOUNT: MountId = MountId(1);

/// Physical block that holds the inode block covering `ino`.
pub fn inode_block_of(geo: FsGeometry, ino: InodeNum) -> BlockNo {
    BlockNo(1_000 + ino.0 / u64::from(geo.inodes_per_block()))
}

#[derive(Debug, Default, Clone)]
pub struct InMemInode {
    pub mode: u16,
    pub nlink: u32,
    pub effective: u32,
    pub size: u64,
    pub blocks: u64,
    pub db: [BlockNo; NDADDR],
    pub ib: [BlockNo; NIADDR],
}

impl InMemInode {
    fn to_disk(&self) -> DiskInode {
        DiskInode {
            mode: self.mode,
            nlink: u16::try_from(self.nlink).unwrap_or(u16::MAX),
            size: self.size,
            blocks: self.blocks,
            db: self.db,
            ib: self.ib,
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingAllocator {
    pub freed_blocks: Mutex<Vec<(BlockNo, u32, InodeNum)>>,
    pub freed_inodes: Mutex<Vec<(InodeNum, u16)>>,
}

impl BlockAllocator for RecordingAllocator {
    fn free_blocks_or_fragment(
        &self,
        _fs: FsId,
        block: BlockNo,
        size: u32,
        owner: InodeNum,
    ) -> Result<()> {
        self.freed_blocks.lock().push((block, size, owner));
        Ok(())
    }

    fn free_inode(&self, _fs: FsId, ino: InodeNum, mode: u16) -> Result<()> {
        self.freed_inodes.lock().push((ino, mode));
        Ok(())
    }
}

impl RecordingAllocator {
    pub fn freed_block_numbers(&self) -> Vec<BlockNo> {
        self.freed_blocks.lock().iter().map(|(b, _, _)| *b).collect()
    }
}

/// In-core inode table plus the buffer bindings the engine's collaborator
/// calls need.
pub struct TestVfs {
    geo: FsGeometry,
    cache: Arc<MemBufCache>,
    engine: OnceLock<Arc<SoftdepEngine>>,
    pub inodes: Mutex<HashMap<InodeNum, InMemInode>>,
    inode_bufs: Mutex<HashMap<BlockNo, BufId>>,
    dir_bufs: Mutex<HashMap<InodeNum, BufId>>,
}

impl TestVfs {
    pub fn new(geo: FsGeometry, cache: Arc<MemBufCache>) -> Arc<Self> {
        Arc::new(Self {
            geo,
            cache,
            engine: OnceLock::new(),
            inodes: Mutex::new(HashMap::new()),
            inode_bufs: Mutex::new(HashMap::new()),
            dir_bufs: Mutex::new(HashMap::new()),
        })
    }

    pub fn bind_engine(&self, engine: Arc<SoftdepEngine>) {
        let _ = self.engine.set(engine);
    }

    fn engine(&self) -> &Arc<SoftdepEngine> {
        self.engine.get().expect("engine bound")
    }

    /// Buffer carrying the inode block that covers `ino`.
    pub fn inode_buf(&self, ino: InodeNum) -> BufId {
        let block = inode_block_of(self.geo, ino);
        *self
            .inode_bufs
            .lock()
            .entry(block)
            .or_insert_with(|| self.cache.create_buffer(block))
    }

    pub fn bind_dir_buf(&self, ino: InodeNum, buf: BufId) {
        self.dir_bufs.lock().insert(ino, buf);
    }

    /// Copy the in-core inode into its buffer and hand the dependencies to
    /// the engine, without writing the buffer.
    pub fn push_inode(&self, ino: InodeNum) {
        let buf = self.inode_buf(ino);
        let image = self
            .inodes
            .lock()
            .get(&ino)
            .cloned()
            .unwrap_or_default()
            .to_disk();
        let offset = self.geo.inode_slot_offset(ino);
        self.cache
            .with_buffer_mut(buf, &mut |bytes| {
                image.encode_at(bytes, offset).expect("inode slot encode");
            })
            .expect("inode buffer");
        self.engine().update_inode_block(FS, ino, buf);
        self.cache.mark_dirty(buf).expect("dirty inode buffer");
    }
}

impl InodeVfs for TestVfs {
    fn adjust_link_count(&self, _fs: FsId, ino: InodeNum, delta: i32) -> Result<LinkCounts> {
        let mut inodes = self.inodes.lock();
        let entry = inodes.entry(ino).or_default();
        entry.nlink = u32::try_from(i64::from(entry.nlink) + i64::from(delta)).unwrap_or(0);
        Ok(LinkCounts {
            nlink: entry.nlink,
            effective: entry.effective,
        })
    }

    fn update_inode_on_disk(&self, _fs: FsId, ino: InodeNum) -> Result<()> {
        self.push_inode(ino);
        let buf = self.inode_buf(ino);
        self.cache.flush(buf)?;
        self.engine().process_completions();
        Ok(())
    }

    fn truncate_to_zero(&self, _fs: FsId, ino: InodeNum) -> Result<()> {
        let prev = {
            let mut inodes = self.inodes.lock();
            let entry = inodes.entry(ino).or_default();
            let prev = FreedInode {
                size: entry.size,
                block_count: entry.blocks,
                db: entry.db,
                ib: entry.ib,
            };
            entry.size = 0;
            entry.blocks = 0;
            entry.db = [BlockNo::NONE; NDADDR];
            entry.ib = [BlockNo::NONE; NIADDR];
            prev
        };
        self.push_inode(ino);
        self.engine()
            .setup_freeblocks(FS, ino, prev, self.inode_buf(ino));
        Ok(())
    }

    fn sync_directory_page(&self, _mount: MountId, ino: InodeNum) -> Result<()> {
        let buf = *self
            .dir_bufs
            .lock()
            .get(&ino)
            .expect("directory buffer bound");
        self.cache.flush(buf)?;
        self.engine().process_completions();
        Ok(())
    }
}

/// Everything a scenario needs, wired together.
pub struct Harness {
    pub geo: FsGeometry,
    pub cache: Arc<MemBufCache>,
    pub allocator: Arc<RecordingAllocator>,
    pub vfs: Arc<TestVfs>,
    pub engine: Arc<SoftdepEngine>,
    pub inode_bitmap_buf: BufId,
    pub block_bitmap_buf: BufId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SoftdepConfig::default())
    }

    pub fn with_config(config: SoftdepConfig) -> Self {
        let geo = FsGeometry::new(4096, 1024, 256).expect("geometry");
        let cache = MemBufCache::new(4096);
        let allocator = Arc::new(RecordingAllocator::default());
        let vfs = TestVfs::new(geo, cache.clone());
        let engine = SoftdepEngine::new(
            config,
            cache.clone(),
            allocator.clone(),
            vfs.clone(),
        );
        vfs.bind_engine(engine.clone());
        cache.install_hooks(engine.clone());
        engine.register_mount(MOUNT, FS, geo);
        let inode_bitmap_buf = cache.create_buffer(BlockNo(10));
        let block_bitmap_buf = cache.create_buffer(BlockNo(11));
        Self {
            geo,
            cache,
            allocator,
            vfs,
            engine,
            inode_bitmap_buf,
            block_bitmap_buf,
        }
    }

    /// Mark a new inode allocated: bitmap bit, in-core entry, dependency.
    pub fn alloc_inode(&self, ino: InodeNum, mode: u16, nlink: u32) {
        self.cache
            .with_buffer_mut(self.inode_bitmap_buf, &mut |bytes| {
                ordfs_ondisk::bitmap_set(bytes, u32::try_from(ino.0).expect("inode index"));
            })
            .expect("inode bitmap");
        self.cache
            .mark_dirty(self.inode_bitmap_buf)
            .expect("dirty inode bitmap");
        self.vfs.inodes.lock().insert(
            ino,
            InMemInode {
                mode,
                nlink,
                effective: nlink,
                ..InMemInode::default()
            },
        );
        self.engine
            .setup_inode_map_dep(self.inode_bitmap_buf, FS, ino);
    }

    /// Mark a new block allocated in the block bitmap.
    pub fn alloc_block(&self, blkno: BlockNo) {
        self.cache
            .with_buffer_mut(self.block_bitmap_buf, &mut |bytes| {
                ordfs_ondisk::bitmap_set(bytes, u32::try_from(blkno.0 % 32_768).expect("bit"));
            })
            .expect("block bitmap");
        self.cache
            .mark_dirty(self.block_bitmap_buf)
            .expect("dirty block bitmap");
        self.engine.setup_block_map_dep(self.block_bitmap_buf, FS, blkno);
    }

    /// Allocate a direct block for `ino` at `lbn`: bitmap dependency, data
    /// buffer, pointer update, in-core inode pointer. Returns the data
    /// buffer.
    pub fn alloc_direct(
        &self,
        ino: InodeNum,
        lbn: LogicalBlock,
        new_blkno: BlockNo,
        old_blkno: BlockNo,
        new_size: u32,
        old_size: u32,
        is_dir: bool,
    ) -> BufId {
        self.alloc_block(new_blkno);
        let data_buf = self.cache.create_buffer(new_blkno);
        self.cache.mark_dirty(data_buf).expect("dirty data");
        self.engine.setup_allocdirect(
            FS, ino, lbn, new_blkno, old_blkno, new_size, old_size, is_dir, data_buf,
        );
        {
            let mut inodes = self.vfs.inodes.lock();
            let entry = inodes.entry(ino).or_default();
            if lbn.is_direct() {
                entry.db[lbn.0 as usize] = new_blkno;
            } else {
                entry.ib[lbn.0 as usize - NDADDR] = new_blkno;
            }
            let end = lbn.0 * u64::from(self.geo.block_size()) + u64::from(new_size);
            if lbn.is_direct() && end > entry.size {
                entry.size = end;
            }
            entry.blocks += 1;
        }
        data_buf
    }

    /// Write `buf` through the pipeline and drain completions.
    pub fn flush(&self, buf: BufId) {
        self.cache.flush(buf).expect("flush");
        self.engine.process_completions();
    }

    /// Durable view of the inode, decoded from the disk image.
    pub fn disk_inode(&self, ino: InodeNum) -> Option<DiskInode> {
        let block = inode_block_of(self.geo, ino);
        let image = self.cache.disk_image(block)?;
        let offset = self.geo.inode_slot_offset(ino);
        Some(DiskInode::decode_at(&image, offset).expect("disk inode decode"))
    }

    /// Create a directory page buffer for `dir_ino` backed by `blkno`.
    pub fn create_dir_page(&self, dir_ino: InodeNum, blkno: BlockNo) -> BufId {
        let buf = self.cache.create_buffer(blkno);
        self.vfs.bind_dir_buf(dir_ino, buf);
        buf
    }

    /// Write a directory entry in memory and record the dependency. The
    /// target's link count must already be recorded via
    /// `change_link_count`.
    pub fn add_dir_entry(
        &self,
        dir_buf: BufId,
        dir_ino: InodeNum,
        diroffset: u64,
        target: InodeNum,
        newdir_buf: Option<BufId>,
    ) {
        let offset = self.geo.byte_offset_in_block(diroffset);
        self.cache
            .with_buffer_mut(dir_buf, &mut |bytes| {
                ordfs_ondisk::set_dir_entry_ino(bytes, offset, target.0).expect("entry write");
            })
            .expect("dir buffer");
        self.cache.mark_dirty(dir_buf).expect("dirty dir");
        self.engine
            .setup_directory_add(dir_buf, FS, dir_ino, diroffset, target, newdir_buf, false);
    }

    /// Remove a directory entry in memory and record the dependency.
    pub fn remove_dir_entry(
        &self,
        dir_buf: BufId,
        dir_ino: InodeNum,
        diroffset: u64,
        target: InodeNum,
        is_rmdir: bool,
    ) {
        let offset = self.geo.byte_offset_in_block(diroffset);
        self.cache
            .with_buffer_mut(dir_buf, &mut |bytes| {
                ordfs_ondisk::set_dir_entry_ino(bytes, offset, 0).expect("entry clear");
            })
            .expect("dir buffer");
        self.cache.mark_dirty(dir_buf).expect("dirty dir");
        let (nlink, effective) = {
            let mut inodes = self.vfs.inodes.lock();
            let entry = inodes.entry(target).or_default();
            entry.effective = entry.effective.saturating_sub(1);
            (entry.nlink, entry.effective)
        };
        // The caller records the link gap; the engine drops the on-disk
        // count only once the zeroed entry is durable.
        self.engine.change_link_count(FS, target, nlink, effective);
        self.engine
            .setup_remove(dir_buf, FS, dir_ino, diroffset, target, is_rmdir);
    }
}
