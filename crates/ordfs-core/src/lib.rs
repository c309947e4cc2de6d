#![forbid(unsafe_code)]
//! Soft-updates dependency engine.
//!
//! This crate is the write-ordering core of a journaling-free Unix-style
//! filesystem. Filesystem operations record their intent as typed
//! dependency records attached to the metadata buffers that will carry the
//! changes to disk; every buffer write is bracketed by a rollback
//! (initiation) and a roll-forward (completion) pass; and records whose
//! constraints are fully satisfied funnel into a global FIFO worklist whose
//! handlers perform the one irreversible release action each kind stands
//! for. Two rules fall out of the graph:
//!
//! 1. no on-disk pointer ever references a resource before that resource's
//!    own allocation record is durable, and
//! 2. no resource is freed until every on-disk pointer to it has been
//!    nulled on disk.
//!
//! # Structure
//!
//! | module | role |
//! |--------|------|
//! | [`arena`] | per-kind typed arenas, generational handles |
//! | [`record`] | the fourteen dependency record kinds |
//! | [`tables`] | the three keyed indexes with explicit resize |
//! | [`graph`] | shared state and record lifecycle (internal) |
//! | [`io`] | rollback / roll-forward around buffer writes (internal) |
//! | [`worklist`] | the FIFO of satisfied records and its handlers |
//! | [`limits`] | backpressure ceilings and the background cleaner |
//! | [`config`] | tunables |
//!
//! # Concurrency
//!
//! One lock serializes all graph mutation. Write completion is message
//! passing: the cache's completion hook posts the buffer id to a queue
//! consumed by one drainer task (or by [`SoftdepEngine::process_completions`]
//! directly, which deterministic tests prefer), so completion handling runs
//! in ordinary task context and may block. Lock order is always buffer
//! cache before graph; the engine never calls into the cache while holding
//! the graph lock — deferred cache actions are applied after it is
//! released.

pub mod arena;
pub mod config;
mod graph;
mod io;
mod limits;
pub mod record;
pub mod tables;
mod worklist;

use crate::arena::Handle;
use crate::graph::{GraphCore, MountInfo, UpdList};
use crate::limits::{Limits, PressureKind};
use crate::record::{
    AllocDirect, AllocIndir, CacheAction, DepRef, DirAdd, DirRem, FreeBlks, FreeFile, FreeFrag,
    IndirDep, InodeDep, MkDir, MkDirKind, NewBlk, NewDirBlk, PageDep, Retired, RollbackStats,
    WorkItem,
};
use crate::tables::{BlockKey, InodeKey, PageKey};
use ordfs_buf::{BufferCache, WriteHooks};
use ordfs_error::{OrdfsError, Result};
use ordfs_types::{
    BlockNo, BufId, FsGeometry, FsId, InodeNum, LogicalBlock, MountId, NDADDR, NIADDR,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub use crate::config::SoftdepConfig;

/// Block-allocator collaborator: the two irreversible release actions.
pub trait BlockAllocator: Send + Sync {
    fn free_blocks_or_fragment(
        &self,
        fs: FsId,
        block: BlockNo,
        size: u32,
        owner: InodeNum,
    ) -> Result<()>;

    fn free_inode(&self, fs: FsId, ino: InodeNum, mode: u16) -> Result<()>;
}

/// Link counts of an in-core inode after an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCounts {
    /// The count that will be written to disk.
    pub nlink: u32,
    /// The count as visible to live references.
    pub effective: u32,
}

/// Inode/VFS collaborator.
pub trait InodeVfs: Send + Sync {
    /// Apply `delta` to the in-core inode's on-disk link count, returning
    /// the resulting counts.
    fn adjust_link_count(&self, fs: FsId, ino: InodeNum, delta: i32) -> Result<LinkCounts>;

    /// Copy the in-core inode into its inode block and write that block.
    fn update_inode_on_disk(&self, fs: FsId, ino: InodeNum) -> Result<()>;

    /// Truncate the file to length zero (reentering the engine's
    /// truncation entry points).
    fn truncate_to_zero(&self, fs: FsId, ino: InodeNum) -> Result<()>;

    /// Write a directory's pages so pending entry zeroings reach disk.
    fn sync_directory_page(&self, mount: MountId, ino: InodeNum) -> Result<()>;
}

/// Prior block pointers of a file being truncated to zero, captured before
/// the caller zeroes its in-core inode.
#[derive(Debug, Clone, Copy)]
pub struct FreedInode {
    pub size: u64,
    pub block_count: u64,
    pub db: [BlockNo; NDADDR],
    pub ib: [BlockNo; NIADDR],
}

/// What the caller must do with a freshly added directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAddPlacement {
    /// The engine tracks the entry; write the page whenever convenient.
    Tracked,
    /// The entry landed in an indirect-addressed directory block, which
    /// the engine does not track; write it synchronously.
    SyncRequired,
}

/// How a directory entry change relates to directory renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameMode {
    /// Non-directory entry change.
    File,
    /// Directory rename within the same parent.
    SameParent,
    /// Directory rename into a different parent: the removal and addition
    /// balance the new parent's link count.
    NewParent,
}

/// The dependency engine. One instance serves any number of registered
/// mounts; all collaborators are fixed at construction.
pub struct SoftdepEngine {
    pub(crate) config: SoftdepConfig,
    pub(crate) graph: Mutex<GraphCore>,
    /// Waits for per-key creation gates.
    pub(crate) gate_cv: Condvar,
    /// Waits for the worklist busy flag.
    pub(crate) worklist_cv: Condvar,
    pub(crate) completions: Mutex<VecDeque<BufId>>,
    pub(crate) completions_cv: Condvar,
    pub(crate) limits: Limits,
    pub(crate) cache: Arc<dyn BufferCache>,
    pub(crate) allocator: Arc<dyn BlockAllocator>,
    pub(crate) vfs: Arc<dyn InodeVfs>,
    pub(crate) shutdown: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    io_errors: AtomicU64,
}

impl SoftdepEngine {
    pub fn new(
        config: SoftdepConfig,
        cache: Arc<dyn BufferCache>,
        allocator: Arc<dyn BlockAllocator>,
        vfs: Arc<dyn InodeVfs>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            graph: Mutex::new(GraphCore::new(config)),
            gate_cv: Condvar::new(),
            worklist_cv: Condvar::new(),
            completions: Mutex::new(VecDeque::new()),
            completions_cv: Condvar::new(),
            limits: Limits::default(),
            cache,
            allocator,
            vfs,
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            io_errors: AtomicU64::new(0),
        })
    }

    /// Spawn the completion drainer and the backpressure cleaner.
    /// Deterministic tests skip this and call
    /// [`process_completions`](Self::process_completions) directly.
    pub fn start_background(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        let weak = Arc::downgrade(self);
        threads.push(
            std::thread::Builder::new()
                .name("ordfs-completion".into())
                .spawn(move || completion_drainer(&weak))
                .expect("spawn completion drainer"),
        );
        let weak = Arc::downgrade(self);
        threads.push(
            std::thread::Builder::new()
                .name("ordfs-cleaner".into())
                .spawn(move || backpressure_cleaner(&weak))
                .expect("spawn cleaner"),
        );
    }

    /// Stop background tasks and wait for them to exit.
    pub fn stop_background(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.completions_cv.notify_all();
        self.limits.cleaner_cv.notify_all();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    // ── Mount lifecycle ─────────────────────────────────────────────────

    pub fn register_mount(&self, mount: MountId, fs: FsId, geo: FsGeometry) {
        self.with_graph(|g| {
            assert!(
                g.mounts.insert(mount, MountInfo { fs, geo }).is_none(),
                "mount {mount} registered twice"
            );
            assert!(
                g.fs_mount.insert(fs, mount).is_none(),
                "filesystem {fs} registered twice"
            );
        });
        tracing::info!(target: "ordfs::engine", mount = mount.0, fs = fs.0, "mount registered");
    }

    /// Drain everything for the mount, then forget it. Fails (retryably)
    /// if dependencies cannot be drained.
    pub fn unmount(&self, mount: MountId) -> Result<usize> {
        let count = self.flush_all_for_mount(mount)?;
        self.with_graph(|g| {
            if let Some(info) = g.mounts.remove(&mount) {
                g.fs_mount.remove(&info.fs);
            }
        });
        tracing::info!(target: "ordfs::engine", mount = mount.0, processed = count, "unmounted");
        Ok(count)
    }

    // ── Allocation-map dependencies ─────────────────────────────────────

    /// A new inode was allocated in the cylinder-group bitmap carried by
    /// `bitmap_buf`. Nothing may reference it on disk until that bitmap is
    /// durable.
    pub fn setup_inode_map_dep(&self, bitmap_buf: BufId, fs: FsId, new_ino: InodeNum) {
        self.throttle(PressureKind::InodeDeps);
        let mut g = self.graph.lock();
        let (idp, existed) = self.inodedep_lookup_create(&mut g, fs, new_ino);
        assert!(
            !existed,
            "inode {new_ino} allocated while a dependency record exists"
        );
        let bm = g.bmsafemap_lookup(fs, bitmap_buf);
        {
            let dep = g.inodedeps.get_mut(idp);
            dep.flags.bitmap_durable = false;
            dep.gate = Some(bm);
        }
        g.bmsafemaps.get_mut(bm).inodedep_deps.push(idp);
        tracing::trace!(target: "ordfs::engine", ino = new_ino.0, "inode_map_dep");
        self.finish_graph(g);
    }

    /// A new block was allocated in the cylinder-group bitmap carried by
    /// `bitmap_buf`.
    pub fn setup_block_map_dep(&self, bitmap_buf: BufId, fs: FsId, new_blkno: BlockNo) {
        let mut g = self.graph.lock();
        let (nb, existed) = self.newblk_lookup_create(&mut g, fs, new_blkno);
        assert!(
            !existed,
            "block {new_blkno} allocated while a dependency record exists"
        );
        let bm = g.bmsafemap_lookup(fs, bitmap_buf);
        {
            let dep = g.newblks.get_mut(nb);
            dep.bitmap_durable = false;
            dep.gate = Some(bm);
        }
        g.bmsafemaps.get_mut(bm).newblk_deps.push(nb);
        tracing::trace!(target: "ordfs::engine", blkno = new_blkno.0, "block_map_dep");
        self.finish_graph(g);
    }

    // ── Direct block allocation ─────────────────────────────────────────

    /// A block (or upgraded fragment) was just allocated at `lbn` of inode
    /// `ino`, and the in-core inode is about to point at it. `buf` carries
    /// the allocated block's contents. `old_blkno`/`old_size` describe the
    /// fragment this allocation supersedes, if any.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_allocdirect(
        &self,
        fs: FsId,
        ino: InodeNum,
        lbn: LogicalBlock,
        new_blkno: BlockNo,
        old_blkno: BlockNo,
        new_size: u32,
        old_size: u32,
        owner_is_dir: bool,
        buf: BufId,
    ) {
        self.throttle(PressureKind::InodeDeps);
        let mut g = self.graph.lock();
        let (idp, _) = self.inodedep_lookup_create(&mut g, fs, ino);

        let freefrag = if new_blkno != old_blkno {
            self.new_freefrag(&mut g, fs, ino, old_blkno, old_size)
        } else {
            None
        };
        let adp = g.allocdirects.alloc(AllocDirect {
            lbn,
            new_blkno,
            old_blkno,
            new_size,
            old_size,
            slot: record::SlotState::Attached,
            flags: record::Completeness::default(),
            freefrag,
            inodedep: idp,
            gate: None,
            new_dir_blk: None,
            attached: None,
        });
        self.consume_newblk_into(&mut g, fs, new_blkno, GatedDep::Direct(adp));
        g.attach(buf, DepRef::AllocDirect(adp));

        if lbn.is_direct() {
            if owner_is_dir {
                let mount = g.mount_of(fs);
                let (pagedep, _) = self.pagedep_lookup_create(&mut g, mount, fs, ino, lbn);
                if g.pagedeps.get(pagedep).attached.is_none() {
                    g.attach(buf, DepRef::Page(pagedep));
                }
            }
        } else {
            assert!(
                old_blkno.is_none(),
                "indirect block at {lbn} replaced a live block"
            );
        }
        g.insert_allocdirect_sorted(idp, UpdList::Future, adp);
        tracing::trace!(
            target: "ordfs::engine",
            ino = ino.0,
            lbn = lbn.0,
            new_blkno = new_blkno.0,
            "allocdirect"
        );
        self.finish_graph(g);
    }

    // ── Indirect block allocation ───────────────────────────────────────

    /// A file page was allocated and an indirect-block pointer slot is
    /// about to reference it. `parent_buf`/`parent_blkno` carry the
    /// indirect block, `page_buf` the allocated page.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_allocindir_page(
        &self,
        fs: FsId,
        ino: InodeNum,
        lbn: LogicalBlock,
        parent_buf: BufId,
        parent_blkno: BlockNo,
        ptr_offset: usize,
        new_blkno: BlockNo,
        old_blkno: BlockNo,
        page_buf: BufId,
        owner_is_dir: bool,
    ) {
        let parent_bytes = self.snapshot_buffer(parent_buf);
        let mut g = self.graph.lock();
        let bsize = g.geo(fs).block_size();
        let freefrag = self.new_freefrag(&mut g, fs, ino, old_blkno, bsize);
        let aip = g.allocindirs.alloc(AllocIndir {
            offset: ptr_offset,
            new_blkno,
            old_blkno,
            flags: record::Completeness::default(),
            freefrag,
            // Patched by setup_allocindir_shared below.
            indirdep: Handle::dangling(),
            gate: None,
            attached: None,
        });
        if owner_is_dir {
            let mount = g.mount_of(fs);
            let (pagedep, _) = self.pagedep_lookup_create(&mut g, mount, fs, ino, lbn);
            if g.pagedeps.get(pagedep).attached.is_none() {
                g.attach(page_buf, DepRef::Page(pagedep));
            }
        }
        g.attach(page_buf, DepRef::AllocIndir(aip));
        self.setup_allocindir_shared(&mut g, fs, ino, parent_buf, parent_blkno, parent_bytes, aip);
        self.finish_graph(g);
    }

    /// A new indirect block (`new_indir_buf`) was allocated and a slot of
    /// its parent indirect block is about to reference it.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_allocindir_meta(
        &self,
        new_indir_buf: BufId,
        fs: FsId,
        ino: InodeNum,
        parent_buf: BufId,
        parent_blkno: BlockNo,
        ptr_offset: usize,
        new_blkno: BlockNo,
    ) {
        let parent_bytes = self.snapshot_buffer(parent_buf);
        let mut g = self.graph.lock();
        let aip = g.allocindirs.alloc(AllocIndir {
            offset: ptr_offset,
            new_blkno,
            old_blkno: BlockNo::NONE,
            flags: record::Completeness::default(),
            freefrag: None,
            indirdep: Handle::dangling(),
            gate: None,
            attached: None,
        });
        g.attach(new_indir_buf, DepRef::AllocIndir(aip));
        self.setup_allocindir_shared(&mut g, fs, ino, parent_buf, parent_blkno, parent_bytes, aip);
        self.finish_graph(g);
    }

    #[allow(clippy::too_many_arguments)]
    fn setup_allocindir_shared(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        fs: FsId,
        ino: InodeNum,
        parent_buf: BufId,
        parent_blkno: BlockNo,
        parent_bytes: Vec<u8>,
        aip: Handle<AllocIndir>,
    ) {
        // Find or create the indirect-block record; its safe copy starts as
        // the block's current content.
        let existing = g
            .buffer_deps
            .get(&parent_buf)
            .and_then(|deps| {
                deps.iter().find_map(|d| match d {
                    DepRef::IndirDep(h) => Some(*h),
                    _ => None,
                })
            });
        let ind = match existing {
            Some(ind) => ind,
            None => {
                let ind = g.indirdeps.alloc(IndirDep {
                    fs,
                    ino,
                    blkno: parent_blkno,
                    state: record::SlotState::Attached,
                    going_away: false,
                    saved_data: None,
                    shadow: parent_bytes,
                    pending_ptrs: Vec::new(),
                    done_ptrs: Vec::new(),
                    attached: None,
                });
                g.attach(parent_buf, DepRef::IndirDep(ind));
                ind
            }
        };
        g.allocindirs.get_mut(aip).indirdep = ind;
        let promoted = g.allocindirs.get(aip).new_blkno;
        self.consume_newblk_into(g, fs, promoted, GatedDep::Indir(aip));

        // Merge with an existing pending update of the same slot.
        let (offset, old_blkno) = {
            let a = g.allocindirs.get(aip);
            (a.offset, a.old_blkno)
        };
        if !old_blkno.is_none() {
            let old_aip = g
                .indirdeps
                .get(ind)
                .pending_ptrs
                .iter()
                .copied()
                .find(|&h| g.allocindirs.get(h).offset == offset);
            if let Some(old_aip) = old_aip {
                let (prior_old_blkno, prior_freefrag, prior_new_blkno) = {
                    let old = g.allocindirs.get(old_aip);
                    (old.old_blkno, old.freefrag, old.new_blkno)
                };
                assert!(
                    prior_new_blkno == old_blkno,
                    "indirect slot {offset} supersedes block {old_blkno} but held {prior_new_blkno}"
                );
                let displaced = {
                    let new = g.allocindirs.get_mut(aip);
                    new.old_blkno = prior_old_blkno;
                    std::mem::replace(&mut new.freefrag, prior_freefrag)
                };
                g.allocindirs.get_mut(old_aip).freefrag = None;
                g.free_allocindir(old_aip, None);
                if let Some(ff) = displaced {
                    g.worklist_push(WorkItem::FreeFrag(ff));
                }
            }
        }
        g.indirdeps.get_mut(ind).pending_ptrs.push(aip);
        // The safe copy keeps the slot's prior pointer until this update
        // commits.
        let rollback = g.allocindirs.get(aip).old_blkno;
        ordfs_ondisk::set_indir_ptr(&mut g.indirdeps.get_mut(ind).shadow, offset, rollback)
            .unwrap_or_else(|e| panic!("safe copy slot {offset} unwritable: {e}"));
    }

    // ── Truncation and inode release ────────────────────────────────────

    /// The file is being truncated to zero: the caller captured the old
    /// pointers in `prev`, zeroed its in-core inode, and copied the zeroed
    /// image into `inode_buf`. All pending allocation dependencies for the
    /// inode become moot; the actual block release waits until the zeroed
    /// inode is durable.
    pub fn setup_freeblocks(&self, fs: FsId, ino: InodeNum, prev: FreedInode, inode_buf: BufId) {
        let mut g = self.graph.lock();
        let mount = g.mount_of(fs);
        let fb = g.freeblks.alloc(FreeBlks {
            fs,
            mount,
            ino,
            old_size: prev.size,
            block_count: prev.block_count,
            db: prev.db,
            ib: prev.ib,
            queued: false,
        });
        let (idp, _) = self.inodedep_lookup_create(&mut g, fs, ino);
        assert!(
            !g.inodedeps.get(idp).io_started,
            "inode {ino} truncated while its block write is in flight"
        );
        let delay = g.inodedeps.get(idp).flags.bitmap_durable;
        if delay {
            g.inodedeps.get_mut(idp).buf_wait.push(DepRef::FreeBlks(fb));
        }
        // Track the zeroed image's buffer like any other inode update.
        self.update_inode_block_locked(&mut g, idp, inode_buf);
        // Pending pointer updates are obsolete: merge the lists to collapse
        // duplicate fragments, then drop everything.
        g.merge_inode_lists(idp);
        while let Some(&adp) = g.inodedeps.get(idp).inode_updates.first() {
            g.free_allocdirect(idp, UpdList::Current, adp, delay);
        }

        // Tear down dependencies on the file's data buffers.
        let victims: Vec<BufId> = g
            .buffer_deps
            .iter()
            .filter(|(_, deps)| {
                deps.iter().any(|d| match d {
                    DepRef::IndirDep(h) => {
                        let dep = g.indirdeps.get(*h);
                        dep.fs == fs && dep.ino == ino
                    }
                    DepRef::Page(h) => {
                        let dep = g.pagedeps.get(*h);
                        dep.fs == fs && dep.ino == ino
                    }
                    _ => false,
                })
            })
            .map(|(buf, _)| *buf)
            .collect();
        self.finish_graph(g);

        for buf in victims {
            let mut actions = Vec::new();
            let mut retired = Vec::new();
            self.cache
                .with_buffer_mut(buf, &mut |bytes| {
                    let mut g = self.graph.lock();
                    let idp = g
                        .inodedep_index
                        .get(&InodeKey { fs, ino });
                    g.deallocate_dependencies_locked(buf, bytes, idp);
                    actions.append(&mut g.actions);
                    retired.append(&mut g.retired);
                    self.mirror_counters(&g);
                })
                .unwrap_or_else(|e| panic!("truncation lost buffer {buf}: {e}"));
            self.apply_actions(actions);
            drop(retired);
        }

        let run_now = self.with_graph(|g| {
            if let Some(idp) = g.inodedep_index.get(&InodeKey { fs, ino }) {
                let _ = g.free_inodedep(idp);
            }
            !delay
        });
        tracing::debug!(target: "ordfs::engine", ino = ino.0, delayed = delay, "freeblocks");
        if run_now {
            // The inode has never been written: the on-disk inode is
            // already zeroed, so release the blocks immediately.
            self.handle_workitem(WorkItem::FreeBlks(fb));
        }
    }

    /// The inode's link count reached zero and its storage may be released
    /// once the zeroed on-disk inode is durable.
    pub fn setup_freefile(&self, fs: FsId, ino: InodeNum, mode: u16) {
        let mut g = self.graph.lock();
        let mount = g.mount_of(fs);
        let ff = g.freefiles.alloc(FreeFile {
            fs,
            mount,
            ino,
            mode,
            queued: false,
        });
        let run_now = match g.inodedep_index.get(&InodeKey { fs, ino }) {
            None => true,
            Some(idp) => {
                if g.check_inode_unwritten(idp) {
                    true
                } else {
                    g.inodedeps.get_mut(idp).inode_wait.push(DepRef::FreeFile(ff));
                    false
                }
            }
        };
        self.finish_graph(g);
        tracing::debug!(target: "ordfs::engine", ino = ino.0, immediate = run_now, "freefile");
        if run_now {
            self.handle_workitem(WorkItem::FreeFile(ff));
        }
    }

    // ── Directory entries ───────────────────────────────────────────────

    /// A directory entry referencing `new_ino` was written (in memory) at
    /// byte `diroffset` of directory `dir_ino`. For a mkdir, `newdir_buf`
    /// carries the new directory's first block and both mkdir
    /// preconditions are tracked. The caller must already have recorded
    /// the link-count changes via [`change_link_count`](Self::change_link_count).
    #[allow(clippy::too_many_arguments)]
    pub fn setup_directory_add(
        &self,
        dir_buf: BufId,
        fs: FsId,
        dir_ino: InodeNum,
        diroffset: u64,
        new_ino: InodeNum,
        newdir_buf: Option<BufId>,
        is_new_block: bool,
    ) -> DirAddPlacement {
        self.throttle(PressureKind::InodeDeps);
        let mut g = self.graph.lock();
        let geo = g.geo(fs);
        let mount = g.mount_of(fs);
        let lbn = geo.byte_to_lbn(diroffset);
        let offset = geo.byte_offset_in_block(diroffset);

        let (pagedep, _) = self.pagedep_lookup_create(&mut g, mount, fs, dir_ino, lbn);
        if g.pagedeps.get(pagedep).attached.is_none() {
            g.attach(dir_buf, DepRef::Page(pagedep));
        }
        let dap = g.diradds.alloc(DirAdd {
            offset,
            new_ino,
            slot: record::SlotState::Attached,
            inode_written: false,
            mkdir_body_pending: false,
            mkdir_parent_pending: false,
            previous: None,
            pagedep,
        });
        g.pagedeps.get_mut(pagedep).pending_adds.push(dap);

        if let Some(body_buf) = newdir_buf {
            // The new directory's `.`/`..` block must be durable.
            g.diradds.get_mut(dap).mkdir_body_pending = true;
            let body = g.mkdirs.alloc(MkDir {
                kind: MkDirKind::Body,
                diradd: dap,
                attached: None,
            });
            g.mkdir_list.push(body);
            g.attach(body_buf, DepRef::MkDir(body));

            // The parent's incremented link count must be durable — unless
            // it already is.
            let parent_key = InodeKey { fs, ino: dir_ino };
            if let Some(parent_idp) = g.inodedep_index.get(&parent_key) {
                if !g.inodedeps.get(parent_idp).flags.is_complete() {
                    g.diradds.get_mut(dap).mkdir_parent_pending = true;
                    let parent = g.mkdirs.alloc(MkDir {
                        kind: MkDirKind::Parent,
                        diradd: dap,
                        attached: None,
                    });
                    g.mkdir_list.push(parent);
                    g.inodedeps
                        .get_mut(parent_idp)
                        .buf_wait
                        .push(DepRef::MkDir(parent));
                }
            }
        }

        // The entry may not reference `new_ino` on disk until that inode
        // (with its incremented link count) is durable.
        let (idp, _) = self.inodedep_lookup_create(&mut g, fs, new_ino);
        if g.inodedeps.get(idp).flags.is_complete() {
            g.diradd_inode_written(dap, idp);
        } else {
            g.inodedeps.get_mut(idp).buf_wait.push(DepRef::DirAdd(dap));
        }

        let placement = if is_new_block {
            self.track_new_dir_block(&mut g, fs, dir_ino, pagedep, lbn, diroffset, geo)
        } else {
            DirAddPlacement::Tracked
        };
        tracing::trace!(
            target: "ordfs::engine",
            dir = dir_ino.0,
            ino = new_ino.0,
            offset = diroffset,
            "directory_add"
        );
        self.finish_graph(g);
        placement
    }

    /// Track a directory entry landing at the start of a newly allocated
    /// block or fragment: settled entries in that block must additionally
    /// wait for the block's inode pointer to be durable.
    #[allow(clippy::too_many_arguments)]
    fn track_new_dir_block(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        fs: FsId,
        dir_ino: InodeNum,
        pagedep: Handle<PageDep>,
        lbn: LogicalBlock,
        diroffset: u64,
        geo: FsGeometry,
    ) -> DirAddPlacement {
        if !lbn.is_direct() {
            // Directories rarely grow into indirect blocks; force those
            // entries out synchronously rather than tracking them.
            return if geo.byte_offset_in_block(diroffset) == 0 {
                DirAddPlacement::SyncRequired
            } else {
                DirAddPlacement::Tracked
            };
        }
        if diroffset % u64::from(geo.frag_size()) != 0 {
            return DirAddPlacement::Tracked;
        }
        if g.pagedeps.get(pagedep).holds_new_block {
            return DirAddPlacement::Tracked;
        }
        let key = InodeKey { fs, ino: dir_ino };
        let idp = g
            .inodedep_index
            .get(&key)
            .unwrap_or_else(|| panic!("new directory block for {dir_ino} without inode record"));
        let adp = g
            .inodedeps
            .get(idp)
            .new_inode_updates
            .last()
            .copied()
            .unwrap_or_else(|| panic!("new directory block for {dir_ino} without its allocation"));
        assert!(
            g.allocdirects.get(adp).lbn == lbn,
            "new directory block allocation tracks {} but the entry landed in {lbn}",
            g.allocdirects.get(adp).lbn
        );
        let ndb = g.newdirblks.alloc(NewDirBlk { pagedep });
        g.pagedeps.get_mut(pagedep).holds_new_block = true;
        g.allocdirects.get_mut(adp).new_dir_blk = Some(ndb);
        DirAddPlacement::Tracked
    }

    /// A directory entry referencing `ino` was removed (in memory) from
    /// byte `diroffset` of directory `dir_ino`. The caller must *not*
    /// decrement the inode's link count — the engine does that once the
    /// zeroed entry is durable.
    pub fn setup_remove(
        &self,
        dir_buf: BufId,
        fs: FsId,
        dir_ino: InodeNum,
        diroffset: u64,
        ino: InodeNum,
        is_rmdir: bool,
    ) {
        self.throttle(PressureKind::RemovalDeps);
        let mut g = self.graph.lock();
        let (dirrem, prev) =
            self.new_dirrem(&mut g, dir_buf, fs, dir_ino, diroffset, ino, is_rmdir);
        let run_now = if g.dirrems.get(dirrem).entry_gone {
            // The entry never made it to disk; the previous occupant of a
            // changed entry still does, and must wait for the zeroing.
            if let Some(prev) = prev {
                let pagedep = g.dirrems.get(dirrem).pagedep.expect("dirrem without page");
                g.pagedeps.get_mut(pagedep).removals.push(prev);
            }
            g.dirrems.get_mut(dirrem).dir_ino = Some(dir_ino);
            true
        } else {
            let pagedep = g.dirrems.get(dirrem).pagedep.expect("dirrem without page");
            g.pagedeps.get_mut(pagedep).removals.push(dirrem);
            false
        };
        tracing::trace!(
            target: "ordfs::engine",
            dir = dir_ino.0,
            ino = ino.0,
            immediate = run_now,
            "directory_remove"
        );
        self.finish_graph(g);
        if run_now {
            self.handle_workitem(WorkItem::DirRem(dirrem));
        }
    }

    /// A directory entry at `diroffset` was changed (in memory) from
    /// `old_ino` to `new_ino`. Rollback regresses the entry to the
    /// previous inode number rather than zero.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_directory_change(
        &self,
        dir_buf: BufId,
        fs: FsId,
        dir_ino: InodeNum,
        diroffset: u64,
        old_ino: InodeNum,
        new_ino: InodeNum,
        rename: RenameMode,
    ) {
        self.throttle(PressureKind::RemovalDeps);
        let mut g = self.graph.lock();
        let geo = g.geo(fs);
        let offset = geo.byte_offset_in_block(diroffset);
        let is_rmdir = rename != RenameMode::File;
        let (dirrem, prev) =
            self.new_dirrem(&mut g, dir_buf, fs, dir_ino, diroffset, old_ino, is_rmdir);
        if rename == RenameMode::NewParent {
            g.dirrems.get_mut(dirrem).dir_change = true;
        }
        let pagedep = g.dirrems.get(dirrem).pagedep.expect("dirrem without page");

        let dap = g.diradds.alloc(DirAdd {
            offset,
            new_ino,
            slot: record::SlotState::Attached,
            inode_written: false,
            mkdir_body_pending: false,
            mkdir_parent_pending: false,
            previous: None,
            pagedep,
        });

        let run_dirrem_now = if g.dirrems.get(dirrem).entry_gone {
            // The changed entry never reached disk. Roll back to the name's
            // prior occupant if one is still on disk, else to zero; the
            // unreferenced inode may be released immediately.
            g.diradds.get_mut(dap).previous = prev;
            g.dirrems.get_mut(dirrem).dir_ino = Some(dir_ino);
            true
        } else {
            g.diradds.get_mut(dap).previous = Some(dirrem);
            false
        };

        let (idp, _) = self.inodedep_lookup_create(&mut g, fs, new_ino);
        if g.inodedeps.get(idp).flags.is_complete() {
            g.diradds.get_mut(dap).inode_written = true;
            g.pagedeps.get_mut(pagedep).settled_adds.push(dap);
            g.inodedeps.get_mut(idp).pending.push(DepRef::DirAdd(dap));
        } else {
            g.pagedeps.get_mut(pagedep).pending_adds.push(dap);
            g.inodedeps.get_mut(idp).buf_wait.push(DepRef::DirAdd(dap));
        }
        tracing::trace!(
            target: "ordfs::engine",
            dir = dir_ino.0,
            old = old_ino.0,
            new = new_ino.0,
            "directory_change"
        );
        self.finish_graph(g);
        if run_dirrem_now {
            self.handle_workitem(WorkItem::DirRem(dirrem));
        }
    }

    /// Allocate a removal record and cancel any pending addition of the
    /// same entry (both become moot). Returns the removal plus, for a
    /// cancelled entry change, the removal of the name's prior occupant.
    #[allow(clippy::too_many_arguments)]
    fn new_dirrem(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        dir_buf: BufId,
        fs: FsId,
        dir_ino: InodeNum,
        diroffset: u64,
        ino: InodeNum,
        is_rmdir: bool,
    ) -> (Handle<DirRem>, Option<Handle<DirRem>>) {
        let geo = g.geo(fs);
        let mount = g.mount_of(fs);
        let lbn = geo.byte_to_lbn(diroffset);
        let offset = geo.byte_offset_in_block(diroffset);

        let (pagedep, _) = self.pagedep_lookup_create(g, mount, fs, dir_ino, lbn);
        if g.pagedeps.get(pagedep).attached.is_none() {
            g.attach(dir_buf, DepRef::Page(pagedep));
        }
        let dirrem = g.dirrems.alloc(DirRem {
            mount,
            fs,
            old_ino: ino,
            dir_ino: None,
            pagedep: Some(pagedep),
            is_rmdir,
            entry_gone: false,
            dir_change: false,
            queued: false,
        });
        g.num_dirrems += 1;

        // A pending addition of the same entry cancels against this
        // removal.
        let page = g.pagedeps.get(pagedep);
        let dap = page
            .pending_adds
            .iter()
            .chain(page.settled_adds.iter())
            .copied()
            .find(|&h| g.diradds.get(h).offset == offset);
        let mut prev = None;
        if let Some(dap) = dap {
            assert!(
                g.diradds.get(dap).slot.is_attached(),
                "cancelled directory entry is rolled back"
            );
            assert!(
                g.diradds.get(dap).new_ino == ino,
                "directory entry removal of inode {ino} found {}",
                g.diradds.get(dap).new_ino
            );
            // A cancelled entry change leaves the prior occupant on disk;
            // its removal is handed back to the caller.
            prev = g.diradds.get_mut(dap).previous.take();
            g.dirrems.get_mut(dirrem).entry_gone = true;
            g.free_diradd(dap);
        }
        (dirrem, prev)
    }

    /// Relocate a pending addition when directory-block compaction moves
    /// its entry. The caller performs the byte move.
    pub fn change_directory_entry_offset(
        &self,
        fs: FsId,
        dir_ino: InodeNum,
        lbn: LogicalBlock,
        old_offset: usize,
        new_offset: usize,
    ) {
        self.with_graph(|g| {
            let mount = g.mount_of(fs);
            let key = PageKey {
                mount,
                ino: dir_ino,
                lbn,
            };
            let Some(pagedep) = g.pagedep_index.get(&key) else {
                return;
            };
            let page = g.pagedeps.get(pagedep);
            let dap = page
                .pending_adds
                .iter()
                .chain(page.settled_adds.iter())
                .copied()
                .find(|&h| g.diradds.get(h).offset == old_offset);
            if let Some(dap) = dap {
                g.diradds.get_mut(dap).offset = new_offset;
            }
        });
    }

    // ── Link counts and inode buffers ───────────────────────────────────

    /// Record the gap between the on-disk and effective link counts so new
    /// references cannot commit before the updated inode does.
    pub fn change_link_count(&self, fs: FsId, ino: InodeNum, nlink: u32, effective: u32) {
        self.throttle(PressureKind::InodeDeps);
        let mut g = self.graph.lock();
        let (idp, _) = self.inodedep_lookup_create(&mut g, fs, ino);
        g.inodedeps.get_mut(idp).nlink_delta = i64::from(nlink) - i64::from(effective);
        self.finish_graph(g);
    }

    /// The in-core inode was just copied into its inode-block buffer:
    /// transfer its dependencies onto that buffer.
    pub fn update_inode_block(&self, fs: FsId, ino: InodeNum, buf: BufId) {
        let mut g = self.graph.lock();
        let Some(idp) = g.inodedep_index.get(&InodeKey { fs, ino }) else {
            self.finish_graph(g);
            return;
        };
        self.update_inode_block_locked(&mut g, idp, buf);
        self.finish_graph(g);
    }

    fn update_inode_block_locked(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        idp: Handle<InodeDep>,
        buf: BufId,
    ) {
        // Changes are in flight again: anything depending on them must wait
        // for this buffer.
        g.inodedeps.get_mut(idp).flags.self_durable = false;
        match g.inodedeps.get(idp).attached {
            None => g.attach(buf, DepRef::Inode(idp)),
            Some(existing) => assert!(
                existing == buf,
                "inode record attached to buffer {existing}, updated through {buf}"
            ),
        }
        g.merge_inode_lists(idp);
        if let Some(&first) = g.inodedeps.get(idp).inode_updates.first() {
            g.allocdirect_partdone(first);
        }
        // Operations awaiting the next inode write now ride this buffer.
        let moved = std::mem::take(&mut g.inodedeps.get_mut(idp).inode_wait);
        g.inodedeps.get_mut(idp).buf_wait.extend(moved);
    }

    /// An inode was loaded from disk: return the effective link count
    /// given the tracked delta.
    pub fn load_inode_block(&self, fs: FsId, ino: InodeNum, ondisk_nlink: u32) -> u32 {
        self.with_graph(|g| g.effective_link_count(fs, ino, ondisk_nlink))
    }

    /// Tracked on-disk minus effective link count for an inode (zero when
    /// untracked).
    pub fn link_delta(&self, fs: FsId, ino: InodeNum) -> i64 {
        self.with_graph(|g| {
            g.inodedep_index
                .get(&InodeKey { fs, ino })
                .map_or(0, |idp| g.inodedeps.get(idp).nlink_delta)
        })
    }

    // ── Buffer bookkeeping ──────────────────────────────────────────────

    /// Number of attached dependencies that would roll the buffer back if
    /// it were written right now.
    pub fn count_dependencies(&self, buf: BufId) -> usize {
        self.with_graph(|g| {
            g.buffer_deps.get(&buf).map_or(0, |deps| {
                deps.iter()
                    .map(|d| match d {
                        DepRef::Page(h) => g.pagedeps.get(*h).pending_adds.len(),
                        DepRef::Inode(h) => {
                            let dep = g.inodedeps.get(*h);
                            if dep.flags.bitmap_durable {
                                dep.inode_updates.len()
                            } else {
                                1
                            }
                        }
                        DepRef::IndirDep(h) => g.indirdeps.get(*h).pending_ptrs.len(),
                        _ => 0,
                    })
                    .sum()
            })
        })
    }

    /// Transfer a buffer's dependencies when the cache re-homes its
    /// memory.
    pub fn move_dependencies(&self, old: BufId, new: BufId) {
        self.with_graph(|g| {
            assert!(
                g.buffer_dep_count(new) == 0,
                "dependency move onto a buffer that already has dependencies"
            );
            let deps = g.take_buffer_deps(old);
            for dep in deps {
                g.attach(new, dep);
            }
        });
    }

    // ── Write pipeline ──────────────────────────────────────────────────

    /// Drain queued completion events. Returns how many were processed.
    pub fn process_completions(&self) -> usize {
        let mut processed = 0;
        loop {
            let next = self.completions.lock().pop_front();
            let Some(buf) = next else { break };
            self.process_one_completion(buf);
            processed += 1;
        }
        processed
    }

    fn process_one_completion(&self, buf: BufId) {
        let mut actions = Vec::new();
        let mut retired: Vec<Retired> = Vec::new();
        self.cache
            .with_buffer_mut(buf, &mut |bytes| {
                let mut g = self.graph.lock();
                g.complete_write(buf, bytes);
                actions.append(&mut g.actions);
                retired.append(&mut g.retired);
                self.mirror_counters(&g);
            })
            .unwrap_or_else(|e| panic!("completion for unknown buffer {buf}: {e}"));
        self.apply_actions(actions);
        drop(retired);
    }

    /// Count of I/O errors reported through the diagnostic hook.
    pub fn io_error_count(&self) -> u64 {
        self.io_errors.load(Ordering::Acquire)
    }

    pub(crate) fn diagnostic(&self, operation: &str, error: &OrdfsError) {
        self.io_errors.fetch_add(1, Ordering::AcqRel);
        tracing::error!(
            target: "ordfs::engine",
            operation,
            error = %error,
            "collaborator failure"
        );
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn rollback_stats(&self) -> RollbackStats {
        self.with_graph(|g| g.stats)
    }

    pub fn outstanding_for_mount(&self, mount: MountId) -> usize {
        self.with_graph(|g| g.outstanding_for_mount(mount))
    }

    /// Live records across every arena; zero means nothing leaked.
    pub fn total_live_records(&self) -> usize {
        self.with_graph(|g| g.total_live_records())
    }

    pub fn worklist_len(&self) -> usize {
        self.with_graph(|g| g.worklist.len())
    }

    pub fn num_inode_deps(&self) -> usize {
        self.limits.inodedeps.load(Ordering::Acquire)
    }

    pub fn num_removal_deps(&self) -> usize {
        self.limits.dirrems.load(Ordering::Acquire)
    }

    // ── Internals ───────────────────────────────────────────────────────

    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut GraphCore) -> R) -> R {
        let mut g = self.graph.lock();
        let result = f(&mut g);
        self.finish_graph(g);
        result
    }

    /// Release the graph lock, then apply deferred cache actions and drop
    /// retired record bodies outside it.
    pub(crate) fn finish_graph(&self, mut g: MutexGuard<'_, GraphCore>) {
        let actions = std::mem::take(&mut g.actions);
        let retired = std::mem::take(&mut g.retired);
        self.mirror_counters(&g);
        drop(g);
        self.apply_actions(actions);
        drop(retired);
    }

    fn mirror_counters(&self, g: &GraphCore) {
        self.limits.inodedeps.store(g.num_inodedeps, Ordering::Release);
        self.limits.dirrems.store(g.num_dirrems, Ordering::Release);
    }

    fn apply_actions(&self, actions: Vec<CacheAction>) {
        for action in actions {
            match action {
                CacheAction::MarkDirty(buf) => self
                    .cache
                    .mark_dirty(buf)
                    .unwrap_or_else(|e| panic!("re-dirty of buffer {buf} failed: {e}")),
                CacheAction::NoteAttach(buf) => self.cache.note_attach(buf),
                CacheAction::NoteDetach(buf) => self.cache.note_detach(buf),
            }
        }
    }

    fn snapshot_buffer(&self, buf: BufId) -> Vec<u8> {
        let mut out = Vec::new();
        self.cache
            .with_buffer_mut(buf, &mut |bytes| out = bytes.clone())
            .unwrap_or_else(|e| panic!("snapshot of buffer {buf} failed: {e}"));
        out
    }

    fn new_freefrag(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        fs: FsId,
        ino: InodeNum,
        blkno: BlockNo,
        size: u32,
    ) -> Option<Handle<FreeFrag>> {
        if blkno.is_none() {
            return None;
        }
        let geo = g.geo(fs);
        assert!(
            size <= geo.block_size(),
            "fragment of {size} bytes exceeds the block size"
        );
        Some(g.freefrags.alloc(FreeFrag {
            fs,
            ino,
            blkno,
            frag_size: size,
            queued: false,
        }))
    }

    /// Consume the transient new-block record for `blkno`, transferring
    /// its bitmap gate (if still pending) onto the promoted dependency.
    fn consume_newblk_into(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        fs: FsId,
        blkno: BlockNo,
        target: GatedDep,
    ) {
        let key = BlockKey { fs, blkno };
        let nb = g
            .newblk_index
            .get(&key)
            .unwrap_or_else(|| panic!("allocation of block {blkno} lost its bitmap record"));
        let (durable, gate) = {
            let dep = g.newblks.get(nb);
            (dep.bitmap_durable, dep.gate)
        };
        if durable {
            match target {
                GatedDep::Direct(adp) => {
                    g.allocdirects.get_mut(adp).flags.bitmap_durable = true;
                }
                GatedDep::Indir(aip) => {
                    g.allocindirs.get_mut(aip).flags.bitmap_durable = true;
                }
            }
        } else {
            let bm = gate.unwrap_or_else(|| panic!("gated block {blkno} without its bitmap"));
            {
                let deps = &mut g.bmsafemaps.get_mut(bm).newblk_deps;
                let pos = deps
                    .iter()
                    .position(|&h| h == nb)
                    .unwrap_or_else(|| panic!("block {blkno} missing from bitmap fan-out"));
                deps.remove(pos);
            }
            match target {
                GatedDep::Direct(adp) => {
                    g.allocdirects.get_mut(adp).gate = Some(bm);
                    g.bmsafemaps.get_mut(bm).allocdirect_deps.push(adp);
                }
                GatedDep::Indir(aip) => {
                    g.allocindirs.get_mut(aip).gate = Some(bm);
                    g.bmsafemaps.get_mut(bm).allocindir_deps.push(aip);
                }
            }
        }
        g.newblk_index.remove(&key);
        g.retire_newblk(nb);
    }

    // ── Gated lookups ───────────────────────────────────────────────────
    //
    // Allocating lookups construct the record outside the lock (mirroring
    // an allocator that may sleep); the per-key gate makes concurrent
    // creators wait and retry the whole lookup, so exactly one record per
    // key ever exists.

    fn inodedep_lookup_create(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        fs: FsId,
        ino: InodeNum,
    ) -> (Handle<InodeDep>, bool) {
        let key = InodeKey { fs, ino };
        loop {
            if let Some(h) = g.inodedep_index.get(&key) {
                return (h, true);
            }
            if g.inodedep_gate.contains(&key) {
                self.gate_cv.wait(g);
                continue;
            }
            g.inodedep_gate.insert(key);
            let record = MutexGuard::unlocked(g, || InodeDep::new(fs, ino));
            g.inodedep_gate.remove(&key);
            self.gate_cv.notify_all();
            // Re-check: a waiter cannot have created it (they retry), but
            // the retry discipline is what this lookup relies on.
            let h = g.inodedeps.alloc(record);
            g.inodedep_index.insert(key, h);
            g.num_inodedeps += 1;
            return (h, false);
        }
    }

    fn newblk_lookup_create(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        fs: FsId,
        blkno: BlockNo,
    ) -> (Handle<NewBlk>, bool) {
        let key = BlockKey { fs, blkno };
        loop {
            if let Some(h) = g.newblk_index.get(&key) {
                return (h, true);
            }
            if g.newblk_gate.contains(&key) {
                self.gate_cv.wait(g);
                continue;
            }
            g.newblk_gate.insert(key);
            let record = MutexGuard::unlocked(g, || NewBlk {
                fs,
                blkno,
                bitmap_durable: true,
                gate: None,
            });
            g.newblk_gate.remove(&key);
            self.gate_cv.notify_all();
            let h = g.newblks.alloc(record);
            g.newblk_index.insert(key, h);
            return (h, false);
        }
    }

    fn pagedep_lookup_create(
        &self,
        g: &mut MutexGuard<'_, GraphCore>,
        mount: MountId,
        fs: FsId,
        ino: InodeNum,
        lbn: LogicalBlock,
    ) -> (Handle<PageDep>, bool) {
        let key = PageKey { mount, ino, lbn };
        loop {
            if let Some(h) = g.pagedep_index.get(&key) {
                return (h, true);
            }
            if g.pagedep_gate.contains(&key) {
                self.gate_cv.wait(g);
                continue;
            }
            g.pagedep_gate.insert(key);
            let record = MutexGuard::unlocked(g, || PageDep {
                mount,
                fs,
                ino,
                lbn,
                io_started: false,
                holds_new_block: false,
                pending_adds: Vec::new(),
                settled_adds: Vec::new(),
                removals: Vec::new(),
                attached: None,
            });
            g.pagedep_gate.remove(&key);
            self.gate_cv.notify_all();
            let h = g.pagedeps.alloc(record);
            g.pagedep_index.insert(key, h);
            return (h, false);
        }
    }
}

impl WriteHooks for SoftdepEngine {
    fn write_initiate(&self, buf: BufId, bytes: &mut Vec<u8>) {
        let mut g = self.graph.lock();
        g.initiate_write(buf, bytes);
        // Initiation queues no re-dirty actions, so applying here cannot
        // reenter the cache's buffer state.
        let actions = std::mem::take(&mut g.actions);
        debug_assert!(
            actions
                .iter()
                .all(|a| !matches!(a, CacheAction::MarkDirty(_))),
            "rollback queued a re-dirty"
        );
        let retired = std::mem::take(&mut g.retired);
        self.mirror_counters(&g);
        drop(g);
        self.apply_actions(actions);
        drop(retired);
    }

    fn write_complete(&self, buf: BufId) {
        self.completions.lock().push_back(buf);
        self.completions_cv.notify_all();
    }

    fn write_error(&self, buf: BufId, error: &OrdfsError) {
        // The rolled-back bytes stay in place; completion never runs for
        // this write, so the dependency state is untouched and a retry
        // re-enters initiation.
        tracing::error!(target: "ordfs::engine", buf = buf.0, error = %error, "metadata write failed");
        self.io_errors.fetch_add(1, Ordering::AcqRel);
    }

    fn deallocate(&self, buf: BufId) {
        let count = self.with_graph(|g| g.buffer_dep_count(buf));
        assert!(
            count == 0,
            "buffer {buf} discarded while carrying {count} dependencies"
        );
    }
}

/// Tells `consume_newblk_into` which promoted dependency inherits a still
/// pending bitmap gate.
enum GatedDep {
    Direct(Handle<AllocDirect>),
    Indir(Handle<AllocIndir>),
}

fn completion_drainer(weak: &Weak<SoftdepEngine>) {
    loop {
        let Some(engine) = weak.upgrade() else { return };
        if engine.shutdown.load(Ordering::Acquire) {
            return;
        }
        let next = {
            let mut queue = engine.completions.lock();
            if queue.is_empty() {
                let _ = engine
                    .completions_cv
                    .wait_for(&mut queue, Duration::from_millis(20));
            }
            queue.pop_front()
        };
        if let Some(buf) = next {
            engine.process_one_completion(buf);
        }
        drop(engine);
    }
}

fn backpressure_cleaner(weak: &Weak<SoftdepEngine>) {
    loop {
        let Some(engine) = weak.upgrade() else { return };
        if engine.shutdown.load(Ordering::Acquire) {
            return;
        }
        {
            let mut guard = engine.limits.sync.lock();
            if !engine.limits.req_inode_cleanup.load(Ordering::Acquire)
                && !engine.limits.req_removal_cleanup.load(Ordering::Acquire)
            {
                let _ = engine
                    .limits
                    .cleaner_cv
                    .wait_for(&mut guard, Duration::from_millis(20));
            }
        }
        if engine.shutdown.load(Ordering::Acquire) {
            return;
        }
        if engine.limits.req_inode_cleanup.swap(false, Ordering::AcqRel) {
            engine.clear_inode_backlog();
        }
        if engine
            .limits
            .req_removal_cleanup
            .swap(false, Ordering::AcqRel)
        {
            engine.clear_removal_backlog();
        }
        engine.limits.waiter_cv.notify_all();
        drop(engine);
    }
}

impl Drop for SoftdepEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.completions_cv.notify_all();
        self.limits.cleaner_cv.notify_all();
    }
}
