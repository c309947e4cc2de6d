//! Worklist processing: the single global FIFO of satisfied records whose
//! terminal, irreversible release action may now run.
//!
//! Processing is effectively single threaded: a busy flag turns a second
//! concurrent drain into a no-op, and callers that need an accurate fully
//! drained queue (unmount) wait on the waiter count. Items are handled
//! strictly in insertion order — the queue order is what guarantees a
//! file's blocks are freed before its inode storage, so no (inode, block)
//! identity can be reborn while old state still references it.

use crate::record::{DepRef, WorkItem};
use crate::tables::InodeKey;
use crate::SoftdepEngine;
use ordfs_error::{OrdfsError, Result};
use ordfs_types::{BlockNo, FsGeometry, FsId, InodeNum, LogicalBlock, MountId, NDADDR, NIADDR};

impl SoftdepEngine {
    /// Drain the worklist, dispatching each item's release action. Returns
    /// the number of processed items belonging to `match_mount` (all items
    /// are processed regardless). A drain already in progress makes this a
    /// no-op returning zero.
    pub fn process_worklist(&self, match_mount: Option<MountId>) -> usize {
        let mut g = self.graph.lock();
        if g.worklist_busy {
            self.finish_graph(g);
            return 0;
        }
        g.worklist_busy = true;
        let mut matched = 0;
        loop {
            let Some(item) = g.worklist.pop_front() else {
                break;
            };
            match item {
                WorkItem::FreeFrag(h) => g.freefrags.get_mut(h).queued = false,
                WorkItem::FreeBlks(h) => g.freeblks.get_mut(h).queued = false,
                WorkItem::FreeFile(h) => g.freefiles.get_mut(h).queued = false,
                WorkItem::DirRem(h) => g.dirrems.get_mut(h).queued = false,
            }
            let mount = g.workitem_mount(item);
            self.finish_graph(g);
            self.handle_workitem(item);
            if match_mount.map_or(true, |m| m == mount) {
                matched += 1;
            }
            g = self.graph.lock();
        }
        g.worklist_busy = false;
        if g.worklist_waiters > 0 {
            self.worklist_cv.notify_all();
        }
        self.finish_graph(g);
        matched
    }

    pub(crate) fn handle_workitem(&self, item: WorkItem) {
        tracing::debug!(target: "ordfs::worklist", item = ?item, "dispatch");
        match item {
            WorkItem::FreeFrag(h) => self.handle_workitem_freefrag(h),
            WorkItem::FreeBlks(h) => self.handle_workitem_freeblocks(h),
            WorkItem::FreeFile(h) => self.handle_workitem_freefile(h),
            WorkItem::DirRem(h) => self.handle_workitem_remove(h),
        }
    }

    /// Release a fragment superseded during a file-growth reallocation.
    fn handle_workitem_freefrag(&self, h: crate::arena::Handle<crate::record::FreeFrag>) {
        let (fs, ino, blkno, size) = self.with_graph(|g| {
            let ff = g.freefrags.get(h);
            (ff.fs, ff.ino, ff.blkno, ff.frag_size)
        });
        if let Err(err) = self.allocator.free_blocks_or_fragment(fs, blkno, size, ino) {
            self.diagnostic("freefrag", &err);
        }
        self.with_graph(|g| g.retire_freefrag(h));
    }

    /// Release every block of a truncated-to-zero file: indirect trees
    /// first, then directs.
    fn handle_workitem_freeblocks(&self, h: crate::arena::Handle<crate::record::FreeBlks>) {
        let (fs, ino, old_size, db, ib, geo) = self.with_graph(|g| {
            let fb = g.freeblks.get(h);
            (fb.fs, fb.ino, fb.old_size, fb.db, fb.ib, g.geo(fb.fs))
        });
        let bsize = geo.block_size();
        for level in (0..NIADDR).rev() {
            let bn = ib[level];
            if bn.is_none() {
                continue;
            }
            if let Err(err) = self.indir_trunc(fs, ino, bn, level, geo) {
                self.diagnostic("freeblocks: indirect walk", &err);
            }
            if let Err(err) = self.allocator.free_blocks_or_fragment(fs, bn, bsize, ino) {
                self.diagnostic("freeblocks: indirect block", &err);
            }
        }
        for i in (0..NDADDR).rev() {
            let bn = db[i];
            if bn.is_none() {
                continue;
            }
            let size = geo.size_of_block(old_size, LogicalBlock(i as u64));
            if let Err(err) = self.allocator.free_blocks_or_fragment(fs, bn, size, ino) {
                self.diagnostic("freeblocks: direct block", &err);
            }
        }
        self.with_graph(|g| g.retire_freeblks(h));
    }

    /// Recursively release the blocks referenced from one indirect block.
    ///
    /// The zeroed inode is durable by the time this runs, so blocks may be
    /// freed as encountered. If the file was deleted before its indirect
    /// blocks ever reached disk, truncation left their real in-memory
    /// content in the orphaned-image map; otherwise the durable content is
    /// read back from the device.
    fn indir_trunc(
        &self,
        fs: FsId,
        ino: InodeNum,
        blk: BlockNo,
        level: usize,
        geo: FsGeometry,
    ) -> Result<()> {
        let bytes = match self.with_graph(|g| g.orphaned_indirect.remove(&(fs, blk))) {
            Some(bytes) => bytes,
            None => self.cache.read_disk_block(blk)?,
        };
        let ptrs = (bytes.len() / 8).min(geo.ptrs_per_block() as usize);
        for i in (0..ptrs).rev() {
            let nb = ordfs_ondisk::indir_ptr(&bytes, i)
                .map_err(|e| OrdfsError::Corruption {
                    block: blk.0,
                    detail: e.to_string(),
                })?;
            if nb.is_none() {
                continue;
            }
            if level > 0 {
                self.indir_trunc(fs, ino, nb, level - 1, geo)?;
            }
            if let Err(err) =
                self.allocator
                    .free_blocks_or_fragment(fs, nb, geo.block_size(), ino)
            {
                self.diagnostic("indirect truncation", &err);
            }
        }
        Ok(())
    }

    /// Release an inode's storage. Runs only after the zeroed on-disk inode
    /// is durable and all of its blocks have been queued ahead of it.
    fn handle_workitem_freefile(&self, h: crate::arena::Handle<crate::record::FreeFile>) {
        let (fs, ino, mode) = self.with_graph(|g| {
            let ff = g.freefiles.get(h);
            assert!(
                g.inodedep_index
                    .get(&InodeKey { fs: ff.fs, ino: ff.ino })
                    .is_none(),
                "inode {} record survived to storage release",
                ff.ino
            );
            (ff.fs, ff.ino, ff.mode)
        });
        if let Err(err) = self.allocator.free_inode(fs, ino, mode) {
            self.diagnostic("freefile", &err);
        }
        self.with_graph(|g| g.retire_freefile(h));
    }

    /// The zeroing of a directory entry is durable: drop the removed
    /// inode's link count, and for a directory removal truncate it and
    /// queue the parent's `..` decrement behind its inode write.
    fn handle_workitem_remove(&self, h: crate::arena::Handle<crate::record::DirRem>) {
        let (fs, old_ino, dir_ino, is_rmdir, dir_change) = self.with_graph(|g| {
            let dr = g.dirrems.get(h);
            (dr.fs, dr.old_ino, dr.dir_ino, dr.is_rmdir, dr.dir_change)
        });

        if !is_rmdir {
            match self.vfs.adjust_link_count(fs, old_ino, -1) {
                Ok(counts) => self.with_graph(|g| {
                    let key = InodeKey { fs, ino: old_ino };
                    let idp = g
                        .inodedep_index
                        .get(&key)
                        .unwrap_or_else(|| panic!("entry removal lost inode {old_ino} record"));
                    g.inodedeps.get_mut(idp).nlink_delta =
                        i64::from(counts.nlink) - i64::from(counts.effective);
                }),
                Err(err) => self.diagnostic("remove: link count", &err),
            }
            self.with_graph(|g| g.retire_dirrem(h));
            return;
        }

        // Directory removal: drop both the deleted entry's reference and
        // the directory's own `.`.
        match self.vfs.adjust_link_count(fs, old_ino, -2) {
            Ok(counts) => self.with_graph(|g| {
                let key = InodeKey { fs, ino: old_ino };
                let idp = g
                    .inodedep_index
                    .get(&key)
                    .unwrap_or_else(|| panic!("directory removal lost inode {old_ino} record"));
                g.inodedeps.get_mut(idp).nlink_delta =
                    i64::from(counts.nlink) - i64::from(counts.effective);
            }),
            Err(err) => self.diagnostic("rmdir: link count", &err),
        }
        if let Err(err) = self.vfs.truncate_to_zero(fs, old_ino) {
            self.diagnostic("rmdir: truncate", &err);
        }

        // A rename into a new parent balances the parent's link count;
        // skip the follow-up decrement.
        if dir_change {
            self.with_graph(|g| g.retire_dirrem(h));
            return;
        }

        // Repurpose the record for the parent's `..` decrement, held until
        // the removed directory's zeroed inode is durable (or run now if it
        // never reached disk at all).
        let parent = dir_ino
            .unwrap_or_else(|| panic!("directory removal of {old_ino} has no parent recorded"));
        let run_now = self.with_graph(|g| {
            {
                let dr = g.dirrems.get_mut(h);
                dr.is_rmdir = false;
                dr.dir_change = false;
                dr.old_ino = parent;
            }
            let key = InodeKey { fs, ino: old_ino };
            match g.inodedep_index.get(&key) {
                None => true,
                Some(idp) => {
                    if g.check_inode_unwritten(idp) {
                        true
                    } else {
                        g.inodedeps.get_mut(idp).inode_wait.push(DepRef::DirRem(h));
                        false
                    }
                }
            }
        });
        if run_now {
            self.handle_workitem_remove(h);
        }
        if let Err(err) = self.vfs.update_inode_on_disk(fs, old_ino) {
            self.diagnostic("rmdir: inode update", &err);
        }
    }

    /// Drain the worklist and flush dirty metadata for one mount until no
    /// dependency remains, retrying while new work keeps appearing.
    /// Returns the number of work items processed for the mount.
    pub fn flush_all_for_mount(&self, mount: MountId) -> Result<usize> {
        // Await our turn at an accurate drain.
        {
            let mut g = self.graph.lock();
            while g.worklist_busy {
                g.worklist_waiters += 1;
                self.worklist_cv.wait(&mut g);
                g.worklist_waiters -= 1;
            }
            self.finish_graph(g);
        }

        let mut total = 0;
        for _ in 0..self.config.flush_retry_limit {
            loop {
                let n = self.process_worklist(Some(mount));
                total += n;
                if n == 0 {
                    break;
                }
            }
            // Push every inode with live dependencies through its buffer so
            // records waiting on inode durability can drain.
            let tracked: Vec<(FsId, InodeNum)> = self.with_graph(|g| {
                let fs = g.mounts.get(&mount).map(|m| m.fs);
                fs.map(|fs| {
                    g.inodedep_index
                        .iter()
                        .filter(|(key, _)| key.fs == fs)
                        .map(|(key, _)| (key.fs, key.ino))
                        .collect()
                })
                .unwrap_or_default()
            });
            for (fs, ino) in tracked {
                if let Err(err) = self.vfs.update_inode_on_disk(fs, ino) {
                    self.diagnostic("flush: inode update", &err);
                }
            }
            for buf in self.cache.dirty_buffers() {
                self.cache.flush(buf)?;
            }
            self.process_completions();
            let remaining =
                self.with_graph(|g| g.outstanding_for_mount(mount) + g.worklist.len());
            if remaining == 0 && self.cache.dirty_buffers().is_empty() {
                tracing::info!(
                    target: "ordfs::worklist",
                    mount = mount.0,
                    processed = total,
                    "mount fully flushed"
                );
                return Ok(total);
            }
        }
        let remaining = self.with_graph(|g| g.outstanding_for_mount(mount) + g.worklist.len());
        Err(OrdfsError::FlushIncomplete { remaining })
    }
}
