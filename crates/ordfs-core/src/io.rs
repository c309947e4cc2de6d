//! Write interception: rollback at initiation, roll-forward at completion.
//!
//! Every metadata buffer write is bracketed by two passes over the buffer's
//! attachment list:
//!
//! - **initiation** rewrites the outgoing bytes so they never reference a
//!   resource whose own allocation record is not yet durable — inode slots
//!   are zeroed or regressed to the last durable fragment boundary,
//!   uncommitted directory entries get their old (or zero) inode number,
//!   and dirty indirect blocks are swapped for their safe copy;
//! - **completion** restores the up-to-date content, advances completeness
//!   flags, retires records whose constraints are now satisfied, and
//!   re-attaches (and re-dirties) anything still pending so the real bytes
//!   are rewritten.
//!
//! A failed write never reaches completion; the rolled-back bytes stay in
//! the buffer and a retry re-enters initiation, which recognizes records
//! that are already rolled back and leaves them as they are.
//!
//! Any mismatch between a record and the bytes it claims to govern aborts:
//! it means the ordering protocol has been broken and continuing could put
//! a forward reference on disk.

use crate::arena::Handle;
use crate::graph::{GraphCore, UpdList};
use crate::record::{
    CacheAction, DepRef, DirAdd, IndirDep, InodeDep, MkDirKind, PageDep,
};
use ordfs_ondisk::{dir_entry_ino, set_dir_entry_ino, set_indir_ptr, DiskInode};
use ordfs_types::{BufId, InodeNum, NDADDR};

impl GraphCore {
    // ── Initiation ──────────────────────────────────────────────────────

    /// Roll the outgoing bytes of `buf` back to their last safe state.
    pub fn initiate_write(&mut self, buf: BufId, bytes: &mut [u8]) {
        let deps = self.buffer_deps.get(&buf).cloned().unwrap_or_default();
        for dep in deps {
            match dep {
                DepRef::Page(h) => self.initiate_filepage(h, bytes),
                DepRef::Inode(h) => self.initiate_inodeblock(h, bytes),
                DepRef::IndirDep(h) => self.initiate_indirblock(h, buf, bytes),
                DepRef::MkDir(_)
                | DepRef::BmSafeMap(_)
                | DepRef::AllocDirect(_)
                | DepRef::AllocIndir(_) => {}
                other => panic!(
                    "write initiation found a {} attached to buffer {buf}",
                    other.kind()
                ),
            }
        }
    }

    /// Replace uncommitted directory entries with their rollback inode
    /// number (zero, or the previous occupant for an entry change).
    fn initiate_filepage(&mut self, pagedep: Handle<PageDep>, bytes: &mut [u8]) {
        if self.pagedeps.get(pagedep).io_started {
            // Write retry after an error: entries are already rolled back.
            tracing::warn!(target: "ordfs::io", "directory page write already started");
            return;
        }
        self.pagedeps.get_mut(pagedep).io_started = true;
        let adds = self.pagedeps.get(pagedep).pending_adds.clone();
        for dap_h in adds {
            let (offset, new_ino, previous) = {
                let dap = self.diradds.get(dap_h);
                (dap.offset, dap.new_ino, dap.previous)
            };
            let on_disk = dir_entry_ino(bytes, offset)
                .unwrap_or_else(|e| panic!("directory entry at {offset} unreadable: {e}"));
            if on_disk != new_ino.0 {
                panic!(
                    "directory entry at {offset} holds inode {on_disk}, expected {new_ino}"
                );
            }
            let rollback = previous.map_or(0, |prev| self.dirrems.get(prev).old_ino.0);
            set_dir_entry_ino(bytes, offset, rollback)
                .unwrap_or_else(|e| panic!("directory entry at {offset} unwritable: {e}"));
            self.diradds
                .get_mut(dap_h)
                .slot
                .undo()
                .unwrap_or_else(|e| panic!("directory entry rollback: {e}"));
        }
    }

    /// Regress the inode's on-disk image so it references only durable
    /// storage.
    fn initiate_inodeblock(&mut self, idp: Handle<InodeDep>, bytes: &mut [u8]) {
        if self.inodedeps.get(idp).io_started {
            tracing::warn!(target: "ordfs::io", "inode block write already started");
            return;
        }
        self.inodedeps.get_mut(idp).io_started = true;

        let (fs, ino) = {
            let dep = self.inodedeps.get(idp);
            (dep.fs, dep.ino)
        };
        let geo = self.geo(fs);
        let offset = geo.inode_slot_offset(ino);

        // A not-yet-durable bitmap means the allocated inode itself may not
        // appear in the write: save the image and send zeros.
        if !self.inodedeps.get(idp).flags.bitmap_durable {
            assert!(
                self.inodedeps.get(idp).saved_inode.is_none(),
                "inode {ino} already has a saved image"
            );
            let image = DiskInode::decode_at(bytes, offset)
                .unwrap_or_else(|e| panic!("inode {ino} slot undecodable: {e}"));
            DiskInode::zero_at(bytes, offset, geo.inode_size() as usize)
                .unwrap_or_else(|e| panic!("inode {ino} slot unwritable: {e}"));
            self.inodedeps.get_mut(idp).saved_inode = Some(Box::new(image));
            tracing::debug!(target: "ordfs::io", ino = ino.0, "inode_rolled_back_to_zero");
            return;
        }

        let mut di = DiskInode::decode_at(bytes, offset)
            .unwrap_or_else(|e| panic!("inode {ino} slot undecodable: {e}"));
        self.inodedeps.get_mut(idp).saved_size = Some(di.size);
        let updates = self.inodedeps.get(idp).inode_updates.clone();
        if updates.is_empty() {
            return;
        }

        // Mark every tracked pointer busy, verifying the buffer agrees with
        // the records.
        let mut prev_lbn: Option<u64> = None;
        for &adp_h in &updates {
            let adp = self.allocdirects.get(adp_h);
            if let Some(prev) = prev_lbn {
                assert!(prev < adp.lbn.0, "pointer-update list out of order");
            }
            prev_lbn = Some(adp.lbn.0);
            let slot_value = if adp.lbn.is_direct() {
                di.db[adp.lbn.0 as usize]
            } else {
                di.ib[adp.lbn.0 as usize - NDADDR]
            };
            if slot_value != adp.new_blkno {
                panic!(
                    "inode {ino} pointer {} holds block {}, expected {}",
                    adp.lbn, slot_value, adp.new_blkno
                );
            }
        }
        for &adp_h in &updates {
            self.allocdirects
                .get_mut(adp_h)
                .slot
                .undo()
                .unwrap_or_else(|e| panic!("pointer rollback: {e}"));
        }

        // The on-disk inode may not claim to be larger than the last
        // durable fragment: roll direct pointers back to their old values,
        // and on the first rollback to a fragment regress the size to that
        // boundary and zero everything beyond it.
        let bsize = u64::from(geo.block_size());
        let mut last_direct: Option<u64> = None;
        let mut indirect_start = updates.len();
        let mut fragment_cut = false;
        for (i, &adp_h) in updates.iter().enumerate() {
            let (lbn, old_blkno, old_size) = {
                let adp = self.allocdirects.get(adp_h);
                (adp.lbn, adp.old_blkno, adp.old_size)
            };
            if !lbn.is_direct() {
                indirect_start = i;
                break;
            }
            di.db[lbn.0 as usize] = old_blkno;
            last_direct = Some(lbn.0);
            if !geo.is_fragment(old_size) {
                continue;
            }
            di.size = lbn.0 * bsize + u64::from(old_size);
            for slot in di.db.iter_mut().skip(lbn.0 as usize + 1) {
                *slot = ordfs_types::BlockNo::NONE;
            }
            for slot in di.ib.iter_mut() {
                *slot = ordfs_types::BlockNo::NONE;
            }
            fragment_cut = true;
            break;
        }

        if !fragment_cut {
            // If the last allocated block was zeroed, regress the size to
            // the last block still claimed. All earlier blocks are full
            // sized (no fragments were seen above).
            if let Some(last_lbn) = last_direct {
                if di.size <= (last_lbn + 1) * bsize {
                    let mut end = 0_u64;
                    for i in (0..=last_lbn as usize).rev() {
                        if !di.db[i].is_none() {
                            end = i as u64 + 1;
                            break;
                        }
                    }
                    di.size = end * bsize;
                }
            }
            // Indirect pointers with pending updates never go out; the
            // durability of their file size is not guaranteed either way.
            for &adp_h in &updates[indirect_start..] {
                let lbn = self.allocdirects.get(adp_h).lbn;
                di.ib[lbn.0 as usize - NDADDR] = ordfs_types::BlockNo::NONE;
            }
        }

        di.encode_at(bytes, offset)
            .unwrap_or_else(|e| panic!("inode {ino} slot unwritable: {e}"));
        tracing::debug!(
            target: "ordfs::io",
            ino = ino.0,
            rolled_size = di.size,
            "inode_rolled_back"
        );
    }

    /// Swap a dirty indirect block for its safe copy, or retire the record
    /// when every pointer is already committed.
    fn initiate_indirblock(&mut self, ind: Handle<IndirDep>, buf: BufId, bytes: &mut [u8]) {
        assert!(
            !self.indirdeps.get(ind).going_away,
            "indirect block dependency written while being torn down"
        );
        if !self.indirdeps.get(ind).state.is_attached() {
            tracing::warn!(target: "ordfs::io", "indirect block write already started");
            return;
        }
        if self.indirdeps.get(ind).pending_ptrs.is_empty() {
            // Only committed pointers remain: the real content is safe and
            // the safe copy has served its purpose.
            assert!(
                self.indirdeps.get(ind).done_ptrs.is_empty(),
                "retired indirect dependency still holds finished pointers"
            );
            self.detach(buf, DepRef::IndirDep(ind));
            self.retire_indirdep(ind);
            return;
        }
        let dep = self.indirdeps.get_mut(ind);
        dep.saved_data = Some(bytes.to_vec());
        bytes.copy_from_slice(&dep.shadow);
        dep.state
            .undo()
            .unwrap_or_else(|e| panic!("indirect block rollback: {e}"));
        tracing::debug!(target: "ordfs::io", buf = buf.0, "indirect_block_swapped_for_safe_copy");
    }

    // ── Completion ──────────────────────────────────────────────────────

    /// Roll `buf` forward after a durable write and retire what is now
    /// satisfied. Runs on the completion drainer, in ordinary task context.
    pub fn complete_write(&mut self, buf: BufId, bytes: &mut [u8]) {
        let deps = self.take_buffer_deps(buf);
        let mut reattach: Vec<DepRef> = Vec::new();
        let mut redirty = false;

        for dep in deps {
            match dep {
                DepRef::Page(h) => {
                    let (rd, ra) = self.handle_written_filepage(h, bytes);
                    redirty |= rd;
                    if ra {
                        reattach.push(dep);
                    }
                }
                DepRef::Inode(h) => {
                    let (rd, ra) = self.handle_written_inodeblock(h, bytes);
                    redirty |= rd;
                    if ra {
                        reattach.push(dep);
                    }
                }
                DepRef::BmSafeMap(h) => self.handle_written_bitmap(h),
                DepRef::MkDir(h) => self.handle_written_mkdir(h, MkDirKind::Body),
                DepRef::AllocDirect(h) => {
                    self.allocdirects.get_mut(h).flags.self_durable = true;
                    self.allocdirect_partdone(h);
                }
                DepRef::AllocIndir(h) => {
                    self.allocindirs.get_mut(h).flags.self_durable = true;
                    self.allocindir_partdone(h);
                }
                DepRef::IndirDep(h) => {
                    self.handle_written_indirblock(h, bytes);
                    reattach.push(dep);
                    redirty = true;
                }
                other => panic!(
                    "write completion found a {} attached to buffer {buf}",
                    other.kind()
                ),
            }
        }

        for dep in reattach {
            self.attach(buf, dep);
        }
        if redirty {
            self.actions.push(CacheAction::MarkDirty(buf));
        }
    }

    /// The cylinder-group bitmap is durable: release everything gated on it.
    fn handle_written_bitmap(&mut self, bm: Handle<crate::record::BmSafeMap>) {
        let newblks = std::mem::take(&mut self.bmsafemaps.get_mut(bm).newblk_deps);
        for h in newblks {
            let dep = self.newblks.get_mut(h);
            dep.bitmap_durable = true;
            dep.gate = None;
        }
        let allocdirects = std::mem::take(&mut self.bmsafemaps.get_mut(bm).allocdirect_deps);
        for h in allocdirects {
            let dep = self.allocdirects.get_mut(h);
            dep.flags.bitmap_durable = true;
            dep.gate = None;
            self.allocdirect_partdone(h);
        }
        let allocindirs = std::mem::take(&mut self.bmsafemaps.get_mut(bm).allocindir_deps);
        for h in allocindirs {
            let dep = self.allocindirs.get_mut(h);
            dep.flags.bitmap_durable = true;
            dep.gate = None;
            self.allocindir_partdone(h);
        }
        let inodedeps = std::mem::take(&mut self.bmsafemaps.get_mut(bm).inodedep_deps);
        for h in inodedeps {
            let dep = self.inodedeps.get_mut(h);
            dep.flags.bitmap_durable = true;
            dep.gate = None;
        }
        self.retire_bmsafemap(bm);
    }

    /// Free the just-finished pointer update, and any fully complete
    /// successors, once no earlier update still guards a fragment.
    pub(crate) fn allocdirect_partdone(&mut self, adp: Handle<crate::record::AllocDirect>) {
        if !self.allocdirects.get(adp).flags.is_complete() {
            return;
        }
        assert!(
            self.allocdirects.get(adp).gate.is_none(),
            "complete pointer update still gated on its bitmap"
        );
        let idp = self.allocdirects.get(adp).inodedep;
        let geo = self.geo(self.inodedeps.get(idp).fs);
        let current = self.inodedeps.get(idp).inode_updates.clone();

        // The on-disk inode size ends at the first fragment boundary still
        // tracked ahead of us; nothing past a fragment may be freed yet.
        let mut position = None;
        for (i, &h) in current.iter().enumerate() {
            if h == adp {
                position = Some(i);
                break;
            }
            if geo.is_fragment(self.allocdirects.get(h).old_size) {
                return;
            }
        }
        let Some(position) = position else {
            // On the future list: freed only after it merges into the
            // current list.
            assert!(
                self.inodedeps.get(idp).new_inode_updates.contains(&adp),
                "complete pointer update on neither inode list"
            );
            return;
        };

        // With a bitmap gate still pending the inode has never been
        // written, so superseded fragments may be freed without delay.
        let delay = self.inodedeps.get(idp).flags.bitmap_durable;
        for &h in &current[position..] {
            if !self.allocdirects.get(h).flags.is_complete() {
                return;
            }
            self.free_allocdirect(idp, UpdList::Current, h, delay);
        }
    }

    /// Commit a finished indirect pointer into the safe copy, or park it if
    /// the safe copy is currently on the wire.
    pub(crate) fn allocindir_partdone(&mut self, aip: Handle<crate::record::AllocIndir>) {
        if !self.allocindirs.get(aip).flags.is_complete() {
            return;
        }
        assert!(
            self.allocindirs.get(aip).gate.is_none(),
            "complete indirect pointer update still gated on its bitmap"
        );
        let ind = self.allocindirs.get(aip).indirdep;
        if !self.indirdeps.get(ind).state.is_attached() {
            let dep = self.indirdeps.get_mut(ind);
            let pos = dep
                .pending_ptrs
                .iter()
                .position(|&h| h == aip)
                .unwrap_or_else(|| panic!("finished indirect pointer not pending"));
            dep.pending_ptrs.remove(pos);
            dep.done_ptrs.push(aip);
            return;
        }
        let (offset, new_blkno) = {
            let a = self.allocindirs.get(aip);
            (a.offset, a.new_blkno)
        };
        set_indir_ptr(&mut self.indirdeps.get_mut(ind).shadow, offset, new_blkno)
            .unwrap_or_else(|e| panic!("safe copy slot {offset} unwritable: {e}"));
        self.free_allocindir(aip, None);
    }

    /// Restore an indirect block's up-to-date content and commit pointers
    /// that finished while the safe copy was on the wire.
    fn handle_written_indirblock(&mut self, ind: Handle<IndirDep>, bytes: &mut [u8]) {
        assert!(
            !self.indirdeps.get(ind).going_away,
            "indirect block completion during teardown"
        );
        {
            let dep = self.indirdeps.get_mut(ind);
            let saved = dep
                .saved_data
                .take()
                .unwrap_or_else(|| panic!("indirect block completed without saved content"));
            bytes.copy_from_slice(&saved);
            dep.state
                .redo()
                .unwrap_or_else(|e| panic!("indirect block roll-forward: {e}"));
        }
        loop {
            let Some(&aip) = self.indirdeps.get(ind).done_ptrs.first() else {
                break;
            };
            self.indirdeps.get_mut(ind).done_ptrs.remove(0);
            // Now that the block is attached again, partdone commits the
            // pointer into the safe copy and retires the record.
            self.allocindir_partdone(aip);
            assert!(
                !self.allocindirs.contains(aip),
                "finished indirect pointer survived roll-forward"
            );
        }
        self.stats.indirect_ptrs += 1;
    }

    /// One of the two mkdir preconditions became durable.
    pub(crate) fn handle_written_mkdir(&mut self, mkdir: Handle<crate::record::MkDir>, kind: MkDirKind) {
        assert!(
            self.mkdirs.get(mkdir).kind == kind,
            "mkdir completion of the wrong kind"
        );
        let dap = self.mkdirs.get(mkdir).diradd;
        match kind {
            MkDirKind::Body => self.diradds.get_mut(dap).mkdir_body_pending = false,
            MkDirKind::Parent => self.diradds.get_mut(dap).mkdir_parent_pending = false,
        }
        if self.diradds.get(dap).all_complete() && self.diradds.get(dap).slot.is_attached() {
            self.settle_diradd(dap);
        }
        if let Some(buf) = self.mkdirs.get(mkdir).attached {
            self.detach(buf, DepRef::MkDir(mkdir));
        }
        self.mkdir_list.retain(|&m| m != mkdir);
        self.retire_mkdir(mkdir);
    }

    /// Move a fully complete addition to its page's settled list.
    pub(crate) fn settle_diradd(&mut self, dap: Handle<DirAdd>) {
        let pagedep = self.diradds.get(dap).pagedep;
        let page = self.pagedeps.get_mut(pagedep);
        if let Some(pos) = page.pending_adds.iter().position(|&h| h == dap) {
            page.pending_adds.remove(pos);
            page.settled_adds.push(dap);
        }
    }

    /// The inode referenced by a directory addition is durable.
    pub(crate) fn diradd_inode_written(&mut self, dap: Handle<DirAdd>, idp: Handle<InodeDep>) {
        self.diradds.get_mut(dap).inode_written = true;
        if self.diradds.get(dap).all_complete() && self.diradds.get(dap).slot.is_attached() {
            self.settle_diradd(dap);
        }
        self.inodedeps.get_mut(idp).pending.push(DepRef::DirAdd(dap));
    }

    /// A directory page write landed: removals may proceed, committed
    /// additions are released, and rolled-back entries are restored.
    fn handle_written_filepage(
        &mut self,
        pagedep: Handle<PageDep>,
        bytes: &mut [u8],
    ) -> (bool, bool) {
        assert!(
            self.pagedeps.get(pagedep).io_started,
            "directory page completed without initiation"
        );
        self.pagedeps.get_mut(pagedep).io_started = false;

        // Entry zeroings have reached disk; the removals may now drop link
        // counts.
        let dir_ino = self.pagedeps.get(pagedep).ino;
        let removals = std::mem::take(&mut self.pagedeps.get_mut(pagedep).removals);
        for dirrem in removals {
            self.dirrems.get_mut(dirrem).dir_ino = Some(dir_ino);
            self.worklist_push(crate::record::WorkItem::DirRem(dirrem));
        }

        // Committed additions are done — unless the page sits in a newly
        // allocated block whose inode pointer is still pending.
        if !self.pagedeps.get(pagedep).holds_new_block {
            while let Some(&dap) = self.pagedeps.get(pagedep).settled_adds.first() {
                self.free_diradd(dap);
            }
        }

        // Restore rolled-back entries and re-dirty so the real values go
        // out with the next write.
        let mut changes = false;
        let pending = self.pagedeps.get(pagedep).pending_adds.clone();
        for dap_h in pending {
            let (offset, new_ino) = {
                let dap = self.diradds.get(dap_h);
                assert!(
                    !dap.slot.is_attached(),
                    "directory entry attached during page write"
                );
                (dap.offset, dap.new_ino)
            };
            set_dir_entry_ino(bytes, offset, new_ino.0)
                .unwrap_or_else(|e| panic!("directory entry at {offset} unwritable: {e}"));
            self.diradds
                .get_mut(dap_h)
                .slot
                .redo()
                .unwrap_or_else(|e| panic!("directory entry roll-forward: {e}"));
            changes = true;
            if self.diradds.get(dap_h).all_complete() {
                self.settle_diradd(dap_h);
            }
        }

        if changes {
            self.stats.dir_entries += 1;
            return (true, true);
        }
        if !self.pagedeps.get(pagedep).holds_new_block {
            self.free_pagedep_if_idle(pagedep);
        }
        (false, false)
    }

    /// An inode block write landed: restore the image, advance pointer
    /// updates, and release everything that waited on this inode being
    /// durable.
    fn handle_written_inodeblock(
        &mut self,
        idp: Handle<InodeDep>,
        bytes: &mut [u8],
    ) -> (bool, bool) {
        assert!(
            self.inodedeps.get(idp).io_started,
            "inode block completed without initiation"
        );
        {
            let dep = self.inodedeps.get_mut(idp);
            dep.io_started = false;
            dep.flags.self_durable = true;
        }
        let (fs, ino) = {
            let dep = self.inodedeps.get(idp);
            (dep.fs, dep.ino)
        };
        let geo = self.geo(fs);
        let offset = geo.inode_slot_offset(ino);

        // The bitmap was incomplete and the slot went out zeroed: restore
        // the saved image and keep the buffer dirty until it can be written
        // for real.
        if let Some(saved) = self.inodedeps.get_mut(idp).saved_inode.take() {
            saved
                .encode_at(bytes, offset)
                .unwrap_or_else(|e| panic!("inode {ino} slot unwritable: {e}"));
            self.stats.inode_bitmap += 1;
            tracing::debug!(target: "ordfs::io", ino = ino.0, "inode_image_restored");
            return (true, true);
        }

        let mut di = DiskInode::decode_at(bytes, offset)
            .unwrap_or_else(|e| panic!("inode {ino} slot undecodable: {e}"));
        let mut changes = false;
        let updates = self.inodedeps.get(idp).inode_updates.clone();
        for &adp_h in &updates {
            let (lbn, old_blkno, new_blkno) = {
                let adp = self.allocdirects.get(adp_h);
                assert!(
                    !adp.slot.is_attached(),
                    "pointer update attached during inode write"
                );
                (adp.lbn, adp.old_blkno, adp.new_blkno)
            };
            if lbn.is_direct() {
                let slot = di.db[lbn.0 as usize];
                if slot != old_blkno {
                    panic!(
                        "inode {ino} direct pointer {lbn} holds {slot}, expected {old_blkno}"
                    );
                }
                di.db[lbn.0 as usize] = new_blkno;
            } else {
                let slot = di.ib[lbn.0 as usize - NDADDR];
                if !slot.is_none() {
                    panic!("inode {ino} indirect pointer {lbn} already holds {slot}");
                }
                di.ib[lbn.0 as usize - NDADDR] = new_blkno;
            }
            self.allocdirects
                .get_mut(adp_h)
                .slot
                .redo()
                .unwrap_or_else(|e| panic!("pointer roll-forward: {e}"));
            changes = true;
        }

        let saved_size = self
            .inodedeps
            .get_mut(idp)
            .saved_size
            .take()
            .unwrap_or_else(|| panic!("inode {ino} completed without a saved size"));
        if di.size != saved_size {
            di.size = saved_size;
            changes = true;
        }
        di.encode_at(bytes, offset)
            .unwrap_or_else(|e| panic!("inode {ino} slot unwritable: {e}"));
        if changes {
            self.stats.direct_ptrs += 1;
        }

        // Advance whatever the durable prefix now allows.
        if let Some(&first) = self.inodedeps.get(idp).inode_updates.first() {
            self.allocdirect_partdone(first);
        }

        // Deallocations held for the inode write may now proceed. Inode
        // storage release is deferred past everything else queued here so
        // the old blocks are freed before the inode can be reused.
        let waiting = std::mem::take(&mut self.inodedeps.get_mut(idp).buf_wait);
        let mut freefile = None;
        for dep in waiting {
            match dep {
                DepRef::FreeFile(h) => {
                    assert!(freefile.is_none(), "two freefiles on one inode");
                    freefile = Some(h);
                }
                DepRef::MkDir(h) => self.handle_written_mkdir(h, MkDirKind::Parent),
                DepRef::DirAdd(h) => self.diradd_inode_written(h, idp),
                DepRef::FreeBlks(h) => self.worklist_push(crate::record::WorkItem::FreeBlks(h)),
                DepRef::FreeFrag(h) => self.worklist_push(crate::record::WorkItem::FreeFrag(h)),
                DepRef::DirRem(h) => self.worklist_push(crate::record::WorkItem::DirRem(h)),
                DepRef::NewDirBlk(h) => self.free_newdirblk(h),
                other => panic!("{} waiting on an inode write", other.kind()),
            }
        }
        if let Some(ff) = freefile {
            assert!(
                self.free_inodedep(idp),
                "inode {ino} still live at storage release"
            );
            self.worklist_push(crate::record::WorkItem::FreeFile(ff));
            return (changes, false);
        }

        if self.free_inodedep(idp) {
            return (changes, false);
        }
        if self.inodedeps.get(idp).inode_updates.is_empty() {
            return (changes, false);
        }
        (changes, true)
    }

    /// Tear down every dependency attached to a data buffer of a file
    /// being truncated to zero. None of the tracked pointers will ever be
    /// visible, so additions are tossed outright; removals survive, held
    /// behind the zeroed inode write when one is still pending.
    ///
    /// For an indirect block the real in-memory content is parked in the
    /// orphaned-image map under its physical address, where the deferred
    /// free walk will find it — the inode that mapped its logical address
    /// is already gone.
    pub(crate) fn deallocate_dependencies_locked(
        &mut self,
        buf: BufId,
        bytes: &[u8],
        inodedep: Option<Handle<InodeDep>>,
    ) {
        let deps = self.take_buffer_deps(buf);
        for dep in deps {
            match dep {
                DepRef::IndirDep(ind) => {
                    assert!(
                        !self.indirdeps.get(ind).going_away,
                        "indirect block torn down twice"
                    );
                    self.indirdeps.get_mut(ind).going_away = true;
                    loop {
                        let next = {
                            let d = self.indirdeps.get(ind);
                            d.pending_ptrs.first().or(d.done_ptrs.first()).copied()
                        };
                        let Some(aip) = next else { break };
                        self.free_allocindir(aip, inodedep);
                    }
                    let (fs, blkno) = {
                        let d = self.indirdeps.get(ind);
                        (d.fs, d.blkno)
                    };
                    let real = self
                        .indirdeps
                        .get_mut(ind)
                        .saved_data
                        .take()
                        .unwrap_or_else(|| bytes.to_vec());
                    self.orphaned_indirect.insert((fs, blkno), real);
                    self.retire_indirdep(ind);
                }
                DepRef::Page(pagedep) => {
                    while let Some(&dap) = self.pagedeps.get(pagedep).pending_adds.first() {
                        self.free_diradd(dap);
                    }
                    while let Some(&dap) = self.pagedeps.get(pagedep).settled_adds.first() {
                        self.free_diradd(dap);
                    }
                    let dir_ino = self.pagedeps.get(pagedep).ino;
                    let removals =
                        std::mem::take(&mut self.pagedeps.get_mut(pagedep).removals);
                    for dirrem in removals {
                        self.dirrems.get_mut(dirrem).dir_ino = Some(dir_ino);
                        let hold = inodedep
                            .map(|idp| !self.inodedeps.get(idp).flags.is_complete())
                            .unwrap_or(false);
                        if hold {
                            self.inodedeps
                                .get_mut(inodedep.unwrap())
                                .buf_wait
                                .push(DepRef::DirRem(dirrem));
                        } else {
                            self.worklist_push(crate::record::WorkItem::DirRem(dirrem));
                        }
                    }
                    if self.pagedeps.get(pagedep).holds_new_block {
                        let idp = inodedep
                            .unwrap_or_else(|| panic!("new directory block without inode record"));
                        let ndb = self
                            .inodedeps
                            .get(idp)
                            .buf_wait
                            .iter()
                            .find_map(|d| match d {
                                DepRef::NewDirBlk(h)
                                    if self.newdirblks.get(*h).pagedep == pagedep =>
                                {
                                    Some(*h)
                                }
                                _ => None,
                            })
                            .unwrap_or_else(|| panic!("lost new-directory-block record"));
                        self.inodedeps
                            .get_mut(idp)
                            .buf_wait
                            .retain(|d| *d != DepRef::NewDirBlk(ndb));
                        self.free_newdirblk(ndb);
                    }
                    self.free_pagedep_if_idle(pagedep);
                }
                DepRef::AllocIndir(aip) => self.free_allocindir(aip, inodedep),
                other => panic!(
                    "{} attached to a buffer being torn down",
                    other.kind()
                ),
            }
        }
    }

    /// Look up the effective link count for a freshly loaded inode image.
    pub fn effective_link_count(&self, fs: ordfs_types::FsId, ino: InodeNum, ondisk: u32) -> u32 {
        let key = crate::tables::InodeKey { fs, ino };
        match self.inodedep_index.get(&key) {
            Some(idp) => {
                let delta = self.inodedeps.get(idp).nlink_delta;
                u32::try_from(i64::from(ondisk) - delta).unwrap_or(0)
            }
            None => ondisk,
        }
    }
}
