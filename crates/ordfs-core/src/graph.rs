//! The shared dependency graph: arenas, indexes, attachment lists, and the
//! record lifecycle routines that every component mutates under the engine
//! lock.
//!
//! Nothing here performs I/O or calls a collaborator. Calls the cache must
//! see (re-dirtying, attach/detach markers) are queued on `actions` and
//! applied by the engine after the lock is released; freed record bodies are
//! queued on `retired` and dropped outside the lock.

use crate::arena::{Arena, Handle};
use crate::config::SoftdepConfig;
use crate::record::{
    AllocDirect, AllocIndir, BmSafeMap, CacheAction, DepRef, DirAdd, DirRem, FreeBlks, FreeFile,
    FreeFrag, IndirDep, InodeDep, MkDir, NewBlk, NewDirBlk, PageDep, Retired, RollbackStats,
    WorkItem,
};
use crate::tables::{BlockKey, DepIndex, InodeKey, PageKey};
use ordfs_types::{BlockNo, BufId, FsGeometry, FsId, InodeNum, MountId, NDADDR};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy)]
pub(crate) struct MountInfo {
    pub fs: FsId,
    pub geo: FsGeometry,
}

/// Which of an inode's two pointer-update lists to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdList {
    /// Updates carried by the buffer currently tracked (`inode_updates`).
    Current,
    /// Updates made since the last copy into the buffer
    /// (`new_inode_updates`).
    Future,
}

pub(crate) struct GraphCore {
    pub pagedeps: Arena<PageDep>,
    pub inodedeps: Arena<InodeDep>,
    pub newblks: Arena<NewBlk>,
    pub bmsafemaps: Arena<BmSafeMap>,
    pub allocdirects: Arena<AllocDirect>,
    pub allocindirs: Arena<AllocIndir>,
    pub indirdeps: Arena<IndirDep>,
    pub freefrags: Arena<FreeFrag>,
    pub freeblks: Arena<FreeBlks>,
    pub freefiles: Arena<FreeFile>,
    pub diradds: Arena<DirAdd>,
    pub dirrems: Arena<DirRem>,
    pub mkdirs: Arena<MkDir>,
    pub newdirblks: Arena<NewDirBlk>,

    pub pagedep_index: DepIndex<PageKey, Handle<PageDep>>,
    pub inodedep_index: DepIndex<InodeKey, Handle<InodeDep>>,
    pub newblk_index: DepIndex<BlockKey, Handle<NewBlk>>,
    pub pagedep_gate: HashSet<PageKey>,
    pub inodedep_gate: HashSet<InodeKey>,
    pub newblk_gate: HashSet<BlockKey>,

    /// Per-buffer attachment lists.
    pub buffer_deps: HashMap<BufId, Vec<DepRef>>,
    /// All live mkdir records (both kinds).
    pub mkdir_list: Vec<Handle<MkDir>>,

    pub worklist: VecDeque<WorkItem>,
    pub worklist_busy: bool,
    pub worklist_waiters: usize,

    pub num_inodedeps: usize,
    pub num_dirrems: usize,

    pub mounts: HashMap<MountId, MountInfo>,
    pub fs_mount: HashMap<FsId, MountId>,

    /// Real copies of indirect blocks orphaned by truncation, keyed by
    /// physical block; consumed by the deferred free walk.
    pub orphaned_indirect: HashMap<(FsId, BlockNo), Vec<u8>>,

    pub actions: Vec<CacheAction>,
    pub retired: Vec<Retired>,
    pub stats: RollbackStats,
}

impl GraphCore {
    pub fn new(config: SoftdepConfig) -> Self {
        let buckets = config.index_buckets;
        Self {
            pagedeps: Arena::new("pagedep"),
            inodedeps: Arena::new("inodedep"),
            newblks: Arena::new("newblk"),
            bmsafemaps: Arena::new("bmsafemap"),
            allocdirects: Arena::new("allocdirect"),
            allocindirs: Arena::new("allocindir"),
            indirdeps: Arena::new("indirdep"),
            freefrags: Arena::new("freefrag"),
            freeblks: Arena::new("freeblks"),
            freefiles: Arena::new("freefile"),
            diradds: Arena::new("diradd"),
            dirrems: Arena::new("dirrem"),
            mkdirs: Arena::new("mkdir"),
            newdirblks: Arena::new("newdirblk"),
            pagedep_index: DepIndex::new(buckets),
            inodedep_index: DepIndex::new(buckets),
            newblk_index: DepIndex::new(buckets),
            pagedep_gate: HashSet::new(),
            inodedep_gate: HashSet::new(),
            newblk_gate: HashSet::new(),
            buffer_deps: HashMap::new(),
            mkdir_list: Vec::new(),
            worklist: VecDeque::new(),
            worklist_busy: false,
            worklist_waiters: 0,
            num_inodedeps: 0,
            num_dirrems: 0,
            mounts: HashMap::new(),
            fs_mount: HashMap::new(),
            orphaned_indirect: HashMap::new(),
            actions: Vec::new(),
            retired: Vec::new(),
            stats: RollbackStats::default(),
        }
    }

    // ── Mount registry ──────────────────────────────────────────────────

    pub fn geo(&self, fs: FsId) -> FsGeometry {
        let mount = self.mount_of(fs);
        self.mounts[&mount].geo
    }

    pub fn mount_of(&self, fs: FsId) -> MountId {
        *self
            .fs_mount
            .get(&fs)
            .unwrap_or_else(|| panic!("filesystem {fs} is not mounted"))
    }

    // ── Buffer attachment lists ─────────────────────────────────────────

    fn set_attached(&mut self, dep: DepRef, buf: Option<BufId>) {
        match dep {
            DepRef::Page(h) => self.pagedeps.get_mut(h).attached = buf,
            DepRef::Inode(h) => self.inodedeps.get_mut(h).attached = buf,
            DepRef::BmSafeMap(h) => self.bmsafemaps.get_mut(h).attached = buf,
            DepRef::AllocDirect(h) => self.allocdirects.get_mut(h).attached = buf,
            DepRef::AllocIndir(h) => self.allocindirs.get_mut(h).attached = buf,
            DepRef::IndirDep(h) => self.indirdeps.get_mut(h).attached = buf,
            DepRef::MkDir(h) => self.mkdirs.get_mut(h).attached = buf,
            other => panic!("{} records never attach to buffers", other.kind()),
        }
    }

    pub fn attach(&mut self, buf: BufId, dep: DepRef) {
        let list = self.buffer_deps.entry(buf).or_default();
        assert!(
            !list.contains(&dep),
            "duplicate attachment of {} to buffer {buf}",
            dep.kind()
        );
        list.push(dep);
        self.set_attached(dep, Some(buf));
        self.actions.push(CacheAction::NoteAttach(buf));
    }

    pub fn detach(&mut self, buf: BufId, dep: DepRef) {
        let list = self
            .buffer_deps
            .get_mut(&buf)
            .unwrap_or_else(|| panic!("buffer {buf} has no attachment list"));
        let pos = list
            .iter()
            .position(|d| *d == dep)
            .unwrap_or_else(|| panic!("{} not attached to buffer {buf}", dep.kind()));
        list.remove(pos);
        if list.is_empty() {
            self.buffer_deps.remove(&buf);
        }
        self.set_attached(dep, None);
        self.actions.push(CacheAction::NoteDetach(buf));
    }

    /// Detach and return the whole attachment list of `buf` in order.
    pub fn take_buffer_deps(&mut self, buf: BufId) -> Vec<DepRef> {
        let list = self.buffer_deps.remove(&buf).unwrap_or_default();
        for dep in &list {
            self.set_attached(*dep, None);
            self.actions.push(CacheAction::NoteDetach(buf));
        }
        list
    }

    pub fn buffer_dep_count(&self, buf: BufId) -> usize {
        self.buffer_deps.get(&buf).map_or(0, Vec::len)
    }

    // ── Record retirement (deferred free) ───────────────────────────────

    pub fn retire_pagedep(&mut self, h: Handle<PageDep>) {
        let rec = self.pagedeps.free(h);
        self.retired.push(Retired::Page(rec));
    }

    pub fn retire_inodedep(&mut self, h: Handle<InodeDep>) {
        let rec = self.inodedeps.free(h);
        self.retired.push(Retired::Inode(rec));
    }

    pub fn retire_newblk(&mut self, h: Handle<NewBlk>) {
        let rec = self.newblks.free(h);
        self.retired.push(Retired::NewBlk(rec));
    }

    pub fn retire_bmsafemap(&mut self, h: Handle<BmSafeMap>) {
        let rec = self.bmsafemaps.free(h);
        self.retired.push(Retired::BmSafeMap(rec));
    }

    pub fn retire_allocdirect(&mut self, h: Handle<AllocDirect>) {
        let rec = self.allocdirects.free(h);
        self.retired.push(Retired::AllocDirect(rec));
    }

    pub fn retire_allocindir(&mut self, h: Handle<AllocIndir>) {
        let rec = self.allocindirs.free(h);
        self.retired.push(Retired::AllocIndir(rec));
    }

    pub fn retire_indirdep(&mut self, h: Handle<IndirDep>) {
        let rec = self.indirdeps.free(h);
        self.retired.push(Retired::IndirDep(rec));
    }

    pub fn retire_freefrag(&mut self, h: Handle<FreeFrag>) {
        let rec = self.freefrags.free(h);
        self.retired.push(Retired::FreeFrag(rec));
    }

    pub fn retire_freeblks(&mut self, h: Handle<FreeBlks>) {
        let rec = self.freeblks.free(h);
        self.retired.push(Retired::FreeBlks(rec));
    }

    pub fn retire_freefile(&mut self, h: Handle<FreeFile>) {
        let rec = self.freefiles.free(h);
        self.retired.push(Retired::FreeFile(rec));
    }

    pub fn retire_diradd(&mut self, h: Handle<DirAdd>) {
        let rec = self.diradds.free(h);
        self.retired.push(Retired::DirAdd(rec));
    }

    pub fn retire_dirrem(&mut self, h: Handle<DirRem>) {
        let rec = self.dirrems.free(h);
        self.retired.push(Retired::DirRem(rec));
        self.num_dirrems -= 1;
    }

    pub fn retire_mkdir(&mut self, h: Handle<MkDir>) {
        let rec = self.mkdirs.free(h);
        self.retired.push(Retired::MkDir(rec));
    }

    pub fn retire_newdirblk(&mut self, h: Handle<NewDirBlk>) {
        let rec = self.newdirblks.free(h);
        self.retired.push(Retired::NewDirBlk(rec));
    }

    // ── Worklist ────────────────────────────────────────────────────────

    pub fn worklist_push(&mut self, item: WorkItem) {
        let queued = match item {
            WorkItem::FreeFrag(h) => &mut self.freefrags.get_mut(h).queued,
            WorkItem::FreeBlks(h) => &mut self.freeblks.get_mut(h).queued,
            WorkItem::FreeFile(h) => &mut self.freefiles.get_mut(h).queued,
            WorkItem::DirRem(h) => &mut self.dirrems.get_mut(h).queued,
        };
        assert!(!*queued, "work item already queued");
        *queued = true;
        self.worklist.push_back(item);
        tracing::trace!(target: "ordfs::worklist", item = ?item, depth = self.worklist.len(), "enqueue");
    }

    pub fn workitem_mount(&self, item: WorkItem) -> MountId {
        match item {
            WorkItem::FreeFrag(h) => self.mount_of(self.freefrags.get(h).fs),
            WorkItem::FreeBlks(h) => self.freeblks.get(h).mount,
            WorkItem::FreeFile(h) => self.freefiles.get(h).mount,
            WorkItem::DirRem(h) => self.dirrems.get(h).mount,
        }
    }

    // ── bmsafemap ───────────────────────────────────────────────────────

    /// Find or create the bitmap record for a cylinder-group buffer.
    pub fn bmsafemap_lookup(&mut self, fs: FsId, buf: BufId) -> Handle<BmSafeMap> {
        if let Some(deps) = self.buffer_deps.get(&buf) {
            for dep in deps {
                if let DepRef::BmSafeMap(h) = dep {
                    return *h;
                }
            }
        }
        let h = self.bmsafemaps.alloc(BmSafeMap {
            fs,
            buf,
            newblk_deps: Vec::new(),
            allocdirect_deps: Vec::new(),
            allocindir_deps: Vec::new(),
            inodedep_deps: Vec::new(),
            attached: None,
        });
        self.attach(buf, DepRef::BmSafeMap(h));
        h
    }

    // ── allocdirect list management ─────────────────────────────────────

    fn upd_list(&mut self, inodedep: Handle<InodeDep>, list: UpdList) -> &mut Vec<Handle<AllocDirect>> {
        let dep = self.inodedeps.get_mut(inodedep);
        match list {
            UpdList::Current => &mut dep.inode_updates,
            UpdList::Future => &mut dep.new_inode_updates,
        }
    }

    /// Insert into the sorted pointer-update list, merging with an existing
    /// update for the same logical block.
    ///
    /// The list stays sorted ascending by logical block so rollback can
    /// regress to a contiguous durable prefix.
    pub fn insert_allocdirect_sorted(
        &mut self,
        inodedep: Handle<InodeDep>,
        list: UpdList,
        adp: Handle<AllocDirect>,
    ) {
        let lbn = self.allocdirects.get(adp).lbn;
        let handles = self.upd_list(inodedep, list).clone();

        // Files generally grow, so the common case appends at the tail.
        match handles.last() {
            None => {
                self.upd_list(inodedep, list).push(adp);
            }
            Some(&last) if self.allocdirects.get(last).lbn <= lbn => {
                self.upd_list(inodedep, list).push(adp);
                if self.allocdirects.get(last).lbn == lbn {
                    self.allocdirect_merge(inodedep, list, adp, last);
                }
            }
            Some(_) => {
                let pos = handles
                    .iter()
                    .position(|&h| self.allocdirects.get(h).lbn >= lbn)
                    .unwrap_or_else(|| panic!("lost pointer-update entry for lbn {lbn}"));
                let old = handles[pos];
                self.upd_list(inodedep, list).insert(pos, adp);
                if self.allocdirects.get(old).lbn == lbn {
                    self.allocdirect_merge(inodedep, list, adp, old);
                }
            }
        }
    }

    /// Replace an old pointer update with a newer one for the same slot.
    pub fn allocdirect_merge(
        &mut self,
        inodedep: Handle<InodeDep>,
        list: UpdList,
        new_h: Handle<AllocDirect>,
        old_h: Handle<AllocDirect>,
    ) {
        let (old_old_blkno, old_old_size, old_new_blkno, old_new_size, old_freefrag) = {
            let old = self.allocdirects.get(old_h);
            (old.old_blkno, old.old_size, old.new_blkno, old.new_size, old.freefrag)
        };
        {
            let new = self.allocdirects.get(new_h);
            if new.old_blkno != old_new_blkno
                || new.old_size != old_new_size
                || (new.lbn.0 as usize) >= NDADDR
            {
                panic!(
                    "pointer-update merge mismatch: lbn {} old {}/{} vs prior new {}/{}",
                    new.lbn, new.old_blkno, new.old_size, old_new_blkno, old_new_size
                );
            }
        }
        {
            let new = self.allocdirects.get_mut(new_h);
            new.old_blkno = old_old_blkno;
            new.old_size = old_old_size;
        }
        // If the old update had a fragment to free, or never had a prior
        // block at all, swap freefrags: the new update adopts the old
        // fragment and the old update posts the new one immediately when it
        // is freed below. When the new block merely extends the old one the
        // fragment is still live on disk and must ride with the new update.
        if old_freefrag.is_some() || old_old_blkno.is_none() {
            let new_freefrag = self.allocdirects.get(new_h).freefrag;
            self.allocdirects.get_mut(new_h).freefrag = old_freefrag;
            self.allocdirects.get_mut(old_h).freefrag = new_freefrag;
        }
        // A tracked new-directory-block moves to the surviving update.
        if let Some(ndb) = self.allocdirects.get_mut(old_h).new_dir_blk.take() {
            assert!(
                self.allocdirects.get(new_h).new_dir_blk.is_none(),
                "both pointer updates track a new directory block"
            );
            self.allocdirects.get_mut(new_h).new_dir_blk = Some(ndb);
        }
        self.free_allocdirect(inodedep, list, old_h, false);
    }

    /// Merge the future pointer-update list into the current one.
    pub fn merge_inode_lists(&mut self, inodedep: Handle<InodeDep>) {
        loop {
            let Some(&new_h) = self.inodedeps.get(inodedep).new_inode_updates.first() else {
                return;
            };
            let new_lbn = self.allocdirects.get(new_h).lbn;
            self.inodedeps.get_mut(inodedep).new_inode_updates.remove(0);

            let current = self.inodedeps.get(inodedep).inode_updates.clone();
            let pos = current
                .iter()
                .position(|&h| self.allocdirects.get(h).lbn >= new_lbn);
            match pos {
                Some(i) => {
                    let listadp = current[i];
                    self.inodedeps
                        .get_mut(inodedep)
                        .inode_updates
                        .insert(i, new_h);
                    if self.allocdirects.get(listadp).lbn == new_lbn {
                        self.allocdirect_merge(inodedep, UpdList::Current, new_h, listadp);
                    }
                }
                None => {
                    self.inodedeps.get_mut(inodedep).inode_updates.push(new_h);
                }
            }
        }
    }

    /// Free a pointer update. `delay` defers its freefrag (and any tracked
    /// new directory block) until the inode block write lands.
    pub fn free_allocdirect(
        &mut self,
        inodedep: Handle<InodeDep>,
        list: UpdList,
        adp: Handle<AllocDirect>,
        delay: bool,
    ) {
        // Still gated on its bitmap: leave the gate's fan-out list.
        if let Some(gate) = self.allocdirects.get(adp).gate {
            let deps = &mut self.bmsafemaps.get_mut(gate).allocdirect_deps;
            let pos = deps
                .iter()
                .position(|&h| h == adp)
                .unwrap_or_else(|| panic!("pointer update missing from bitmap fan-out"));
            deps.remove(pos);
            self.allocdirects.get_mut(adp).gate = None;
        }
        {
            let handles = self.upd_list(inodedep, list);
            let pos = handles
                .iter()
                .position(|&h| h == adp)
                .unwrap_or_else(|| panic!("pointer update missing from its inode list"));
            handles.remove(pos);
        }
        if let Some(buf) = self.allocdirects.get(adp).attached {
            self.detach(buf, DepRef::AllocDirect(adp));
        }
        if let Some(freefrag) = self.allocdirects.get(adp).freefrag {
            if delay {
                self.inodedeps
                    .get_mut(inodedep)
                    .buf_wait
                    .push(DepRef::FreeFrag(freefrag));
            } else {
                self.worklist_push(WorkItem::FreeFrag(freefrag));
            }
        }
        if let Some(ndb) = self.allocdirects.get(adp).new_dir_blk {
            if delay {
                self.inodedeps
                    .get_mut(inodedep)
                    .buf_wait
                    .push(DepRef::NewDirBlk(ndb));
            } else {
                self.free_newdirblk(ndb);
            }
        }
        self.retire_allocdirect(adp);
    }

    /// Free an indirect pointer update. With an inodedep the freefrag is
    /// deferred to that inode's block write; without one it is queued now.
    pub fn free_allocindir(&mut self, aip: Handle<AllocIndir>, inodedep: Option<Handle<InodeDep>>) {
        if let Some(gate) = self.allocindirs.get(aip).gate {
            let deps = &mut self.bmsafemaps.get_mut(gate).allocindir_deps;
            let pos = deps
                .iter()
                .position(|&h| h == aip)
                .unwrap_or_else(|| panic!("indirect pointer update missing from bitmap fan-out"));
            deps.remove(pos);
            self.allocindirs.get_mut(aip).gate = None;
        }
        if let Some(buf) = self.allocindirs.get(aip).attached {
            self.detach(buf, DepRef::AllocIndir(aip));
        }
        let indirdep = self.allocindirs.get(aip).indirdep;
        if self.indirdeps.contains(indirdep) {
            let dep = self.indirdeps.get_mut(indirdep);
            if let Some(pos) = dep.pending_ptrs.iter().position(|&h| h == aip) {
                dep.pending_ptrs.remove(pos);
            } else if let Some(pos) = dep.done_ptrs.iter().position(|&h| h == aip) {
                dep.done_ptrs.remove(pos);
            }
        }
        if let Some(freefrag) = self.allocindirs.get(aip).freefrag {
            match inodedep {
                Some(idp) => self
                    .inodedeps
                    .get_mut(idp)
                    .buf_wait
                    .push(DepRef::FreeFrag(freefrag)),
                None => self.worklist_push(WorkItem::FreeFrag(freefrag)),
            }
        }
        self.retire_allocindir(aip);
    }

    // ── diradd / pagedep lifecycle ──────────────────────────────────────

    /// Free a directory-addition record, posting the superseded removal if
    /// this addition replaced an existing entry.
    pub fn free_diradd(&mut self, dap: Handle<DirAdd>) {
        let pagedep = self.diradds.get(dap).pagedep;
        {
            let page = self.pagedeps.get_mut(pagedep);
            if let Some(pos) = page.pending_adds.iter().position(|&h| h == dap) {
                page.pending_adds.remove(pos);
            } else if let Some(pos) = page.settled_adds.iter().position(|&h| h == dap) {
                page.settled_adds.remove(pos);
            } else {
                panic!("diradd missing from its page lists");
            }
        }
        if let Some(prev) = self.diradds.get(dap).previous {
            let dir_ino = self.pagedeps.get(pagedep).ino;
            self.dirrems.get_mut(prev).dir_ino = Some(dir_ino);
            self.worklist_push(WorkItem::DirRem(prev));
        }
        // Unlink from the referenced inode's wait lists.
        let fs = self.pagedeps.get(pagedep).fs;
        let new_ino = self.diradds.get(dap).new_ino;
        let key = InodeKey { fs, ino: new_ino };
        if let Some(idp) = self.inodedep_index.get(&key) {
            let dep_ref = DepRef::DirAdd(dap);
            {
                let idep = self.inodedeps.get_mut(idp);
                idep.buf_wait.retain(|d| *d != dep_ref);
                idep.pending.retain(|d| *d != dep_ref);
            }
            let _ = self.free_inodedep(idp);
        }
        // Retire any mkdir records still tied to this addition.
        if !self.diradds.get(dap).preconditions_met() {
            let tied: Vec<Handle<MkDir>> = self
                .mkdir_list
                .iter()
                .copied()
                .filter(|&m| self.mkdirs.get(m).diradd == dap)
                .collect();
            for mkdir in tied {
                match self.mkdirs.get(mkdir).kind {
                    crate::record::MkDirKind::Body => {
                        self.diradds.get_mut(dap).mkdir_body_pending = false;
                    }
                    crate::record::MkDirKind::Parent => {
                        self.diradds.get_mut(dap).mkdir_parent_pending = false;
                    }
                }
                if let Some(buf) = self.mkdirs.get(mkdir).attached {
                    self.detach(buf, DepRef::MkDir(mkdir));
                }
                self.mkdir_list.retain(|&m| m != mkdir);
                // A parent-precondition mkdir also waits on the parent
                // inodedep's buf_wait list.
                let dep_ref = DepRef::MkDir(mkdir);
                for idp in self.inodedeps.handles().collect::<Vec<_>>() {
                    self.inodedeps.get_mut(idp).buf_wait.retain(|d| *d != dep_ref);
                }
                self.retire_mkdir(mkdir);
            }
            assert!(
                self.diradds.get(dap).preconditions_met(),
                "mkdir precondition without a matching mkdir record"
            );
        }
        self.retire_diradd(dap);
    }

    /// Clear the new-block marker and release settled entries if the page is
    /// no longer tracked by a buffer.
    pub fn free_newdirblk(&mut self, ndb: Handle<NewDirBlk>) {
        let pagedep = self.newdirblks.get(ndb).pagedep;
        self.pagedeps.get_mut(pagedep).holds_new_block = false;
        if self.pagedeps.get(pagedep).attached.is_none() {
            while let Some(&dap) = self.pagedeps.get(pagedep).settled_adds.first() {
                self.free_diradd(dap);
            }
        }
        self.free_pagedep_if_idle(pagedep);
        self.retire_newdirblk(ndb);
    }

    pub fn free_pagedep_if_idle(&mut self, pagedep: Handle<PageDep>) {
        let page = self.pagedeps.get(pagedep);
        if page.attached.is_some()
            || page.holds_new_block
            || !page.pending_adds.is_empty()
            || !page.settled_adds.is_empty()
            || !page.removals.is_empty()
        {
            return;
        }
        let key = PageKey {
            mount: page.mount,
            ino: page.ino,
            lbn: page.lbn,
        };
        self.pagedep_index
            .remove(&key)
            .unwrap_or_else(|| panic!("pagedep missing from its index"));
        self.retire_pagedep(pagedep);
    }

    // ── inodedep lifecycle ──────────────────────────────────────────────

    /// Free the inode record if nothing references it. Returns whether it
    /// was freed.
    pub fn free_inodedep(&mut self, idp: Handle<InodeDep>) -> bool {
        let dep = self.inodedeps.get(idp);
        if dep.attached.is_some() || !dep.is_idle() {
            return false;
        }
        let key = InodeKey {
            fs: dep.fs,
            ino: dep.ino,
        };
        self.inodedep_index
            .remove(&key)
            .unwrap_or_else(|| panic!("inodedep missing from its index"));
        self.retire_inodedep(idp);
        self.num_inodedeps -= 1;
        true
    }

    /// If the inode has never been written to disk, drop its bitmap gate
    /// (the bitmap correctly shows it unallocated, and any in-flight write
    /// carries the zeroed slot), free the record, and return true.
    pub fn check_inode_unwritten(&mut self, idp: Handle<InodeDep>) -> bool {
        {
            let dep = self.inodedeps.get(idp);
            if dep.flags.bitmap_durable
                || !dep.pending.is_empty()
                || !dep.buf_wait.is_empty()
                || !dep.inode_wait.is_empty()
                || !dep.inode_updates.is_empty()
                || !dep.new_inode_updates.is_empty()
                || dep.nlink_delta != 0
            {
                return false;
            }
        }
        if let Some(gate) = self.inodedeps.get(idp).gate {
            let deps = &mut self.bmsafemaps.get_mut(gate).inodedep_deps;
            let pos = deps
                .iter()
                .position(|&h| h == idp)
                .unwrap_or_else(|| panic!("inodedep missing from bitmap fan-out"));
            deps.remove(pos);
            self.inodedeps.get_mut(idp).gate = None;
        }
        {
            let dep = self.inodedeps.get_mut(idp);
            dep.flags.bitmap_durable = true;
            dep.flags.self_durable = true;
            dep.saved_inode = None;
        }
        if let Some(buf) = self.inodedeps.get(idp).attached {
            self.detach(buf, DepRef::Inode(idp));
        }
        assert!(
            self.free_inodedep(idp),
            "unwritten inode record still busy"
        );
        true
    }

    // ── Accounting ──────────────────────────────────────────────────────

    /// Outstanding dependency records for one mount, across every kind.
    pub fn outstanding_for_mount(&self, mount: MountId) -> usize {
        let fs = self.mounts.get(&mount).map(|m| m.fs);
        let Some(fs) = fs else { return 0 };
        let mut count = 0;
        count += self
            .pagedeps
            .handles()
            .filter(|&h| self.pagedeps.get(h).mount == mount)
            .count();
        count += self
            .inodedeps
            .handles()
            .filter(|&h| self.inodedeps.get(h).fs == fs)
            .count();
        count += self
            .newblks
            .handles()
            .filter(|&h| self.newblks.get(h).fs == fs)
            .count();
        count += self
            .bmsafemaps
            .handles()
            .filter(|&h| self.bmsafemaps.get(h).fs == fs)
            .count();
        count += self
            .allocdirects
            .handles()
            .filter(|&h| self.inodedeps.get(self.allocdirects.get(h).inodedep).fs == fs)
            .count();
        count += self
            .allocindirs
            .handles()
            .filter(|&h| {
                let dep = self.allocindirs.get(h);
                self.indirdeps.contains(dep.indirdep) && self.indirdeps.get(dep.indirdep).fs == fs
            })
            .count();
        count += self
            .indirdeps
            .handles()
            .filter(|&h| self.indirdeps.get(h).fs == fs)
            .count();
        count += self
            .freefrags
            .handles()
            .filter(|&h| self.freefrags.get(h).fs == fs)
            .count();
        count += self
            .freeblks
            .handles()
            .filter(|&h| self.freeblks.get(h).mount == mount)
            .count();
        count += self
            .freefiles
            .handles()
            .filter(|&h| self.freefiles.get(h).mount == mount)
            .count();
        count += self
            .diradds
            .handles()
            .filter(|&h| self.pagedeps.get(self.diradds.get(h).pagedep).mount == mount)
            .count();
        count += self
            .dirrems
            .handles()
            .filter(|&h| self.dirrems.get(h).mount == mount)
            .count();
        count += self
            .mkdirs
            .handles()
            .filter(|&h| {
                let dap = self.mkdirs.get(h).diradd;
                self.diradds.contains(dap)
                    && self.pagedeps.get(self.diradds.get(dap).pagedep).mount == mount
            })
            .count();
        count += self
            .newdirblks
            .handles()
            .filter(|&h| self.pagedeps.get(self.newdirblks.get(h).pagedep).mount == mount)
            .count();
        count
    }

    /// Total live records across every arena; zero means no leak.
    pub fn total_live_records(&self) -> usize {
        self.pagedeps.len()
            + self.inodedeps.len()
            + self.newblks.len()
            + self.bmsafemaps.len()
            + self.allocdirects.len()
            + self.allocindirs.len()
            + self.indirdeps.len()
            + self.freefrags.len()
            + self.freeblks.len()
            + self.freefiles.len()
            + self.diradds.len()
            + self.dirrems.len()
            + self.mkdirs.len()
            + self.newdirblks.len()
    }
}
