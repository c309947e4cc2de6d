//! The dependency record kinds and their state.
//!
//! Fourteen kinds of record describe every ordering constraint the engine
//! enforces. Each record is owned by exactly one of: a buffer's attachment
//! list, another record's wait list, or the worklist/deferred-free queue.
//! Cross-references are typed handles into the per-kind arenas.
//!
//! Record state is split across two explicit axes instead of one bitmask:
//!
//! - [`SlotState`] — whether the record's on-disk slot currently holds the
//!   real value (`Attached`) or the rolled-back value (`Undone`). Toggled
//!   only by write initiation and completion.
//! - completeness flags — `bitmap_durable` (the governing allocation bitmap
//!   has been written) and `self_durable` (the record's own guarded bytes
//!   have been written). Monotonic within one write cycle; cleared only by
//!   that cycle's rollback.

use crate::arena::Handle;
use ordfs_ondisk::DiskInode;
use ordfs_types::{BlockNo, BufId, FsId, InodeNum, LogicalBlock, MountId, NDADDR, NIADDR};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("slot already undone")]
    AlreadyUndone,
    #[error("slot already attached")]
    AlreadyAttached,
}

/// Whether an on-disk slot currently carries the real (uncommitted) value or
/// the rolled-back safe value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Attached,
    Undone,
}

impl SlotState {
    /// Initiation rolls the slot back.
    pub fn undo(&mut self) -> Result<(), StateError> {
        match self {
            Self::Attached => {
                *self = Self::Undone;
                Ok(())
            }
            Self::Undone => Err(StateError::AlreadyUndone),
        }
    }

    /// Completion restores the real value.
    pub fn redo(&mut self) -> Result<(), StateError> {
        match self {
            Self::Undone => {
                *self = Self::Attached;
                Ok(())
            }
            Self::Attached => Err(StateError::AlreadyAttached),
        }
    }

    #[must_use]
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Attached)
    }
}

/// The two completeness flags shared by allocation-tracking records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completeness {
    /// The allocation bitmap covering this resource is durable.
    pub bitmap_durable: bool,
    /// The bytes this record guards have themselves been written.
    pub self_durable: bool,
}

impl Completeness {
    #[must_use]
    pub fn all() -> Self {
        Self {
            bitmap_durable: true,
            self_durable: true,
        }
    }

    #[must_use]
    pub fn is_complete(self) -> bool {
        self.bitmap_durable && self.self_durable
    }
}

/// Untyped reference to any record, used in buffer attachment lists and wait
/// lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepRef {
    Page(Handle<PageDep>),
    Inode(Handle<InodeDep>),
    NewBlk(Handle<NewBlk>),
    BmSafeMap(Handle<BmSafeMap>),
    AllocDirect(Handle<AllocDirect>),
    AllocIndir(Handle<AllocIndir>),
    IndirDep(Handle<IndirDep>),
    FreeFrag(Handle<FreeFrag>),
    FreeBlks(Handle<FreeBlks>),
    FreeFile(Handle<FreeFile>),
    DirAdd(Handle<DirAdd>),
    DirRem(Handle<DirRem>),
    MkDir(Handle<MkDir>),
    NewDirBlk(Handle<NewDirBlk>),
}

impl DepRef {
    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::Page(_) => "pagedep",
            Self::Inode(_) => "inodedep",
            Self::NewBlk(_) => "newblk",
            Self::BmSafeMap(_) => "bmsafemap",
            Self::AllocDirect(_) => "allocdirect",
            Self::AllocIndir(_) => "allocindir",
            Self::IndirDep(_) => "indirdep",
            Self::FreeFrag(_) => "freefrag",
            Self::FreeBlks(_) => "freeblks",
            Self::FreeFile(_) => "freefile",
            Self::DirAdd(_) => "diradd",
            Self::DirRem(_) => "dirrem",
            Self::MkDir(_) => "mkdir",
            Self::NewDirBlk(_) => "newdirblk",
        }
    }
}

/// Per-directory-page record: tracks pending entry additions and removals
/// for one logical block of a directory.
#[derive(Debug)]
pub struct PageDep {
    pub mount: MountId,
    pub fs: FsId,
    /// Inode of the directory that owns the page.
    pub ino: InodeNum,
    pub lbn: LogicalBlock,
    pub io_started: bool,
    /// The page sits in a newly allocated block whose on-disk inode pointer
    /// is not yet committed; settled entries must wait for it.
    pub holds_new_block: bool,
    /// Additions whose preconditions are not all satisfied.
    pub pending_adds: Vec<Handle<DirAdd>>,
    /// Additions whose referenced inode is durable, awaiting the page write.
    pub settled_adds: Vec<Handle<DirAdd>>,
    /// Removals awaiting the page write that zeroes their entry.
    pub removals: Vec<Handle<DirRem>>,
    pub attached: Option<BufId>,
}

/// Per-inode record: every dependency keyed by one (filesystem, inode).
#[derive(Debug)]
pub struct InodeDep {
    pub fs: FsId,
    pub ino: InodeNum,
    pub flags: Completeness,
    pub io_started: bool,
    /// On-disk link count minus effective link count: removals recorded in
    /// memory but not yet safe to push to disk.
    pub nlink_delta: i64,
    /// Saved on-disk image while the slot is rolled back to zero (bitmap
    /// not yet durable).
    pub saved_inode: Option<Box<DiskInode>>,
    /// Size recorded at initiation, restored by completion.
    pub saved_size: Option<u64>,
    /// Pointer updates carried by the buffer currently being tracked,
    /// sorted ascending by logical block.
    pub inode_updates: Vec<Handle<AllocDirect>>,
    /// Pointer updates made since the in-core inode was last copied into
    /// its buffer, sorted ascending by logical block.
    pub new_inode_updates: Vec<Handle<AllocDirect>>,
    /// Records waiting for the inode block write to land.
    pub buf_wait: Vec<DepRef>,
    /// Records waiting for the *next* copy of the in-core inode into its
    /// buffer (moved to `buf_wait` at that point).
    pub inode_wait: Vec<DepRef>,
    /// Directory additions whose referenced inode (this one) is durable.
    pub pending: Vec<DepRef>,
    /// Bitmap gate, when the inode's allocation bitmap is not yet durable.
    pub gate: Option<Handle<BmSafeMap>>,
    pub attached: Option<BufId>,
}

impl InodeDep {
    #[must_use]
    pub fn new(fs: FsId, ino: InodeNum) -> Self {
        Self {
            fs,
            ino,
            // An inode found on disk has no outstanding dependencies.
            flags: Completeness::all(),
            io_started: false,
            nlink_delta: 0,
            saved_inode: None,
            saved_size: None,
            inode_updates: Vec::new(),
            new_inode_updates: Vec::new(),
            buf_wait: Vec::new(),
            inode_wait: Vec::new(),
            pending: Vec::new(),
            gate: None,
            attached: None,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.flags.is_complete()
            && self.pending.is_empty()
            && self.buf_wait.is_empty()
            && self.inode_wait.is_empty()
            && self.inode_updates.is_empty()
            && self.new_inode_updates.is_empty()
            && self.nlink_delta == 0
            && self.saved_inode.is_none()
    }
}

/// Transient record for a freshly allocated block, consumed when the block
/// is promoted into an `allocdirect` or `allocindir`.
#[derive(Debug)]
pub struct NewBlk {
    pub fs: FsId,
    pub blkno: BlockNo,
    pub bitmap_durable: bool,
    pub gate: Option<Handle<BmSafeMap>>,
}

/// Per-bitmap-buffer record: fans out to every dependent gated on that
/// bitmap becoming durable.
#[derive(Debug)]
pub struct BmSafeMap {
    pub fs: FsId,
    pub buf: BufId,
    pub newblk_deps: Vec<Handle<NewBlk>>,
    pub allocdirect_deps: Vec<Handle<AllocDirect>>,
    pub allocindir_deps: Vec<Handle<AllocIndir>>,
    pub inodedep_deps: Vec<Handle<InodeDep>>,
    pub attached: Option<BufId>,
}

/// One direct (or inode-level indirect) pointer slot update.
#[derive(Debug)]
pub struct AllocDirect {
    pub lbn: LogicalBlock,
    pub new_blkno: BlockNo,
    pub old_blkno: BlockNo,
    pub new_size: u32,
    pub old_size: u32,
    pub slot: SlotState,
    pub flags: Completeness,
    pub freefrag: Option<Handle<FreeFrag>>,
    pub inodedep: Handle<InodeDep>,
    pub gate: Option<Handle<BmSafeMap>>,
    pub new_dir_blk: Option<Handle<NewDirBlk>>,
    pub attached: Option<BufId>,
}

/// One pointer slot update within an indirect block.
#[derive(Debug)]
pub struct AllocIndir {
    pub offset: usize,
    pub new_blkno: BlockNo,
    pub old_blkno: BlockNo,
    pub flags: Completeness,
    pub freefrag: Option<Handle<FreeFrag>>,
    pub indirdep: Handle<IndirDep>,
    pub gate: Option<Handle<BmSafeMap>>,
    pub attached: Option<BufId>,
}

/// Per-dirty-indirect-block record, owning the safe copy that holds only
/// committed pointers.
#[derive(Debug)]
pub struct IndirDep {
    pub fs: FsId,
    pub ino: InodeNum,
    /// Physical block of the indirect block, for orphaned-image handoff at
    /// truncation.
    pub blkno: BlockNo,
    pub state: SlotState,
    pub going_away: bool,
    /// Up-to-date content parked here while the safe copy is on the wire.
    pub saved_data: Option<Vec<u8>>,
    /// The safe copy: only committed pointers.
    pub shadow: Vec<u8>,
    /// Pointer updates not yet committed.
    pub pending_ptrs: Vec<Handle<AllocIndir>>,
    /// Pointer updates completed while a write was in flight.
    pub done_ptrs: Vec<Handle<AllocIndir>>,
    pub attached: Option<BufId>,
}

/// Deferred release of a superseded fragment.
#[derive(Debug)]
pub struct FreeFrag {
    pub fs: FsId,
    pub ino: InodeNum,
    pub blkno: BlockNo,
    pub frag_size: u32,
    pub queued: bool,
}

/// Deferred release of all blocks of a truncated-to-zero file.
#[derive(Debug)]
pub struct FreeBlks {
    pub fs: FsId,
    pub mount: MountId,
    pub ino: InodeNum,
    pub old_size: u64,
    pub block_count: u64,
    pub db: [BlockNo; NDADDR],
    pub ib: [BlockNo; NIADDR],
    pub queued: bool,
}

/// Deferred release of an inode's storage.
#[derive(Debug)]
pub struct FreeFile {
    pub fs: FsId,
    pub mount: MountId,
    pub ino: InodeNum,
    pub mode: u16,
    pub queued: bool,
}

/// One pending directory entry addition.
///
/// Placement walks Undone ⇄ Attached under rollback/roll-forward, then the
/// entry is settled once the referenced inode is durable and released when
/// the page write lands.
#[derive(Debug)]
pub struct DirAdd {
    /// Byte offset of the entry within its directory page.
    pub offset: usize,
    pub new_ino: InodeNum,
    pub slot: SlotState,
    /// The referenced inode (with its incremented link count) is durable.
    pub inode_written: bool,
    /// mkdir precondition: the new directory's own first block (`.`/`..`)
    /// must be durable.
    pub mkdir_body_pending: bool,
    /// mkdir precondition: the parent's incremented link count must be
    /// durable.
    pub mkdir_parent_pending: bool,
    /// For an entry change: the removal record of the previous occupant;
    /// rollback writes that inode number instead of zero.
    pub previous: Option<Handle<DirRem>>,
    pub pagedep: Handle<PageDep>,
}

impl DirAdd {
    /// Both mkdir preconditions (vacuously true for plain adds) satisfied.
    #[must_use]
    pub fn preconditions_met(&self) -> bool {
        !self.mkdir_body_pending && !self.mkdir_parent_pending
    }

    #[must_use]
    pub fn all_complete(&self) -> bool {
        self.preconditions_met() && self.inode_written
    }
}

/// One pending directory entry removal.
#[derive(Debug)]
pub struct DirRem {
    pub mount: MountId,
    pub fs: FsId,
    /// The inode the removed entry referenced (later replaced by the parent
    /// directory's inode for the rmdir follow-up decrement).
    pub old_ino: InodeNum,
    /// The directory's own inode, recorded when the entry zeroing reaches
    /// disk.
    pub dir_ino: Option<InodeNum>,
    pub pagedep: Option<Handle<PageDep>>,
    pub is_rmdir: bool,
    /// The entry never reached disk (or its zeroing already did), so the
    /// link count may drop immediately.
    pub entry_gone: bool,
    /// Rename into a new parent: the add and remove balance, skip the
    /// follow-up parent decrement.
    pub dir_change: bool,
    pub queued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkDirKind {
    /// Waits on the new directory's first block (`.` and `..`).
    Body,
    /// Waits on the parent directory's link-count update.
    Parent,
}

/// One of the two independent mkdir preconditions.
#[derive(Debug)]
pub struct MkDir {
    pub kind: MkDirKind,
    pub diradd: Handle<DirAdd>,
    pub attached: Option<BufId>,
}

/// Tracks a newly allocated directory block until its inode pointer is
/// durable; settled entries in that block must wait for it.
#[derive(Debug)]
pub struct NewDirBlk {
    pub pagedep: Handle<PageDep>,
}

/// One entry queued for terminal release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    FreeFrag(Handle<FreeFrag>),
    FreeBlks(Handle<FreeBlks>),
    FreeFile(Handle<FreeFile>),
    DirRem(Handle<DirRem>),
}

/// Counters for rollbacks observed at write completion, mirroring the
/// diagnostic counters of classic soft-updates implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackStats {
    /// Inode slots zeroed because their bitmap was not yet durable.
    pub inode_bitmap: u64,
    /// Inode blocks rewritten after direct/indirect pointer rollback.
    pub direct_ptrs: u64,
    /// Indirect blocks rewritten after shadow-copy substitution.
    pub indirect_ptrs: u64,
    /// Directory pages rewritten after entry rollback.
    pub dir_entries: u64,
}

/// Record values parked on the deferred-free queue; dropped outside the
/// engine lock.
#[derive(Debug)]
pub enum Retired {
    Page(PageDep),
    Inode(InodeDep),
    NewBlk(NewBlk),
    BmSafeMap(BmSafeMap),
    AllocDirect(AllocDirect),
    AllocIndir(AllocIndir),
    IndirDep(IndirDep),
    FreeFrag(FreeFrag),
    FreeBlks(FreeBlks),
    FreeFile(FreeFile),
    DirAdd(DirAdd),
    DirRem(DirRem),
    MkDir(MkDir),
    NewDirBlk(NewDirBlk),
}

/// Deferred calls into the buffer cache, applied only after the engine lock
/// is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    MarkDirty(BufId),
    NoteAttach(BufId),
    NoteDetach(BufId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_state_round_trip() {
        let mut slot = SlotState::Attached;
        slot.undo().expect("undo");
        assert!(!slot.is_attached());
        assert_eq!(slot.undo(), Err(StateError::AlreadyUndone));
        slot.redo().expect("redo");
        assert!(slot.is_attached());
        assert_eq!(slot.redo(), Err(StateError::AlreadyAttached));
    }

    #[test]
    fn completeness_requires_both() {
        let mut flags = Completeness::default();
        assert!(!flags.is_complete());
        flags.bitmap_durable = true;
        assert!(!flags.is_complete());
        flags.self_durable = true;
        assert!(flags.is_complete());
        assert!(Completeness::all().is_complete());
    }

    #[test]
    fn fresh_inodedep_is_idle() {
        let dep = InodeDep::new(FsId(1), InodeNum(5));
        assert!(dep.is_idle());
    }

    #[test]
    fn diradd_preconditions() {
        let mut pagedeps: crate::arena::Arena<PageDep> = crate::arena::Arena::new("pagedep");
        let page = pagedeps.alloc(PageDep {
            mount: MountId(1),
            fs: FsId(1),
            ino: InodeNum(2),
            lbn: LogicalBlock(0),
            io_started: false,
            holds_new_block: false,
            pending_adds: Vec::new(),
            settled_adds: Vec::new(),
            removals: Vec::new(),
            attached: None,
        });
        let mut dap = DirAdd {
            offset: 0,
            new_ino: InodeNum(7),
            slot: SlotState::Attached,
            inode_written: false,
            mkdir_body_pending: true,
            mkdir_parent_pending: true,
            previous: None,
            pagedep: page,
        };
        assert!(!dap.preconditions_met());
        dap.mkdir_body_pending = false;
        assert!(!dap.preconditions_met());
        dap.mkdir_parent_pending = false;
        assert!(dap.preconditions_met());
        assert!(!dap.all_complete());
        dap.inode_written = true;
        assert!(dap.all_complete());
    }
}
