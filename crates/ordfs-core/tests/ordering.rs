#![forbid(unsafe_code)]
//! End-to-end ordering scenarios driven through the in-memory buffer cache.

mod common;

use common::{Harness, FS, MOUNT};
use ordfs_buf::BufferCache;
use ordfs_core::RenameMode;
use ordfs_ondisk::{dir_entry_ino, set_indir_ptr};
use ordfs_types::{BlockNo, InodeNum, LogicalBlock, NDADDR};

const S_IFREG: u16 = 0o100_000;
const S_IFDIR: u16 = 0o040_000;

#[test]
fn rolled_back_inode_never_references_pending_block() {
    let h = Harness::new();
    let ino = InodeNum(10);
    h.vfs.inodes.lock().insert(
        ino,
        common::InMemInode {
            mode: S_IFREG,
            nlink: 1,
            effective: 1,
            ..common::InMemInode::default()
        },
    );
    let data_buf = h.alloc_direct(ino, LogicalBlock(0), BlockNo(500), BlockNo::NONE, 4096, 0, false);
    h.vfs.push_inode(ino);

    // The inode block goes out before the block bitmap: the pointer must
    // be rolled back to zero and the size regressed.
    let inode_buf = h.vfs.inode_buf(ino);
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.db[0], BlockNo::NONE, "pointer leaked before its bitmap");
    assert_eq!(di.size, 0, "size leaked past durable storage");

    // Completion restored the real content and re-dirtied the buffer.
    assert!(h.cache.is_dirty(inode_buf));

    // Writing the data block alone does not release the pointer: a rewrite
    // of the inode block must still roll back.
    h.flush(data_buf);
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.db[0], BlockNo::NONE, "pointer leaked before its bitmap");

    // Once the bitmap is durable too, the rewrite publishes the pointer.
    h.flush(h.block_bitmap_buf);
    assert!(h.cache.is_dirty(inode_buf));
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.db[0], BlockNo(500));
    assert_eq!(di.size, 4096);

    assert_eq!(h.engine.total_live_records(), 0, "records leaked");
    let stats = h.engine.rollback_stats();
    assert!(stats.direct_ptrs >= 2, "both rollbacks should be counted");
}

#[test]
fn release_waits_for_bitmap_and_inode_in_either_order() {
    // Same scenario with the two durable writes in the opposite order.
    let h = Harness::new();
    let ino = InodeNum(10);
    h.vfs.inodes.lock().insert(
        ino,
        common::InMemInode {
            mode: S_IFREG,
            nlink: 1,
            effective: 1,
            ..common::InMemInode::default()
        },
    );
    let data_buf = h.alloc_direct(ino, LogicalBlock(0), BlockNo(500), BlockNo::NONE, 4096, 0, false);
    h.vfs.push_inode(ino);
    let inode_buf = h.vfs.inode_buf(ino);

    // Bitmap first.
    h.flush(h.block_bitmap_buf);
    assert!(
        h.engine.total_live_records() > 0,
        "dependency released before the data block was durable"
    );

    // Inode block next: its pointer still may not go out, because the data
    // block itself is not durable — the record is only released after the
    // data write completes.
    h.flush(inode_buf);
    assert!(h.engine.total_live_records() > 0);

    h.flush(data_buf);
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.db[0], BlockNo(500));
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn freshly_allocated_inode_rolls_back_to_zeros() {
    let h = Harness::new();
    let ino = InodeNum(7);
    h.alloc_inode(ino, S_IFREG, 1);
    h.vfs.push_inode(ino);
    let inode_buf = h.vfs.inode_buf(ino);

    // Inode block written before the inode bitmap: the slot goes out
    // zeroed.
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.nlink, 0);
    assert_eq!(di.mode, 0);
    assert_eq!(h.engine.rollback_stats().inode_bitmap, 1);
    assert!(h.cache.is_dirty(inode_buf), "restore must re-dirty");

    h.flush(h.inode_bitmap_buf);
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.nlink, 1);
    assert_eq!(di.mode, S_IFREG);
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn completion_processing_is_idempotent() {
    let h = Harness::new();
    let ino = InodeNum(10);
    h.vfs.inodes.lock().insert(ino, common::InMemInode::default());
    let data_buf = h.alloc_direct(ino, LogicalBlock(0), BlockNo(500), BlockNo::NONE, 4096, 0, false);
    h.vfs.push_inode(ino);
    let inode_buf = h.vfs.inode_buf(ino);

    // Two full write cycles with the bitmap still pending must produce the
    // same durable image; the completeness flags cleared by each rollback
    // are restored by the matching completion.
    h.flush(inode_buf);
    let first = h.disk_inode(ino).expect("durable inode block");
    h.cache.mark_dirty(inode_buf).expect("dirty");
    h.flush(inode_buf);
    let second = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(first, second);

    // Draining an empty completion queue is a no-op.
    assert_eq!(h.engine.process_completions(), 0);
    assert_eq!(h.engine.process_completions(), 0);

    // Finish the protocol.
    h.flush(data_buf);
    h.flush(h.block_bitmap_buf);
    h.flush(inode_buf);
    assert_eq!(h.engine.total_live_records(), 0);
    assert_eq!(h.engine.flush_all_for_mount(MOUNT).expect("flush"), 0);
}

#[test]
fn truncate_with_pending_indirect_dependencies_leaks_nothing() {
    let h = Harness::new();
    let ino = InodeNum(20);
    h.vfs.inodes.lock().insert(
        ino,
        common::InMemInode {
            mode: S_IFREG,
            nlink: 1,
            effective: 1,
            ..common::InMemInode::default()
        },
    );
    // One direct block and one single-level indirect block with a page
    // referenced through it; nothing durable yet.
    let _d0 = h.alloc_direct(ino, LogicalBlock(0), BlockNo(600), BlockNo::NONE, 4096, 0, false);
    let indir_buf = h.alloc_direct(
        ino,
        LogicalBlock(NDADDR as u64),
        BlockNo(700),
        BlockNo::NONE,
        4096,
        0,
        false,
    );
    h.alloc_block(BlockNo(800));
    let page_buf = h.cache.create_buffer(BlockNo(800));
    h.cache.mark_dirty(page_buf).expect("dirty page");
    h.cache
        .with_buffer_mut(indir_buf, &mut |bytes| {
            set_indir_ptr(bytes, 0, BlockNo(800)).expect("pointer write");
        })
        .expect("indirect buffer");
    h.engine.setup_allocindir_page(
        FS,
        ino,
        LogicalBlock(NDADDR as u64),
        indir_buf,
        BlockNo(700),
        0,
        BlockNo(800),
        BlockNo::NONE,
        page_buf,
        false,
    );
    h.vfs.push_inode(ino);

    // Truncate to zero while every dependency is still pending.
    use ordfs_core::InodeVfs;
    h.vfs.truncate_to_zero(FS, ino).expect("truncate");
    h.engine.flush_all_for_mount(MOUNT).expect("flush");

    assert_eq!(h.engine.total_live_records(), 0, "arena leak after truncate");
    let freed = h.allocator.freed_block_numbers();
    assert!(freed.contains(&BlockNo(600)), "direct block not released");
    assert!(freed.contains(&BlockNo(700)), "indirect block not released");
    assert!(
        freed.contains(&BlockNo(800)),
        "block reachable only through the never-written indirect block not released"
    );
    // The page must come back before the indirect block that referenced it.
    let page_pos = freed.iter().position(|b| *b == BlockNo(800)).expect("page");
    let indir_pos = freed.iter().position(|b| *b == BlockNo(700)).expect("indir");
    assert!(page_pos < indir_pos);
    // The zeroed inode is what ended up durable.
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.size, 0);
    assert!(di.db.iter().all(|b| b.is_none()));
    assert!(di.ib.iter().all(|b| b.is_none()));
}

#[test]
fn indirect_block_writes_safe_copy_until_pointer_commits() {
    let h = Harness::new();
    let ino = InodeNum(50);
    h.vfs.inodes.lock().insert(ino, common::InMemInode::default());
    // The indirect block itself is already durable; a new page is being
    // hung off pointer slot 3.
    let indir_buf = h.cache.create_buffer(BlockNo(700));
    h.alloc_block(BlockNo(800));
    let page_buf = h.cache.create_buffer(BlockNo(800));
    h.cache.mark_dirty(page_buf).expect("dirty page");
    h.cache
        .with_buffer_mut(indir_buf, &mut |bytes| {
            set_indir_ptr(bytes, 3, BlockNo(800)).expect("pointer write");
        })
        .expect("indirect buffer");
    h.cache.mark_dirty(indir_buf).expect("dirty indirect");
    h.engine.setup_allocindir_page(
        FS,
        ino,
        LogicalBlock(NDADDR as u64 + 3),
        indir_buf,
        BlockNo(700),
        3,
        BlockNo(800),
        BlockNo::NONE,
        page_buf,
        false,
    );

    // Writing the indirect block now sends the safe copy: slot 3 zero.
    h.flush(indir_buf);
    let image = h.cache.disk_image(BlockNo(700)).expect("durable indirect block");
    assert_eq!(
        ordfs_ondisk::indir_ptr(&image, 3).expect("slot"),
        BlockNo::NONE,
        "uncommitted pointer escaped in the safe copy"
    );
    assert!(h.cache.is_dirty(indir_buf), "swap-back must re-dirty");
    assert!(h.engine.rollback_stats().indirect_ptrs >= 1);

    // Page contents and bitmap durable: the pointer becomes writable.
    h.flush(page_buf);
    h.flush(h.block_bitmap_buf);
    h.flush(indir_buf);
    let image = h.cache.disk_image(BlockNo(700)).expect("durable indirect block");
    assert_eq!(ordfs_ondisk::indir_ptr(&image, 3).expect("slot"), BlockNo(800));
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn cancelled_add_and_remove_never_reach_disk() {
    let h = Harness::new();
    let dir = InodeNum(2);
    let target = InodeNum(7);
    h.vfs.inodes.lock().insert(
        dir,
        common::InMemInode {
            mode: S_IFDIR,
            nlink: 2,
            effective: 2,
            ..common::InMemInode::default()
        },
    );
    let dir_buf = h.create_dir_page(dir, BlockNo(900));
    h.alloc_inode(target, S_IFREG, 1);
    h.engine.change_link_count(FS, target, 1, 1);

    h.add_dir_entry(dir_buf, dir, 64, target, None);
    assert!(h.engine.count_dependencies(dir_buf) >= 1);

    // Remove the entry before the page is ever written: the addition and
    // removal cancel.
    h.remove_dir_entry(dir_buf, dir, 64, target, false);
    assert_eq!(h.engine.link_delta(FS, target), 0);
    assert_eq!(h.vfs.inodes.lock()[&target].nlink, 0);

    h.flush(dir_buf);
    let page = h.cache.disk_image(BlockNo(900)).expect("durable page");
    assert_eq!(
        dir_entry_ino(&page, 64).expect("entry"),
        0,
        "a write referenced the cancelled inode"
    );

    h.engine.flush_all_for_mount(MOUNT).expect("flush");
    assert_eq!(h.engine.total_live_records(), 0);
    assert!(h.allocator.freed_blocks.lock().is_empty());
}

#[test]
fn mkdir_requires_body_parent_and_inode_durability() {
    let h = Harness::new();
    let parent = InodeNum(2);
    let newdir = InodeNum(30);
    h.vfs.inodes.lock().insert(
        parent,
        common::InMemInode {
            mode: S_IFDIR,
            nlink: 3,
            effective: 3,
            ..common::InMemInode::default()
        },
    );
    let parent_page = h.create_dir_page(parent, BlockNo(900));

    h.alloc_inode(newdir, S_IFDIR, 2);
    // The new directory's first block carries `.` and `..`.
    let body_buf = h.alloc_direct(newdir, LogicalBlock(0), BlockNo(950), BlockNo::NONE, 4096, 0, true);
    // Parent link count grew; its inode must be rewritten.
    h.engine.change_link_count(FS, parent, 3, 3);
    h.vfs.push_inode(parent);

    h.cache
        .with_buffer_mut(parent_page, &mut |bytes| {
            ordfs_ondisk::set_dir_entry_ino(bytes, 128, newdir.0).expect("entry");
        })
        .expect("parent page");
    h.cache.mark_dirty(parent_page).expect("dirty");
    h.engine
        .setup_directory_add(parent_page, FS, parent, 128, newdir, Some(body_buf), false);

    let entry_on_disk = |h: &Harness| {
        h.cache
            .disk_image(BlockNo(900))
            .map(|page| dir_entry_ino(&page, 128).expect("entry"))
            .unwrap_or(0)
    };

    // Page written first: rolled back.
    h.flush(parent_page);
    assert_eq!(entry_on_disk(&h), 0);

    // Body durable, parent inode durable — but the new inode itself is
    // not: the entry still may not appear.
    h.flush(body_buf);
    h.flush(h.vfs.inode_buf(parent));
    h.cache.mark_dirty(parent_page).expect("dirty");
    h.flush(parent_page);
    assert_eq!(entry_on_disk(&h), 0, "entry appeared before the inode was durable");

    // Bitmaps and the new inode's block: every precondition now holds.
    h.flush(h.inode_bitmap_buf);
    h.flush(h.block_bitmap_buf);
    h.vfs.push_inode(newdir);
    h.flush(h.vfs.inode_buf(newdir));

    h.cache.mark_dirty(parent_page).expect("dirty");
    h.flush(parent_page);
    assert_eq!(entry_on_disk(&h), newdir.0);

    h.engine.flush_all_for_mount(MOUNT).expect("flush");
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn entry_change_rolls_back_to_previous_inode() {
    let h = Harness::new();
    let dir = InodeNum(2);
    let old = InodeNum(7);
    let new = InodeNum(8);
    h.vfs.inodes.lock().insert(
        dir,
        common::InMemInode {
            mode: S_IFDIR,
            nlink: 2,
            effective: 2,
            ..common::InMemInode::default()
        },
    );
    h.vfs.inodes.lock().insert(
        old,
        common::InMemInode {
            mode: S_IFREG,
            nlink: 1,
            effective: 1,
            ..common::InMemInode::default()
        },
    );
    let dir_buf = h.create_dir_page(dir, BlockNo(900));

    // "name -> 7" is already durable.
    h.cache
        .with_buffer_mut(dir_buf, &mut |bytes| {
            ordfs_ondisk::set_dir_entry_ino(bytes, 64, old.0).expect("entry");
        })
        .expect("dir page");
    h.cache.mark_dirty(dir_buf).expect("dirty");
    h.flush(dir_buf);

    // Change it to the freshly allocated inode 8.
    h.alloc_inode(new, S_IFREG, 1);
    {
        let mut inodes = h.vfs.inodes.lock();
        let entry = inodes.get_mut(&old).expect("old inode");
        entry.effective -= 1;
    }
    h.engine.change_link_count(FS, old, 1, 0);
    h.cache
        .with_buffer_mut(dir_buf, &mut |bytes| {
            ordfs_ondisk::set_dir_entry_ino(bytes, 64, new.0).expect("entry");
        })
        .expect("dir page");
    h.cache.mark_dirty(dir_buf).expect("dirty");
    h.engine
        .setup_directory_change(dir_buf, FS, dir, 64, old, new, RenameMode::File);

    // While inode 8 is not durable, the write shows the previous occupant.
    h.flush(dir_buf);
    let page = h.cache.disk_image(BlockNo(900)).expect("durable page");
    assert_eq!(dir_entry_ino(&page, 64).expect("entry"), old.0);

    // Make inode 8 durable and rewrite the page.
    h.flush(h.inode_bitmap_buf);
    h.vfs.push_inode(new);
    h.flush(h.vfs.inode_buf(new));
    h.cache.mark_dirty(dir_buf).expect("dirty");
    h.flush(dir_buf);
    let page = h.cache.disk_image(BlockNo(900)).expect("durable page");
    assert_eq!(dir_entry_ino(&page, 64).expect("entry"), new.0);

    // With the zeroing of the old reference durable, the old inode's link
    // count drops.
    let processed = h.engine.process_worklist(None);
    assert!(processed >= 1);
    assert_eq!(h.vfs.inodes.lock()[&old].nlink, 0);
    assert_eq!(h.engine.link_delta(FS, old), 0);

    h.engine.flush_all_for_mount(MOUNT).expect("flush");
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn failed_write_keeps_rollback_and_retries_cleanly() {
    let h = Harness::new();
    let ino = InodeNum(40);
    h.vfs.inodes.lock().insert(ino, common::InMemInode::default());
    let data_buf = h.alloc_direct(ino, LogicalBlock(0), BlockNo(510), BlockNo::NONE, 4096, 0, false);
    h.vfs.push_inode(ino);
    let inode_buf = h.vfs.inode_buf(ino);

    h.cache.fail_next_write(inode_buf);
    assert!(h.cache.flush(inode_buf).is_err());
    assert_eq!(h.engine.io_error_count(), 1);
    assert!(h.cache.is_dirty(inode_buf), "failed write must stay dirty");
    assert!(h.cache.disk_image(common::inode_block_of(h.geo, ino)).is_none());

    // Retry: the rolled-back image goes out, completion restores the
    // up-to-date content.
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.db[0], BlockNo::NONE);

    h.flush(data_buf);
    h.flush(h.block_bitmap_buf);
    h.flush(inode_buf);
    let di = h.disk_inode(ino).expect("durable inode block");
    assert_eq!(di.db[0], BlockNo(510));
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
#[should_panic(expected = "discarded while carrying")]
fn releasing_a_buffer_with_dependencies_aborts() {
    let h = Harness::new();
    let dir = InodeNum(2);
    let target = InodeNum(7);
    h.vfs.inodes.lock().insert(dir, common::InMemInode::default());
    let dir_buf = h.create_dir_page(dir, BlockNo(900));
    h.alloc_inode(target, S_IFREG, 1);
    h.add_dir_entry(dir_buf, dir, 64, target, None);
    h.cache.release_buffer(dir_buf).expect("release");
}

#[test]
fn dependencies_follow_a_moved_buffer() {
    let h = Harness::new();
    let ino = InodeNum(10);
    h.vfs.inodes.lock().insert(ino, common::InMemInode::default());
    let data_buf = h.alloc_direct(ino, LogicalBlock(0), BlockNo(500), BlockNo::NONE, 4096, 0, false);
    h.vfs.push_inode(ino);

    // The cache re-homes the data block into a fresh buffer.
    let new_buf = h.cache.create_buffer(BlockNo(500));
    h.cache.mark_dirty(new_buf).expect("dirty");
    h.engine.move_dependencies(data_buf, new_buf);
    assert_eq!(h.cache.marker_count(data_buf), 0);
    assert!(h.cache.marker_count(new_buf) > 0);

    // The protocol completes through the new buffer.
    h.flush(new_buf);
    h.flush(h.block_bitmap_buf);
    h.flush(h.vfs.inode_buf(ino));
    h.cache.mark_dirty(h.vfs.inode_buf(ino)).expect("dirty");
    h.flush(h.vfs.inode_buf(ino));
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn concurrent_creators_share_one_record() {
    let h = Harness::new();
    let ino = InodeNum(77);
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                h.engine.change_link_count(FS, ino, 2, 2);
            });
        }
    });
    assert_eq!(h.engine.num_inode_deps(), 1);
    h.engine.flush_all_for_mount(MOUNT).expect("flush");
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn unmount_drains_everything_and_counts_work() {
    let h = Harness::new();
    let dir = InodeNum(2);
    let victim = InodeNum(9);
    h.vfs.inodes.lock().insert(
        dir,
        common::InMemInode {
            mode: S_IFDIR,
            nlink: 2,
            effective: 2,
            ..common::InMemInode::default()
        },
    );
    let dir_buf = h.create_dir_page(dir, BlockNo(900));

    // A durable entry, then a removal that must drain through unmount.
    h.vfs.inodes.lock().insert(
        victim,
        common::InMemInode {
            mode: S_IFREG,
            nlink: 1,
            effective: 1,
            ..common::InMemInode::default()
        },
    );
    h.cache
        .with_buffer_mut(dir_buf, &mut |bytes| {
            ordfs_ondisk::set_dir_entry_ino(bytes, 64, victim.0).expect("entry");
        })
        .expect("dir page");
    h.cache.mark_dirty(dir_buf).expect("dirty");
    h.flush(dir_buf);
    h.remove_dir_entry(dir_buf, dir, 64, victim, false);

    let processed = h.engine.unmount(MOUNT).expect("unmount");
    assert!(processed >= 1, "the removal work item must be counted");
    assert_eq!(h.engine.total_live_records(), 0);
    assert_eq!(h.vfs.inodes.lock()[&victim].nlink, 0);
}
