#![forbid(unsafe_code)]
//! On-disk metadata codecs.
//!
//! Pure parsing crate — no I/O, no side effects. Encodes and decodes the
//! three metadata buffer layouts the dependency engine patches during
//! rollback and roll-forward:
//!
//! - inode blocks (an array of fixed-size [`DiskInode`] slots),
//! - indirect pointer blocks (an array of little-endian `u64` block numbers),
//! - directory pages (each entry's leading 8 bytes hold the referenced inode
//!   number, which is the only field the engine ever rewrites).
//!
//! Also provides the allocation-bitmap bit operations used by tests and by
//! the in-memory collaborators.

use ordfs_types::{read_le_u16, read_le_u64, write_le_u16, write_le_u64};
use ordfs_types::{BlockNo, BytesError, NDADDR, NIADDR};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("short buffer: {0}")]
    Bytes(#[from] BytesError),
    #[error("inode slot index {index} out of range for {slots} slots")]
    SlotOutOfRange { index: usize, slots: usize },
    #[error("pointer index {index} out of range for {slots} slots")]
    PtrOutOfRange { index: usize, slots: usize },
}

/// Encoded byte length of a [`DiskInode`] (slots are padded to the
/// filesystem's inode size, at least this large).
pub const DISK_INODE_LEN: usize = 8 + 8 + 8 + NDADDR * 8 + NIADDR * 8;

/// In-memory image of one on-disk inode.
///
/// Layout (little-endian): `mode:u16 nlink:u16 pad:u32 size:u64 blocks:u64`
/// followed by the direct and indirect pointer arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub nlink: u16,
    pub size: u64,
    pub blocks: u64,
    pub db: [BlockNo; NDADDR],
    pub ib: [BlockNo; NIADDR],
}

impl DiskInode {
    pub fn decode(slot: &[u8]) -> Result<Self, CodecError> {
        let mode = read_le_u16(slot, 0)?;
        let nlink = read_le_u16(slot, 2)?;
        let size = read_le_u64(slot, 8)?;
        let blocks = read_le_u64(slot, 16)?;
        let mut db = [BlockNo::NONE; NDADDR];
        for (i, slot_db) in db.iter_mut().enumerate() {
            *slot_db = BlockNo(read_le_u64(slot, 24 + i * 8)?);
        }
        let mut ib = [BlockNo::NONE; NIADDR];
        for (i, slot_ib) in ib.iter_mut().enumerate() {
            *slot_ib = BlockNo(read_le_u64(slot, 24 + NDADDR * 8 + i * 8)?);
        }
        Ok(Self {
            mode,
            nlink,
            size,
            blocks,
            db,
            ib,
        })
    }

    pub fn encode(&self, slot: &mut [u8]) -> Result<(), CodecError> {
        write_le_u16(slot, 0, self.mode)?;
        write_le_u16(slot, 2, self.nlink)?;
        write_le_u16(slot, 4, 0)?;
        write_le_u16(slot, 6, 0)?;
        write_le_u64(slot, 8, self.size)?;
        write_le_u64(slot, 16, self.blocks)?;
        for (i, db) in self.db.iter().enumerate() {
            write_le_u64(slot, 24 + i * 8, db.0)?;
        }
        for (i, ib) in self.ib.iter().enumerate() {
            write_le_u64(slot, 24 + NDADDR * 8 + i * 8, ib.0)?;
        }
        Ok(())
    }

    /// Decode the inode at byte `offset` within an inode block.
    pub fn decode_at(block: &[u8], offset: usize) -> Result<Self, CodecError> {
        if offset + DISK_INODE_LEN > block.len() {
            return Err(CodecError::SlotOutOfRange {
                index: offset,
                slots: block.len(),
            });
        }
        Self::decode(&block[offset..offset + DISK_INODE_LEN])
    }

    /// Encode this inode at byte `offset` within an inode block.
    pub fn encode_at(&self, block: &mut [u8], offset: usize) -> Result<(), CodecError> {
        if offset + DISK_INODE_LEN > block.len() {
            return Err(CodecError::SlotOutOfRange {
                index: offset,
                slots: block.len(),
            });
        }
        self.encode(&mut block[offset..offset + DISK_INODE_LEN])
    }

    /// Zero the inode slot at byte `offset` (an unallocated inode).
    pub fn zero_at(block: &mut [u8], offset: usize, slot_len: usize) -> Result<(), CodecError> {
        if offset + slot_len > block.len() {
            return Err(CodecError::SlotOutOfRange {
                index: offset,
                slots: block.len(),
            });
        }
        block[offset..offset + slot_len].fill(0);
        Ok(())
    }
}

// ── Indirect pointer blocks ─────────────────────────────────────────────────

/// Read pointer slot `index` of an indirect block.
pub fn indir_ptr(block: &[u8], index: usize) -> Result<BlockNo, CodecError> {
    let slots = block.len() / 8;
    if index >= slots {
        return Err(CodecError::PtrOutOfRange { index, slots });
    }
    Ok(BlockNo(read_le_u64(block, index * 8)?))
}

/// Write pointer slot `index` of an indirect block.
pub fn set_indir_ptr(block: &mut [u8], index: usize, value: BlockNo) -> Result<(), CodecError> {
    let slots = block.len() / 8;
    if index >= slots {
        return Err(CodecError::PtrOutOfRange { index, slots });
    }
    write_le_u64(block, index * 8, value.0)?;
    Ok(())
}

// ── Directory pages ─────────────────────────────────────────────────────────

/// Read the inode number of the directory entry at byte `offset`.
pub fn dir_entry_ino(page: &[u8], offset: usize) -> Result<u64, CodecError> {
    Ok(read_le_u64(page, offset)?)
}

/// Overwrite the inode number of the directory entry at byte `offset`.
pub fn set_dir_entry_ino(page: &mut [u8], offset: usize, ino: u64) -> Result<(), CodecError> {
    write_le_u64(page, offset, ino)?;
    Ok(())
}

// ── Allocation bitmaps ──────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordfs_types::InodeNum;

    #[test]
    fn disk_inode_encode_decode() {
        let mut ino = DiskInode {
            mode: 0o100_644,
            nlink: 2,
            size: 123_456,
            blocks: 17,
            ..DiskInode::default()
        };
        ino.db[0] = BlockNo(100);
        ino.db[11] = BlockNo(111);
        ino.ib[2] = BlockNo(999);

        let mut block = vec![0_u8; 4096];
        ino.encode_at(&mut block, 256).expect("encode");
        let back = DiskInode::decode_at(&block, 256).expect("decode");
        assert_eq!(back, ino);
        // Neighboring slots untouched.
        assert_eq!(DiskInode::decode_at(&block, 0).expect("slot 0"), DiskInode::default());
    }

    #[test]
    fn disk_inode_zero_slot() {
        let mut block = vec![0xFF_u8; 1024];
        DiskInode::zero_at(&mut block, 256, 256).expect("zero");
        assert!(block[256..512].iter().all(|b| *b == 0));
        assert!(block[..256].iter().all(|b| *b == 0xFF));
        assert!(block[512..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn disk_inode_slot_bounds() {
        let block = vec![0_u8; 200];
        assert!(DiskInode::decode_at(&block, 128).is_err());
    }

    #[test]
    fn indirect_pointer_slots() {
        let mut block = vec![0_u8; 4096];
        set_indir_ptr(&mut block, 0, BlockNo(5)).expect("set");
        set_indir_ptr(&mut block, 511, BlockNo(6)).expect("set");
        assert_eq!(indir_ptr(&block, 0).expect("get"), BlockNo(5));
        assert_eq!(indir_ptr(&block, 511).expect("get"), BlockNo(6));
        assert_eq!(indir_ptr(&block, 1).expect("get"), BlockNo::NONE);
        assert!(indir_ptr(&block, 512).is_err());
        assert!(set_indir_ptr(&mut block, 512, BlockNo(1)).is_err());
    }

    #[test]
    fn dir_entry_ino_round_trip() {
        let mut page = vec![0_u8; 512];
        set_dir_entry_ino(&mut page, 64, InodeNum(7).0).expect("set");
        assert_eq!(dir_entry_ino(&page, 64).expect("get"), 7);
        set_dir_entry_ino(&mut page, 64, 0).expect("clear");
        assert_eq!(dir_entry_ino(&page, 64).expect("get"), 0);
        assert!(dir_entry_ino(&page, 508).is_err());
    }

    #[test]
    fn bitmap_bit_ops() {
        let mut map = vec![0_u8; 8];
        assert!(!bitmap_get(&map, 10));
        bitmap_set(&mut map, 10);
        assert!(bitmap_get(&map, 10));
        bitmap_clear(&mut map, 10);
        assert!(!bitmap_get(&map, 10));
        // Out-of-range reads are false, writes are ignored.
        assert!(!bitmap_get(&map, 1000));
        bitmap_set(&mut map, 1000);
    }
}
