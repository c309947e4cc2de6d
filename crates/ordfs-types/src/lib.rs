#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of direct block pointer slots in an on-disk inode.
pub const NDADDR: usize = 12;
/// Number of indirect block pointer slots in an on-disk inode.
pub const NIADDR: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MountId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNum(pub u64);

/// Physical disk block number. Zero means "no block" in every pointer slot,
/// exactly as the on-disk format treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockNo(pub u64);

/// Logical block index within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

/// Buffer identity handed out by the buffer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufId(pub u64);

impl BlockNo {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl LogicalBlock {
    /// Whether this logical block is addressed by a direct pointer slot.
    #[must_use]
    pub fn is_direct(self) -> bool {
        (self.0 as usize) < NDADDR
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Per-filesystem geometry the dependency engine needs.
///
/// Fragment size matters to rollback: an inode's on-disk size may only end at
/// a fragment boundary of the last durable block, so rollback has to know
/// where full blocks end and fragments begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    block_size: u32,
    frag_size: u32,
    inode_size: u32,
}

impl FsGeometry {
    pub fn new(block_size: u32, frag_size: u32, inode_size: u32) -> Result<Self, GeometryError> {
        if !block_size.is_power_of_two() || !(512..=65536).contains(&block_size) {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        if !frag_size.is_power_of_two() || frag_size > block_size || frag_size == 0 {
            return Err(GeometryError::InvalidField {
                field: "frag_size",
                reason: "must be a power of two no larger than block_size",
            });
        }
        if !inode_size.is_power_of_two() || inode_size > block_size || inode_size < 128 {
            return Err(GeometryError::InvalidField {
                field: "inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        Ok(Self {
            block_size,
            frag_size,
            inode_size,
        })
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn frag_size(self) -> u32 {
        self.frag_size
    }

    #[must_use]
    pub fn inode_size(self) -> u32 {
        self.inode_size
    }

    #[must_use]
    pub fn inodes_per_block(self) -> u32 {
        self.block_size / self.inode_size
    }

    /// Pointer slots per indirect block (8-byte pointers).
    #[must_use]
    pub fn ptrs_per_block(self) -> u32 {
        self.block_size / 8
    }

    /// Byte offset of an inode's slot within its inode block.
    #[must_use]
    pub fn inode_slot_offset(self, ino: InodeNum) -> usize {
        let idx = ino.0 % u64::from(self.inodes_per_block());
        (idx as usize) * (self.inode_size as usize)
    }

    /// Whether `size` describes a fragment rather than nothing or a full block.
    #[must_use]
    pub fn is_fragment(self, size: u32) -> bool {
        size != 0 && size != self.block_size
    }

    /// On-disk size of logical block `lbn` for a file of `file_size` bytes:
    /// a full block unless `lbn` is the last block and ends in a fragment.
    #[must_use]
    pub fn size_of_block(self, file_size: u64, lbn: LogicalBlock) -> u32 {
        let bsize = u64::from(self.block_size);
        let start = lbn.0 * bsize;
        if file_size >= start + bsize {
            self.block_size
        } else {
            let tail = file_size.saturating_sub(start);
            let frag = u64::from(self.frag_size);
            let bytes = (tail.div_ceil(frag) * frag).min(bsize);
            u32::try_from(bytes).unwrap_or(self.block_size)
        }
    }

    /// Logical block containing byte offset `off`.
    #[must_use]
    pub fn byte_to_lbn(self, off: u64) -> LogicalBlock {
        LogicalBlock(off / u64::from(self.block_size))
    }

    /// Byte offset within its block of byte offset `off`.
    #[must_use]
    pub fn byte_offset_in_block(self, off: u64) -> usize {
        (off % u64::from(self.block_size)) as usize
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BytesError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], BytesError> {
    let end = offset.checked_add(len).ok_or(BytesError::InsufficientData {
        needed: len,
        offset,
        actual: 0,
    })?;
    if end > data.len() {
        return Err(BytesError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], BytesError> {
    let end = offset.checked_add(len).ok_or(BytesError::InsufficientData {
        needed: len,
        offset,
        actual: 0,
    })?;
    if end > data.len() {
        return Err(BytesError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, BytesError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, BytesError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, BytesError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), BytesError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), BytesError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), BytesError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_helpers() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).expect("u16");
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).expect("u32");
        write_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).expect("u64");
        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 8).expect("u64"), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_bounds_errors() {
        let buf = [0_u8; 4];
        assert!(read_le_u64(&buf, 0).is_err());
        assert!(read_le_u32(&buf, 2).is_err());
        let mut buf = [0_u8; 4];
        assert!(write_le_u64(&mut buf, 0, 1).is_err());
    }

    #[test]
    fn test_geometry_validation() {
        assert!(FsGeometry::new(4096, 512, 256).is_ok());
        assert!(FsGeometry::new(4096, 4096, 256).is_ok());
        // frag larger than block
        assert!(FsGeometry::new(4096, 8192, 256).is_err());
        // non power of two
        assert!(FsGeometry::new(3000, 512, 256).is_err());
        // inode slot too small
        assert!(FsGeometry::new(4096, 512, 64).is_err());
    }

    #[test]
    fn test_inode_slot_offset() {
        let geo = FsGeometry::new(4096, 512, 256).expect("geometry");
        assert_eq!(geo.inodes_per_block(), 16);
        assert_eq!(geo.inode_slot_offset(InodeNum(0)), 0);
        assert_eq!(geo.inode_slot_offset(InodeNum(1)), 256);
        assert_eq!(geo.inode_slot_offset(InodeNum(16)), 0);
        assert_eq!(geo.inode_slot_offset(InodeNum(17)), 256);
    }

    #[test]
    fn test_size_of_block() {
        let geo = FsGeometry::new(4096, 1024, 256).expect("geometry");
        // Interior block of a large file: full block.
        assert_eq!(geo.size_of_block(100_000, LogicalBlock(0)), 4096);
        // Last block ending mid-fragment rounds up to the fragment boundary.
        assert_eq!(geo.size_of_block(4096 + 100, LogicalBlock(1)), 1024);
        assert_eq!(geo.size_of_block(4096 + 1500, LogicalBlock(1)), 2048);
        // Exactly full.
        assert_eq!(geo.size_of_block(8192, LogicalBlock(1)), 4096);
    }

    #[test]
    fn test_fragment_predicate() {
        let geo = FsGeometry::new(4096, 1024, 256).expect("geometry");
        assert!(!geo.is_fragment(0));
        assert!(!geo.is_fragment(4096));
        assert!(geo.is_fragment(1024));
        assert!(geo.is_fragment(2048));
    }

    #[test]
    fn test_lbn_math() {
        let geo = FsGeometry::new(4096, 512, 256).expect("geometry");
        assert_eq!(geo.byte_to_lbn(0), LogicalBlock(0));
        assert_eq!(geo.byte_to_lbn(4095), LogicalBlock(0));
        assert_eq!(geo.byte_to_lbn(4096), LogicalBlock(1));
        assert_eq!(geo.byte_offset_in_block(4100), 4);
        assert!(LogicalBlock(11).is_direct());
        assert!(!LogicalBlock(12).is_direct());
    }
}
