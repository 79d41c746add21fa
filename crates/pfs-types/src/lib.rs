#![forbid(unsafe_code)]
//! Core types and on-disk constants for PFS images.
//!
//! Newtype wrappers for block/inode numbers, validated block sizes,
//! little-endian field helpers, and the fixed offsets of the PFS header
//! and inode encodings. Pure data — no I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Image identity ──────────────────────────────────────────────────────────

pub const PFS_VERSION: i64 = 1;
pub const PFS_MAGIC: i64 = 20_130_315;

// ── Header mode flags (u16 at 0x1C) ─────────────────────────────────────────

pub const PFS_MODE_SIGNED: u16 = 0x1;
pub const PFS_MODE_64BIT: u16 = 0x2;
pub const PFS_MODE_ENCRYPTED: u16 = 0x4;
/// Set on every image produced by the reference tooling.
pub const PFS_MODE_UNK_ALWAYS_SET: u16 = 0x8;

// ── Header field offsets ────────────────────────────────────────────────────

pub const HEADER_VERSION_OFFSET: usize = 0x00;
pub const HEADER_MAGIC_OFFSET: usize = 0x08;
pub const HEADER_ID_OFFSET: usize = 0x10;
pub const HEADER_MODE_OFFSET: usize = 0x1C;
pub const HEADER_BLOCK_SIZE_OFFSET: usize = 0x20;
pub const HEADER_NBACKUP_OFFSET: usize = 0x24;
pub const HEADER_NBLOCK_OFFSET: usize = 0x28;
pub const HEADER_NDINODE_OFFSET: usize = 0x30;
pub const HEADER_NDBLOCK_OFFSET: usize = 0x38;
pub const HEADER_NDINODEBLOCK_OFFSET: usize = 0x40;
pub const HEADER_SUPERROOT_INO_OFFSET: usize = 0x48;
/// The inode-block-signature descriptor (signed inode encoding) lives here,
/// which places its per-slot signature records at 0xB8.
pub const HEADER_INODE_SIG_OFFSET: usize = 0x54;
pub const HEADER_SEED_OFFSET: usize = 0x370;
/// Signature slot for the header region itself.
pub const HEADER_SIG_OFFSET: usize = 0x380;
/// Span of the header region covered by its signature.
pub const HEADER_SIG_SPAN: usize = 0x5A0;

pub const SEED_SIZE: usize = 16;
pub const EKPFS_SIZE: usize = 32;

// ── Inode encodings ─────────────────────────────────────────────────────────

/// Size of the plain (unsigned) inode encoding.
pub const DINODE_PLAIN_SIZE: usize = 0xA8;
/// Size of the signed inode encoding, which carries a 36-byte
/// signature+pointer record per block-pointer slot.
pub const DINODE_SIGNED_SIZE: usize = 0x2C8;
/// Offset of the first block-pointer slot in either encoding.
pub const DINODE_POINTER_OFFSET: usize = 0x64;

/// Direct data-block slots per inode.
pub const DIRECT_SLOTS: usize = 12;
/// Slot holding the single-indirect block pointer.
pub const SLOT_INDIRECT: usize = 12;
/// Slot holding the double-indirect block pointer.
pub const SLOT_DOUBLE_INDIRECT: usize = 13;
/// Total pointer slots in an inode (12 direct + 5 indirect).
pub const POINTER_SLOTS: usize = 17;

/// HMAC-SHA256 signature size.
pub const SIG_SIZE: usize = 32;
/// Signature record: 32-byte tag followed by a 4-byte LE block number.
pub const SIG_ENTRY_SIZE: usize = 36;

/// Sentinel stamped into unused pointer slots of unsigned images.
pub const NO_BLOCK: i32 = -1;

// ── Inode flags (u32 at 0x04) ───────────────────────────────────────────────

pub const INODE_FLAG_COMPRESSED: u32 = 0x1;
/// Always set alongside [`INODE_FLAG_UNK2`] on signed images.
pub const INODE_FLAG_UNK1: u32 = 0x2;
pub const INODE_FLAG_UNK2: u32 = 0x4;
pub const INODE_FLAG_READONLY: u32 = 0x10;
pub const INODE_FLAG_INTERNAL: u32 = 0x2_0000;

// ── Inode mode (u16 at 0x00) ────────────────────────────────────────────────

/// Directory bit of the inode mode.
pub const MODE_DIR: u16 = 0o040_000;
/// Regular-file bit of the inode mode.
pub const MODE_FILE: u16 = 0o100_000;
/// r-x for owner, group, and other — the only permission set emitted.
pub const PERM_RX: u16 = 0o555;

// ── Dirents ─────────────────────────────────────────────────────────────────

/// Fixed dirent prefix: ino, kind, namelen, entsize (four u32 fields).
pub const DIRENT_HEADER_SIZE: usize = 0x10;
pub const DIRENT_MAX_NAME: usize = 255;
/// Upper bound on a serialized dirent (header + name padded to 8).
pub const DIRENT_MAX_SIZE: usize = 272;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Block number within the image (the on-disk pointer width is 32 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Byte offset within the image (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Validated block size (power of two in 4096..=65536).
///
/// The lower bound keeps every block coverable by whole XTS sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// The block size every known PFS image uses.
    pub const STANDARD: Self = Self(65536);

    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(4096..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of blocks needed to hold `bytes` (rounding up).
    #[must_use]
    pub fn blocks_for(self, bytes: u64) -> u64 {
        ceil_div(bytes, self.as_u64())
    }

    /// Round a byte count up to a block boundary.
    #[must_use]
    pub fn round_up(self, bytes: u64) -> u64 {
        self.blocks_for(bytes) * self.as_u64()
    }

    /// Signature+pointer records that fit in one block of this size.
    #[must_use]
    pub fn sig_entries_per_block(self) -> u64 {
        self.as_u64() / SIG_ENTRY_SIZE as u64
    }
}

impl BlockIndex {
    /// Byte offset of the start of this block.
    #[must_use]
    pub fn byte_offset(self, block_size: BlockSize) -> ByteOffset {
        ByteOffset(u64::from(self.0) * block_size.as_u64())
    }
}

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const SUPER_ROOT: Self = Self(0);
    pub const FLAT_PATH_TABLE: Self = Self(1);
    pub const UROOT: Self = Self(2);

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: i64, actual: i64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian field helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// Write-side counterparts. Callers serialize into buffers sized by the
// record constants above, so bounds are part of the encoding contract.

#[inline]
pub fn write_le_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ── Arithmetic helpers ──────────────────────────────────────────────────────

/// Divide, rounding up. Returns 0 when `value` is 0.
#[must_use]
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    debug_assert!(divisor > 0);
    value.div_ceil(divisor)
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` block counter to the on-disk 32-bit pointer width.
pub fn block_to_i32(value: u64, field: &'static str) -> Result<i32, ParseError> {
    i32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
