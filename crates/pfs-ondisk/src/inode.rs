#![forbid(unsafe_code)]

use pfs_types::{
    BlockSize, DINODE_PLAIN_SIZE, DINODE_POINTER_OFFSET, DINODE_SIGNED_SIZE, InodeNumber,
    POINTER_SLOTS, ParseError, SIG_ENTRY_SIZE, SIG_SIZE, read_le_i32, read_le_u16, read_le_u32,
    read_le_u64, write_le_i32, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

// Common-prefix field offsets, shared by both encodings.
const MODE_OFFSET: usize = 0x00;
const NLINK_OFFSET: usize = 0x02;
const FLAGS_OFFSET: usize = 0x04;
const SIZE_OFFSET: usize = 0x08;
const SIZE_COMPRESSED_OFFSET: usize = 0x10;
const TIME_SEC_OFFSET: usize = 0x18;
const TIME_NSEC_OFFSET: usize = 0x38;
const UID_OFFSET: usize = 0x48;
const GID_OFFSET: usize = 0x4C;
const BLOCKS_OFFSET: usize = 0x60;

/// Which of the two on-disk inode encodings an image uses.
///
/// Selected once per build from the signing configuration: signed images
/// carry a 36-byte signature+pointer record per slot, plain images a bare
/// 4-byte pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeLayout {
    Plain,
    Signed,
}

impl InodeLayout {
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            Self::Plain => DINODE_PLAIN_SIZE,
            Self::Signed => DINODE_SIGNED_SIZE,
        }
    }

    /// Distance between consecutive pointer slots.
    #[must_use]
    pub fn pointer_stride(self) -> usize {
        match self {
            Self::Plain => 4,
            Self::Signed => SIG_ENTRY_SIZE,
        }
    }

    /// Offset of pointer slot `slot` within the encoded inode.
    ///
    /// In the signed encoding this is the start of the 36-byte record; the
    /// block number itself sits 32 bytes further in, after the signature.
    #[must_use]
    pub fn slot_offset(self, slot: usize) -> usize {
        debug_assert!(slot < POINTER_SLOTS);
        DINODE_POINTER_OFFSET + self.pointer_stride() * slot
    }
}

/// Absolute image offset of a signed inode's slot record.
///
/// The inode table starts at block 1 and signed inodes are addressed as if
/// packed back to back at `0x2C8` bytes apiece.
#[must_use]
pub fn signed_slot_image_offset(block_size: BlockSize, ino: InodeNumber, slot: usize) -> u64 {
    block_size.as_u64()
        + DINODE_SIGNED_SIZE as u64 * u64::from(ino.0)
        + DINODE_POINTER_OFFSET as u64
        + SIG_ENTRY_SIZE as u64 * slot as u64
}

/// An in-memory inode record.
///
/// Created during setup, mutated only by the layout planner, then read-only
/// while the image is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dinode {
    pub layout: InodeLayout,
    pub number: InodeNumber,
    pub mode: u16,
    pub nlink: u16,
    pub flags: u32,
    pub size: u64,
    pub size_compressed: u64,
    pub time_sec: u64,
    pub time_nsec: u32,
    pub uid: u32,
    pub gid: u32,
    pub blocks: u32,
    pointers: [i32; POINTER_SLOTS],
}

impl Dinode {
    #[must_use]
    pub fn new(layout: InodeLayout, number: InodeNumber) -> Self {
        Self {
            layout,
            number,
            mode: 0,
            nlink: 1,
            flags: 0,
            size: 0,
            size_compressed: 0,
            time_sec: 0,
            time_nsec: 0,
            uid: 0,
            gid: 0,
            blocks: 0,
            pointers: [0; POINTER_SLOTS],
        }
    }

    pub fn set_pointer(&mut self, slot: usize, block: i32) {
        debug_assert!(slot < POINTER_SLOTS);
        self.pointers[slot] = block;
    }

    #[must_use]
    pub fn pointer(&self, slot: usize) -> i32 {
        debug_assert!(slot < POINTER_SLOTS);
        self.pointers[slot]
    }

    /// First data block; meaningful once the planner has run.
    #[must_use]
    pub fn start_block(&self) -> i32 {
        self.pointers[0]
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & pfs_types::MODE_DIR != 0
    }

    /// Serialize into `buf`, which must hold at least `layout.size_of()`
    /// bytes. Signature areas of the signed encoding are left zeroed; the
    /// signer fills them after the data pass.
    pub fn write_into(&self, buf: &mut [u8]) {
        write_le_u16(buf, MODE_OFFSET, self.mode);
        write_le_u16(buf, NLINK_OFFSET, self.nlink);
        write_le_u32(buf, FLAGS_OFFSET, self.flags);
        write_le_u64(buf, SIZE_OFFSET, self.size);
        write_le_u64(buf, SIZE_COMPRESSED_OFFSET, self.size_compressed);
        // All four timestamp slots carry the same instant.
        for slot in 0..4 {
            write_le_u64(buf, TIME_SEC_OFFSET + 8 * slot, self.time_sec);
            write_le_u32(buf, TIME_NSEC_OFFSET + 4 * slot, self.time_nsec);
        }
        write_le_u32(buf, UID_OFFSET, self.uid);
        write_le_u32(buf, GID_OFFSET, self.gid);
        // 0x50..0x60 spare, left zero.
        write_le_u32(buf, BLOCKS_OFFSET, self.blocks);

        let pointer_shift = match self.layout {
            InodeLayout::Plain => 0,
            InodeLayout::Signed => SIG_SIZE,
        };
        for (slot, pointer) in self.pointers.iter().enumerate() {
            write_le_i32(buf, self.layout.slot_offset(slot) + pointer_shift, *pointer);
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.layout.size_of()];
        self.write_into(&mut buf);
        buf
    }

    /// Parse an encoded inode back into memory.
    ///
    /// Signature bytes of the signed encoding are not retained.
    pub fn parse_from_bytes(
        data: &[u8],
        layout: InodeLayout,
        number: InodeNumber,
    ) -> Result<Self, ParseError> {
        if data.len() < layout.size_of() {
            return Err(ParseError::InsufficientData {
                needed: layout.size_of(),
                offset: 0,
                actual: data.len(),
            });
        }

        let pointer_shift = match layout {
            InodeLayout::Plain => 0,
            InodeLayout::Signed => SIG_SIZE,
        };
        let mut pointers = [0_i32; POINTER_SLOTS];
        for (slot, pointer) in pointers.iter_mut().enumerate() {
            *pointer = read_le_i32(data, layout.slot_offset(slot) + pointer_shift)?;
        }

        Ok(Self {
            layout,
            number,
            mode: read_le_u16(data, MODE_OFFSET)?,
            nlink: read_le_u16(data, NLINK_OFFSET)?,
            flags: read_le_u32(data, FLAGS_OFFSET)?,
            size: read_le_u64(data, SIZE_OFFSET)?,
            size_compressed: read_le_u64(data, SIZE_COMPRESSED_OFFSET)?,
            time_sec: read_le_u64(data, TIME_SEC_OFFSET)?,
            time_nsec: read_le_u32(data, TIME_NSEC_OFFSET)?,
            uid: read_le_u32(data, UID_OFFSET)?,
            gid: read_le_u32(data, GID_OFFSET)?,
            blocks: read_le_u32(data, BLOCKS_OFFSET)?,
            pointers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::{INODE_FLAG_READONLY, MODE_DIR, MODE_FILE, NO_BLOCK, PERM_RX};

    fn sample(layout: InodeLayout) -> Dinode {
        let mut ino = Dinode::new(layout, InodeNumber(3));
        ino.mode = MODE_FILE | PERM_RX;
        ino.nlink = 1;
        ino.flags = INODE_FLAG_READONLY;
        ino.size = 10;
        ino.blocks = 1;
        ino.time_sec = 1_700_000_000;
        ino.set_pointer(0, 6);
        ino
    }

    #[test]
    fn plain_round_trip() {
        let ino = sample(InodeLayout::Plain);
        let bytes = ino.to_bytes();
        assert_eq!(bytes.len(), DINODE_PLAIN_SIZE);

        let parsed = Dinode::parse_from_bytes(&bytes, InodeLayout::Plain, InodeNumber(3)).unwrap();
        assert_eq!(parsed, ino);
    }

    #[test]
    fn signed_round_trip() {
        let mut ino = sample(InodeLayout::Signed);
        ino.set_pointer(12, 99);
        let bytes = ino.to_bytes();
        assert_eq!(bytes.len(), DINODE_SIGNED_SIZE);

        let parsed = Dinode::parse_from_bytes(&bytes, InodeLayout::Signed, InodeNumber(3)).unwrap();
        assert_eq!(parsed, ino);
    }

    #[test]
    fn field_positions_match_layout() {
        let mut ino = sample(InodeLayout::Plain);
        ino.mode = MODE_DIR | PERM_RX;
        ino.set_pointer(1, NO_BLOCK);
        let bytes = ino.to_bytes();

        assert_eq!(read_le_u16(&bytes, 0x00).unwrap(), MODE_DIR | PERM_RX);
        assert_eq!(read_le_u64(&bytes, 0x08).unwrap(), 10);
        assert_eq!(read_le_u32(&bytes, 0x60).unwrap(), 1);
        // Plain pointers are bare i32s from 0x64.
        assert_eq!(read_le_i32(&bytes, 0x64).unwrap(), 6);
        assert_eq!(read_le_i32(&bytes, 0x68).unwrap(), NO_BLOCK);
    }

    #[test]
    fn signed_pointer_sits_after_signature() {
        let ino = sample(InodeLayout::Signed);
        let bytes = ino.to_bytes();

        // Slot 0: 32 bytes of (zero) signature, then the block number.
        assert!(bytes[0x64..0x64 + 32].iter().all(|b| *b == 0));
        assert_eq!(read_le_i32(&bytes, 0x64 + 32).unwrap(), 6);
    }

    #[test]
    fn all_timestamp_slots_are_stamped() {
        let ino = sample(InodeLayout::Plain);
        let bytes = ino.to_bytes();
        for slot in 0..4 {
            assert_eq!(
                read_le_u64(&bytes, 0x18 + 8 * slot).unwrap(),
                1_700_000_000,
                "timestamp slot {slot}"
            );
        }
    }

    #[test]
    fn slot_image_offset_formula() {
        let bs = BlockSize::STANDARD;
        // Inode 0, slot 0: right at the start of the table's pointer area.
        assert_eq!(
            signed_slot_image_offset(bs, InodeNumber(0), 0),
            65536 + 0x64
        );
        assert_eq!(
            signed_slot_image_offset(bs, InodeNumber(2), 1),
            65536 + 2 * 0x2C8 + 0x64 + 36
        );
    }

    #[test]
    fn truncated_input_is_rejected() {
        let err = Dinode::parse_from_bytes(&[0_u8; 16], InodeLayout::Plain, InodeNumber(0));
        assert!(matches!(err, Err(ParseError::InsufficientData { .. })));
    }
}
