#![forbid(unsafe_code)]

use crate::inode::{Dinode, InodeLayout};
use pfs_types::{
    BlockSize, HEADER_BLOCK_SIZE_OFFSET, HEADER_INODE_SIG_OFFSET, HEADER_MAGIC_OFFSET,
    HEADER_MODE_OFFSET, HEADER_NBLOCK_OFFSET, HEADER_NDBLOCK_OFFSET, HEADER_NDINODE_OFFSET,
    HEADER_NDINODEBLOCK_OFFSET, HEADER_SEED_OFFSET, HEADER_SIG_SPAN, HEADER_SUPERROOT_INO_OFFSET,
    HEADER_VERSION_OFFSET, InodeNumber, PFS_MAGIC, PFS_VERSION, ParseError, SEED_SIZE,
    read_fixed, read_le_i64, read_le_u16, read_le_u32, write_le_i64, write_le_u16, write_le_u32,
};

/// The PFS image header, occupying block 0.
///
/// Besides the fixed-offset scalar fields it embeds the inode-block
/// signature descriptor — a signed-encoding inode whose pointer slots
/// address the inode-table blocks and receive their signatures.
#[derive(Debug, Clone)]
pub struct Header {
    pub block_size: BlockSize,
    pub mode: u16,
    pub seed: [u8; SEED_SIZE],
    pub nblock: u64,
    pub dinode_count: u64,
    pub ndblock: u64,
    pub dinode_block_count: u64,
    pub superroot_ino: u64,
    pub inode_block_sig: Dinode,
}

impl Header {
    #[must_use]
    pub fn new(block_size: BlockSize, mode: u16, seed: [u8; SEED_SIZE]) -> Self {
        Self {
            block_size,
            mode,
            seed,
            nblock: 0,
            dinode_count: 0,
            ndblock: 0,
            dinode_block_count: 0,
            superroot_ino: u64::from(InodeNumber::SUPER_ROOT.0),
            inode_block_sig: Dinode::new(InodeLayout::Signed, InodeNumber::SUPER_ROOT),
        }
    }

    /// Serialize into `buf` (the caller passes the whole of block 0).
    ///
    /// `buf` must cover at least the signed header span.
    pub fn write_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIG_SPAN);

        write_le_i64(buf, HEADER_VERSION_OFFSET, PFS_VERSION);
        write_le_i64(buf, HEADER_MAGIC_OFFSET, PFS_MAGIC);
        // id / fmode / clean / ronly / rsv stay zero.
        write_le_u16(buf, HEADER_MODE_OFFSET, self.mode);
        write_le_u32(buf, HEADER_BLOCK_SIZE_OFFSET, self.block_size.get());
        // nbackup stays zero.
        write_le_i64(buf, HEADER_NBLOCK_OFFSET, self.nblock as i64);
        write_le_i64(buf, HEADER_NDINODE_OFFSET, self.dinode_count as i64);
        write_le_i64(buf, HEADER_NDBLOCK_OFFSET, self.ndblock as i64);
        write_le_i64(buf, HEADER_NDINODEBLOCK_OFFSET, self.dinode_block_count as i64);
        write_le_i64(buf, HEADER_SUPERROOT_INO_OFFSET, self.superroot_ino as i64);

        self.inode_block_sig
            .write_into(&mut buf[HEADER_INODE_SIG_OFFSET..]);

        buf[HEADER_SEED_OFFSET..HEADER_SEED_OFFSET + SEED_SIZE].copy_from_slice(&self.seed);
        // The header signature slot at 0x380 is filled by the signer.
    }

    /// Parse a header from the start of an image.
    pub fn parse_from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_i64(data, HEADER_MAGIC_OFFSET)?;
        if magic != PFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: PFS_MAGIC,
                actual: magic,
            });
        }

        let block_size = BlockSize::new(read_le_u32(data, HEADER_BLOCK_SIZE_OFFSET)?)?;
        let inode_sig_bytes = &data[HEADER_INODE_SIG_OFFSET..];
        let inode_block_sig =
            Dinode::parse_from_bytes(inode_sig_bytes, InodeLayout::Signed, InodeNumber::SUPER_ROOT)?;

        Ok(Self {
            block_size,
            mode: read_le_u16(data, HEADER_MODE_OFFSET)?,
            seed: read_fixed::<SEED_SIZE>(data, HEADER_SEED_OFFSET)?,
            nblock: read_le_i64(data, HEADER_NBLOCK_OFFSET)? as u64,
            dinode_count: read_le_i64(data, HEADER_NDINODE_OFFSET)? as u64,
            ndblock: read_le_i64(data, HEADER_NDBLOCK_OFFSET)? as u64,
            dinode_block_count: read_le_i64(data, HEADER_NDINODEBLOCK_OFFSET)? as u64,
            superroot_ino: read_le_i64(data, HEADER_SUPERROOT_INO_OFFSET)? as u64,
            inode_block_sig,
        })
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.mode & pfs_types::PFS_MODE_SIGNED != 0
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.mode & pfs_types::PFS_MODE_ENCRYPTED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::{PFS_MODE_ENCRYPTED, PFS_MODE_SIGNED, PFS_MODE_UNK_ALWAYS_SET};

    fn sample() -> Header {
        let mut hdr = Header::new(
            BlockSize::STANDARD,
            PFS_MODE_UNK_ALWAYS_SET | PFS_MODE_SIGNED,
            [9_u8; 16],
        );
        hdr.nblock = 8;
        hdr.ndblock = 8;
        hdr.dinode_count = 4;
        hdr.dinode_block_count = 1;
        hdr.inode_block_sig.set_pointer(0, 1);
        hdr
    }

    #[test]
    fn round_trip() {
        let hdr = sample();
        let mut buf = vec![0_u8; 65536];
        hdr.write_into(&mut buf);

        let parsed = Header::parse_from_bytes(&buf).unwrap();
        assert_eq!(parsed.block_size, hdr.block_size);
        assert_eq!(parsed.mode, hdr.mode);
        assert_eq!(parsed.seed, hdr.seed);
        assert_eq!(parsed.nblock, 8);
        assert_eq!(parsed.ndblock, 8);
        assert_eq!(parsed.dinode_count, 4);
        assert_eq!(parsed.dinode_block_count, 1);
        assert_eq!(parsed.superroot_ino, 0);
        assert_eq!(parsed.inode_block_sig.pointer(0), 1);
    }

    #[test]
    fn identity_fields_are_fixed() {
        let hdr = sample();
        let mut buf = vec![0_u8; 65536];
        hdr.write_into(&mut buf);

        assert_eq!(read_le_i64(&buf, 0x00).unwrap(), 1);
        assert_eq!(read_le_i64(&buf, 0x08).unwrap(), 20_130_315);
    }

    #[test]
    fn descriptor_sig_records_start_at_0xb8() {
        // The descriptor sits at 0x54, its pointer area 0x64 further in.
        assert_eq!(HEADER_INODE_SIG_OFFSET + 0x64, 0xB8);

        let mut hdr = sample();
        hdr.inode_block_sig.set_pointer(0, 1);
        let mut buf = vec![0_u8; 65536];
        hdr.write_into(&mut buf);
        // Block pointer follows the 32-byte signature hole.
        assert_eq!(pfs_types::read_le_i32(&buf, 0xB8 + 32).unwrap(), 1);
    }

    #[test]
    fn mode_queries() {
        let hdr = sample();
        assert!(hdr.is_signed());
        assert!(!hdr.is_encrypted());

        let enc = Header::new(
            BlockSize::STANDARD,
            PFS_MODE_UNK_ALWAYS_SET | PFS_MODE_ENCRYPTED,
            [0_u8; 16],
        );
        assert!(enc.is_encrypted());
        assert!(!enc.is_signed());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0_u8; 65536];
        assert!(matches!(
            Header::parse_from_bytes(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }
}
