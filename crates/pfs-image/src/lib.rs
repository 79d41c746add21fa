#![forbid(unsafe_code)]
//! PFS image builder.
//!
//! Synthesizes a byte-exact PFS disk image from an in-memory filesystem
//! tree: a single planning pass resolves every block assignment and inode
//! pointer, then the writer emits the image, the signer replays the
//! signing queue, and the encryptor transforms the remaining sectors.
//!
//! ```no_run
//! use pfs_image::{ImageProps, build_image, sink::FileImageSink};
//! use pfs_tree::{BytesContents, FsTree};
//!
//! # fn main() -> pfs_error::Result<()> {
//! let mut tree = FsTree::new();
//! tree.add_file(
//!     tree.root(),
//!     "hello.txt",
//!     5,
//!     Box::new(BytesContents(b"hello".to_vec())),
//! )?;
//!
//! let props = ImageProps::inner();
//! let mut sink = FileImageSink::create("image.pfs")?;
//! let summary = build_image(&props, &mut tree, &mut sink)?;
//! println!("wrote {} blocks", summary.ndblock);
//! # Ok(())
//! # }
//! ```

pub mod encrypt;
pub mod layout;
pub mod setup;
pub mod sign;
pub mod sink;
pub mod writer;

pub use layout::{BlockSigInfo, Layout};
pub use sink::{FileImageSink, ImageSink, MemImageSink};

use pfs_error::{PfsError, Result};
use pfs_ondisk::InodeLayout;
use pfs_tree::FsTree;
use pfs_types::{
    BlockSize, EKPFS_SIZE, PFS_MODE_ENCRYPTED, PFS_MODE_SIGNED, PFS_MODE_UNK_ALWAYS_SET,
    SEED_SIZE,
};
use serde::Serialize;
use tracing::info;

/// Build configuration for one image.
#[derive(Debug, Clone)]
pub struct ImageProps {
    pub block_size: BlockSize,
    pub sign: bool,
    pub encrypt: bool,
    /// Required whenever `sign` or `encrypt` is set.
    pub ekpfs: Option<[u8; EKPFS_SIZE]>,
    /// Zero-filled is acceptable for fake-signed images.
    pub seed: [u8; SEED_SIZE],
    /// Seconds since the Unix epoch, applied to every inode.
    pub file_time: u64,
}

impl ImageProps {
    /// An inner image: unsigned, unencrypted, standard block size.
    #[must_use]
    pub fn inner() -> Self {
        Self {
            block_size: BlockSize::STANDARD,
            sign: false,
            encrypt: false,
            ekpfs: None,
            seed: [0; SEED_SIZE],
            file_time: 0,
        }
    }

    /// An outer image: signed and encrypted under `ekpfs`.
    #[must_use]
    pub fn outer(ekpfs: [u8; EKPFS_SIZE], seed: [u8; SEED_SIZE]) -> Self {
        Self {
            block_size: BlockSize::STANDARD,
            sign: true,
            encrypt: true,
            ekpfs: Some(ekpfs),
            seed,
            file_time: 0,
        }
    }

    /// The inode encoding this configuration selects.
    #[must_use]
    pub fn inode_layout(&self) -> InodeLayout {
        if self.sign {
            InodeLayout::Signed
        } else {
            InodeLayout::Plain
        }
    }

    /// Header mode word.
    #[must_use]
    pub fn mode(&self) -> u16 {
        let mut mode = PFS_MODE_UNK_ALWAYS_SET;
        if self.sign {
            mode |= PFS_MODE_SIGNED;
        }
        if self.encrypt {
            mode |= PFS_MODE_ENCRYPTED;
        }
        mode
    }

    fn validate(&self) -> Result<()> {
        if (self.sign || self.encrypt) && self.ekpfs.is_none() {
            return Err(PfsError::ConfigMismatch(
                "signing or encryption requested without an EKPFS".to_owned(),
            ));
        }
        Ok(())
    }
}

/// What a finished build looks like.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub image_len: u64,
    pub ndblock: u64,
    pub inode_count: u64,
    pub signed: bool,
    pub encrypted: bool,
    pub empty_block: u32,
}

/// Image length in bytes for this configuration and tree, without
/// writing anything.
pub fn calculate_size(props: &ImageProps, tree: &FsTree) -> Result<u64> {
    props.validate()?;
    let planned = layout::plan(props, setup::prepare(props, tree)?)?;
    Ok(planned.image_len(props))
}

/// Plan and write a complete image into `sink`.
pub fn build_image<S: ImageSink>(
    props: &ImageProps,
    tree: &mut FsTree,
    sink: &mut S,
) -> Result<BuildSummary> {
    props.validate()?;

    info!(
        event = "build_image",
        sign = props.sign,
        encrypt = props.encrypt,
        block_size = props.block_size.get()
    );

    let planned = layout::plan(props, setup::prepare(props, tree)?)?;
    writer::write_image(&planned, tree, sink)?;

    if props.sign {
        let ekpfs = props
            .ekpfs
            .as_ref()
            .ok_or_else(|| PfsError::ConfigMismatch("signing without an EKPFS".to_owned()))?;
        sign::sign_image(&planned, ekpfs, sink)?;
    }
    if props.encrypt {
        let ekpfs = props
            .ekpfs
            .as_ref()
            .ok_or_else(|| PfsError::ConfigMismatch("encryption without an EKPFS".to_owned()))?;
        encrypt::encrypt_image(&planned, ekpfs, sink)?;
    }

    let summary = BuildSummary {
        image_len: planned.image_len(props),
        ndblock: planned.ndblock,
        inode_count: planned.header.dinode_count,
        signed: props.sign,
        encrypted: props.encrypt,
        empty_block: planned.empty_block,
    };
    info!(
        event = "build_complete",
        image_len = summary.image_len,
        ndblock = summary.ndblock,
        inode_count = summary.inode_count
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_without_key_is_a_config_mismatch() {
        let mut props = ImageProps::inner();
        props.sign = true;
        let tree = FsTree::new();
        assert!(matches!(
            calculate_size(&props, &tree),
            Err(PfsError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn encrypt_without_key_is_a_config_mismatch() {
        let mut props = ImageProps::inner();
        props.encrypt = true;
        let tree = FsTree::new();
        assert!(matches!(
            calculate_size(&props, &tree),
            Err(PfsError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn mode_word_combines_flags() {
        assert_eq!(ImageProps::inner().mode(), PFS_MODE_UNK_ALWAYS_SET);
        let outer = ImageProps::outer([0; 32], [0; 16]);
        assert_eq!(
            outer.mode(),
            PFS_MODE_UNK_ALWAYS_SET | PFS_MODE_SIGNED | PFS_MODE_ENCRYPTED
        );
        assert_eq!(outer.inode_layout(), InodeLayout::Signed);
        assert_eq!(ImageProps::inner().inode_layout(), InodeLayout::Plain);
    }

    #[test]
    fn calculate_size_matches_the_planned_block_count() {
        let tree = FsTree::new();
        let size = calculate_size(&ImageProps::inner(), &tree).unwrap();
        assert_eq!(size, 6 * 65536);
    }
}
