#![forbid(unsafe_code)]
//! Signature pass.
//!
//! Replays the planner's signing queue in LIFO order over the written
//! image: data blocks first, then the indirect and inode blocks that hold
//! their signatures, and the header region last.

use crate::layout::Layout;
use crate::sink::ImageSink;
use pfs_crypto::SigningKey;
use pfs_error::Result;
use pfs_types::{ByteOffset, EKPFS_SIZE, SIG_SIZE};
use tracing::info;

pub fn sign_image<S: ImageSink>(
    layout: &Layout,
    ekpfs: &[u8; EKPFS_SIZE],
    sink: &mut S,
) -> Result<()> {
    let key = SigningKey::new(ekpfs, &layout.header.seed);
    let bs = layout.header.block_size.as_u64();

    info!(
        event = "phase",
        name = "signing blocks",
        entries = layout.sig_queue.len()
    );

    // Pop order: the reverse of push order. A container block (indirect
    // block, inode block, header) was pushed before the entries whose
    // signatures it stores, so it is signed after them.
    for item in layout.sig_queue.iter().rev() {
        let mut data = vec![0_u8; item.span as usize];
        sink.read_exact_at(ByteOffset(u64::from(item.block) * bs), &mut data)?;
        let tag = key.sign(&data);
        sink.write_all_at(ByteOffset(item.sig_offset), &tag)?;
        sink.write_all_at(
            ByteOffset(item.sig_offset + SIG_SIZE as u64),
            &item.block.to_le_bytes(),
        )?;
    }

    Ok(())
}
