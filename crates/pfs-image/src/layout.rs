#![forbid(unsafe_code)]
//! Block layout planning.
//!
//! Assigns a block number to every inode-table block, dirent block, file
//! payload block, and indirect block, fills every inode pointer slot, and
//! (for signed images) builds the signing queue. After planning, all sizes
//! and pointers are final and the writer can emit the image in one pass.

use crate::ImageProps;
use crate::setup::Setup;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{Dirent, Header, signed_slot_image_offset};
use pfs_types::{
    DIRECT_SLOTS, HEADER_SIG_OFFSET, HEADER_SIG_SPAN, InodeNumber, NO_BLOCK,
    SIG_ENTRY_SIZE, SLOT_DOUBLE_INDIRECT, SLOT_INDIRECT, block_to_i32, ceil_div,
};
use tracing::{debug, info};

/// One pending signature: HMAC the `span` bytes of `block` and store the
/// tag (plus the LE block number) at the absolute offset `sig_offset`.
///
/// Queue entries are pushed in layout order and consumed last-in first-out:
/// a block's signature may be stored inside a block that is itself signed
/// later (data signatures inside indirect and inode blocks, inode-block
/// signatures inside the header), so containers must be signed after their
/// contents are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSigInfo {
    pub block: u32,
    pub sig_offset: u64,
    pub span: u32,
}

/// A fully planned image, ready for the writer.
#[derive(Debug)]
pub struct Layout {
    pub header: Header,
    pub setup: Setup,
    pub sig_queue: Vec<BlockSigInfo>,
    /// Reserved zero block after the flat path table; the encryptor skips
    /// its sectors.
    pub empty_block: u32,
    pub ndblock: u64,
}

impl Layout {
    /// Final image length in bytes.
    #[must_use]
    pub fn image_len(&self, props: &ImageProps) -> u64 {
        self.ndblock * props.block_size.as_u64()
    }
}

/// Indirect blocks needed for a payload of `size` bytes.
///
/// One first-level indirect block covers data blocks 12..12+entries; past
/// that a double-indirect block plus one second-level block per further
/// `entries` data blocks.
fn indirect_blocks(props: &ImageProps, size: u64) -> u64 {
    let entries = props.block_size.sig_entries_per_block();
    let blocks = props.block_size.blocks_for(size);
    if blocks <= DIRECT_SLOTS as u64 {
        return 0;
    }
    if blocks <= DIRECT_SLOTS as u64 + entries {
        return 1;
    }
    2 + ceil_div(blocks - DIRECT_SLOTS as u64 - entries, entries)
}

/// Hard ceiling of the supported pointer structure.
fn max_representable_blocks(props: &ImageProps) -> u64 {
    let entries = props.block_size.sig_entries_per_block();
    DIRECT_SLOTS as u64 + entries + entries * entries
}

pub fn plan(props: &ImageProps, mut setup: Setup) -> Result<Layout> {
    let block_size = props.block_size;
    let inode_size = props.inode_layout().size_of() as u64;
    let inodes_per_block = block_size.as_u64() / inode_size;
    let inode_count = setup.inode_count();
    let dinode_block_count = ceil_div(inode_count, inodes_per_block);
    if dinode_block_count > DIRECT_SLOTS as u64 {
        return Err(PfsError::LayoutOverflow(format!(
            "{inode_count} inodes need {dinode_block_count} table blocks; at most {DIRECT_SLOTS} are addressable"
        )));
    }

    let mut header = Header::new(block_size, props.mode(), props.seed);
    header.dinode_count = inode_count;
    header.dinode_block_count = dinode_block_count;
    header.inode_block_sig.blocks = dinode_block_count as u32;
    header.inode_block_sig.size = dinode_block_count * block_size.as_u64();
    header.inode_block_sig.time_sec = props.file_time;

    info!(
        event = "plan_layout",
        signed = props.sign,
        inode_count,
        dinode_block_count
    );

    let layout = if props.sign {
        plan_signed(props, &mut setup, &mut header, dinode_block_count)?
    } else {
        plan_plain(props, &mut setup, &mut header, dinode_block_count)?
    };

    debug!(
        event = "plan_complete",
        ndblock = layout.0,
        empty_block = layout.1,
        sig_entries = layout.2.len()
    );

    let (ndblock, empty_block, sig_queue) = layout;
    header.ndblock = ndblock;
    header.nblock = ndblock;

    Ok(Layout {
        header,
        setup,
        sig_queue,
        empty_block,
        ndblock,
    })
}

type PlanResult = (u64, u32, Vec<BlockSigInfo>);

fn plan_signed(
    props: &ImageProps,
    setup: &mut Setup,
    header: &mut Header,
    dinode_block_count: u64,
) -> Result<PlanResult> {
    let block_size = props.block_size;
    let bs = block_size.as_u64();
    let entries_per_block = block_size.sig_entries_per_block();
    let mut sig_queue: Vec<BlockSigInfo> = Vec::new();
    let full_span = u32::try_from(bs)
        .map_err(|_| PfsError::Format("block size does not fit u32".to_owned()))?;
    let push = |queue: &mut Vec<BlockSigInfo>, block: u64, sig_offset: u64| -> Result<()> {
        queue.push(BlockSigInfo {
            block: block_to_i32(block, "sig_block")? as u32,
            sig_offset,
            span: full_span,
        });
        Ok(())
    };

    // The header region is pushed first, so it pops last — after the
    // inode-block signatures inside it are final.
    sig_queue.push(BlockSigInfo {
        block: 0,
        sig_offset: HEADER_SIG_OFFSET as u64,
        span: HEADER_SIG_SPAN as u32,
    });

    let mut ndblock: u64 = 1 + dinode_block_count;
    for i in 0..dinode_block_count {
        let block = 1 + i;
        header
            .inode_block_sig
            .set_pointer(i as usize, block_to_i32(block, "inode_table_block")?);
        push(
            &mut sig_queue,
            block,
            (0xB8 + SIG_ENTRY_SIZE * i as usize) as u64,
        )?;
    }

    // Super-root dirent block.
    let super_root = InodeNumber::SUPER_ROOT;
    setup.inodes[super_root.as_usize()].set_pointer(0, block_to_i32(ndblock, "super_root")?);
    push(
        &mut sig_queue,
        ndblock,
        signed_slot_image_offset(block_size, super_root, 0),
    )?;
    ndblock += 1;

    // Flat path table blocks, direct slots only.
    let fpt = InodeNumber::FLAT_PATH_TABLE;
    let fpt_blocks = u64::from(setup.inodes[fpt.as_usize()].blocks);
    if fpt_blocks > DIRECT_SLOTS as u64 {
        return Err(PfsError::LayoutOverflow(format!(
            "flat path table needs {fpt_blocks} blocks; only {DIRECT_SLOTS} direct slots are used"
        )));
    }
    for i in 0..fpt_blocks.max(1) {
        setup.inodes[fpt.as_usize()].set_pointer(i as usize, block_to_i32(ndblock, "fpt_block")?);
        push(
            &mut sig_queue,
            ndblock,
            signed_slot_image_offset(block_size, fpt, i as usize),
        )?;
        ndblock += 1;
    }

    // One unused block after the FPT, then the reserved zero block the
    // encryptor must leave alone.
    ndblock += 1;
    let empty_block = block_to_i32(ndblock, "empty_block")? as u32;
    ndblock += 1;

    // Reserve the whole indirect-block region ahead of any data.
    let mut ib_start = ndblock;
    for planned in &setup.nodes {
        ndblock += indirect_blocks(props, planned.content_size);
    }

    // Data blocks, node by node.
    for planned in &mut setup.nodes {
        let ino = &mut setup.inodes[planned.ino.as_usize()];
        let blocks = block_size.blocks_for(planned.content_size);
        if blocks > max_representable_blocks(props) {
            return Err(PfsError::LayoutOverflow(format!(
                "inode {} needs {blocks} blocks, more than the pointer structure can address",
                planned.ino
            )));
        }
        ino.blocks = u32::try_from(blocks)
            .map_err(|_| PfsError::LayoutOverflow("block count exceeds u32".to_owned()))?;
        ino.size = if planned.is_dir {
            block_size.round_up(planned.content_size)
        } else {
            planned.content_size
        };
        if ino.size_compressed != 0 {
            ino.size_compressed = ino.size;
        }
        planned.start_block = block_to_i32(ndblock, "start_block")? as u32;

        for i in 0..blocks.min(DIRECT_SLOTS as u64) {
            ino.set_pointer(i as usize, block_to_i32(ndblock, "data_block")?);
            push(
                &mut sig_queue,
                ndblock,
                signed_slot_image_offset(block_size, planned.ino, i as usize),
            )?;
            ndblock += 1;
        }

        if blocks > DIRECT_SLOTS as u64 {
            // First-level indirect block: holds the signature records of
            // data blocks 12.. and is itself signed into slot 12.
            ino.set_pointer(SLOT_INDIRECT, block_to_i32(ib_start, "indirect_block")?);
            push(
                &mut sig_queue,
                ib_start,
                signed_slot_image_offset(block_size, planned.ino, SLOT_INDIRECT),
            )?;
            let first_level_top = blocks.min(DIRECT_SLOTS as u64 + entries_per_block);
            for i in DIRECT_SLOTS as u64..first_level_top {
                push(
                    &mut sig_queue,
                    ndblock,
                    ib_start * bs + SIG_ENTRY_SIZE as u64 * (i - DIRECT_SLOTS as u64),
                )?;
                ndblock += 1;
            }
            ib_start += 1;

            if blocks > DIRECT_SLOTS as u64 + entries_per_block {
                let double = ib_start;
                ino.set_pointer(
                    SLOT_DOUBLE_INDIRECT,
                    block_to_i32(double, "double_indirect_block")?,
                );
                push(
                    &mut sig_queue,
                    double,
                    signed_slot_image_offset(block_size, planned.ino, SLOT_DOUBLE_INDIRECT),
                )?;
                ib_start += 1;

                let mut covered = DIRECT_SLOTS as u64 + entries_per_block;
                let mut second_index = 0_u64;
                while covered < blocks {
                    let second = ib_start;
                    push(
                        &mut sig_queue,
                        second,
                        double * bs + SIG_ENTRY_SIZE as u64 * second_index,
                    )?;
                    let take = entries_per_block.min(blocks - covered);
                    for k in 0..take {
                        push(&mut sig_queue, ndblock, second * bs + SIG_ENTRY_SIZE as u64 * k)?;
                        ndblock += 1;
                    }
                    covered += take;
                    ib_start += 1;
                    second_index += 1;
                }
            }
        }
    }

    Ok((ndblock, empty_block, sig_queue))
}

fn plan_plain(
    props: &ImageProps,
    setup: &mut Setup,
    header: &mut Header,
    dinode_block_count: u64,
) -> Result<PlanResult> {
    let block_size = props.block_size;

    // The descriptor's first pointer names the table start; the rest are
    // stamped with the sentinel, as are all non-initial data slots below.
    header.inode_block_sig.set_pointer(0, 1);
    for i in 1..dinode_block_count.min(DIRECT_SLOTS as u64) {
        header.inode_block_sig.set_pointer(i as usize, NO_BLOCK);
    }

    let mut ndblock: u64 = 1 + dinode_block_count;

    let super_root = InodeNumber::SUPER_ROOT;
    setup.inodes[super_root.as_usize()].set_pointer(0, block_to_i32(ndblock, "super_root")?);
    ndblock += 1;

    let fpt = InodeNumber::FLAT_PATH_TABLE;
    let fpt_blocks = u64::from(setup.inodes[fpt.as_usize()].blocks);
    setup.inodes[fpt.as_usize()].set_pointer(0, block_to_i32(ndblock, "fpt_block")?);
    for i in 1..fpt_blocks.min(DIRECT_SLOTS as u64) {
        setup.inodes[fpt.as_usize()].set_pointer(i as usize, NO_BLOCK);
    }
    ndblock += fpt_blocks.max(1);

    // The reserved zero block after the FPT exists in this profile too.
    let empty_block = block_to_i32(ndblock, "empty_block")? as u32;
    ndblock += 1;

    // Data is contiguous; only the start block is recorded.
    for planned in &mut setup.nodes {
        let ino = &mut setup.inodes[planned.ino.as_usize()];
        let blocks = block_size.blocks_for(planned.content_size);
        ino.blocks = u32::try_from(blocks)
            .map_err(|_| PfsError::LayoutOverflow("block count exceeds u32".to_owned()))?;
        ino.size = if planned.is_dir {
            block_size.round_up(planned.content_size)
        } else {
            planned.content_size
        };
        if ino.size_compressed != 0 {
            ino.size_compressed = ino.size;
        }
        ino.set_pointer(0, block_to_i32(ndblock, "start_block")?);
        for i in 1..blocks.min(DIRECT_SLOTS as u64) {
            ino.set_pointer(i as usize, NO_BLOCK);
        }
        planned.start_block = block_to_i32(ndblock, "start_block")? as u32;
        ndblock += blocks;
    }

    Ok((ndblock, empty_block, Vec::new()))
}

/// Pack dirents into blocks: a dirent never straddles a block boundary.
///
/// Returns `(offset_within_stream, bytes)` pairs relative to the start of
/// the directory's block run.
pub fn pack_dirents(dirents: &[Dirent], block_size: u64) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::with_capacity(dirents.len());
    let mut offset = 0_u64;
    let mut remaining = block_size;
    for dirent in dirents {
        let size = dirent.ent_size() as u64;
        if size > remaining {
            offset += remaining;
            remaining = block_size;
        }
        out.push((offset, dirent.to_bytes()));
        offset += size;
        remaining -= size;
    }
    out
}
