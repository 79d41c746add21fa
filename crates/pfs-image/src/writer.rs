#![forbid(unsafe_code)]
//! Image emission.
//!
//! Walks a planned layout and writes the header, inode table, dirent
//! blocks, and file payloads to the sink in block order, then sets the
//! final length. Signature and encryption passes run afterwards.

use crate::layout::{Layout, pack_dirents};
use crate::sink::ImageSink;
use pfs_error::{PfsError, Result};
use pfs_ondisk::Dirent;
use pfs_tree::{FsTree, NodeKind};
use pfs_types::ByteOffset;
use std::io::{self, Write};
use tracing::{debug, info};

/// `io::Write` adapter that appends to the sink from a fixed position.
struct SinkCursor<'a, S: ImageSink> {
    sink: &'a mut S,
    pos: u64,
    written: u64,
    error: Option<PfsError>,
}

impl<'a, S: ImageSink> SinkCursor<'a, S> {
    fn new(sink: &'a mut S, pos: u64) -> Self {
        Self {
            sink,
            pos,
            written: 0,
            error: None,
        }
    }

    fn finish(self) -> Result<u64> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.written),
        }
    }
}

impl<S: ImageSink> Write for SinkCursor<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Err(err) = self.sink.write_all_at(ByteOffset(self.pos), buf) {
            let msg = err.to_string();
            self.error = Some(err);
            return Err(io::Error::other(msg));
        }
        self.pos += buf.len() as u64;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_image<S: ImageSink>(layout: &Layout, tree: &mut FsTree, sink: &mut S) -> Result<()> {
    let block_size = layout.header.block_size;
    let bs = block_size.as_u64();

    // Phase 1: header block.
    info!(event = "phase", name = "writing header");
    let mut block0 = vec![0_u8; block_size.as_usize()];
    layout.header.write_into(&mut block0);
    sink.write_all_at(ByteOffset(0), &block0)?;

    // Phase 2: the inode table. An inode never straddles a block
    // boundary; the remainder of a block too small for another encoding
    // is skipped.
    info!(event = "phase", name = "writing inodes");
    let inode_size = layout
        .setup
        .inodes
        .first()
        .map_or(0, |ino| ino.layout.size_of() as u64);
    let mut pos = bs;
    for ino in &layout.setup.inodes {
        sink.write_all_at(ByteOffset(pos), &ino.to_bytes())?;
        pos += inode_size;
        let within = pos % bs;
        if within != 0 && bs - within < inode_size {
            pos += bs - within;
        }
    }

    // Phase 3: super-root dirents, directly after the inode table.
    info!(event = "phase", name = "writing super-root dirents");
    let super_root_offset = (1 + layout.header.dinode_block_count) * bs;
    write_dirents(
        sink,
        super_root_offset,
        &layout.setup.super_root_dirents,
        bs,
    )?;

    // Phases 4 and 5: the flat path table streams like a file at the head
    // of the node list, then every node's payload in layout order.
    info!(event = "phase", name = "writing flat path table");
    let fpt_ino = &layout.setup.inodes[pfs_types::InodeNumber::FLAT_PATH_TABLE.as_usize()];
    let fpt_start = u64::try_from(fpt_ino.start_block())
        .map_err(|_| PfsError::Format("flat path table start block is unset".to_owned()))?;
    sink.write_all_at(ByteOffset(fpt_start * bs), &layout.setup.fpt_bytes)?;

    info!(event = "phase", name = "writing dirents and file data");
    for planned in &layout.setup.nodes {
        let start = u64::from(planned.start_block) * bs;
        if planned.is_dir {
            write_dirents(sink, start, &planned.dirents, bs)?;
            continue;
        }

        let node = tree.node_mut(planned.node);
        let NodeKind::File { contents, .. } = &mut node.kind else {
            return Err(PfsError::InvalidTree(format!(
                "planned file {:?} is not a file node",
                node.name
            )));
        };
        let mut cursor = SinkCursor::new(sink, start);
        let stream_result = contents.stream_to(&mut cursor);
        let written = match cursor.finish() {
            Ok(written) => {
                stream_result?;
                written
            }
            // Sink-side failures surface with their original error; the
            // io::Error returned to the producer is a copy.
            Err(err) => return Err(err),
        };
        if written != planned.content_size {
            return Err(PfsError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "producer for inode {} wrote {written} bytes, declared {}",
                    planned.ino, planned.content_size
                ),
            )));
        }
        debug!(event = "file_written", ino = planned.ino.0, bytes = written);
    }

    // Phase 6: pad (or trim) to the planned image length.
    info!(event = "phase", name = "finalizing image length");
    sink.set_len(layout.ndblock * bs)?;

    Ok(())
}

fn write_dirents<S: ImageSink>(
    sink: &mut S,
    start: u64,
    dirents: &[Dirent],
    block_size: u64,
) -> Result<()> {
    for (offset, bytes) in pack_dirents(dirents, block_size) {
        sink.write_all_at(ByteOffset(start + offset), &bytes)?;
    }
    Ok(())
}
