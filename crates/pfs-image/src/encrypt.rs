#![forbid(unsafe_code)]
//! Encryption pass.
//!
//! Overwrites every non-reserved XTS sector with its ciphertext, in place.
//! Sectors are 4096 bytes regardless of the PFS block size; the tweak is
//! the absolute sector index. The header block and the reserved empty
//! block after the flat path table stay plaintext.

use crate::layout::Layout;
use crate::sink::ImageSink;
use pfs_crypto::{XTS_SECTOR_SIZE, XtsCipher};
use pfs_error::Result;
use pfs_types::{ByteOffset, EKPFS_SIZE, ceil_div};
use tracing::info;

pub fn encrypt_image<S: ImageSink>(
    layout: &Layout,
    ekpfs: &[u8; EKPFS_SIZE],
    sink: &mut S,
) -> Result<()> {
    let cipher = XtsCipher::for_image(ekpfs, &layout.header.seed);
    let sectors_per_block = layout.header.block_size.as_u64() / XTS_SECTOR_SIZE as u64;
    let total_sectors = ceil_div(sink.len(), XTS_SECTOR_SIZE as u64);

    info!(
        event = "phase",
        name = "encrypting sectors",
        total_sectors,
        empty_block = layout.empty_block
    );

    let mut buf = vec![0_u8; XTS_SECTOR_SIZE];
    // Sector 0..sectors_per_block cover the header block and are never
    // encrypted.
    let mut sector = sectors_per_block;
    while sector < total_sectors {
        // The reserved block of zeroes after the flat path table is left
        // plaintext on shipped images.
        if sector / sectors_per_block == u64::from(layout.empty_block) {
            sector += sectors_per_block;
            continue;
        }
        let offset = ByteOffset(sector * XTS_SECTOR_SIZE as u64);
        sink.read_exact_at(offset, &mut buf)?;
        cipher.encrypt_sector(sector, &mut buf);
        sink.write_all_at(offset, &buf)?;
        sector += 1;
    }

    Ok(())
}
