#![forbid(unsafe_code)]
//! On-disk record serialization for PFS images.
//!
//! Pure encoding crate — no I/O, no side effects. Serializes the image
//! header, the two inode encodings, directory entries, and the flat path
//! table into byte buffers, and parses them back for validation.

pub mod dirent;
pub mod fpt;
pub mod header;
pub mod inode;

pub use dirent::{Dirent, DirentKind};
pub use fpt::{FlatPathTable, FptEntry};
pub use header::Header;
pub use inode::{Dinode, InodeLayout, signed_slot_image_offset};
