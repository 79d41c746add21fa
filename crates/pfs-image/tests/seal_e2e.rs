#![forbid(unsafe_code)]
//! End-to-end verification of the signed ("outer") profile: every queue
//! entry's HMAC is recomputable from the finished image, encryption covers
//! exactly the sectors it should, and decrypting restores the signed
//! plaintext.

use pfs_crypto::{XTS_SECTOR_SIZE, XtsCipher, derive_sign_key, hmac_sha256};
use pfs_image::{ImageProps, MemImageSink, build_image, layout, setup};
use pfs_ondisk::{Dinode, Header, InodeLayout};
use pfs_tree::{BytesContents, Contents, FsTree};
use pfs_types::{InodeNumber, read_le_u32};

const BS: usize = 65536;
const EKPFS: [u8; 32] = [
    0x4A, 0x12, 0x9F, 0x30, 0x88, 0x21, 0xC6, 0x55, 0x0E, 0x03, 0x77, 0xAB, 0x19, 0xDE, 0x60,
    0x92, 0x5C, 0x44, 0xF1, 0x08, 0x3D, 0xB2, 0xEA, 0x71, 0x26, 0x9B, 0x50, 0xC7, 0x18, 0x84,
    0x33, 0xFF,
];

fn file(data: &[u8]) -> Box<dyn Contents> {
    Box::new(BytesContents(data.to_vec()))
}

fn small_tree() -> FsTree {
    let mut tree = FsTree::new();
    tree.add_file(tree.root(), "a", 10, file(b"0123456789"))
        .unwrap();
    tree
}

fn build(props: &ImageProps, mut tree: FsTree) -> Vec<u8> {
    let mut sink = MemImageSink::new();
    build_image(props, &mut tree, &mut sink).expect("build");
    sink.into_inner()
}

fn signed_props() -> ImageProps {
    let mut props = ImageProps::outer(EKPFS, [0; 16]);
    props.encrypt = false;
    props
}

#[test]
fn every_signature_in_the_queue_verifies() {
    let props = signed_props();
    let tree = small_tree();
    let planned = layout::plan(&props, setup::prepare(&props, &tree).unwrap()).unwrap();
    let image = build(&props, small_tree());

    let key = derive_sign_key(&EKPFS, &props.seed);
    assert!(!planned.sig_queue.is_empty());

    let image_len = image.len() as u64;
    for entry in &planned.sig_queue {
        assert!(u64::from(entry.block) * (BS as u64) < image_len);
        assert!(entry.sig_offset + 36 <= image_len, "entry {entry:?}");

        let sig_offset = entry.sig_offset as usize;
        let stored_tag = &image[sig_offset..sig_offset + 32];
        let stored_index = read_le_u32(&image, sig_offset + 32).unwrap();
        assert_eq!(stored_index, entry.block, "block index after the tag");

        let expected = if entry.block == 0 {
            // The header's own signature slot was zero while its HMAC was
            // computed.
            let mut region = image[..entry.span as usize].to_vec();
            region[sig_offset..sig_offset + 32].fill(0);
            hmac_sha256(&key, &region)
        } else {
            let start = entry.block as usize * BS;
            hmac_sha256(&key, &image[start..start + entry.span as usize])
        };
        assert_eq!(stored_tag, &expected[..], "signature of block {}", entry.block);
    }
}

#[test]
fn signed_header_and_inode_table_reflect_the_profile() {
    let image = build(&signed_props(), small_tree());
    let header = Header::parse_from_bytes(&image).expect("header");

    assert!(header.is_signed());
    assert!(!header.is_encrypted());
    assert_eq!(header.dinode_count, 4);
    assert_eq!(header.dinode_block_count, 1);
    // The descriptor's first pointer addresses inode-table block 1, and
    // the signer stamped the matching block index after the tag at 0xB8.
    assert_eq!(header.inode_block_sig.pointer(0), 1);
    assert_eq!(read_le_u32(&image, 0xB8 + 32).unwrap(), 1);

    // Signed encoding: 0x2C8 bytes per inode.
    let file_ino =
        Dinode::parse_from_bytes(&image[BS + 3 * 0x2C8..], InodeLayout::Signed, InodeNumber(3))
            .expect("inode");
    assert_eq!(file_ino.size, 10);
    assert_eq!(file_ino.blocks, 1);
}

#[test]
fn thirteen_block_file_signs_through_the_indirect_block() {
    let size = 13 * BS;
    let mut tree = FsTree::new();
    tree.add_file(tree.root(), "big", size as u64, file(&vec![0x11_u8; size]))
        .unwrap();
    let props = signed_props();
    let planned = layout::plan(&props, setup::prepare(&props, &tree).unwrap()).unwrap();

    let mut tree2 = FsTree::new();
    tree2
        .add_file(tree2.root(), "big", size as u64, file(&vec![0x11_u8; size]))
        .unwrap();
    let image = build(&props, tree2);

    let file_ino =
        Dinode::parse_from_bytes(&image[BS + 3 * 0x2C8..], InodeLayout::Signed, InodeNumber(3))
            .expect("inode");
    assert_eq!(file_ino.blocks, 13);

    // Slot 12 points at the reserved indirect block.
    let indirect = file_ino.pointer(12) as usize;
    assert_eq!(indirect, planned.empty_block as usize + 1);

    // The 13th data block's signature record is the indirect block's
    // first entry: a verifiable tag followed by the data block number.
    let key = derive_sign_key(&EKPFS, &props.seed);
    let data_block = read_le_u32(&image, indirect * BS + 32).unwrap() as usize;
    assert_eq!(data_block, file_ino.start_block() as usize + 12);
    let expected = hmac_sha256(&key, &image[data_block * BS..(data_block + 1) * BS]);
    assert_eq!(&image[indirect * BS..indirect * BS + 32], &expected[..]);

    // The indirect block itself is signed into inode slot 12.
    let slot12_offset = BS + 3 * 0x2C8 + 0x64 + 36 * 12;
    let expected_indirect = hmac_sha256(&key, &image[indirect * BS..(indirect + 1) * BS]);
    assert_eq!(&image[slot12_offset..slot12_offset + 32], &expected_indirect[..]);
}

#[test]
fn encryption_covers_everything_but_header_and_empty_block() {
    let signed_only = build(&signed_props(), small_tree());

    let props = ImageProps::outer(EKPFS, [0; 16]);
    let sealed = build(&props, small_tree());
    assert_eq!(signed_only.len(), sealed.len());

    let planned = layout::plan(&props, setup::prepare(&props, &small_tree()).unwrap()).unwrap();
    let empty = planned.empty_block as usize;

    // Sectors 0..16 (the header block) are untouched plaintext.
    assert_eq!(&sealed[..BS], &signed_only[..BS]);
    // The reserved empty block stays plaintext zeros.
    assert_eq!(&sealed[empty * BS..(empty + 1) * BS], &signed_only[empty * BS..(empty + 1) * BS]);
    assert!(sealed[empty * BS..(empty + 1) * BS].iter().all(|b| *b == 0));

    // Every other block differs from its plaintext.
    let total_blocks = sealed.len() / BS;
    for block in 1..total_blocks {
        if block == empty {
            continue;
        }
        assert_ne!(
            &sealed[block * BS..(block + 1) * BS],
            &signed_only[block * BS..(block + 1) * BS],
            "block {block} should be ciphertext"
        );
    }

    // Decrypting with the derived keys restores the signed image exactly.
    let cipher = XtsCipher::for_image(&EKPFS, &props.seed);
    let sectors_per_block = BS / XTS_SECTOR_SIZE;
    let mut restored = sealed.clone();
    let total_sectors = restored.len() / XTS_SECTOR_SIZE;
    let mut sector = sectors_per_block;
    while sector < total_sectors {
        if sector / sectors_per_block == empty {
            sector += sectors_per_block;
            continue;
        }
        let range = sector * XTS_SECTOR_SIZE..(sector + 1) * XTS_SECTOR_SIZE;
        cipher.decrypt_sector(sector as u64, &mut restored[range]);
        sector += 1;
    }
    assert_eq!(restored, signed_only);
}

#[test]
fn sealed_builds_are_reproducible() {
    let props = ImageProps::outer(EKPFS, [3; 16]);
    let a = build(&props, small_tree());
    let b = build(&props, small_tree());
    assert_eq!(a, b);
}
