#![forbid(unsafe_code)]
//! Root structure setup and inode allocation.
//!
//! Builds the super-root / flat-path-table / uroot trio, allocates inodes
//! for every directory (pre-order) and file (path-sorted), constructs all
//! dirent lists, and serializes the flat path table so the planner knows
//! its size before block layout.

use crate::ImageProps;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{Dinode, Dirent, DirentKind, FlatPathTable};
use pfs_tree::{FsTree, NodeId};
use pfs_types::{
    INODE_FLAG_COMPRESSED, INODE_FLAG_INTERNAL, INODE_FLAG_READONLY, INODE_FLAG_UNK1,
    INODE_FLAG_UNK2, InodeNumber, MODE_DIR, MODE_FILE, PERM_RX,
};
use std::collections::HashMap;
use tracing::debug;

/// A tree node with its allocated inode and (for directories) dirent list.
#[derive(Debug)]
pub struct PlannedNode {
    pub node: NodeId,
    pub ino: InodeNumber,
    pub is_dir: bool,
    /// `.`, `..`, then children in allocation order. Empty for files.
    pub dirents: Vec<Dirent>,
    /// Bytes the node contributes to the data area: dirent bytes for
    /// directories, the exact payload length for files.
    pub content_size: u64,
    /// First data block; filled by the layout planner.
    pub start_block: u32,
}

/// Everything the layout planner needs, produced in one pass over the tree.
#[derive(Debug)]
pub struct Setup {
    /// Indexed by inode number: super-root, FPT, uroot, directories, files.
    pub inodes: Vec<Dinode>,
    /// uroot first, then directories in pre-order, then files in path order.
    pub nodes: Vec<PlannedNode>,
    pub super_root_dirents: Vec<Dirent>,
    pub fpt_bytes: Vec<u8>,
}

impl Setup {
    #[must_use]
    pub fn inode_count(&self) -> u64 {
        self.inodes.len() as u64
    }
}

/// Flag policy shared by the internal trio and file inodes: readonly on
/// unsigned images; on signed images readonly is dropped and two flag bits
/// of unknown meaning are always set.
fn base_flags(props: &ImageProps, internal: bool) -> u32 {
    let mut flags = if internal { INODE_FLAG_INTERNAL } else { 0 };
    if props.sign {
        flags |= INODE_FLAG_UNK1 | INODE_FLAG_UNK2;
    } else {
        flags |= INODE_FLAG_READONLY;
    }
    flags
}

pub fn prepare(props: &ImageProps, tree: &FsTree) -> Result<Setup> {
    tree.validate()?;

    let layout = props.inode_layout();
    let new_inode = |number: u32| {
        let mut ino = Dinode::new(layout, InodeNumber(number));
        ino.time_sec = props.file_time;
        ino
    };

    debug!(event = "setup_root_structure", sign = props.sign);

    // Super-root: the synthetic directory above the user root. Its two
    // children are the flat path table and uroot.
    let mut super_root = new_inode(0);
    super_root.mode = MODE_DIR | PERM_RX;
    super_root.nlink = 1;
    super_root.flags = base_flags(props, true);
    super_root.blocks = 1;
    super_root.size = props.block_size.as_u64();

    let mut fpt_ino = new_inode(1);
    fpt_ino.mode = MODE_FILE | PERM_RX;
    fpt_ino.nlink = 1;
    fpt_ino.flags = base_flags(props, true);

    let mut uroot_ino = new_inode(2);
    uroot_ino.mode = MODE_DIR | PERM_RX;
    uroot_ino.nlink = 3;
    uroot_ino.flags = base_flags(props, false);
    uroot_ino.blocks = 1;
    uroot_ino.size = props.block_size.as_u64();

    let super_root_dirents = vec![
        Dirent::new(InodeNumber::FLAT_PATH_TABLE, DirentKind::File, "flat_path_table")?,
        Dirent::new(InodeNumber::UROOT, DirentKind::Directory, "uroot")?,
    ];

    let mut inodes = vec![super_root, fpt_ino, uroot_ino];
    let mut nodes = Vec::new();
    let mut ino_of_node: HashMap<NodeId, InodeNumber> = HashMap::new();
    // Planned-node index of each directory, for dirent insertion.
    let mut dir_slot: HashMap<NodeId, usize> = HashMap::new();

    // The user root becomes uroot, seeded with its own `.` and `..`.
    let root = tree.root();
    ino_of_node.insert(root, InodeNumber::UROOT);
    dir_slot.insert(root, 0);
    nodes.push(PlannedNode {
        node: root,
        ino: InodeNumber::UROOT,
        is_dir: true,
        dirents: vec![
            Dirent::dot(InodeNumber::UROOT),
            Dirent::dot_dot(InodeNumber::UROOT),
        ],
        content_size: 0,
        start_block: 0,
    });

    // Directories, pre-order. Allocation order fixes inode numbers.
    for dir in tree.directories_preorder() {
        if dir == root {
            continue;
        }
        let number = InodeNumber(inodes.len() as u32);
        let parent = tree
            .node(dir)
            .parent
            .ok_or_else(|| PfsError::InvalidTree("directory without parent".to_owned()))?;
        let parent_ino = ino_of_node[&parent];

        let mut ino = new_inode(number.0);
        ino.mode = MODE_DIR | PERM_RX;
        ino.nlink = 2;
        // Plain directories keep readonly even on signed images.
        ino.flags = base_flags(props, false) | INODE_FLAG_READONLY;
        ino.blocks = 1;
        ino.size = props.block_size.as_u64();
        inodes.push(ino);
        ino_of_node.insert(dir, number);

        // Hook into the parent: one dirent, one link.
        let parent_slot = dir_slot[&parent];
        nodes[parent_slot].dirents.push(Dirent::new(
            number,
            DirentKind::Directory,
            tree.node(dir).name.clone(),
        )?);
        inodes[ino_of_node[&parent].as_usize()].nlink += 1;

        dir_slot.insert(dir, nodes.len());
        nodes.push(PlannedNode {
            node: dir,
            ino: number,
            is_dir: true,
            dirents: vec![Dirent::dot(number), Dirent::dot_dot(parent_ino)],
            content_size: 0,
            start_block: 0,
        });
    }

    // Files, sorted by absolute path.
    for (path, file) in tree.files_sorted_by_path() {
        let number = InodeNumber(inodes.len() as u32);
        let node = tree.node(file);
        let pfs_tree::NodeKind::File {
            size,
            compressed_size,
            compress,
            ..
        } = &node.kind
        else {
            continue;
        };

        let mut ino = new_inode(number.0);
        ino.mode = MODE_FILE | PERM_RX;
        ino.nlink = 1;
        ino.flags = base_flags(props, false);
        if *compress {
            ino.flags |= INODE_FLAG_COMPRESSED;
        }
        ino.size = *size;
        ino.size_compressed = *compressed_size;
        ino.blocks = u32::try_from(props.block_size.blocks_for(*size))
            .map_err(|_| PfsError::LayoutOverflow(format!("file {path} exceeds 2^32 blocks")))?;
        inodes.push(ino);
        ino_of_node.insert(file, number);

        let parent = node
            .parent
            .ok_or_else(|| PfsError::InvalidTree(format!("file {path} without parent")))?;
        let parent_slot = dir_slot[&parent];
        nodes[parent_slot]
            .dirents
            .push(Dirent::new(number, DirentKind::File, node.name.clone())?);

        nodes.push(PlannedNode {
            node: file,
            ino: number,
            is_dir: false,
            dirents: Vec::new(),
            content_size: *size,
            start_block: 0,
        });
    }

    // Directory payloads are their packed dirent bytes.
    for planned in &mut nodes {
        if planned.is_dir {
            planned.content_size = planned
                .dirents
                .iter()
                .map(|d| d.ent_size() as u64)
                .sum();
        }
    }

    // Flat path table: uroot, the table itself, then every node in inode
    // order. Serialized now because the planner needs its final size.
    let mut fpt = FlatPathTable::new();
    fpt.push(InodeNumber::UROOT, DirentKind::Directory, "/");
    fpt.push(InodeNumber::FLAT_PATH_TABLE, DirentKind::File, "/flat_path_table");
    for planned in &nodes {
        if planned.node == root {
            continue;
        }
        let kind = if planned.is_dir {
            DirentKind::Directory
        } else {
            DirentKind::File
        };
        fpt.push(planned.ino, kind, tree.full_path(planned.node));
    }
    let fpt_bytes = fpt.to_bytes();

    let fpt_len = fpt_bytes.len() as u64;
    inodes[InodeNumber::FLAT_PATH_TABLE.as_usize()].size = fpt_len;
    inodes[InodeNumber::FLAT_PATH_TABLE.as_usize()].blocks =
        u32::try_from(props.block_size.blocks_for(fpt_len))
            .map_err(|_| PfsError::LayoutOverflow("flat path table exceeds 2^32 blocks".into()))?;

    debug!(
        event = "setup_complete",
        inode_count = inodes.len(),
        node_count = nodes.len(),
        fpt_bytes = fpt_bytes.len()
    );

    Ok(Setup {
        inodes,
        nodes,
        super_root_dirents,
        fpt_bytes,
    })
}
