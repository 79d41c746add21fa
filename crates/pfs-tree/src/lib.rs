#![forbid(unsafe_code)]
//! In-memory filesystem tree for PFS image building.
//!
//! Arena-based: the tree owns a flat `Vec` of nodes; directories hold child
//! indices and children hold a parent index, so there are no owning parent
//! pointers. File payloads are streamed through a `Contents` producer at
//! write time rather than buffered in the tree.

use pfs_error::{PfsError, Result};
use pfs_types::DIRENT_MAX_NAME;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Index of a node within its [`FsTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Streams a file's raw bytes into a sink.
///
/// Invoked synchronously, exactly once per build, and expected to produce
/// exactly the byte count the file node declares.
pub trait Contents: Send {
    fn stream_to(&mut self, out: &mut dyn Write) -> io::Result<()>;
}

/// In-memory file contents.
pub struct BytesContents(pub Vec<u8>);

impl Contents for BytesContents {
    fn stream_to(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.0)
    }
}

/// File contents read from the host filesystem at write time.
pub struct HostFileContents {
    path: PathBuf,
}

impl HostFileContents {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Contents for HostFileContents {
    fn stream_to(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let mut file = File::open(&self.path)?;
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            out.write_all(&buf[..n])?;
        }
    }
}

pub enum NodeKind {
    Directory {
        children: Vec<NodeId>,
    },
    File {
        size: u64,
        /// 0 means "same as uncompressed".
        compressed_size: u64,
        compress: bool,
        contents: Box<dyn Contents>,
    },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory { children } => f
                .debug_struct("Directory")
                .field("children", &children.len())
                .finish(),
            Self::File {
                size,
                compressed_size,
                compress,
                ..
            } => f
                .debug_struct("File")
                .field("size", size)
                .field("compressed_size", compressed_size)
                .field("compress", compress)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub struct FsNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl FsNode {
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Byte length of the node's payload; `None` for directories.
    #[must_use]
    pub fn file_size(&self) -> Option<u64> {
        match &self.kind {
            NodeKind::File { size, .. } => Some(*size),
            NodeKind::Directory { .. } => None,
        }
    }
}

/// The filesystem tree handed to the image builder.
#[derive(Debug)]
pub struct FsTree {
    nodes: Vec<FsNode>,
}

impl FsTree {
    /// Create a tree with an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![FsNode {
                name: String::new(),
                parent: None,
                kind: NodeKind::Directory {
                    children: Vec::new(),
                },
            }],
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &FsNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut FsNode {
        &mut self.nodes[id.0]
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Add a directory under `parent`.
    pub fn add_directory(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        self.add_node(
            parent,
            name.into(),
            NodeKind::Directory {
                children: Vec::new(),
            },
        )
    }

    /// Add a file under `parent`.
    pub fn add_file(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        size: u64,
        contents: Box<dyn Contents>,
    ) -> Result<NodeId> {
        self.add_node(
            parent,
            name.into(),
            NodeKind::File {
                size,
                compressed_size: 0,
                compress: false,
                contents,
            },
        )
    }

    /// Add a file that records compression metadata.
    ///
    /// The producer must stream the bytes exactly as they will appear in
    /// the image; the builder records metadata only.
    pub fn add_compressed_file(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        size: u64,
        compressed_size: u64,
        contents: Box<dyn Contents>,
    ) -> Result<NodeId> {
        self.add_node(
            parent,
            name.into(),
            NodeKind::File {
                size,
                compressed_size,
                compress: true,
                contents,
            },
        )
    }

    fn add_node(&mut self, parent: NodeId, name: String, kind: NodeKind) -> Result<NodeId> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(PfsError::InvalidTree(format!("invalid node name {name:?}")));
        }
        if name.len() > DIRENT_MAX_NAME {
            return Err(PfsError::InvalidTree(format!(
                "name of {} bytes exceeds the {DIRENT_MAX_NAME}-byte limit",
                name.len()
            )));
        }

        let NodeKind::Directory { children } = &self.nodes[parent.0].kind else {
            return Err(PfsError::InvalidTree(format!(
                "parent of {name:?} is not a directory"
            )));
        };
        if children
            .iter()
            .any(|child| self.nodes[child.0].name == name)
        {
            return Err(PfsError::InvalidTree(format!(
                "duplicate name {name:?} in {}",
                self.full_path(parent)
            )));
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(FsNode {
            name,
            parent: Some(parent),
            kind,
        });
        let NodeKind::Directory { children } = &mut self.nodes[parent.0].kind else {
            unreachable!("parent checked above");
        };
        children.push(id);
        Ok(id)
    }

    /// Absolute path of a node within the image (`/` for the root).
    #[must_use]
    pub fn full_path(&self, id: NodeId) -> String {
        if id == self.root() {
            return "/".to_owned();
        }
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            if node_id == self.root() {
                break;
            }
            let node = &self.nodes[node_id.0];
            segments.push(node.name.as_str());
            cursor = node.parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// All directories in stable pre-order, root first. Children are
    /// visited in insertion order.
    #[must_use]
    pub fn directories_preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let NodeKind::Directory { children } = &self.nodes[id.0].kind else {
                continue;
            };
            out.push(id);
            for child in children.iter().rev() {
                if self.nodes[child.0].is_directory() {
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// All files with their absolute paths, sorted lexicographically by
    /// path. This ordering fixes inode numbers and block layout.
    #[must_use]
    pub fn files_sorted_by_path(&self) -> Vec<(String, NodeId)> {
        let mut files: Vec<(String, NodeId)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.is_directory())
            .map(|(idx, _)| (self.full_path(NodeId(idx)), NodeId(idx)))
            .collect();
        files.sort();
        files
    }

    /// Verify structural invariants: parent links match child lists and
    /// every non-root node has a parent.
    pub fn validate(&self) -> Result<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            let id = NodeId(idx);
            if id == self.root() {
                if node.parent.is_some() {
                    return Err(PfsError::InvalidTree("root must not have a parent".into()));
                }
                continue;
            }
            let Some(parent) = node.parent else {
                return Err(PfsError::InvalidTree(format!(
                    "node {:?} has no parent link",
                    node.name
                )));
            };
            let NodeKind::Directory { children } = &self.nodes[parent.0].kind else {
                return Err(PfsError::InvalidTree(format!(
                    "parent of {:?} is not a directory",
                    node.name
                )));
            };
            if !children.contains(&id) {
                return Err(PfsError::InvalidTree(format!(
                    "parent link of {:?} is not mirrored by a child entry",
                    node.name
                )));
            }
        }
        Ok(())
    }
}

impl Default for FsTree {
    fn default() -> Self {
        Self::new()
    }
}
