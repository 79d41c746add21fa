#![forbid(unsafe_code)]

use crate::dirent::DirentKind;
use pfs_types::{DIRENT_HEADER_SIZE, InodeNumber, ParseError, ensure_slice, read_le_u32, write_le_u32};

/// One flat-path-table entry: a node's full path bound to its inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FptEntry {
    pub ino: InodeNumber,
    pub kind: DirentKind,
    pub path: String,
}

/// The flat path table: every node's absolute path mapped to its inode
/// number, serialized as a linear run of dirent-shaped records.
///
/// The planner needs [`FlatPathTable::serialized_len`] before block layout;
/// the writer streams [`FlatPathTable::to_bytes`] through a synthetic file
/// node bound to inode 1.
#[derive(Debug, Clone, Default)]
pub struct FlatPathTable {
    entries: Vec<FptEntry>,
}

impl FlatPathTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ino: InodeNumber, kind: DirentKind, path: impl Into<String>) {
        self.entries.push(FptEntry {
            ino,
            kind,
            path: path.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[FptEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total serialized size in bytes.
    #[must_use]
    pub fn serialized_len(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| entry_size(e.path.len()) as u64)
            .sum()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len() as usize);
        for entry in &self.entries {
            let size = entry_size(entry.path.len());
            let start = buf.len();
            buf.resize(start + size, 0);
            let record = &mut buf[start..];
            write_le_u32(record, 0x00, entry.ino.0);
            write_le_u32(record, 0x04, entry.kind as u32);
            write_le_u32(record, 0x08, entry.path.len() as u32);
            write_le_u32(record, 0x0C, size as u32);
            record[DIRENT_HEADER_SIZE..DIRENT_HEADER_SIZE + entry.path.len()]
                .copy_from_slice(entry.path.as_bytes());
        }
        buf
    }

    /// Parse a serialized table back into entries.
    pub fn parse_from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let ino = read_le_u32(data, offset)?;
            let kind = DirentKind::from_raw(read_le_u32(data, offset + 0x04)?)?;
            let pathlen = read_le_u32(data, offset + 0x08)? as usize;
            let ent_size = read_le_u32(data, offset + 0x0C)? as usize;
            if ent_size < entry_size(pathlen) {
                return Err(ParseError::InvalidField {
                    field: "fpt_entsize",
                    reason: "smaller than header + path",
                });
            }
            let path_bytes = ensure_slice(data, offset + DIRENT_HEADER_SIZE, pathlen)?;
            let path =
                String::from_utf8(path_bytes.to_vec()).map_err(|_| ParseError::InvalidField {
                    field: "fpt_path",
                    reason: "not valid UTF-8",
                })?;
            entries.push(FptEntry {
                ino: InodeNumber(ino),
                kind,
                path,
            });
            offset += ent_size;
        }
        Ok(Self { entries })
    }
}

fn entry_size(path_len: usize) -> usize {
    (DIRENT_HEADER_SIZE + path_len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FlatPathTable {
        let mut fpt = FlatPathTable::new();
        fpt.push(InodeNumber(2), DirentKind::Directory, "/");
        fpt.push(InodeNumber(1), DirentKind::File, "/flat_path_table");
        fpt.push(InodeNumber(3), DirentKind::Directory, "/d1");
        fpt.push(InodeNumber(4), DirentKind::File, "/d1/f");
        fpt
    }

    #[test]
    fn serialized_len_matches_bytes() {
        let fpt = table();
        assert_eq!(fpt.serialized_len(), fpt.to_bytes().len() as u64);
        // "/" → 24, "/flat_path_table" (16) → 32, "/d1" → 24, "/d1/f" → 24.
        assert_eq!(fpt.serialized_len(), 24 + 32 + 24 + 24);
    }

    #[test]
    fn round_trip() {
        let fpt = table();
        let parsed = FlatPathTable::parse_from_bytes(&fpt.to_bytes()).unwrap();
        assert_eq!(parsed.entries(), fpt.entries());
    }

    #[test]
    fn paths_longer_than_a_dirent_name_are_allowed() {
        let mut fpt = FlatPathTable::new();
        let deep = format!("/{}", "d/".repeat(200));
        fpt.push(InodeNumber(9), DirentKind::Directory, deep.clone());
        let parsed = FlatPathTable::parse_from_bytes(&fpt.to_bytes()).unwrap();
        assert_eq!(parsed.entries()[0].path, deep);
    }

    #[test]
    fn empty_table_is_empty_bytes() {
        let fpt = FlatPathTable::new();
        assert!(fpt.is_empty());
        assert_eq!(fpt.serialized_len(), 0);
        assert!(fpt.to_bytes().is_empty());
    }
}
