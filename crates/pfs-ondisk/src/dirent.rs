#![forbid(unsafe_code)]

use pfs_types::{
    DIRENT_HEADER_SIZE, DIRENT_MAX_NAME, InodeNumber, ParseError, ensure_slice, read_le_u32,
    write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Directory entry kind, as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum DirentKind {
    File = 2,
    Directory = 3,
    Dot = 4,
    DotDot = 5,
}

impl DirentKind {
    pub fn from_raw(raw: u32) -> Result<Self, ParseError> {
        match raw {
            2 => Ok(Self::File),
            3 => Ok(Self::Directory),
            4 => Ok(Self::Dot),
            5 => Ok(Self::DotDot),
            _ => Err(ParseError::InvalidField {
                field: "dirent_kind",
                reason: "unknown entry kind",
            }),
        }
    }
}

/// A variable-length directory entry.
///
/// Wire layout: `u32 ino, u32 kind, u32 namelen, u32 entsize`, then the
/// name padded so the record length is a multiple of 8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: InodeNumber,
    pub kind: DirentKind,
    pub name: String,
}

impl Dirent {
    pub fn new(ino: InodeNumber, kind: DirentKind, name: impl Into<String>) -> Result<Self, ParseError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "dirent_name",
                reason: "empty name",
            });
        }
        if name.len() > DIRENT_MAX_NAME {
            return Err(ParseError::InvalidField {
                field: "dirent_name",
                reason: "name exceeds 255 bytes",
            });
        }
        Ok(Self { ino, kind, name })
    }

    /// The `.` entry of a directory.
    #[must_use]
    pub fn dot(ino: InodeNumber) -> Self {
        Self {
            ino,
            kind: DirentKind::Dot,
            name: ".".to_owned(),
        }
    }

    /// The `..` entry of a directory.
    #[must_use]
    pub fn dot_dot(parent: InodeNumber) -> Self {
        Self {
            ino: parent,
            kind: DirentKind::DotDot,
            name: "..".to_owned(),
        }
    }

    /// Serialized length: header plus the name rounded up to 8 bytes.
    #[must_use]
    pub fn ent_size(&self) -> usize {
        record_size(self.name.len())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; self.ent_size()];
        write_le_u32(&mut buf, 0x00, self.ino.0);
        write_le_u32(&mut buf, 0x04, self.kind as u32);
        write_le_u32(&mut buf, 0x08, self.name.len() as u32);
        write_le_u32(&mut buf, 0x0C, self.ent_size() as u32);
        buf[DIRENT_HEADER_SIZE..DIRENT_HEADER_SIZE + self.name.len()]
            .copy_from_slice(self.name.as_bytes());
        buf
    }

    /// Parse one dirent from `data`, returning it with its consumed length.
    pub fn parse_from_bytes(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let ino = read_le_u32(data, 0x00)?;
        let kind = DirentKind::from_raw(read_le_u32(data, 0x04)?)?;
        let namelen = read_le_u32(data, 0x08)? as usize;
        let ent_size = read_le_u32(data, 0x0C)? as usize;

        if ent_size < record_size(namelen) {
            return Err(ParseError::InvalidField {
                field: "dirent_entsize",
                reason: "smaller than header + name",
            });
        }
        let name_bytes = ensure_slice(data, DIRENT_HEADER_SIZE, namelen)?;
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| ParseError::InvalidField {
            field: "dirent_name",
            reason: "not valid UTF-8",
        })?;

        Ok((
            Self {
                ino: InodeNumber(ino),
                kind,
                name,
            },
            ent_size,
        ))
    }
}

/// Serialized record length for a name of `name_len` bytes.
#[must_use]
pub fn record_size(name_len: usize) -> usize {
    (DIRENT_HEADER_SIZE + name_len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::DIRENT_MAX_SIZE;

    #[test]
    fn ent_size_rounds_to_eight() {
        assert_eq!(Dirent::dot(InodeNumber(2)).ent_size(), 24);
        assert_eq!(Dirent::dot_dot(InodeNumber(2)).ent_size(), 24);

        let e = Dirent::new(InodeNumber(1), DirentKind::File, "flat_path_table").unwrap();
        // 16 + 15 → 32.
        assert_eq!(e.ent_size(), 32);

        let eight = Dirent::new(InodeNumber(3), DirentKind::File, "12345678").unwrap();
        assert_eq!(eight.ent_size(), 24);
    }

    #[test]
    fn max_name_fits_the_documented_bound() {
        let name = "x".repeat(DIRENT_MAX_NAME);
        let e = Dirent::new(InodeNumber(3), DirentKind::File, name).unwrap();
        assert_eq!(e.ent_size(), DIRENT_MAX_SIZE);

        let too_long = "x".repeat(DIRENT_MAX_NAME + 1);
        assert!(Dirent::new(InodeNumber(3), DirentKind::File, too_long).is_err());
    }

    #[test]
    fn round_trip() {
        let e = Dirent::new(InodeNumber(7), DirentKind::Directory, "saves").unwrap();
        let bytes = e.to_bytes();
        assert_eq!(bytes.len(), e.ent_size());

        let (parsed, consumed) = Dirent::parse_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, e);
        assert_eq!(consumed, e.ent_size());
    }

    #[test]
    fn wire_fields_are_little_endian() {
        let e = Dirent::new(InodeNumber(0x0102), DirentKind::File, "a").unwrap();
        let bytes = e.to_bytes();
        assert_eq!(&bytes[0..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[8..12], &[0x01, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[12..16], &[0x18, 0x00, 0x00, 0x00]);
        assert_eq!(bytes[16], b'a');
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(Dirent::new(InodeNumber(1), DirentKind::File, "").is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = Dirent::dot(InodeNumber(2)).to_bytes();
        bytes[4] = 9;
        assert!(Dirent::parse_from_bytes(&bytes).is_err());
    }
}
