#![forbid(unsafe_code)]

use pfs_error::{PfsError, Result};
use pfs_types::ByteOffset;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Random-access byte sink the image is built into.
///
/// Positional pread/pwrite semantics: no shared cursor, writes may extend
/// the sink. A fresh sink must read back zeros for any region that was
/// never written, which is what both provided implementations guarantee.
pub trait ImageSink {
    /// Current length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`, extending the sink if needed.
    fn write_all_at(&mut self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Truncate or zero-extend to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> Result<()>;
}

/// File-backed sink using positional I/O.
#[derive(Debug)]
pub struct FileImageSink {
    file: File,
    len: u64,
}

impl FileImageSink {
    /// Create (or truncate) the image file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self { file, len: 0 })
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl ImageSink for FileImageSink {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| PfsError::Format("read range overflows u64".to_owned()))?;
        if end.0 > self.len {
            return Err(PfsError::Format(format!(
                "read out of bounds: offset={offset} len={} sink_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&mut self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| PfsError::Format("write range overflows u64".to_owned()))?;
        self.file.write_all_at(buf, offset.0)?;
        self.len = self.len.max(end.0);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }
}

/// In-memory sink, primarily for tests and size-bounded builds.
#[derive(Debug, Default)]
pub struct MemImageSink {
    data: Vec<u8>,
}

impl MemImageSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ImageSink for MemImageSink {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset.0)
            .map_err(|_| PfsError::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| PfsError::Format("read range overflows usize".to_owned()))?;
        if end > self.data.len() {
            return Err(PfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end: offset={offset} len={}", buf.len()),
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset.0)
            .map_err(|_| PfsError::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| PfsError::Format("write range overflows usize".to_owned()))?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| PfsError::Format("length does not fit usize".to_owned()))?;
        self.data.resize(len, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_sink_extends_with_zeros() {
        let mut sink = MemImageSink::new();
        sink.write_all_at(ByteOffset(4), &[1, 2]).unwrap();
        assert_eq!(sink.len(), 6);
        assert_eq!(sink.as_slice(), &[0, 0, 0, 0, 1, 2]);

        sink.set_len(8).unwrap();
        assert_eq!(sink.as_slice(), &[0, 0, 0, 0, 1, 2, 0, 0]);
    }

    #[test]
    fn mem_sink_read_past_end_fails() {
        let sink = MemImageSink::new();
        let mut buf = [0_u8; 4];
        assert!(sink.read_exact_at(ByteOffset(0), &mut buf).is_err());
    }

    #[test]
    fn file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.pfs");

        let mut sink = FileImageSink::create(&path).unwrap();
        sink.write_all_at(ByteOffset(10), b"hello").unwrap();
        sink.set_len(32).unwrap();
        assert_eq!(sink.len(), 32);

        let mut buf = [0_u8; 5];
        sink.read_exact_at(ByteOffset(10), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Unwritten gap reads back as zeros.
        let mut gap = [0xFF_u8; 10];
        sink.read_exact_at(ByteOffset(0), &mut gap).unwrap();
        assert_eq!(gap, [0_u8; 10]);
    }
}
