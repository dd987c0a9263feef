//! Random-access byte sources backing reftable files.

use crate::{Error, Result};
use bytes::Bytes;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Random-access reader over a file, channel, or in-memory buffer.
///
/// `read` returns `len` bytes except at end-of-file, where a short buffer
/// is legal. Reads take `&self` so a source can back a shared reader;
/// whether that is actually safe is up to the implementation
/// (`MemBlockSource` is, a plain seekable channel would not be).
pub trait BlockSource {
    /// Read up to `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: u32) -> Result<Bytes>;

    /// Total size of the underlying bytes.
    fn size(&self) -> Result<u64>;

    /// Hint that `[start, end)` is about to be scanned front to back.
    fn advise_sequential(&self, _start: u64, _end: u64) {}

    /// Release underlying resources. Idempotent.
    fn close(&mut self) {}

    /// Read exactly `len` bytes or fail with [`Error::TruncatedInput`].
    fn read_exact(&self, offset: u64, len: u32) -> Result<Bytes> {
        let buf = self.read(offset, len)?;
        if buf.len() < len as usize {
            return Err(Error::TruncatedInput {
                offset,
                wanted: len as usize,
                got: buf.len(),
            });
        }
        Ok(buf)
    }
}

/// Block source over a contiguous in-memory buffer.
///
/// Clones share the same bytes; safe to use from any number of threads.
#[derive(Clone, Debug)]
pub struct MemBlockSource {
    bytes: Bytes,
}

impl MemBlockSource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }
}

impl BlockSource for MemBlockSource {
    fn read(&self, offset: u64, len: u32) -> Result<Bytes> {
        let total = self.bytes.len() as u64;
        if offset >= total {
            return Ok(Bytes::new());
        }
        let end = total.min(offset + len as u64);
        Ok(self.bytes.slice(offset as usize..end as usize))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}

/// Block source over a file, using positioned reads so concurrent readers
/// never race on a shared cursor.
#[derive(Debug)]
pub struct FileBlockSource {
    file: Option<File>,
    size: u64,
}

impl FileBlockSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Some(file),
            size,
        })
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "block source is closed",
            ))
        })
    }
}

impl BlockSource for FileBlockSource {
    fn read(&self, offset: u64, len: u32) -> Result<Bytes> {
        let file = self.file()?;
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break; // EOF, short buffer is fine
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    fn size(&self) -> Result<u64> {
        self.file()?;
        Ok(self.size)
    }

    fn close(&mut self) {
        self.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_source_short_read_at_eof() {
        let src = MemBlockSource::new(vec![1, 2, 3, 4]);
        assert_eq!(src.size().unwrap(), 4);
        assert_eq!(&src.read(2, 10).unwrap()[..], &[3, 4]);
        assert!(src.read(9, 4).unwrap().is_empty());
        assert!(matches!(
            src.read_exact(2, 10),
            Err(Error::TruncatedInput { offset: 2, .. })
        ));
    }

    #[test]
    fn file_source_reads_and_closes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let mut src = FileBlockSource::open(tmp.path()).unwrap();
        assert_eq!(src.size().unwrap(), 10);
        assert_eq!(&src.read_exact(3, 4).unwrap()[..], b"3456");
        assert_eq!(&src.read(8, 8).unwrap()[..], b"89");

        src.close();
        src.close(); // idempotent
        assert!(src.read(0, 1).is_err());
    }
}
