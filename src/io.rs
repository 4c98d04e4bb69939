//! Positional file access for the page file, the log, and the persisted
//! free-pages list.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, StoreError};

pub trait FileIo: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn truncate(&self, len: u64) -> Result<()>;
    /// Grows the file to at least `len` bytes, allocating backing space.
    fn preallocate(&self, len: u64) -> Result<()>;
}

/// `FileIo` over a shared [`File`] handle using positional reads and
/// writes, so concurrent workers never contend on a seek cursor.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            inner: Arc::new(file),
        })
    }

    #[cfg(unix)]
    fn pread(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        self.inner.read_at(dst, off)
    }

    #[cfg(windows)]
    fn pread(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        self.inner.seek_read(dst, off)
    }

    #[cfg(unix)]
    fn pwrite(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        self.inner.write_at(src, off)
    }

    #[cfg(windows)]
    fn pwrite(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        self.inner.seek_write(src, off)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = self.pread(off, dst)?;
            if read == 0 {
                return Err(StoreError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "positional read reached EOF",
                )));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = self.pwrite(off, src)?;
            if written == 0 {
                return Err(StoreError::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "positional write wrote zero bytes",
                )));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata().map_err(StoreError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StoreError::from)
    }

    fn preallocate(&self, len: u64) -> Result<()> {
        if self.len()? < len {
            self.inner.set_len(len).map_err(StoreError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();

        let payload = b"hello tidepool";
        io.write_at(0, payload).unwrap();
        io.sync_all().unwrap();

        let mut buf = vec![0u8; payload.len()];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert!(io.len().unwrap() >= payload.len() as u64);
    }

    #[test]
    fn read_past_eof_returns_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();
        let mut buf = [0u8; 8];
        let err = io.read_at(0, &mut buf).unwrap_err();
        match err {
            StoreError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn preallocate_grows_but_never_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();
        io.preallocate(4096).unwrap();
        assert_eq!(io.len().unwrap(), 4096);
        io.preallocate(1024).unwrap();
        assert_eq!(io.len().unwrap(), 4096);
    }
}
