use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{TransferError, validate_file_name};

/// Any seekable byte stream that can back a transfer.
pub trait SeekStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> SeekStream for T {}

enum Inner {
    File(File),
    Memory(Cursor<Vec<u8>>),
    Stream(Box<dyn SeekStream>),
}

/// Owned, seekable source or sink of a transfer's bytes.
///
/// A store opened from a path remembers it, which is what makes the
/// transfer resumable: the resume ledger only keeps a reference to the file
/// and reopens it later.
pub struct BackingStore {
    inner: Inner,
    path: Option<PathBuf>,
}

impl BackingStore {
    /// Opens an existing file for reading (uploads).
    pub fn open_file(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        Ok(Self {
            inner: Inner::File(file),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates (or truncates) a file for writing (fresh downloads).
    pub fn create_file(path: &Path) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            inner: Inner::File(file),
            path: Some(path.to_path_buf()),
        })
    }

    /// Reopens a partially written file without truncating it (resumed
    /// downloads). Fails if the file no longer exists.
    pub fn open_for_resume(path: &Path) -> Result<Self, TransferError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            inner: Inner::File(file),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates `dir/name` for a download, validating the peer-supplied name.
    pub fn create_in_dir(dir: &Path, name: &str) -> Result<Self, TransferError> {
        validate_file_name(name)?;
        Self::create_file(&dir.join(name))
    }

    /// In-memory store; not resumable.
    pub fn memory(bytes: Vec<u8>) -> Self {
        Self {
            inner: Inner::Memory(Cursor::new(bytes)),
            path: None,
        }
    }

    /// Wraps an arbitrary stream. Pass `path` only if the stream's contents
    /// can be reopened from it later.
    pub fn from_stream(stream: impl SeekStream + 'static, path: Option<PathBuf>) -> Self {
        Self {
            inner: Inner::Stream(Box::new(stream)),
            path,
        }
    }

    /// File this store can be reopened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total length in bytes. Leaves the position unchanged.
    pub fn len(&mut self) -> io::Result<u64> {
        if let Inner::Memory(c) = &self.inner {
            return Ok(c.get_ref().len() as u64);
        }
        let pos = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        if pos != end {
            self.seek(SeekFrom::Start(pos))?;
        }
        Ok(end)
    }

    pub fn is_empty(&mut self) -> io::Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Reads the whole store from the beginning, leaving the position at
    /// the end.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.rewind()?;
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Returns the buffer of an in-memory store.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.inner {
            Inner::Memory(c) => Some(c.into_inner()),
            _ => None,
        }
    }

    fn stream(&mut self) -> &mut (dyn SeekStream + 'static) {
        match &mut self.inner {
            Inner::File(f) => f,
            Inner::Memory(c) => c,
            Inner::Stream(s) => s.as_mut(),
        }
    }
}

impl Read for BackingStore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream().read(buf)
    }
}

impl Write for BackingStore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream().flush()
    }
}

impl Seek for BackingStore {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.stream().seek(pos)
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            Inner::File(_) => "file",
            Inner::Memory(_) => "memory",
            Inner::Stream(_) => "stream",
        };
        f.debug_struct("BackingStore")
            .field("kind", &kind)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_len_and_bytes() {
        let mut store = BackingStore::memory(b"hello".to_vec());
        assert_eq!(store.len().unwrap(), 5);
        assert!(store.path().is_none());
        assert_eq!(store.into_bytes().unwrap(), b"hello");
    }

    #[test]
    fn file_len_preserves_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut store = BackingStore::open_file(&path).unwrap();
        store.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(store.len().unwrap(), 10);
        assert_eq!(store.stream_position().unwrap(), 4);
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn create_file_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"stale contents").unwrap();

        let mut store = BackingStore::create_file(&path).unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn open_for_resume_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"half").unwrap();

        let mut store = BackingStore::open_for_resume(&path).unwrap();
        assert_eq!(store.len().unwrap(), 4);
        store.seek(SeekFrom::End(0)).unwrap();
        store.write_all(b"more").unwrap();
        assert_eq!(store.read_all().unwrap(), b"halfmore");
    }

    #[test]
    fn open_for_resume_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = BackingStore::open_for_resume(&dir.path().join("gone.bin"));
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[test]
    fn create_in_dir_validates_name() {
        let dir = TempDir::new().unwrap();
        assert!(BackingStore::create_in_dir(dir.path(), "../escape").is_err());

        let store = BackingStore::create_in_dir(dir.path(), "ok.txt").unwrap();
        assert_eq!(store.path(), Some(dir.path().join("ok.txt").as_path()));
    }

    #[test]
    fn from_stream_is_not_memory() {
        let store = BackingStore::from_stream(Cursor::new(vec![1, 2, 3]), None);
        assert!(store.into_bytes().is_none());
    }
}
