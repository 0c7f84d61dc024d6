use std::io::{Read, Seek, SeekFrom, Write};

use onetox_protocol::Fingerprint;
use sha2::{Digest, Sha256};

use crate::backing::BackingStore;
use crate::state::TransferState;
use crate::types::TransferSlot;
use crate::TransferError;

// ---------------------------------------------------------------------------
// Fingerprint helpers
// ---------------------------------------------------------------------------

/// SHA-256 fingerprint of `data`.
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    Fingerprint::new(Sha256::digest(data).to_vec())
}

/// SHA-256 fingerprint of a whole store. The store is rewound afterwards.
pub fn fingerprint_store(store: &mut BackingStore) -> Result<Fingerprint, TransferError> {
    store.rewind()?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = store.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    store.rewind()?;
    Ok(Fingerprint::new(hasher.finalize().to_vec()))
}

// ---------------------------------------------------------------------------
// Chunk engine
// ---------------------------------------------------------------------------

impl TransferSlot {
    /// Reads `length` bytes at `offset` and moves the cursor past them.
    ///
    /// Requests need not be sequential; the store is only repositioned when
    /// `offset` differs from the cursor.
    pub fn read_chunk(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, TransferError> {
        let end = self.check_range(offset, length as u64)?;
        let cursor = self.cursor;
        let store = self.store.as_mut().ok_or(TransferError::NoBackingStore)?;
        if cursor != offset {
            store.seek(SeekFrom::Start(offset))?;
        }
        let mut buf = vec![0u8; length];
        store.read_exact(&mut buf)?;
        self.cursor = end;
        Ok(buf)
    }

    /// Writes `data` at `offset` and moves the cursor past it.
    pub fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let end = self.check_range(offset, data.len() as u64)?;
        let cursor = self.cursor;
        let store = self.store.as_mut().ok_or(TransferError::NoBackingStore)?;
        if cursor != offset {
            store.seek(SeekFrom::Start(offset))?;
        }
        store.write_all(data)?;
        if end == self.total_bytes {
            store.flush()?;
        }
        self.cursor = end;
        Ok(())
    }

    /// `true` once every byte has been moved.
    pub fn is_finished(&self) -> bool {
        self.cursor == self.total_bytes
    }

    /// Percentage complete, 0 to 100.
    pub fn progress(&self) -> f64 {
        if self.state == TransferState::Finished || self.total_bytes == 0 {
            return 100.0;
        }
        self.cursor as f64 / self.total_bytes as f64 * 100.0
    }

    /// Returns the end offset of the range, or an error if it falls outside
    /// the transfer.
    fn check_range(&self, offset: u64, length: u64) -> Result<u64, TransferError> {
        match offset.checked_add(length) {
            Some(end) if end <= self.total_bytes => Ok(end),
            _ => Err(TransferError::ChunkOutOfRange {
                offset,
                length,
                total: self.total_bytes,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn slot(store: BackingStore, total_bytes: u64) -> TransferSlot {
        TransferSlot {
            state: TransferState::Uploading,
            cursor: 0,
            total_bytes,
            store: Some(store),
            resume_token: None,
        }
    }

    #[test]
    fn fingerprint_bytes_deterministic() {
        let a = fingerprint_bytes(b"hello world");
        let b = fingerprint_bytes(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 32);
        assert_ne!(a, fingerprint_bytes(b"hello"));
    }

    #[test]
    fn fingerprint_store_matches_bytes_and_rewinds() {
        let data = b"avatar image bytes".to_vec();
        let mut store = BackingStore::memory(data.clone());
        store.seek(SeekFrom::Start(3)).unwrap();

        let fp = fingerprint_store(&mut store).unwrap();
        assert_eq!(fp, fingerprint_bytes(&data));
        assert_eq!(store.stream_position().unwrap(), 0);
    }

    #[test]
    fn sequential_reads() {
        let mut s = slot(BackingStore::memory(b"AABBCCDDEE".to_vec()), 10);
        assert_eq!(s.read_chunk(0, 4).unwrap(), b"AABB");
        assert_eq!(s.cursor(), 4);
        assert_eq!(s.read_chunk(4, 4).unwrap(), b"CCDD");
        assert_eq!(s.read_chunk(8, 2).unwrap(), b"EE");
        assert!(s.is_finished());
    }

    #[test]
    fn out_of_order_read_seeks() {
        let mut s = slot(BackingStore::memory(b"0123456789".to_vec()), 10);
        assert_eq!(s.read_chunk(6, 4).unwrap(), b"6789");
        assert_eq!(s.cursor(), 10);
        assert_eq!(s.read_chunk(2, 3).unwrap(), b"234");
        assert_eq!(s.cursor(), 5);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let mut s = slot(BackingStore::memory(b"0123456789".to_vec()), 10);
        let err = s.read_chunk(8, 5).unwrap_err();
        assert!(matches!(err, TransferError::ChunkOutOfRange { .. }));
        assert_eq!(s.cursor(), 0);
    }

    #[test]
    fn offset_overflow_is_rejected() {
        let mut s = slot(BackingStore::memory(vec![0; 4]), 4);
        assert!(matches!(
            s.read_chunk(u64::MAX, 2),
            Err(TransferError::ChunkOutOfRange { .. })
        ));
    }

    #[test]
    fn short_store_is_io_error() {
        // Declared size larger than the data actually present.
        let mut s = slot(BackingStore::memory(b"abc".to_vec()), 10);
        assert!(matches!(s.read_chunk(0, 5), Err(TransferError::Io(_))));
    }

    #[test]
    fn missing_store_is_rejected() {
        let mut s = TransferSlot {
            state: TransferState::BeforeDownload,
            cursor: 0,
            total_bytes: 4,
            store: None,
            resume_token: None,
        };
        assert!(matches!(
            s.write_chunk(0, b"data"),
            Err(TransferError::NoBackingStore)
        ));
    }

    #[test]
    fn writes_land_at_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut s = slot(BackingStore::create_file(&path).unwrap(), 11);
        s.write_chunk(0, b"Hello").unwrap();
        assert_eq!(s.cursor(), 5);
        s.write_chunk(5, b" World").unwrap();
        assert!(s.is_finished());
        assert_eq!(std::fs::read(&path).unwrap(), b"Hello World");
    }

    #[test]
    fn out_of_order_write_seeks() {
        let mut s = slot(BackingStore::from_stream(Cursor::new(vec![0u8; 6]), None), 6);
        s.write_chunk(3, b"def").unwrap();
        s.write_chunk(0, b"abc").unwrap();
        assert_eq!(s.cursor(), 3);
        assert_eq!(s.store.as_mut().unwrap().read_all().unwrap(), b"abcdef");
    }

    #[test]
    fn write_past_end_is_rejected() {
        let mut s = slot(BackingStore::memory(Vec::new()), 4);
        assert!(s.write_chunk(2, b"xyz").is_err());
        assert_eq!(s.cursor(), 0);
    }

    #[test]
    fn progress_percentages() {
        let mut s = slot(BackingStore::memory(vec![0; 200]), 200);
        assert_eq!(s.progress(), 0.0);
        s.read_chunk(0, 50).unwrap();
        assert!((s.progress() - 25.0).abs() < f64::EPSILON);
        s.state = TransferState::Finished;
        assert_eq!(s.progress(), 100.0);
    }

    #[test]
    fn empty_transfer_is_complete() {
        let s = slot(BackingStore::memory(Vec::new()), 0);
        assert!(s.is_finished());
        assert_eq!(s.progress(), 100.0);
    }

    #[test]
    fn cursor_stays_in_bounds() {
        let mut s = slot(BackingStore::memory((0..=255).collect()), 256);
        for (offset, len) in [(0, 100), (100, 156), (50, 10), (250, 6), (255, 2), (0, 257)] {
            let _ = s.read_chunk(offset, len);
            assert!(s.cursor() <= s.total_bytes());
        }
    }
}
