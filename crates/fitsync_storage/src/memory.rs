//! In-memory backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A backend holding its bytes in memory.
///
/// Clones share the same buffer. Tests use this to "reopen" a store after a
/// simulated crash: keep a clone, drop the database, open a new one over
/// the clone.
///
/// ```rust
/// use fitsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let view = backend.clone();
/// backend.append(b"abc").unwrap();
/// assert_eq!(view.size().unwrap(), 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites a single byte. Used to inject corruption in tests.
    pub fn corrupt_byte(&self, offset: usize, value: u8) {
        if let Some(byte) = self.data.write().get_mut(offset) {
            *byte = value;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        data.clear();
        data.extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(10, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn truncate_drops_tail() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");

        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::InvalidTruncate { requested: 100, size: 5 })
        ));
    }

    #[test]
    fn replace_swaps_contents() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"old journal").unwrap();
        backend.replace(b"new").unwrap();
        assert_eq!(backend.data(), b"new");
        assert_eq!(backend.append(b"!").unwrap(), 3);
    }

    #[test]
    fn clones_share_buffer() {
        let mut backend = InMemoryBackend::new();
        let view = backend.clone();
        backend.append(b"shared").unwrap();
        assert_eq!(view.data(), b"shared");

        view.corrupt_byte(0, b'S');
        assert_eq!(backend.read_at(0, 1).unwrap(), b"S");
    }

    #[test]
    fn read_from_offset() {
        let backend = InMemoryBackend::with_data(b"0123456789".to_vec());
        assert_eq!(backend.read_from(7).unwrap(), b"789");
        assert!(backend.read_from(10).unwrap().is_empty());
        assert!(backend.read_from(42).unwrap().is_empty());
    }
}
