//! The backend trait.

use crate::error::StorageResult;

/// A byte store the journal is written to.
///
/// # Invariants
///
/// - `append` writes at the current end and returns that offset
/// - `read_at` returns exactly the bytes previously appended there
/// - after `flush` (or the stronger `sync`) returns, appended data survives
///   process termination
/// - `replace` is all-or-nothing: a crash leaves either the old or the new
///   contents, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the store, or on I/O failure.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces data and metadata onto durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current size in bytes; also the offset of the next append.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops everything after `new_size`.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is larger than the current size or the
    /// truncation itself fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically swaps the whole contents for `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents cannot be made durable. The old
    /// contents are left in place in that case.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads everything from `offset` to the end.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::size`] and [`Self::read_at`].
    fn read_from(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = usize::try_from(size - offset).map_err(|_| {
            crate::StorageError::Corrupted(format!("store of {size} bytes does not fit in memory"))
        })?;
        self.read_at(offset, len)
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        (**self).append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        (**self).flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        (**self).truncate(new_size)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        (**self).replace(data)
    }
}
