//! Journal writer and recovery.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{CoreError, CoreResult};
use crate::journal::frame::{encode_frame, Frame, FrameKind, FrameReader};
use crate::journal::op::JournalOp;
use fitsync_storage::StorageBackend;
use tracing::{debug, warn};

/// What recovery found in an existing journal.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Committed batches, oldest first.
    pub batches: Vec<Vec<JournalOp>>,
    /// Bytes of torn or uncommitted tail that were cut off.
    pub discarded_bytes: u64,
}

/// Append-only log of committed batches over a [`StorageBackend`].
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
    next_batch: u64,
    poisoned: bool,
}

impl Journal {
    /// Opens a journal, replaying and validating what is already there.
    ///
    /// A torn or uncommitted tail is truncated away so the next batch starts
    /// on a clean frame boundary.
    ///
    /// # Errors
    ///
    /// Fails on checksum mismatches and structural corruption anywhere in
    /// the committed part of the log, and on storage errors.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_commit: bool,
    ) -> CoreResult<(Self, Recovered)> {
        let image = backend.read_from(0)?;
        let mut reader = FrameReader::new(&image);
        let mut recovered = Recovered::default();
        let mut open_batch: Option<(u64, Vec<JournalOp>)> = None;
        let mut committed_end = 0u64;
        let mut last_batch = 0u64;

        while let Some(frame) = reader.next_frame()? {
            match frame.kind {
                FrameKind::Begin => {
                    if let Some((id, _)) = &open_batch {
                        return Err(CoreError::journal_corruption(
                            frame.offset,
                            format!("batch {id} was never committed before the next began"),
                        ));
                    }
                    open_batch = Some((read_u64(&frame, 0)?, Vec::new()));
                }
                FrameKind::Op => {
                    let Some((_, ops)) = open_batch.as_mut() else {
                        return Err(CoreError::journal_corruption(
                            frame.offset,
                            "operation outside of a batch",
                        ));
                    };
                    let op = from_cbor(frame.payload).map_err(|e| {
                        CoreError::journal_corruption(frame.offset, e.to_string())
                    })?;
                    ops.push(op);
                }
                FrameKind::Commit => {
                    let id = read_u64(&frame, 0)?;
                    let count = read_u32(&frame, 8)? as usize;
                    match open_batch.take() {
                        Some((open_id, ops)) if open_id == id && ops.len() == count => {
                            recovered.batches.push(ops);
                            committed_end = frame.end;
                            last_batch = id;
                        }
                        _ => {
                            return Err(CoreError::journal_corruption(
                                frame.offset,
                                format!("commit of batch {id} does not match its begin"),
                            ))
                        }
                    }
                }
            }
        }

        let size = image.len() as u64;
        if committed_end < size {
            recovered.discarded_bytes = size - committed_end;
            warn!(
                committed_end,
                discarded = recovered.discarded_bytes,
                "discarding torn journal tail"
            );
            backend.truncate(committed_end)?;
            backend.sync()?;
        }

        debug!(
            batches = recovered.batches.len(),
            bytes = committed_end,
            "journal recovered"
        );

        Ok((
            Self {
                backend,
                sync_on_commit,
                next_batch: last_batch + 1,
                poisoned: false,
            },
            recovered,
        ))
    }

    /// Durably appends one batch.
    ///
    /// Returns once the batch is flushed (and synced when configured). If
    /// the write fails, the partial batch is cut off again; if even that
    /// fails the journal refuses further writes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Poisoned`] after an unrecoverable write failure,
    /// otherwise the underlying encode or storage error.
    pub fn commit(&mut self, ops: &[JournalOp]) -> CoreResult<u64> {
        if self.poisoned {
            return Err(CoreError::Poisoned);
        }

        let batch = self.next_batch;
        let buf = encode_batch(batch, ops)?;
        let start = self.backend.size()?;

        let written = self.backend.append(&buf).and_then(|_| {
            if self.sync_on_commit {
                self.backend.sync()
            } else {
                self.backend.flush()
            }
        });

        if let Err(err) = written {
            if self.backend.truncate(start).is_err() {
                warn!(batch, "journal write failed and rollback failed; poisoning");
                self.poisoned = true;
            }
            return Err(err.into());
        }

        self.next_batch += 1;
        Ok(batch)
    }

    /// Atomically replaces the whole journal with a single batch.
    ///
    /// # Errors
    ///
    /// Returns the encode or storage error. A failed rewrite poisons the
    /// journal since the backend handle may no longer point at the file.
    pub fn rewrite(&mut self, ops: &[JournalOp]) -> CoreResult<()> {
        if self.poisoned {
            return Err(CoreError::Poisoned);
        }
        let batch = self.next_batch;
        let buf = encode_batch(batch, ops)?;
        if let Err(err) = self.backend.replace(&buf) {
            self.poisoned = true;
            return Err(err.into());
        }
        self.next_batch += 1;
        Ok(())
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }
}

fn encode_batch(batch: u64, ops: &[JournalOp]) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_frame(&mut buf, FrameKind::Begin, &batch.to_le_bytes())?;
    for op in ops {
        encode_frame(&mut buf, FrameKind::Op, &to_cbor(op)?)?;
    }
    let count = u32::try_from(ops.len())
        .map_err(|_| CoreError::invalid_argument("too many operations in one batch"))?;
    let mut commit = Vec::with_capacity(12);
    commit.extend_from_slice(&batch.to_le_bytes());
    commit.extend_from_slice(&count.to_le_bytes());
    encode_frame(&mut buf, FrameKind::Commit, &commit)?;
    Ok(buf)
}

fn read_u64(frame: &Frame<'_>, at: usize) -> CoreResult<u64> {
    frame
        .payload
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| CoreError::journal_corruption(frame.offset, "short batch header"))
}

fn read_u32(frame: &Frame<'_>, at: usize) -> CoreResult<u32> {
    frame
        .payload
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| CoreError::journal_corruption(frame.offset, "short batch trailer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SyncCursor, WorkoutId};
    use fitsync_storage::InMemoryBackend;

    fn cursor_op(token: &str) -> JournalOp {
        JournalOp::SetCursor {
            cursor: SyncCursor::new(token),
        }
    }

    fn open(backend: &InMemoryBackend) -> (Journal, Recovered) {
        Journal::open(Box::new(backend.clone()), true).unwrap()
    }

    #[test]
    fn committed_batches_replay_in_order() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, recovered) = open(&backend);
            assert!(recovered.batches.is_empty());
            assert_eq!(journal.commit(&[cursor_op("a")]).unwrap(), 1);
            assert_eq!(
                journal
                    .commit(&[cursor_op("b"), JournalOp::Discard { target: WorkoutId::new() }])
                    .unwrap(),
                2
            );
        }

        let (mut journal, recovered) = open(&backend);
        assert_eq!(recovered.batches.len(), 2);
        assert_eq!(recovered.batches[0], vec![cursor_op("a")]);
        assert_eq!(recovered.batches[1].len(), 2);
        assert_eq!(recovered.discarded_bytes, 0);
        assert_eq!(journal.commit(&[]).unwrap(), 3);
    }

    #[test]
    fn torn_batch_is_discarded_and_truncated() {
        let backend = InMemoryBackend::new();
        let committed_size = {
            let (mut journal, _) = open(&backend);
            journal.commit(&[cursor_op("kept")]).unwrap();
            let size = journal.size().unwrap();
            journal.commit(&[cursor_op("lost"), cursor_op("lost too")]).unwrap();
            size
        };

        // Chop the second batch somewhere inside its commit frame.
        let full = backend.data();
        let mut torn = backend.clone();
        torn.truncate(full.len() as u64 - 3).unwrap();

        let (_, recovered) = open(&backend);
        assert_eq!(recovered.batches, vec![vec![cursor_op("kept")]]);
        assert!(recovered.discarded_bytes > 0);
        assert_eq!(backend.data().len() as u64, committed_size);
    }

    #[test]
    fn complete_frames_without_commit_are_discarded() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, _) = open(&backend);
            journal.commit(&[cursor_op("kept")]).unwrap();
        }
        let mut raw = backend.clone();
        let mut tail = Vec::new();
        encode_frame(&mut tail, FrameKind::Begin, &2u64.to_le_bytes()).unwrap();
        encode_frame(&mut tail, FrameKind::Op, &to_cbor(&cursor_op("orphan")).unwrap()).unwrap();
        raw.append(&tail).unwrap();

        let (_, recovered) = open(&backend);
        assert_eq!(recovered.batches.len(), 1);
        assert_eq!(recovered.discarded_bytes, tail.len() as u64);
    }

    #[test]
    fn checksum_failure_is_fatal() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, _) = open(&backend);
            journal.commit(&[cursor_op("x")]).unwrap();
            journal.commit(&[cursor_op("y")]).unwrap();
        }
        backend.corrupt_byte(20, 0xAA);

        let result = Journal::open(Box::new(backend.clone()), true);
        assert!(matches!(result, Err(err) if err.is_corruption()));
    }

    #[test]
    fn rewrite_replaces_history() {
        let backend = InMemoryBackend::new();
        {
            let (mut journal, _) = open(&backend);
            for i in 0..10 {
                journal.commit(&[cursor_op(&format!("c{i}"))]).unwrap();
            }
            let before = journal.size().unwrap();
            journal.rewrite(&[cursor_op("c9")]).unwrap();
            assert!(journal.size().unwrap() < before);
            journal.commit(&[cursor_op("c10")]).unwrap();
        }

        let (_, recovered) = open(&backend);
        assert_eq!(
            recovered.batches,
            vec![vec![cursor_op("c9")], vec![cursor_op("c10")]]
        );
    }
}
