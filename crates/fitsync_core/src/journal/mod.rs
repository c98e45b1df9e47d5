//! Durable journal of store changes.
//!
//! Every change to records, the mutation queue or the sync cursor is
//! written here before it becomes visible. Changes are grouped into
//! batches; a batch is the unit of atomicity.
//!
//! ## Frame Format
//!
//! ```text
//! | magic "FJNL" (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! A batch is a `Begin` frame, one `Op` frame per [`JournalOp`] (CBOR), and
//! a `Commit` frame carrying the batch id and op count.
//!
//! ## Recovery Policy
//!
//! Tolerated, treated as the end of the log and truncated away:
//!
//! - a frame cut short by the end of the file
//! - complete frames of a batch whose `Commit` never made it
//!
//! Fatal, the store refuses to open:
//!
//! - CRC mismatch
//! - bad magic, unknown kind, future version
//! - a `Commit` that does not match its `Begin`
//!
//! ## Invariants
//!
//! - a batch is flushed before the commit call returns
//! - only committed batches are replayed
//! - replay is deterministic: ops carry all their inputs

mod frame;
mod op;
mod writer;

pub use frame::{
    compute_crc32, encode_frame, Frame, FrameKind, FrameReader, FRAME_MAGIC, FRAME_VERSION,
};
pub use op::JournalOp;
pub use writer::{Journal, Recovered};
