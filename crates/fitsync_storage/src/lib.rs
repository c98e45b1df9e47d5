//! # fitsync storage
//!
//! Persistence substrate for the fitsync workout store.
//!
//! A backend is an **opaque, append-oriented byte store**. It knows nothing
//! about journal frames, workout records or mutation entries; the core crate
//! owns every byte of interpretation.
//!
//! ## Operations
//!
//! - positional reads and tail appends
//! - `flush`/`sync` for durability
//! - `truncate` for dropping a torn journal tail after recovery
//! - `replace` for atomic whole-content rewrites during compaction
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and ephemeral stores
//! - [`FileBackend`] - a single OS file
//!
//! ## Example
//!
//! ```rust
//! use fitsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"FJNL").unwrap();
//! assert_eq!(backend.read_at(offset, 4).unwrap(), b"FJNL");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
