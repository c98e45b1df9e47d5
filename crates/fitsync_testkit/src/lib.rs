//! # fitsync Testkit
//!
//! Test utilities for fitsync.
//!
//! This crate provides:
//! - A storage backend that simulates crashes mid-write
//! - Test fixtures: stores on a controllable clock, sample sessions
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fitsync_testkit::prelude::*;
//!
//! #[test]
//! fn survives_torn_write() {
//!     let fixture = TestStore::memory();
//!     let crash = fixture.crashable();
//!     // ... arm the crash, write, reopen, check
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
