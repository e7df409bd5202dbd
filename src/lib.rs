//! coldpack bundles large populations of small objects held in blob
//! storage into single append-only tar archives, each indexed by a
//! companion CSV manifest.  Per-object storage and request overhead
//! collapses, while any individual original stays retrievable through one
//! manifest lookup and one range read.
//!
//! The four operations, in lifecycle order:
//!
//! - [`archive::archive`] streams every object under a prefix into a tar
//!   archive, recording exact byte offsets in the manifest as it goes.
//! - [`validate::validate`] re-derives every payload from the archive via
//!   range reads and proves it against the manifest (and, optionally, the
//!   live source).
//! - [`delete::delete`] removes source objects the manifest lists, batched
//!   and idempotent, dry-run by default.
//! - [`extract::extract`] serves one original back with a single range
//!   read located purely from manifest metadata.

#![forbid(unsafe_code)]

pub mod archive;
pub mod delete;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod manifest;
pub mod store;
pub mod tarball;
pub mod validate;

pub use error::{Error, Result};

/// Tar block granularity: headers are one block, payloads are padded to a
/// block boundary, and the archive ends with two zero blocks.
pub const TAR_BLOCK_SIZE: u64 = 512;
