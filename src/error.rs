//! Error types for the coldpack library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, Error>`.  The variants follow the failure taxonomy of the
//! four operations:
//!
//! - **archive** is all-or-nothing: [`Listing`], [`Fetch`], [`SizeMismatch`]
//!   and [`Write`] abort the run and the half-written archive/manifest pair
//!   must be discarded.
//! - **validate** collects every per-key mismatch and surfaces them together
//!   as a single [`Validation`] failure.
//! - **delete** collects per-key failures into [`Delete`]; a partial batch
//!   failure never aborts the remaining batch.
//! - **extract** fails fast with [`NotFound`] before touching the network.
//!
//! [`Listing`]: Error::Listing
//! [`Fetch`]: Error::Fetch
//! [`SizeMismatch`]: Error::SizeMismatch
//! [`Write`]: Error::Write
//! [`Validation`]: Error::Validation
//! [`Delete`]: Error::Delete
//! [`NotFound`]: Error::NotFound

use crate::validate::MismatchReport;

/// Result type alias for operations that may return a coldpack [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for archive, validate, delete and extract operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Enumerating the source prefix failed.  Listing errors are never
    /// retried: they usually indicate a permission or endpoint problem.
    #[error("listing failed under {prefix}: {source}")]
    Listing {
        prefix: String,
        source: object_store::Error,
    },

    /// Fetching an object body failed even after the bounded retry budget
    /// was exhausted.
    #[error("fetch failed for {key} after {attempts} attempts: {source}")]
    Fetch {
        key: String,
        attempts: u32,
        source: object_store::Error,
    },

    /// A fetched body did not have the size reported by the listing.
    #[error("object size mismatch for {key}: listed {listed}, fetched {fetched}")]
    SizeMismatch {
        key: String,
        listed: u64,
        fetched: u64,
    },

    /// Writing to the archive or manifest stream failed.  The stream
    /// position is unreliable from here on, so the operation aborts.
    #[error("archive write failed: {0}")]
    Write(#[from] std::io::Error),

    /// Serializing or parsing a manifest row failed.
    #[error("manifest error: {0}")]
    Manifest(#[from] csv::Error),

    /// A manifest contains the same key twice.
    #[error("duplicate key in manifest: {0}")]
    DuplicateKey(String),

    /// One or more rows failed validation.  The report names every
    /// offending key.
    #[error("{0}")]
    Validation(MismatchReport),

    /// Some keys could not be deleted.  The remaining batches were still
    /// processed; this summarizes the per-key failures.
    #[error("failed to delete {failed} of {requested} keys")]
    Delete { failed: usize, requested: usize },

    /// The requested key is not present in the manifest.
    #[error("key not found in manifest: {0}")]
    NotFound(String),

    /// The source prefix matched no objects; an empty archive is never
    /// written.
    #[error("no objects found under {0}")]
    EmptySource(String),

    /// The manifest contains no rows.
    #[error("no entries found in manifest {0}")]
    EmptyManifest(String),

    /// The object key cannot be represented as a tar entry, for example a
    /// key ending in `/` or one too long for a ustar name/prefix split.
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// An output already exists and `--overwrite` was not given.
    #[error("{0} already exists")]
    WouldOverwrite(String),

    /// A storage URL could not be parsed or its scheme is unsupported.
    #[error("invalid store url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Any other storage backend failure.
    #[error("storage error: {0}")]
    Store(#[from] object_store::Error),
}
