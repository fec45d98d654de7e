//! # Content-addressed filesystem tree repository
//!
//! This crate implements the write side of a repository storing immutable,
//! content-addressed filesystem objects: file content, directory metadata,
//! directory trees, and commits binding a tree root to a branch. Objects are
//! named by the SHA-256 of their canonical serialization and stored as loose
//! files under `objects/XX/`, placed atomically via rename so that readers
//! only ever observe complete objects.
//!
//! The entry point is [`Repo`]: open or initialize a repository, start a
//! transaction with [`Repo::prepare_transaction`], ingest a directory tree
//! with [`Repo::write_directory_to_mtree`] (optionally priming the hardlink
//! cache via [`Repo::scan_hardlinks`]), serialize the resulting
//! [`MutableTree`] with [`Repo::write_mtree`], stamp a commit with
//! [`Repo::write_commit`], stage the branch update with [`Repo::set_ref`],
//! and finish with [`Repo::commit_transaction`].

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::fmt::Display;

mod cancellable;
mod checksum;
mod commit;
mod content;
mod devino;
mod mtree;
mod objgv;
mod objtype;
mod refs;
mod repo;
pub mod tokio_util;
mod variant_utils;
mod write;

pub use cancellable::Cancellable;
pub use checksum::Checksum;
pub use commit::{CommitFilter, CommitFilterResult, CommitModifier, CommitModifierFlags};
pub use content::{file_content_stream, FileHeader, FileMeta};
pub use mtree::MutableTree;
pub use objtype::{ObjectType, StorageMode};
pub use repo::{CommitInfo, DirMetaInfo, Repo, TransactionStats};

/// Errors returned by repository operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Cancellation was observed.
    #[error("operation was cancelled")]
    Cancelled,
    /// An underlying I/O operation failed.
    #[error("{context}: {source}")]
    Io {
        /// The operation that failed.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A verified write found different content than was promised.
    #[error("corrupted {objtype} object {expected} (actual checksum is {actual})")]
    Corrupt {
        /// The kind of object being written.
        objtype: ObjectType,
        /// The checksum the caller promised.
        expected: String,
        /// The checksum the content actually hashed to.
        actual: String,
    },
    /// The source tree contains a file type the store cannot represent
    /// (device, socket, fifo, ...).
    #[error("unsupported file type {0:#o}")]
    UnsupportedFileType(u32),
    /// API misuse relative to the transaction state machine.
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
    /// No unique temporary name could be allocated.
    #[error("exhausted attempts to create temporary {0}")]
    Exhausted(&'static str),
    /// Applying a staged ref update failed.
    #[error("updating ref {refspec}: {source}")]
    RefUpdate {
        /// The refspec that could not be updated.
        refspec: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach operation context to fallible I/O, analogous to
/// `anyhow::Context` but producing our typed error.
pub(crate) trait IoContext<T> {
    fn io_context<C: Display>(self, context: C) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: context.to_string(),
            source,
        })
    }
}

impl<T> IoContext<T> for std::result::Result<T, rustix::io::Errno> {
    fn io_context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|errno| Error::Io {
            context: context.to_string(),
            source: errno.into(),
        })
    }
}

impl<T> IoContext<T> for std::result::Result<T, openssl::error::ErrorStack> {
    fn io_context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| Error::Io {
            context: context.to_string(),
            source: std::io::Error::other(e),
        })
    }
}
