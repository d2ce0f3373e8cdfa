//! # sandfs-backend
//!
//! Handle-based blob backend abstraction for sandfs.
//!
//! The storage substrate sandfs targets exposes named blobs with two access
//! modes: an exclusive random-access session (seekable read/write/truncate)
//! and a buffered stream that replaces the blob wholesale on close. At most
//! one exclusive session may be open on a given blob; a second open raises
//! `SessionBusy`. The packed storage engine and the link table never open
//! sessions directly without going through the access serializer, which
//! exists precisely because of that restriction.
//!
//! `DirBackend` is the reference implementation: one file per blob under a
//! root directory, driven by `tokio::fs`. It enforces the single-session
//! restriction in-process so that misuse of the serializer is observable
//! under test rather than silently tolerated.

#![allow(async_fn_in_trait)]

mod dir;

pub use dir::{DirBackend, DirSession, DirStream};

use std::io;

use thiserror::Error;

/// Errors raised by a blob backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("exclusive session already open on {0}")]
    SessionBusy(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Named-blob storage with exclusive random-access sessions and
/// buffered rewrite streams.
pub trait BlobBackend: Send + Sync + 'static {
    type Session: AccessSession;
    type Stream: WriteStream;

    /// Open an exclusive random-access session on the named blob.
    ///
    /// With `create` set, a missing blob is created empty; otherwise a
    /// missing blob is `NotFound`. A second session on the same blob while
    /// one is open is `SessionBusy`.
    async fn open_session(&self, name: &str, create: bool) -> Result<Self::Session>;

    /// Open a buffered write stream that replaces the named blob on close.
    async fn open_stream(&self, name: &str) -> Result<Self::Stream>;

    /// Whether the named blob exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Remove the named blob. Returns whether it existed.
    async fn remove(&self, name: &str) -> Result<bool>;
}

/// Exclusive, seekable access to one blob.
///
/// Dropping a session releases its exclusivity reservation; `close` does the
/// same after flushing.
pub trait AccessSession: Send {
    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short only at end of blob.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `data` starting at `offset`, extending the blob if needed.
    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<()>;

    /// Truncate or extend the blob to exactly `size` bytes.
    async fn truncate(&mut self, size: u64) -> Result<()>;

    /// Current size of the blob in bytes.
    async fn size(&mut self) -> Result<u64>;

    /// Flush and release the session.
    async fn close(self) -> Result<()>;
}

/// Buffered whole-blob writer.
pub trait WriteStream: Send {
    /// Append bytes to the pending content.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Atomically replace the blob with the pending content.
    async fn close(self) -> Result<()>;
}
