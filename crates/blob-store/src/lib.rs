//! Abstraction over a remote blob store with weak-consistency conditional
//! primitives (ETag, `If-Match`, `If-None-Match`).
//!
//! Callers keep a copy of the etag the store returned on their last
//! successful read or write and attach it to follow-up requests. The store
//! answers `NotModified` when a conditional read observes no change and
//! `PreconditionFailed` when a conditional write lost a race, which lets
//! callers implement optimistic concurrency without server-side locks.

mod memory;

pub use memory::InMemoryBlobStore;

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The blob does not exist.
    #[error("blob not found")]
    NotFound,
    /// A conditional write lost the race against another writer.
    #[error("precondition failed")]
    PreconditionFailed,
    /// Anything else, including transient connectivity problems.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Version information the store assigns to a blob on every write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    /// Opaque version token. Two reads returning the same etag observed the
    /// same content.
    pub etag: String,
    /// Server-recorded modification time.
    pub mtime: DateTime<Utc>,
}

/// Outcome of a conditional download.
#[derive(Clone, Debug)]
pub enum Download {
    Fetched { content: Vec<u8>, info: BlobInfo },
    /// The blob still matches the etag the caller sent along.
    NotModified,
}

/// Condition attached to an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional overwrite.
    None,
    /// `If-Match`: only write if the blob still carries this etag.
    IfMatch(String),
    /// `If-None-Match: *`: only write if the blob does not exist yet
    /// (RFC 9110 creation-only semantics).
    IfAbsent,
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Returns the current version information of a blob.
    async fn stat(&self, path: &str) -> Result<BlobInfo, Error>;

    /// Downloads a blob. With `if_none_match` set, returns
    /// [`Download::NotModified`] when the blob still carries that etag.
    async fn download(
        &self,
        path: &str,
        if_none_match: Option<String>,
    ) -> Result<Download, Error>;

    /// Uploads a blob under the given write condition and returns the
    /// version information of the newly written content.
    async fn upload(
        &self,
        path: &str,
        content: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<BlobInfo, Error>;

    /// Creates the directory if it is missing. Idempotent.
    async fn make_dir_if_not_exist(&self, path: &str) -> Result<(), Error>;

    /// Deletes a blob. Deleting a missing blob is a no-op.
    async fn delete(&self, path: &str) -> Result<(), Error>;
}

impl Error {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Returns the parent directory of a blob path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit_once('/').map(|(dir, _)| dir).filter(|dir| !dir.is_empty())
}
