/// Errors surfaced by the share manager.
///
/// `PreconditionFailed` and `NotModified` outcomes of the blob store never
/// appear here; the caches consume them internally as part of the
/// sync-and-retry protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown share, key or reference. Also covers access denials so the
    /// existence of a share is never disclosed to third parties.
    #[error("share not found")]
    NotFound,
    /// A share for the same `(resource, grantee)` pair already exists.
    #[error("share already exists")]
    AlreadyExists,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Blob-store failure that survived the retry budget.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<blob_store::Error> for Error {
    fn from(err: blob_store::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
