//! In-memory [`BlobStore`] with full conditional-write semantics.
//!
//! Etags are minted from a store-wide monotonic counter, so every write
//! observably advances the version of the blob it touches. Clones share the
//! same underlying state which makes the store double as a stand-in for a
//! remote server shared between several manager replicas in tests.

use {
    crate::{BlobInfo, BlobStore, Download, Error, WriteCondition},
    chrono::Utc,
    std::{
        collections::{HashMap, HashSet},
        sync::{
            Arc, Mutex,
            atomic::{AtomicU64, Ordering},
        },
    },
};

#[derive(Clone, Default)]
pub struct InMemoryBlobStore(Arc<Inner>);

#[derive(Default)]
struct Inner {
    blobs: Mutex<HashMap<String, Blob>>,
    dirs: Mutex<HashSet<String>>,
    version: AtomicU64,
}

struct Blob {
    content: Vec<u8>,
    info: BlobInfo,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        let version = self.0.version.fetch_add(1, Ordering::Relaxed) + 1;
        format!("\"{version}\"")
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn stat(&self, path: &str) -> Result<BlobInfo, Error> {
        let blobs = self.0.blobs.lock().unwrap();
        blobs.get(path).map(|blob| blob.info.clone()).ok_or(Error::NotFound)
    }

    async fn download(
        &self,
        path: &str,
        if_none_match: Option<String>,
    ) -> Result<Download, Error> {
        let blobs = self.0.blobs.lock().unwrap();
        let blob = blobs.get(path).ok_or(Error::NotFound)?;
        if if_none_match.is_some_and(|etag| etag == blob.info.etag) {
            return Ok(Download::NotModified);
        }
        Ok(Download::Fetched {
            content: blob.content.clone(),
            info: blob.info.clone(),
        })
    }

    async fn upload(
        &self,
        path: &str,
        content: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<BlobInfo, Error> {
        let mut blobs = self.0.blobs.lock().unwrap();
        match &condition {
            WriteCondition::None => (),
            WriteCondition::IfMatch(etag) => {
                let current = blobs.get(path).ok_or(Error::PreconditionFailed)?;
                if current.info.etag != *etag {
                    return Err(Error::PreconditionFailed);
                }
            }
            WriteCondition::IfAbsent => {
                if blobs.contains_key(path) {
                    return Err(Error::PreconditionFailed);
                }
            }
        }
        let info = BlobInfo {
            etag: self.next_etag(),
            mtime: Utc::now(),
        };
        blobs.insert(path.to_owned(), Blob {
            content,
            info: info.clone(),
        });
        Ok(info)
    }

    async fn make_dir_if_not_exist(&self, path: &str) -> Result<(), Error> {
        self.0.dirs.lock().unwrap().insert(path.trim_end_matches('/').to_owned());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        self.0.blobs.lock().unwrap().remove(path);
        Ok(())
    }
}
