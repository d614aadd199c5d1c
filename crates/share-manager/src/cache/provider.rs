use {
    crate::{
        error::Error,
        model::{Share, ShareId, SpaceKey},
    },
    blob_store::{BlobStore, Download, WriteCondition, parent_dir},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
};

/// Upper bound on sync-then-replay rounds after a lost etag race. Races are
/// resolved by another writer finishing, so there is no backoff.
const MAX_PERSIST_ATTEMPTS: usize = 100;

/// Authoritative map of all shares per storage space, persisted as one JSON
/// blob per space under `/storages/{storageID}/{spaceID}.json`.
///
/// Internally reference counted for cheap clones and easy sharing. Every
/// space has its own lock which is held across the whole
/// sync-mutate-persist sequence of an operation, including the blob-store
/// round-trips.
#[derive(Clone)]
pub struct ProviderCache(Arc<Inner>);

struct Inner {
    store: Arc<dyn BlobStore>,
    spaces: Mutex<HashMap<SpaceKey, Arc<tokio::sync::Mutex<SpaceShares>>>>,
}

/// All shares of one space plus the etag the store returned on the write
/// that produced the blob they were read from.
#[derive(Default)]
struct SpaceShares {
    shares: HashMap<ShareId, Share>,
    etag: String,
}

/// Shallow copy of a space's shares as returned by [`ProviderCache::list_space`].
#[derive(Clone, Debug)]
pub struct SpaceSnapshot {
    pub shares: HashMap<ShareId, Share>,
    pub etag: String,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "Shares")]
    shares: &'a HashMap<ShareId, Share>,
    #[serde(rename = "etag", skip_serializing_if = "str::is_empty")]
    etag: &'a str,
}

#[derive(Default, Deserialize)]
struct WireIn {
    #[serde(rename = "Shares", default)]
    shares: HashMap<ShareId, serde_json::Value>,
}

impl ProviderCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self(Arc::new(Inner {
            store,
            spaces: Mutex::default(),
        }))
    }

    /// Writes the share into the space's shard and persists it.
    ///
    /// Fails with [`Error::AlreadyExists`] if a *different* share for the
    /// same `(resource, grantee)` pair exists; the check runs inside the
    /// space lock on every persist attempt, so racing creates lose
    /// deterministically even across replicas.
    pub async fn add(
        &self,
        storage_id: &str,
        space_id: &str,
        id: &ShareId,
        share: Share,
    ) -> Result<(), Error> {
        ensure_ids(storage_id, space_id, Some(id))?;
        let shard = self.shard(storage_id, space_id);
        let mut space = shard.lock().await;
        self.sync(&mut space, storage_id, space_id).await?;
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            let colliding = space.shares.values().any(|existing| {
                existing.id != *id
                    && existing.resource_id == share.resource_id
                    && existing.grantee == share.grantee
            });
            if colliding {
                return Err(Error::AlreadyExists);
            }
            space.shares.insert(id.clone(), share.clone());
            match self.persist(&mut space, storage_id, space_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_precondition_failed() => {
                    self.sync(&mut space, storage_id, space_id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        tracing::warn!(
            storage_id,
            space_id,
            share = %id,
            "persist retry budget exhausted",
        );
        Err(blob_store::Error::PreconditionFailed.into())
    }

    /// Removes the share from the space's shard. Removing a share that is
    /// not present is a no-op.
    pub async fn remove(
        &self,
        storage_id: &str,
        space_id: &str,
        id: &ShareId,
    ) -> Result<(), Error> {
        ensure_ids(storage_id, space_id, Some(id))?;
        let shard = self.shard(storage_id, space_id);
        let mut space = shard.lock().await;
        self.sync(&mut space, storage_id, space_id).await?;
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            if space.shares.remove(id).is_none() {
                return Ok(());
            }
            match self.persist(&mut space, storage_id, space_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_precondition_failed() => {
                    self.sync(&mut space, storage_id, space_id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        tracing::warn!(
            storage_id,
            space_id,
            share = %id,
            "persist retry budget exhausted",
        );
        Err(blob_store::Error::PreconditionFailed.into())
    }

    /// Looks a share up by ID. `skip_sync` is only passed by callers that
    /// already hold equivalent freshness guarantees for this space.
    pub async fn get(
        &self,
        storage_id: &str,
        space_id: &str,
        id: &ShareId,
        skip_sync: bool,
    ) -> Result<Option<Share>, Error> {
        ensure_ids(storage_id, space_id, Some(id))?;
        let shard = self.shard(storage_id, space_id);
        let mut space = shard.lock().await;
        if !skip_sync {
            self.sync(&mut space, storage_id, space_id).await?;
        }
        Ok(space.shares.get(id).cloned())
    }

    /// Returns a shallow copy of the space's shares plus the current etag,
    /// synced first.
    pub async fn list_space(
        &self,
        storage_id: &str,
        space_id: &str,
    ) -> Result<SpaceSnapshot, Error> {
        ensure_ids(storage_id, space_id, None)?;
        let shard = self.shard(storage_id, space_id);
        let mut space = shard.lock().await;
        self.sync(&mut space, storage_id, space_id).await?;
        Ok(SpaceSnapshot {
            shares: space.shares.clone(),
            etag: space.etag.clone(),
        })
    }

    fn shard(
        &self,
        storage_id: &str,
        space_id: &str,
    ) -> Arc<tokio::sync::Mutex<SpaceShares>> {
        let key = SpaceKey::new(storage_id, space_id);
        let mut spaces = self.0.spaces.lock().unwrap();
        spaces.entry(key).or_default().clone()
    }

    /// Brings the in-memory shard up to date. Three terminal outcomes:
    /// a newer blob replaces the in-memory content and etag, `NotModified`
    /// confirms the in-memory view, `NotFound` means the first persist will
    /// create the blob. Transient failures get one silent retry.
    async fn sync(
        &self,
        space: &mut SpaceShares,
        storage_id: &str,
        space_id: &str,
    ) -> Result<(), Error> {
        let path = shard_path(storage_id, space_id);
        let if_none_match = (!space.etag.is_empty()).then(|| space.etag.clone());
        let mut retried = false;
        loop {
            match self.0.store.download(&path, if_none_match.clone()).await {
                Ok(Download::Fetched { content, info }) => {
                    space.shares = decode_shares(&content, &path);
                    space.etag = info.etag;
                    return Ok(());
                }
                Ok(Download::NotModified) => return Ok(()),
                Err(err) if err.is_not_found() => {
                    // The blob disappeared from under us; forget the stale
                    // view so the next persist recreates it.
                    if !space.etag.is_empty() {
                        *space = SpaceShares::default();
                    }
                    return Ok(());
                }
                Err(err) if !retried => {
                    tracing::debug!(?err, %path, "download failed, retrying once");
                    retried = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn persist(
        &self,
        space: &mut SpaceShares,
        storage_id: &str,
        space_id: &str,
    ) -> Result<(), blob_store::Error> {
        let path = shard_path(storage_id, space_id);
        let content = serde_json::to_vec(&WireOut {
            shares: &space.shares,
            etag: &space.etag,
        })
        .map_err(anyhow::Error::from)?;
        if let Some(dir) = parent_dir(&path) {
            self.0.store.make_dir_if_not_exist(dir).await?;
        }
        let condition = if space.etag.is_empty() {
            WriteCondition::IfAbsent
        } else {
            WriteCondition::IfMatch(space.etag.clone())
        };
        let info = self.0.store.upload(&path, content, condition).await?;
        space.etag = info.etag;
        Ok(())
    }
}

fn shard_path(storage_id: &str, space_id: &str) -> String {
    format!("/storages/{storage_id}/{space_id}.json")
}

fn ensure_ids(
    storage_id: &str,
    space_id: &str,
    share_id: Option<&ShareId>,
) -> Result<(), Error> {
    if storage_id.is_empty() {
        return Err(Error::invalid("missing storage id"));
    }
    if space_id.is_empty() {
        return Err(Error::invalid("missing space id"));
    }
    if share_id.is_some_and(|id| id.as_str().is_empty()) {
        return Err(Error::invalid("missing share id"));
    }
    Ok(())
}

/// Decodes a space shard, share by share. A corrupt blob yields an empty
/// shard, a corrupt entry is skipped; neither ever fails the caller.
fn decode_shares(content: &[u8], path: &str) -> HashMap<ShareId, Share> {
    let wire: WireIn = match serde_json::from_slice(content) {
        Ok(wire) => wire,
        Err(err) => {
            tracing::error!(?err, path, "corrupt space shard, treating as empty");
            return HashMap::default();
        }
    };
    wire.shares
        .into_iter()
        .filter_map(|(id, value)| match serde_json::from_value::<Share>(value) {
            Ok(share) => Some((id, share)),
            Err(err) => {
                tracing::warn!(?err, path, share = %id, "skipping undecodable share");
                None
            }
        })
        .collect()
}
