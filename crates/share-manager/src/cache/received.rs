use {
    crate::{
        error::Error,
        model::{ReceivedState, ShareId, SpaceKey},
    },
    blob_store::{BlobStore, Download, WriteCondition, parent_dir},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
};

const MAX_PERSIST_ATTEMPTS: usize = 2;

/// Per-user overlay carrying state and mount point for every share the user
/// received, persisted as one JSON blob per user under
/// `/users/{userID}/received.json`.
///
/// Group shares have no entry here until the member explicitly updates
/// state or mount point; until then the member inherits the implicit
/// pending state from the group index.
///
/// Unlike the provider cache, staleness is detected by statting the blob
/// and comparing the store's mtime against the mtime of the version held
/// in memory; the etag only keeps writes conditional.
#[derive(Clone)]
pub struct UserReceivedCache(Arc<Inner>);

struct Inner {
    store: Arc<dyn BlobStore>,
    users: Mutex<HashMap<String, Arc<tokio::sync::Mutex<UserIndex>>>>,
}

struct UserIndex {
    /// Server mtime of the blob version in memory. Zero until the first
    /// download, which is what forces it.
    mtime: DateTime<Utc>,
    spaces: HashMap<SpaceKey, SpaceStates>,
    etag: String,
}

impl Default for UserIndex {
    fn default() -> Self {
        Self {
            mtime: DateTime::UNIX_EPOCH,
            spaces: HashMap::default(),
            etag: String::new(),
        }
    }
}

/// Receiver state per share of one space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpaceStates {
    #[serde(rename = "Mtime")]
    pub mtime: DateTime<Utc>,
    #[serde(rename = "States", default)]
    pub states: HashMap<ShareId, ReceivedState>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "Mtime")]
    mtime: DateTime<Utc>,
    #[serde(rename = "Spaces")]
    spaces: &'a HashMap<SpaceKey, SpaceStates>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "Spaces", default)]
    spaces: HashMap<SpaceKey, SpaceStates>,
}

impl UserReceivedCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self(Arc::new(Inner {
            store,
            users: Mutex::default(),
        }))
    }

    /// Upserts the receiver state for one share and persists the user's
    /// blob.
    pub async fn add(
        &self,
        user: &str,
        key: &SpaceKey,
        id: &ShareId,
        state: ReceivedState,
    ) -> Result<(), Error> {
        ensure_user(user)?;
        let shard = self.shard(user);
        let mut index = shard.lock().await;
        self.sync(&mut index, user).await?;
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            let now = Utc::now();
            let space = index.spaces.entry(key.clone()).or_insert_with(|| {
                SpaceStates {
                    mtime: now,
                    states: HashMap::default(),
                }
            });
            space.mtime = now;
            space.states.insert(id.clone(), state.clone());
            match self.persist(&mut index, user).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_precondition_failed() => {
                    self.sync(&mut index, user).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(blob_store::Error::PreconditionFailed.into())
    }

    /// Drops the receiver state of one share, if any.
    pub async fn remove(
        &self,
        user: &str,
        key: &SpaceKey,
        id: &ShareId,
    ) -> Result<(), Error> {
        ensure_user(user)?;
        let shard = self.shard(user);
        let mut index = shard.lock().await;
        self.sync(&mut index, user).await?;
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            let now = Utc::now();
            let Some(space) = index.spaces.get_mut(key) else {
                return Ok(());
            };
            if space.states.remove(id).is_none() {
                return Ok(());
            }
            space.mtime = now;
            if space.states.is_empty() {
                index.spaces.remove(key);
            }
            match self.persist(&mut index, user).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_precondition_failed() => {
                    self.sync(&mut index, user).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(blob_store::Error::PreconditionFailed.into())
    }

    /// In-memory lookup, no sync. Callers wanting freshness call
    /// [`Self::sync_user`] (or [`Self::list`]) first.
    pub async fn get(
        &self,
        user: &str,
        key: &SpaceKey,
        id: &ShareId,
    ) -> Result<Option<ReceivedState>, Error> {
        ensure_user(user)?;
        let shard = self.shard(user);
        let index = shard.lock().await;
        Ok(index
            .spaces
            .get(key)
            .and_then(|space| space.states.get(id))
            .cloned())
    }

    /// Brings the user's overlay up to date with the store.
    pub async fn sync_user(&self, user: &str) -> Result<(), Error> {
        ensure_user(user)?;
        let shard = self.shard(user);
        let mut index = shard.lock().await;
        self.sync(&mut index, user).await
    }

    /// Returns a shallow copy of the user's overlay, synced first.
    pub async fn list(
        &self,
        user: &str,
    ) -> Result<HashMap<SpaceKey, SpaceStates>, Error> {
        ensure_user(user)?;
        let shard = self.shard(user);
        let mut index = shard.lock().await;
        self.sync(&mut index, user).await?;
        Ok(index.spaces.clone())
    }

    fn shard(&self, user: &str) -> Arc<tokio::sync::Mutex<UserIndex>> {
        let mut users = self.0.users.lock().unwrap();
        users.entry(user.to_owned()).or_default().clone()
    }

    /// Stats the blob and downloads it only when the on-store mtime is
    /// later than the one in memory. A successful download replaces the
    /// in-memory view entirely.
    async fn sync(&self, index: &mut UserIndex, user: &str) -> Result<(), Error> {
        let path = received_path(user);
        let mut retried = false;
        loop {
            match self.0.store.stat(&path).await {
                Ok(info) => {
                    if info.mtime <= index.mtime {
                        return Ok(());
                    }
                    break;
                }
                Err(err) if err.is_not_found() => {
                    // Never persisted, or deleted from under us.
                    if !index.etag.is_empty() {
                        *index = UserIndex::default();
                    }
                    return Ok(());
                }
                Err(err) if !retried => {
                    tracing::debug!(?err, %path, "stat failed, retrying once");
                    retried = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let mut retried = false;
        loop {
            match self.0.store.download(&path, None).await {
                Ok(Download::Fetched { content, info }) => {
                    match serde_json::from_slice::<WireIn>(&content) {
                        Ok(wire) => index.spaces = wire.spaces,
                        Err(err) => {
                            tracing::error!(
                                ?err,
                                %path,
                                "corrupt received shard, treating as empty",
                            );
                            index.spaces = HashMap::default();
                        }
                    }
                    index.mtime = info.mtime;
                    index.etag = info.etag;
                    return Ok(());
                }
                Ok(Download::NotModified) => return Ok(()),
                // Deleted between the stat and the download.
                Err(err) if err.is_not_found() => {
                    *index = UserIndex::default();
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

    /// Stamps the user's wire mtime with now, marshals and uploads
    /// conditionally, then adopts the server's etag and mtime so the next
    /// sync recognizes our own write as current.
    async fn persist(
        &self,
        index: &mut UserIndex,
        user: &str,
    ) -> Result<(), blob_store::Error> {
        let path = received_path(user);
        let content = serde_json::to_vec(&WireOut {
            mtime: Utc::now(),
            spaces: &index.spaces,
        })
        .map_err(anyhow::Error::from)?;
        if let Some(dir) = parent_dir(&path) {
            self.0.store.make_dir_if_not_exist(dir).await?;
        }
        let condition = if index.etag.is_empty() {
            WriteCondition::IfAbsent
        } else {
            WriteCondition::IfMatch(index.etag.clone())
        };
        let info = self.0.store.upload(&path, content, condition).await?;
        index.mtime = info.mtime;
        index.etag = info.etag;
        Ok(())
    }
}

fn received_path(user: &str) -> String {
    format!("/users/{user}/received.json")
}

fn ensure_user(user: &str) -> Result<(), Error> {
    if user.is_empty() {
        return Err(Error::invalid("missing user id"));
    }
    Ok(())
}
