use {
    crate::{
        error::Error,
        model::{ShareId, SpaceKey},
    },
    blob_store::{BlobStore, Download, WriteCondition, parent_dir},
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeSet, HashMap},
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
};

/// Index-cache writes only race with other writers of the same subject, so a
/// single replay is enough before surfacing the conflict.
const MAX_PERSIST_ATTEMPTS: usize = 2;

/// Per-subject index of share IDs grouped by space key, persisted as one
/// JSON blob per subject under `/{namespace}/{subject}/{filename}`.
///
/// Instantiated once per index the manager keeps: share IDs a user created
/// (`users` / `created.json`) and share IDs granted to a group
/// (`groups` / `received.json`). The wire format is identical for both, so
/// the blobs stay shape-compatible regardless of the subject kind.
///
/// Reads go through a per-subject TTL gate: within `ttl` of the last sync
/// the blob store is not consulted at all, bounding coordination cost under
/// read pressure at the price of `ttl`-bounded staleness. A zero `ttl`
/// disables the gate.
#[derive(Clone)]
pub struct IndexCache(Arc<Inner>);

struct Inner {
    store: Arc<dyn BlobStore>,
    namespace: &'static str,
    filename: &'static str,
    ttl: Duration,
    subjects: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SubjectIndex>>>>,
}

struct SubjectIndex {
    spaces: HashMap<SpaceKey, SpaceShareIds>,
    mtime: DateTime<Utc>,
    etag: String,
    next_sync: Option<Instant>,
}

impl Default for SubjectIndex {
    fn default() -> Self {
        Self {
            spaces: HashMap::default(),
            mtime: DateTime::UNIX_EPOCH,
            etag: String::new(),
            next_sync: None,
        }
    }
}

/// Share IDs of one space inside a subject's index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpaceShareIds {
    #[serde(rename = "Mtime")]
    pub mtime: DateTime<Utc>,
    #[serde(rename = "IDs", with = "ids_as_map", default)]
    pub ids: BTreeSet<ShareId>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "Mtime")]
    mtime: DateTime<Utc>,
    #[serde(rename = "UserShares")]
    spaces: &'a HashMap<SpaceKey, SpaceShareIds>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "Mtime")]
    mtime: DateTime<Utc>,
    #[serde(rename = "UserShares", default)]
    spaces: HashMap<SpaceKey, SpaceShareIds>,
}

impl IndexCache {
    pub fn new(
        store: Arc<dyn BlobStore>,
        namespace: &'static str,
        filename: &'static str,
        ttl: Duration,
    ) -> Self {
        Self(Arc::new(Inner {
            store,
            namespace,
            filename,
            ttl,
            subjects: Mutex::default(),
        }))
    }

    /// Records that `id` belongs to `subject`, under the space key encoded
    /// in the ID prefix.
    pub async fn add(&self, subject: &str, id: &ShareId) -> Result<(), Error> {
        let key = space_key_of(id)?;
        ensure_subject(subject)?;
        let shard = self.shard(subject);
        let mut index = shard.lock().await;
        self.sync(&mut index, subject, false).await?;
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            let now = Utc::now();
            index.mtime = now;
            let space = index.spaces.entry(key.clone()).or_insert_with(|| {
                SpaceShareIds {
                    mtime: now,
                    ids: BTreeSet::default(),
                }
            });
            space.mtime = now;
            space.ids.insert(id.clone());
            match self.persist(&mut index, subject).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_precondition_failed() => {
                    self.sync(&mut index, subject, true).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(blob_store::Error::PreconditionFailed.into())
    }

    /// Drops `id` from `subject`'s index. Unknown IDs are a no-op.
    pub async fn remove(&self, subject: &str, id: &ShareId) -> Result<(), Error> {
        let key = space_key_of(id)?;
        ensure_subject(subject)?;
        let shard = self.shard(subject);
        let mut index = shard.lock().await;
        self.sync(&mut index, subject, false).await?;
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            let now = Utc::now();
            let Some(space) = index.spaces.get_mut(&key) else {
                return Ok(());
            };
            if !space.ids.remove(id) {
                return Ok(());
            }
            space.mtime = now;
            if space.ids.is_empty() {
                index.spaces.remove(&key);
            }
            index.mtime = now;
            match self.persist(&mut index, subject).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_precondition_failed() => {
                    self.sync(&mut index, subject, true).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(blob_store::Error::PreconditionFailed.into())
    }

    /// Returns a shallow copy of the subject's index, synced first unless
    /// the TTL gate is still closed.
    pub async fn list(
        &self,
        subject: &str,
    ) -> Result<HashMap<SpaceKey, SpaceShareIds>, Error> {
        ensure_subject(subject)?;
        let shard = self.shard(subject);
        let mut index = shard.lock().await;
        self.sync(&mut index, subject, false).await?;
        Ok(index.spaces.clone())
    }

    fn shard(&self, subject: &str) -> Arc<tokio::sync::Mutex<SubjectIndex>> {
        let mut subjects = self.0.subjects.lock().unwrap();
        subjects.entry(subject.to_owned()).or_default().clone()
    }

    async fn sync(
        &self,
        index: &mut SubjectIndex,
        subject: &str,
        force: bool,
    ) -> Result<(), Error> {
        if !force
            && index
                .next_sync
                .is_some_and(|next_sync| Instant::now() < next_sync)
        {
            return Ok(());
        }
        let path = self.path(subject);
        let if_none_match = (!index.etag.is_empty()).then(|| index.etag.clone());
        let mut retried = false;
        loop {
            let outcome = self.0.store.download(&path, if_none_match.clone()).await;
            match outcome {
                Ok(Download::Fetched { content, info }) => {
                    let (mtime, spaces) = decode_index(&content, &path);
                    index.mtime = mtime;
                    index.spaces = spaces;
                    index.etag = info.etag;
                }
                Ok(Download::NotModified) => (),
                // Absent blob just means the subject never persisted.
                Err(err) if err.is_not_found() => {
                    if !index.etag.is_empty() {
                        *index = SubjectIndex::default();
                    }
                }
                Err(err) if !retried => {
                    tracing::debug!(?err, %path, "download failed, retrying once");
                    retried = true;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            if !self.0.ttl.is_zero() {
                index.next_sync = Some(Instant::now() + self.0.ttl);
            }
            return Ok(());
        }
    }

    async fn persist(
        &self,
        index: &mut SubjectIndex,
        subject: &str,
    ) -> Result<(), blob_store::Error> {
        let path = self.path(subject);
        let content = serde_json::to_vec(&WireOut {
            mtime: index.mtime,
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
        index.etag = info.etag;
        Ok(())
    }

    fn path(&self, subject: &str) -> String {
        format!("/{}/{subject}/{}", self.0.namespace, self.0.filename)
    }
}

fn space_key_of(id: &ShareId) -> Result<SpaceKey, Error> {
    id.space_key()
        .ok_or_else(|| Error::invalid(format!("share id {id} encodes no space")))
}

fn ensure_subject(subject: &str) -> Result<(), Error> {
    if subject.is_empty() {
        return Err(Error::invalid("missing subject id"));
    }
    Ok(())
}

fn decode_index(
    content: &[u8],
    path: &str,
) -> (DateTime<Utc>, HashMap<SpaceKey, SpaceShareIds>) {
    match serde_json::from_slice::<WireIn>(content) {
        Ok(wire) => (wire.mtime, wire.spaces),
        Err(err) => {
            tracing::error!(?err, path, "corrupt index shard, treating as empty");
            (DateTime::UNIX_EPOCH, HashMap::default())
        }
    }
}

/// The shard schema stores ID sets as maps of ID to empty object.
mod ids_as_map {
    use {
        crate::model::ShareId,
        serde::{
            Deserialize, Deserializer, Serializer,
            de::IgnoredAny,
            ser::SerializeMap,
        },
        std::collections::{BTreeMap, BTreeSet},
    };

    pub fn serialize<S: Serializer>(
        ids: &BTreeSet<ShareId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ids.len()))?;
        for id in ids {
            map.serialize_entry(id, &serde_json::json!({}))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<ShareId>, D::Error> {
        let map = BTreeMap::<ShareId, IgnoredAny>::deserialize(deserializer)?;
        Ok(map.into_keys().collect())
    }
}
