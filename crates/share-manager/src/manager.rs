use {
    crate::{
        cache::{IndexCache, ProviderCache, UserReceivedCache},
        config::Config,
        error::Error,
        model::{
            Filter, Grantee, GroupId, MountPoint, Permissions, ReceivedShare,
            ReceivedState, ResourceId, Share, ShareId, ShareRef, ShareState,
            SpaceKey, Timestamp, UserId, matches_filters,
        },
    },
    blob_store::BlobStore,
    std::{collections::HashMap, sync::Arc},
};

/// The calling identity: the user plus their group memberships, as resolved
/// by the surrounding service.
#[derive(Clone, Debug)]
pub struct Caller {
    pub user: UserId,
    pub groups: Vec<GroupId>,
}

impl Caller {
    pub fn new(user: impl Into<UserId>, groups: Vec<GroupId>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }
}

impl From<&str> for Caller {
    fn from(user: &str) -> Self {
        Self {
            user: UserId::from(user),
            groups: Vec::new(),
        }
    }
}

/// The resource being shared, as resolved by the storage layer.
#[derive(Clone, Debug)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub owner: UserId,
}

/// What to grant to whom.
#[derive(Clone, Debug)]
pub struct Grant {
    pub grantee: Grantee,
    pub permissions: Permissions,
}

/// Partial update of a received share, applied per field-mask path.
#[derive(Clone, Debug, Default)]
pub struct ReceivedShareUpdate {
    pub state: Option<ShareState>,
    pub mount_point: Option<MountPoint>,
}

/// The share-manager operations.
#[async_trait::async_trait]
pub trait ShareManaging: Send + Sync {
    /// Creates a share granting `grant.grantee` access to the resource.
    async fn share(
        &self,
        caller: &Caller,
        resource: &ResourceInfo,
        grant: &Grant,
    ) -> Result<Share, Error>;

    /// Resolves a share. Visible only to its creator and its grantee;
    /// everyone else gets `NotFound`.
    async fn get_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
    ) -> Result<Share, Error>;

    /// Removes a share. Only the creator may do so.
    async fn unshare(
        &self,
        caller: &Caller,
        reference: &ShareRef,
    ) -> Result<(), Error>;

    /// Replaces the permissions of a share and bumps its mtime. Only the
    /// creator may do so.
    async fn update_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
        permissions: Permissions,
    ) -> Result<Share, Error>;

    /// Lists the shares the caller created, filtered.
    async fn list_shares(
        &self,
        caller: &Caller,
        filters: &[Filter],
    ) -> Result<Vec<Share>, Error>;

    /// Lists the shares the caller receives, directly or via a group,
    /// with the caller's state overlay applied.
    async fn list_received_shares(
        &self,
        caller: &Caller,
        filters: &[Filter],
    ) -> Result<Vec<ReceivedShare>, Error>;

    /// Resolves a single received share. Only the grantee may see it.
    async fn get_received_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
    ) -> Result<ReceivedShare, Error>;

    /// Updates the caller's state/mount-point overlay on a received share.
    /// `field_mask` names the paths to apply; anything but `state` and
    /// `mount_point` is rejected.
    async fn update_received_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
        update: &ReceivedShareUpdate,
        field_mask: &[String],
    ) -> Result<ReceivedShare, Error>;
}

/// Share manager persisting its state as sharded JSON blobs.
///
/// Composes the four coherence caches. Operations take the involved shard
/// locks one at a time, always in the order provider, created,
/// group-received, user-received. There is no cross-shard atomicity: an
/// operation interrupted between shard writes leaves indices ahead of (or
/// behind) the provider shard, which readers tolerate by skipping dangling
/// index entries until the next write reconciles them.
pub struct Manager {
    provider: ProviderCache,
    created: IndexCache,
    group_received: IndexCache,
    user_received: UserReceivedCache,
}

impl Manager {
    pub fn new(store: Arc<dyn BlobStore>, config: &Config) -> Self {
        Self {
            provider: ProviderCache::new(store.clone()),
            created: IndexCache::new(
                store.clone(),
                "users",
                "created.json",
                config.ttl,
            ),
            group_received: IndexCache::new(
                store.clone(),
                "groups",
                "received.json",
                config.ttl,
            ),
            user_received: UserReceivedCache::new(store),
        }
    }

    /// Resolves a reference to the underlying share, syncing the provider
    /// shard it lives in.
    async fn resolve(&self, reference: &ShareRef) -> Result<Share, Error> {
        match reference {
            ShareRef::Id(id) => {
                let decoded = id.decode();
                if decoded.storage_id.is_empty() || decoded.space_id.is_empty() {
                    return Err(Error::invalid(format!(
                        "share id {id} encodes no space"
                    )));
                }
                self.provider
                    .get(&decoded.storage_id, &decoded.space_id, id, false)
                    .await?
                    .ok_or(Error::NotFound)
            }
            ShareRef::Key {
                resource_id,
                grantee,
            } => {
                let snapshot = self
                    .provider
                    .list_space(&resource_id.storage_id, &resource_id.space_id)
                    .await?;
                snapshot
                    .shares
                    .into_values()
                    .find(|share| {
                        share.resource_id == *resource_id
                            && share.grantee == *grantee
                    })
                    .ok_or(Error::NotFound)
            }
        }
    }

    /// Looks up the caller's overlay on a share, falling back to the
    /// implicit pending state.
    async fn overlay(
        &self,
        caller: &Caller,
        share: &Share,
    ) -> Result<ReceivedState, Error> {
        Ok(self
            .user_received
            .get(caller.user.as_str(), &share.space_key(), &share.id)
            .await?
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl ShareManaging for Manager {
    async fn share(
        &self,
        caller: &Caller,
        resource: &ResourceInfo,
        grant: &Grant,
    ) -> Result<Share, Error> {
        match &grant.grantee {
            Grantee::User(user) if *user == caller.user => {
                return Err(Error::invalid("cannot share a resource with yourself"));
            }
            Grantee::User(user) if *user == resource.owner => {
                return Err(Error::invalid("the owner already has access"));
            }
            Grantee::Invalid(_) => {
                return Err(Error::invalid("unknown grantee kind"));
            }
            _ => (),
        }

        let id = ShareId::mint(&resource.id);
        let now = Timestamp::now();
        let share = Share {
            id: id.clone(),
            resource_id: resource.id.clone(),
            grantee: grant.grantee.clone(),
            permissions: grant.permissions,
            owner: resource.owner.clone(),
            creator: caller.user.clone(),
            ctime: now,
            mtime: now,
        };

        // The provider cache re-checks (resource, grantee) uniqueness under
        // the space lock, so a racing duplicate fails there even if it
        // slipped past everything above.
        self.provider
            .add(&resource.id.storage_id, &resource.id.space_id, &id, share.clone())
            .await?;
        self.created.add(caller.user.as_str(), &id).await?;
        match &share.grantee {
            Grantee::User(user) => {
                self.user_received
                    .add(
                        user.as_str(),
                        &share.space_key(),
                        &id,
                        ReceivedState::default(),
                    )
                    .await?;
            }
            Grantee::Group(group) => {
                self.group_received.add(group.as_str(), &id).await?;
            }
            // Rejected above.
            Grantee::Invalid(_) => (),
        }
        Ok(share)
    }

    async fn get_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
    ) -> Result<Share, Error> {
        let share = self.resolve(reference).await?;
        if share.creator != caller.user
            && !share.is_received_by(&caller.user, &caller.groups)
        {
            return Err(Error::NotFound);
        }
        Ok(share)
    }

    async fn unshare(
        &self,
        caller: &Caller,
        reference: &ShareRef,
    ) -> Result<(), Error> {
        let share = self.resolve(reference).await?;
        if share.creator != caller.user {
            return Err(Error::NotFound);
        }
        self.provider
            .remove(
                &share.resource_id.storage_id,
                &share.resource_id.space_id,
                &share.id,
            )
            .await?;
        self.created.remove(caller.user.as_str(), &share.id).await?;
        match &share.grantee {
            Grantee::User(user) => {
                self.user_received
                    .remove(user.as_str(), &share.space_key(), &share.id)
                    .await?;
            }
            Grantee::Group(group) => {
                self.group_received.remove(group.as_str(), &share.id).await?;
            }
            Grantee::Invalid(_) => (),
        }
        Ok(())
    }

    async fn update_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
        permissions: Permissions,
    ) -> Result<Share, Error> {
        let mut share = self.resolve(reference).await?;
        if share.creator != caller.user {
            return Err(Error::NotFound);
        }
        share.permissions = permissions;
        share.mtime = Timestamp::now();
        self.provider
            .add(
                &share.resource_id.storage_id,
                &share.resource_id.space_id,
                &share.id,
                share.clone(),
            )
            .await?;
        // Re-adding bumps the creator index mtimes, which signals the change
        // to other replicas watching the index.
        self.created.add(caller.user.as_str(), &share.id).await?;
        Ok(share)
    }

    async fn list_shares(
        &self,
        caller: &Caller,
        filters: &[Filter],
    ) -> Result<Vec<Share>, Error> {
        let created = self.created.list(caller.user.as_str()).await?;
        let mut shares = Vec::new();
        for (key, space) in created {
            let snapshot = self
                .provider
                .list_space(key.storage_id(), key.space_id())
                .await?;
            for id in space.ids {
                // The index may run ahead of the provider shard.
                let Some(share) = snapshot.shares.get(&id) else {
                    tracing::debug!(share = %id, "created index entry without share");
                    continue;
                };
                if share.creator == caller.user && matches_filters(share, filters)
                {
                    shares.push(share.clone());
                }
            }
        }
        Ok(shares)
    }

    async fn list_received_shares(
        &self,
        caller: &Caller,
        filters: &[Filter],
    ) -> Result<Vec<ReceivedShare>, Error> {
        // Space key -> share -> overlay. Group shares start out with the
        // implicit pending state; the user's own entries override.
        let mut received: HashMap<SpaceKey, HashMap<ShareId, ReceivedState>> =
            HashMap::new();
        for group in &caller.groups {
            for (key, space) in self.group_received.list(group.as_str()).await? {
                let states = received.entry(key).or_default();
                for id in space.ids {
                    states.entry(id).or_default();
                }
            }
        }
        for (key, space) in self.user_received.list(caller.user.as_str()).await? {
            let states = received.entry(key).or_default();
            for (id, state) in space.states {
                states.insert(id, state);
            }
        }

        let mut shares = Vec::new();
        for (key, states) in received {
            let snapshot = self
                .provider
                .list_space(key.storage_id(), key.space_id())
                .await?;
            for (id, state) in states {
                // Index entries may run ahead of the provider shard; skip
                // them rather than deleting, the index may just be newer.
                let Some(share) = snapshot.shares.get(&id) else {
                    tracing::debug!(share = %id, "received index entry without share");
                    continue;
                };
                if !share.is_received_by(&caller.user, &caller.groups) {
                    continue;
                }
                if !matches_filters(share, filters) {
                    continue;
                }
                shares.push(ReceivedShare {
                    share: share.clone(),
                    state: state.state,
                    mount_point: state.mount_point,
                });
            }
        }
        Ok(shares)
    }

    async fn get_received_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
    ) -> Result<ReceivedShare, Error> {
        let share = self.resolve(reference).await?;
        if !share.is_received_by(&caller.user, &caller.groups) {
            return Err(Error::NotFound);
        }
        self.user_received.sync_user(caller.user.as_str()).await?;
        let overlay = self.overlay(caller, &share).await?;
        Ok(ReceivedShare {
            share,
            state: overlay.state,
            mount_point: overlay.mount_point,
        })
    }

    async fn update_received_share(
        &self,
        caller: &Caller,
        reference: &ShareRef,
        update: &ReceivedShareUpdate,
        field_mask: &[String],
    ) -> Result<ReceivedShare, Error> {
        let share = self.resolve(reference).await?;
        if !share.is_received_by(&caller.user, &caller.groups) {
            return Err(Error::NotFound);
        }

        self.user_received.sync_user(caller.user.as_str()).await?;
        let mut overlay = self.overlay(caller, &share).await?;
        for path in field_mask {
            match path.as_str() {
                "state" => {
                    let next = update.state.ok_or_else(|| {
                        Error::invalid("field mask names state but none is set")
                    })?;
                    if !overlay.state.can_transition_to(next) {
                        return Err(Error::invalid(format!(
                            "cannot move a {:?} share back to {next:?}",
                            overlay.state
                        )));
                    }
                    overlay.state = next;
                }
                "mount_point" => {
                    overlay.mount_point = update.mount_point.clone();
                }
                other => {
                    return Err(Error::NotSupported(format!(
                        "field mask path {other}"
                    )));
                }
            }
        }

        self.user_received
            .add(
                caller.user.as_str(),
                &share.space_key(),
                &share.id,
                overlay.clone(),
            )
            .await?;
        Ok(ReceivedShare {
            share,
            state: overlay.state,
            mount_point: overlay.mount_point,
        })
    }
}
