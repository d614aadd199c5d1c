//! End-to-end scenarios driving the manager against a shared in-memory
//! blob store, including restarts and concurrent replicas.

use {
    blob_store::InMemoryBlobStore,
    share_manager::{
        Caller, Config, Error, Grant, Manager, ReceivedShareUpdate,
        ResourceInfo, ShareManaging,
        cache::{IndexCache, UserReceivedCache},
        model::{
            Filter, Grantee, GroupId, MountPoint, Permissions, ResourceId,
            ShareRef, ShareState, UserId,
        },
    },
    std::{sync::Arc, time::Duration},
};

/// Config with the sync gate disabled so replicas observe each other's
/// writes immediately.
fn config() -> Config {
    toml::from_str(
        r#"
        gateway-addr = "gateway:9142"
        service-user-id = "service"
        service-user-idp = "internal"
        machine-auth-apikey = "secret"
        ttl = "0s"
        "#,
    )
    .unwrap()
}

fn manager(store: &InMemoryBlobStore) -> Manager {
    Manager::new(Arc::new(store.clone()), &config())
}

fn resource(opaque: &str) -> ResourceInfo {
    ResourceInfo {
        id: ResourceId::new("storageid", "spaceid", opaque),
        owner: UserId::from("admin"),
    }
}

fn to_user(user: &str) -> Grant {
    Grant {
        grantee: Grantee::User(UserId::from(user)),
        permissions: Permissions::READ,
    }
}

fn to_group(group: &str) -> Grant {
    Grant {
        grantee: Grantee::Group(GroupId::from(group)),
        permissions: Permissions::READ,
    }
}

fn member_of(user: &str, group: &str) -> Caller {
    Caller::new(user, vec![GroupId::from(group)])
}

fn mask(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|path| (*path).to_owned()).collect()
}

#[tokio::test]
async fn create_list_unshare_cycle() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let einstein = Caller::from("einstein");

    let share = manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();
    assert_eq!(share.creator, UserId::from("admin"));
    assert_eq!(share.ctime, share.mtime);

    let created = manager.list_shares(&admin, &[]).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0], share);

    let received = manager.list_received_shares(&einstein, &[]).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].share, share);
    assert_eq!(received[0].state, ShareState::Pending);
    assert_eq!(received[0].mount_point, None);

    manager
        .unshare(&admin, &ShareRef::Id(share.id.clone()))
        .await
        .unwrap();
    assert!(manager.list_shares(&admin, &[]).await.unwrap().is_empty());
    assert!(
        manager
            .list_received_shares(&einstein, &[])
            .await
            .unwrap()
            .is_empty()
    );
}

/// Fresh cache instances over the same store, reading the persisted
/// grantee-side blobs directly. `list_received_shares` would mask a stale
/// index entry by skipping IDs the provider shard no longer has, so eager
/// cleanup has to be asserted against the blobs themselves.
fn group_index(store: &InMemoryBlobStore) -> IndexCache {
    IndexCache::new(
        Arc::new(store.clone()),
        "groups",
        "received.json",
        Duration::ZERO,
    )
}

fn received_overlay(store: &InMemoryBlobStore) -> UserReceivedCache {
    UserReceivedCache::new(Arc::new(store.clone()))
}

#[tokio::test]
async fn unshare_eagerly_clears_grantee_side_blobs() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let einstein = member_of("einstein", "users");

    // One share per grantee kind: the group one lands in the group index,
    // the direct one (accepted, so definitely persisted) in the user's
    // received overlay.
    let group_share = manager
        .share(&admin, &resource("opaque-1"), &to_group("users"))
        .await
        .unwrap();
    let user_share = manager
        .share(&admin, &resource("opaque-2"), &to_user("einstein"))
        .await
        .unwrap();
    manager
        .update_received_share(
            &einstein,
            &ShareRef::Id(user_share.id.clone()),
            &ReceivedShareUpdate {
                state: Some(ShareState::Accepted),
                mount_point: None,
            },
            &mask(&["state"]),
        )
        .await
        .unwrap();

    let spaces = group_index(&store).list("users").await.unwrap();
    assert!(
        spaces
            .values()
            .any(|space| space.ids.contains(&group_share.id))
    );
    let spaces = received_overlay(&store).list("einstein").await.unwrap();
    assert!(
        spaces
            .values()
            .any(|space| space.states.contains_key(&user_share.id))
    );

    manager
        .unshare(&admin, &ShareRef::Id(group_share.id.clone()))
        .await
        .unwrap();
    manager
        .unshare(&admin, &ShareRef::Id(user_share.id.clone()))
        .await
        .unwrap();

    // The entries are gone from the persisted blobs themselves, not merely
    // hidden behind the missing provider shares.
    assert!(group_index(&store).list("users").await.unwrap().is_empty());
    assert!(
        received_overlay(&store)
            .list("einstein")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn accepting_survives_a_restart() {
    let store = InMemoryBlobStore::new();
    let admin = Caller::from("admin");
    let einstein = Caller::from("einstein");

    let share = {
        let manager = manager(&store);
        let share = manager
            .share(&admin, &resource("opaqueid"), &to_user("einstein"))
            .await
            .unwrap();
        let accepted = manager
            .update_received_share(
                &einstein,
                &ShareRef::Id(share.id.clone()),
                &ReceivedShareUpdate {
                    state: Some(ShareState::Accepted),
                    mount_point: None,
                },
                &mask(&["state"]),
            )
            .await
            .unwrap();
        assert_eq!(accepted.state, ShareState::Accepted);
        share
    };

    // A fresh manager over the same store observes the accepted state.
    let restarted = manager(&store);
    let received = restarted
        .get_received_share(&einstein, &ShareRef::Id(share.id.clone()))
        .await
        .unwrap();
    assert_eq!(received.state, ShareState::Accepted);

    // Accepting again is idempotent.
    let again = restarted
        .update_received_share(
            &einstein,
            &ShareRef::Id(share.id),
            &ReceivedShareUpdate {
                state: Some(ShareState::Accepted),
                mount_point: None,
            },
            &mask(&["state"]),
        )
        .await
        .unwrap();
    assert_eq!(again.state, ShareState::Accepted);
}

#[tokio::test]
async fn duplicate_share_is_rejected() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");

    manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();
    let err = manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists));

    // The same resource can still go to someone else.
    manager
        .share(&admin, &resource("opaqueid"), &to_user("marie"))
        .await
        .unwrap();
}

#[tokio::test]
async fn replicas_converge_through_the_store() {
    let store = InMemoryBlobStore::new();
    let replica_a = manager(&store);
    let replica_b = manager(&store);
    let admin = Caller::from("admin");

    // Both replicas write the same provider shard and the same created
    // index; the loser of each etag race replays on top.
    replica_a
        .share(&admin, &resource("opaque-1"), &to_user("einstein"))
        .await
        .unwrap();
    replica_b
        .share(&admin, &resource("opaque-2"), &to_user("marie"))
        .await
        .unwrap();

    let fresh = manager(&store);
    assert_eq!(fresh.list_shares(&admin, &[]).await.unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_share_across_replicas_is_rejected() {
    let store = InMemoryBlobStore::new();
    let replica_a = manager(&store);
    let replica_b = manager(&store);
    let admin = Caller::from("admin");

    replica_a
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();
    let err = replica_b
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists));
}

#[tokio::test]
async fn group_share_with_user_overlay() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let einstein = member_of("einstein", "users");
    let marie = member_of("marie", "users");

    let share = manager
        .share(&admin, &resource("opaqueid"), &to_group("users"))
        .await
        .unwrap();

    // Both members inherit the implicit pending state from the group.
    for member in [&einstein, &marie] {
        let received = manager.list_received_shares(member, &[]).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].state, ShareState::Pending);
    }

    // One member accepts; the overlay is theirs alone.
    manager
        .update_received_share(
            &einstein,
            &ShareRef::Id(share.id.clone()),
            &ReceivedShareUpdate {
                state: Some(ShareState::Accepted),
                mount_point: None,
            },
            &mask(&["state"]),
        )
        .await
        .unwrap();

    let received = manager.list_received_shares(&einstein, &[]).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].state, ShareState::Accepted);

    let received = manager.list_received_shares(&marie, &[]).await.unwrap();
    assert_eq!(received[0].state, ShareState::Pending);

    // A non-member sees nothing.
    let outsider = Caller::from("mallory");
    assert!(
        manager
            .list_received_shares(&outsider, &[])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn filter_by_resource_id() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let einstein = Caller::from("einstein");

    let r1 = manager
        .share(&admin, &resource("opaque-1"), &to_user("einstein"))
        .await
        .unwrap();
    manager
        .share(&admin, &resource("opaque-2"), &to_user("einstein"))
        .await
        .unwrap();

    let filters = [Filter::ResourceId(r1.resource_id.clone())];
    let received = manager
        .list_received_shares(&einstein, &filters)
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].share, r1);

    let created = manager.list_shares(&admin, &filters).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0], r1);
}

#[tokio::test]
async fn shares_are_only_visible_to_creator_and_grantee() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let einstein = Caller::from("einstein");
    let mallory = Caller::from("mallory");

    let share = manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();
    let reference = ShareRef::Id(share.id.clone());

    assert!(manager.get_share(&admin, &reference).await.is_ok());
    assert!(manager.get_share(&einstein, &reference).await.is_ok());
    assert!(matches!(
        manager.get_share(&mallory, &reference).await.unwrap_err(),
        Error::NotFound
    ));

    // Only the creator may remove or update; everyone else is told the
    // share does not exist.
    assert!(matches!(
        manager.unshare(&einstein, &reference).await.unwrap_err(),
        Error::NotFound
    ));
    assert!(matches!(
        manager
            .update_share(&mallory, &reference, Permissions::WRITE)
            .await
            .unwrap_err(),
        Error::NotFound
    ));
}

#[tokio::test]
async fn resolving_by_resource_and_grantee_key() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");

    let share = manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();

    let reference = ShareRef::Key {
        resource_id: share.resource_id.clone(),
        grantee: Grantee::User(UserId::from("einstein")),
    };
    assert_eq!(manager.get_share(&admin, &reference).await.unwrap(), share);

    let missing = ShareRef::Key {
        resource_id: share.resource_id.clone(),
        grantee: Grantee::User(UserId::from("marie")),
    };
    assert!(matches!(
        manager.get_share(&admin, &missing).await.unwrap_err(),
        Error::NotFound
    ));
}

#[tokio::test]
async fn update_share_changes_permissions_and_mtime() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");

    let share = manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();
    let updated = manager
        .update_share(&admin, &ShareRef::Id(share.id.clone()), Permissions::WRITE)
        .await
        .unwrap();
    assert_eq!(updated.permissions, Permissions::WRITE);
    assert!(updated.mtime >= share.mtime);
    assert_eq!(updated.ctime, share.ctime);

    let fresh = self::manager(&store);
    let listed = fresh.list_shares(&admin, &[]).await.unwrap();
    assert_eq!(listed[0].permissions, Permissions::WRITE);
}

#[tokio::test]
async fn self_share_and_owner_share_are_rejected() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let marie = Caller::from("marie");

    let err = manager
        .share(&admin, &resource("opaqueid"), &to_user("admin"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // The resource owner is admin; sharing it with them is just as moot,
    // whoever creates the share.
    let err = manager
        .share(&marie, &resource("opaqueid"), &to_user("admin"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn received_share_update_validates_the_field_mask() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");
    let einstein = Caller::from("einstein");

    let share = manager
        .share(&admin, &resource("opaqueid"), &to_user("einstein"))
        .await
        .unwrap();
    let reference = ShareRef::Id(share.id.clone());

    let err = manager
        .update_received_share(
            &einstein,
            &reference,
            &ReceivedShareUpdate::default(),
            &mask(&["permissions"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));

    let updated = manager
        .update_received_share(
            &einstein,
            &reference,
            &ReceivedShareUpdate {
                state: Some(ShareState::Accepted),
                mount_point: Some(MountPoint::from("/shares/report.txt")),
            },
            &mask(&["state", "mount_point"]),
        )
        .await
        .unwrap();
    assert_eq!(updated.state, ShareState::Accepted);
    assert_eq!(
        updated.mount_point,
        Some(MountPoint::from("/shares/report.txt"))
    );

    // Accepted shares cannot go back to pending.
    let err = manager
        .update_received_share(
            &einstein,
            &reference,
            &ReceivedShareUpdate {
                state: Some(ShareState::Pending),
                mount_point: None,
            },
            &mask(&["state"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // But they can flip to rejected and back.
    for state in [ShareState::Rejected, ShareState::Accepted] {
        let updated = manager
            .update_received_share(
                &einstein,
                &reference,
                &ReceivedShareUpdate {
                    state: Some(state),
                    mount_point: None,
                },
                &mask(&["state"]),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, state);
    }
}

#[tokio::test]
async fn parallel_shares_with_distinct_grantees_all_succeed() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");

    let results = futures::future::join_all((0..8).map(|number| {
        let manager = &manager;
        let admin = &admin;
        async move {
            let grant = to_user(&format!("user-{number}"));
            manager.share(admin, &resource("opaqueid"), &grant).await
        }
    }))
    .await;
    assert!(results.iter().all(Result::is_ok));

    let fresh = self::manager(&store);
    assert_eq!(fresh.list_shares(&admin, &[]).await.unwrap().len(), 8);
}

#[tokio::test]
async fn parallel_identical_shares_produce_exactly_one_winner() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");

    let results = futures::future::join_all((0..8).map(|_| {
        let manager = &manager;
        let admin = &admin;
        async move {
            let grant = to_user("einstein");
            manager.share(admin, &resource("opaqueid"), &grant).await
        }
    }))
    .await;
    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|err| matches!(err, Error::AlreadyExists))
    );

    let fresh = self::manager(&store);
    assert_eq!(fresh.list_shares(&admin, &[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_share_ids_are_invalid_references() {
    let store = InMemoryBlobStore::new();
    let manager = manager(&store);
    let admin = Caller::from("admin");

    let err = manager
        .get_share(&admin, &ShareRef::Id("justanopaqueid".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = manager
        .get_share(
            &admin,
            &ShareRef::Id("storageid^spaceid°unknown".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound));
}
