use {
    chrono::Utc,
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    serde_json::{Value, json},
    std::fmt,
    uuid::Uuid,
};

/// Separates the storage ID from the space ID in share IDs and space keys.
pub const SPACE_DELIMITER: char = '^';
/// Separates the space prefix from the opaque component of a share ID.
pub const OPAQUE_DELIMITER: char = '°';

/// A user identity.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub String);

/// A group identity.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a resource inside a logical storage space.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceId {
    pub storage_id: String,
    pub space_id: String,
    pub opaque_id: String,
}

impl ResourceId {
    pub fn new(
        storage_id: impl Into<String>,
        space_id: impl Into<String>,
        opaque_id: impl Into<String>,
    ) -> Self {
        Self {
            storage_id: storage_id.into(),
            space_id: space_id.into(),
            opaque_id: opaque_id.into(),
        }
    }

    pub fn space_key(&self) -> SpaceKey {
        SpaceKey::new(&self.storage_id, &self.space_id)
    }
}

/// Globally unique share identifier of the form
/// `<storageID>^<spaceID>°<opaque>`, so the space a share lives in can be
/// recovered from the ID alone.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShareId(String);

/// The components of a [`ShareId`]. Produced by lenient decoding: missing
/// delimiters yield empty storage and/or space IDs which callers must treat
/// as an invalid reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedShareId {
    pub storage_id: String,
    pub space_id: String,
    pub opaque_id: String,
}

impl ShareId {
    /// Mints a fresh ID for a share on the given resource.
    pub fn mint(resource: &ResourceId) -> Self {
        Self(format!(
            "{}{SPACE_DELIMITER}{}{OPAQUE_DELIMITER}{}",
            resource.storage_id,
            resource.space_id,
            Uuid::new_v4()
        ))
    }

    pub fn decode(&self) -> DecodedShareId {
        let (prefix, opaque_id) = match self.0.split_once(OPAQUE_DELIMITER) {
            Some((prefix, opaque)) => (prefix, opaque),
            None => ("", self.0.as_str()),
        };
        let (storage_id, space_id) = match prefix.split_once(SPACE_DELIMITER) {
            Some((storage, space)) => (storage, space),
            None => ("", prefix),
        };
        DecodedShareId {
            storage_id: storage_id.to_owned(),
            space_id: space_id.to_owned(),
            opaque_id: opaque_id.to_owned(),
        }
    }

    /// The space key encoded in the ID prefix, if the ID carries one.
    pub fn space_key(&self) -> Option<SpaceKey> {
        let decoded = self.decode();
        (!decoded.storage_id.is_empty() && !decoded.space_id.is_empty())
            .then(|| SpaceKey::new(&decoded.storage_id, &decoded.space_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShareId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `<storageID>^<spaceID>`, the map key used throughout the index caches.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SpaceKey(String);

impl SpaceKey {
    pub fn new(storage_id: &str, space_id: &str) -> Self {
        Self(format!("{storage_id}{SPACE_DELIMITER}{space_id}"))
    }

    pub fn storage_id(&self) -> &str {
        self.0.split_once(SPACE_DELIMITER).map(|(storage, _)| storage).unwrap_or("")
    }

    pub fn space_id(&self) -> &str {
        self.0.split_once(SPACE_DELIMITER).map(|(_, space)| space).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&ResourceId> for SpaceKey {
    fn from(resource: &ResourceId) -> Self {
        resource.space_key()
    }
}

impl fmt::Display for SpaceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seconds + nanos wall-clock timestamp carried by shares.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "PascalCase")]
pub struct Timestamp {
    pub seconds: u64,
    #[serde(default)]
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: u64::try_from(now.timestamp()).unwrap_or_default(),
            nanos: now.timestamp_subsec_nanos(),
        }
    }
}

/// Opaque permission bit set. The manager stores and compares it but never
/// interprets individual bits.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(3);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GranteeType {
    User,
    Group,
}

/// The receiving side of a share.
///
/// On the wire this is a tagged variant, `{"Id": {"UserId": {...}}}` or
/// `{"Id": {"GroupId": {...}}}`. Decoding dispatches on the discriminator in
/// a single pass; an unrecognized kind is retained verbatim so the rest of a
/// shard still loads.
#[derive(Clone, Debug, PartialEq)]
pub enum Grantee {
    User(UserId),
    Group(GroupId),
    Invalid(Value),
}

impl Grantee {
    pub fn kind(&self) -> Option<GranteeType> {
        match self {
            Self::User(_) => Some(GranteeType::User),
            Self::Group(_) => Some(GranteeType::Group),
            Self::Invalid(_) => None,
        }
    }

    pub fn user(&self) -> Option<&UserId> {
        match self {
            Self::User(user) => Some(user),
            _ => None,
        }
    }

    pub fn group(&self) -> Option<&GroupId> {
        match self {
            Self::Group(group) => Some(group),
            _ => None,
        }
    }

    fn from_wire(value: Value) -> Self {
        if let Some(id) = value.get("Id").and_then(Value::as_object) {
            if let Some(opaque) = id
                .get("UserId")
                .and_then(|user| user.get("OpaqueId"))
                .and_then(Value::as_str)
            {
                return Self::User(UserId(opaque.to_owned()));
            }
            if let Some(opaque) = id
                .get("GroupId")
                .and_then(|group| group.get("OpaqueId"))
                .and_then(Value::as_str)
            {
                return Self::Group(GroupId(opaque.to_owned()));
            }
        }
        Self::Invalid(value)
    }
}

impl Serialize for Grantee {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::User(user) => json!({"Id": {"UserId": {"OpaqueId": user.0.as_str()}}})
                .serialize(serializer),
            Self::Group(group) => json!({"Id": {"GroupId": {"OpaqueId": group.0.as_str()}}})
                .serialize(serializer),
            Self::Invalid(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Grantee {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_wire(Value::deserialize(deserializer)?))
    }
}

/// A grant of permissions on a resource to a user or group. Identity is
/// immutable; only permissions and mtime change after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Share {
    pub id: ShareId,
    pub resource_id: ResourceId,
    pub grantee: Grantee,
    pub permissions: Permissions,
    /// Owner of the shared resource. May differ from the creator for
    /// space-owned resources.
    pub owner: UserId,
    pub creator: UserId,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
}

impl Share {
    pub fn space_key(&self) -> SpaceKey {
        self.resource_id.space_key()
    }

    /// Whether the share is addressed to the given user, directly or through
    /// one of their groups.
    pub fn is_received_by(&self, user: &UserId, groups: &[GroupId]) -> bool {
        match &self.grantee {
            Grantee::User(grantee) => grantee == user,
            Grantee::Group(grantee) => groups.contains(grantee),
            Grantee::Invalid(_) => false,
        }
    }
}

/// Reference to a share, either by ID or by its `(resource, grantee)` key.
#[derive(Clone, Debug)]
pub enum ShareRef {
    Id(ShareId),
    Key {
        resource_id: ResourceId,
        grantee: Grantee,
    },
}
