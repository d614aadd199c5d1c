//! Domain model of the share manager: identities, resources, shares and the
//! receiver-side overlay, plus the wire conventions the shard blobs use.

mod filter;
mod received;
mod share;

pub use {
    filter::{Filter, matches_filters},
    received::{MountPoint, ReceivedShare, ReceivedState, ShareState},
    share::{
        DecodedShareId, Grantee, GranteeType, GroupId, Permissions, ResourceId,
        Share, ShareId, ShareRef, SpaceKey, Timestamp, UserId,
    },
};
