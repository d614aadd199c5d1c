use super::share::{GranteeType, ResourceId, Share, UserId};

/// A predicate on shares used by the list operations.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    ResourceId(ResourceId),
    Owner(UserId),
    Creator(UserId),
    GranteeType(GranteeType),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    ResourceId,
    Owner,
    Creator,
    GranteeType,
}

impl Filter {
    fn kind(&self) -> Kind {
        match self {
            Self::ResourceId(_) => Kind::ResourceId,
            Self::Owner(_) => Kind::Owner,
            Self::Creator(_) => Kind::Creator,
            Self::GranteeType(_) => Kind::GranteeType,
        }
    }

    fn matches(&self, share: &Share) -> bool {
        match self {
            Self::ResourceId(resource_id) => share.resource_id == *resource_id,
            Self::Owner(owner) => share.owner == *owner,
            Self::Creator(creator) => share.creator == *creator,
            Self::GranteeType(kind) => share.grantee.kind() == Some(*kind),
        }
    }
}

/// Filters of the same kind are OR-ed, different kinds are AND-ed.
pub fn matches_filters(share: &Share, filters: &[Filter]) -> bool {
    const KINDS: [Kind; 4] =
        [Kind::ResourceId, Kind::Owner, Kind::Creator, Kind::GranteeType];
    KINDS.iter().all(|kind| {
        let mut of_kind =
            filters.iter().filter(|filter| filter.kind() == *kind).peekable();
        of_kind.peek().is_none() || of_kind.any(|filter| filter.matches(share))
    })
}
