use {
    super::share::Share,
    serde::{Deserialize, Serialize},
};

/// Receiver-side state of a share.
///
/// Shards encode the state as an integer; unknown values decode as pending
/// so a newer writer cannot poison an older reader's shard.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(from = "u8", into = "u8")]
pub enum ShareState {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl From<u8> for ShareState {
    fn from(value: u8) -> Self {
        match value {
            2 => Self::Accepted,
            3 => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

impl From<ShareState> for u8 {
    fn from(state: ShareState) -> Self {
        match state {
            ShareState::Pending => 1,
            ShareState::Accepted => 2,
            ShareState::Rejected => 3,
        }
    }
}

impl ShareState {
    /// Allowed transitions: pending may move anywhere, accepted and rejected
    /// may flip into each other, and repeating the current state is always
    /// fine. Nothing moves back to pending.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (current, next) if current == next => true,
            (Self::Pending, _) => true,
            (Self::Accepted, Self::Rejected) => true,
            (Self::Rejected, Self::Accepted) => true,
            _ => false,
        }
    }
}

/// Location where the receiver mounted the share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    pub path: String,
}

impl From<&str> for MountPoint {
    fn from(path: &str) -> Self {
        Self { path: path.to_owned() }
    }
}

/// Per-user overlay on a share: state plus optional mount point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceivedState {
    #[serde(rename = "State")]
    pub state: ShareState,
    #[serde(rename = "MountPoint", skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<MountPoint>,
}

/// A share observed from the grantee's point of view.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedShare {
    pub share: Share,
    pub state: ShareState,
    pub mount_point: Option<MountPoint>,
}
