//! The three-cache coherence layer between in-memory state and the blob
//! store.
//!
//! Every cache follows the same protocol: take the shard lock, bring the
//! shard up to date with a conditional download, apply the mutation in
//! memory, persist with a conditional upload and, when that write lost a
//! race, re-sync and replay. Locks are held across the blob-store
//! round-trips, so within one shard operations are linearizable.

mod index;
mod provider;
mod received;

pub use {
    index::{IndexCache, SpaceShareIds},
    provider::{ProviderCache, SpaceSnapshot},
    received::{SpaceStates, UserReceivedCache},
};
