//! Multi-user share manager persisting its state as sharded JSON blobs on a
//! conditional blob store.
//!
//! Shares are collaboration grants on resources living inside logical
//! storage spaces. The manager answers which shares exist on a space, which
//! shares a user created, which shares a user receives (directly or via a
//! group) and what state the receiver attached to each of them, while other
//! replicas of the same service may be mutating the same state
//! concurrently.
//!
//! Coherence with the store rests on four caches, each sharded into one
//! JSON blob per space, user or group, and each using the store's etag
//! primitives for optimistic concurrency:
//!
//! - [`cache::ProviderCache`] — authoritative shares per space,
//! - [`cache::IndexCache`] — share IDs per creating user and per receiving
//!   group,
//! - [`cache::UserReceivedCache`] — per-user state/mount-point overlay.
//!
//! [`Manager`] composes them into the share operations; [`Registry`] builds
//! managers by driver name.

pub mod cache;
pub mod config;
mod error;
mod manager;
pub mod model;
mod registry;

pub use {
    config::Config,
    error::Error,
    manager::{
        Caller, Grant, Manager, ReceivedShareUpdate, ResourceInfo,
        ShareManaging,
    },
    registry::{Factory, Registry},
};
