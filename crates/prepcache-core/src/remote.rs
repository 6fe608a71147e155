//! The seam between the sync engine and the remote relational store.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{EntityGroup, GroupData, PendingMutation, RemoteMarker};

/// Remote data service queried per entity group.
///
/// Implementations scope every query to what `user_id` is allowed to see
/// (own profile and contacts, communities by membership, shared guides).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the authoritative contents of one group
    async fn fetch_group(&self, group: EntityGroup, user_id: &str) -> Result<GroupData>;

    /// Cheap probe: newest `updated_at` and row count, no row payloads
    async fn probe_group(&self, group: EntityGroup, user_id: &str) -> Result<RemoteMarker>;

    /// Upload one queued mutation; `Ok` means the server acknowledged it
    async fn apply_mutation(&self, mutation: &PendingMutation) -> Result<()>;
}
