//! Data models for cached preparedness entities.
//!
//! This module contains the row snapshots kept in the local cache:
//!
//! - `Profile`: the signed-in member's own profile
//! - `Community`: communities the member belongs to
//! - `Guide`: preparedness guides shared across communities
//! - `EmergencyContact`: the member's personal emergency contacts
//! - `EntityGroup`, `GroupData`: the unit in which entities are synced
//! - `PendingMutation`: a local write waiting to be uploaded

pub mod community;
pub mod contact;
pub mod group;
pub mod guide;
pub mod mutation;
pub mod profile;

use chrono::{DateTime, Utc};

pub use community::Community;
pub use contact::EmergencyContact;
pub use group::{EntityGroup, GroupData, GroupVersion, RemoteMarker, SyncMetadata};
pub use guide::Guide;
pub use mutation::{MutationKind, PendingMutation};
pub use profile::Profile;

/// A denormalized snapshot of a server row.
///
/// Entities are replaced wholesale; nothing in the cache merges individual fields.
pub trait CachedEntity {
    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
}

/// Latest `updated_at` across a set of entities
pub fn latest_update<'a, T, I>(items: I) -> Option<DateTime<Utc>>
where
    T: CachedEntity + 'a,
    I: IntoIterator<Item = &'a T>,
{
    items.into_iter().map(|item| item.updated_at()).max()
}
