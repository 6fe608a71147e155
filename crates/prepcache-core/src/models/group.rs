//! Entity groups and the bookkeeping that tracks what was last pulled.
//!
//! A group is synced as one unit: its cache file is replaced wholesale after
//! a complete fetch, and its version marker is recorded in `SyncMetadata`.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    latest_update, CachedEntity, Community, EmergencyContact, Guide, MutationKind, PendingMutation,
    Profile,
};

/// A named category of cached data synced as an atomic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum EntityGroup {
    Profile,
    Communities,
    Guides,
    EmergencyContacts,
}

impl EntityGroup {
    pub const ALL: [EntityGroup; 4] = [
        EntityGroup::Profile,
        EntityGroup::Communities,
        EntityGroup::Guides,
        EntityGroup::EmergencyContacts,
    ];

    /// Remote table backing this group
    pub fn table(&self) -> &'static str {
        match self {
            EntityGroup::Profile => "profiles",
            EntityGroup::Communities => "communities",
            EntityGroup::Guides => "guides",
            EntityGroup::EmergencyContacts => "emergency_contacts",
        }
    }

    /// Base name of the cache file holding this group
    pub fn cache_name(&self) -> &'static str {
        match self {
            EntityGroup::Profile => "profile",
            EntityGroup::Communities => "communities",
            EntityGroup::Guides => "guides",
            EntityGroup::EmergencyContacts => "emergency_contacts",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EntityGroup::Profile => "Profile",
            EntityGroup::Communities => "Communities",
            EntityGroup::Guides => "Guides",
            EntityGroup::EmergencyContacts => "Emergency contacts",
        }
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_name())
    }
}

/// The full contents of one entity group as fetched from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupData {
    Profile(Option<Profile>),
    Communities(Vec<Community>),
    Guides(Vec<Guide>),
    EmergencyContacts(Vec<EmergencyContact>),
}

impl GroupData {
    pub fn empty(group: EntityGroup) -> Self {
        match group {
            EntityGroup::Profile => GroupData::Profile(None),
            EntityGroup::Communities => GroupData::Communities(Vec::new()),
            EntityGroup::Guides => GroupData::Guides(Vec::new()),
            EntityGroup::EmergencyContacts => GroupData::EmergencyContacts(Vec::new()),
        }
    }

    pub fn group(&self) -> EntityGroup {
        match self {
            GroupData::Profile(_) => EntityGroup::Profile,
            GroupData::Communities(_) => EntityGroup::Communities,
            GroupData::Guides(_) => EntityGroup::Guides,
            GroupData::EmergencyContacts(_) => EntityGroup::EmergencyContacts,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            GroupData::Profile(p) => usize::from(p.is_some()),
            GroupData::Communities(v) => v.len(),
            GroupData::Guides(v) => v.len(),
            GroupData::EmergencyContacts(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overlay a local write onto this snapshot, replacing or removing the
    /// whole record it targets.
    pub fn apply_mutation(&mut self, mutation: &PendingMutation) -> Result<()> {
        if mutation.group != self.group() {
            return Err(anyhow!(
                "Mutation for {} applied to {} data",
                mutation.group,
                self.group()
            ));
        }
        match self {
            GroupData::Profile(profile) => {
                *profile = match mutation.kind {
                    MutationKind::Delete => None,
                    _ => Some(payload_row(mutation)?),
                };
                Ok(())
            }
            GroupData::Communities(rows) => upsert(rows, mutation),
            GroupData::Guides(rows) => upsert(rows, mutation),
            GroupData::EmergencyContacts(rows) => upsert(rows, mutation),
        }
    }

    /// Version marker describing this snapshot
    pub fn marker(&self) -> RemoteMarker {
        let latest = match self {
            GroupData::Profile(p) => p.as_ref().map(|p| p.updated_at()),
            GroupData::Communities(v) => latest_update(v),
            GroupData::Guides(v) => latest_update(v),
            GroupData::EmergencyContacts(v) => latest_update(v),
        };
        RemoteMarker {
            latest_update: latest,
            row_count: self.len(),
        }
    }
}

fn upsert<T>(rows: &mut Vec<T>, mutation: &PendingMutation) -> Result<()>
where
    T: CachedEntity + DeserializeOwned,
{
    let replacement = match mutation.kind {
        MutationKind::Delete => None,
        _ => Some(payload_row(mutation)?),
    };
    rows.retain(|row| row.id() != mutation.record_id);
    rows.extend(replacement);
    Ok(())
}

fn payload_row<T: CachedEntity + DeserializeOwned>(mutation: &PendingMutation) -> Result<T> {
    let row: T = serde_json::from_value(mutation.payload.clone())
        .with_context(|| format!("Invalid {} payload for {}", mutation.group, mutation.record_id))?;
    if row.id() != mutation.record_id {
        return Err(anyhow!(
            "Payload id {} does not match record {}",
            row.id(),
            mutation.record_id
        ));
    }
    Ok(row)
}

/// Cheap summary of a remote group: newest `updated_at` plus row count.
///
/// The row count catches deletions, which never bump `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMarker {
    pub latest_update: Option<DateTime<Utc>>,
    pub row_count: usize,
}

/// What was recorded for a group at its last successful pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersion {
    pub latest_update: Option<DateTime<Utc>>,
    pub row_count: usize,
    pub synced_at: DateTime<Utc>,
}

impl GroupVersion {
    pub fn matches(&self, marker: &RemoteMarker) -> bool {
        self.latest_update == marker.latest_update && self.row_count == marker.row_count
    }
}

/// Last successful sync time plus per-group version markers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub groups: BTreeMap<EntityGroup, GroupVersion>,
}

impl SyncMetadata {
    pub fn version(&self, group: EntityGroup) -> Option<&GroupVersion> {
        self.groups.get(&group)
    }

    pub fn record_group(&mut self, group: EntityGroup, marker: RemoteMarker, synced_at: DateTime<Utc>) {
        self.groups.insert(
            group,
            GroupVersion {
                latest_update: marker.latest_update,
                row_count: marker.row_count,
                synced_at,
            },
        );
    }

    /// Advance `last_sync`, never letting it stand still or move backwards.
    pub fn advance_last_sync(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self.last_sync {
            Some(prev) if now <= prev => prev + Duration::milliseconds(1),
            _ => now,
        };
        self.last_sync = Some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guide(id: &str, updated_at: DateTime<Utc>) -> Guide {
        Guide {
            id: id.to_string(),
            title: format!("Guide {}", id),
            content: String::new(),
            category: None,
            community_id: None,
            updated_at,
        }
    }

    #[test]
    fn test_marker_tracks_newest_row_and_count() {
        let old = Utc::now() - Duration::hours(2);
        let new = Utc::now();
        let data = GroupData::Guides(vec![guide("a", new), guide("b", old)]);
        let marker = data.marker();
        assert_eq!(marker.latest_update, Some(new));
        assert_eq!(marker.row_count, 2);
    }

    #[test]
    fn test_apply_mutation_replaces_whole_record() {
        let at = Utc::now();
        let mut data = GroupData::Guides(vec![guide("a", at), guide("b", at)]);
        let mut edited = guide("a", at + Duration::minutes(5));
        edited.title = "Shelter in place".to_string();
        let row = serde_json::to_value(&edited).expect("row");

        data.apply_mutation(&PendingMutation::update(EntityGroup::Guides, "a", row))
            .expect("update");
        data.apply_mutation(&PendingMutation::delete(EntityGroup::Guides, "b"))
            .expect("delete");

        assert_eq!(data, GroupData::Guides(vec![edited]));
    }

    #[test]
    fn test_apply_mutation_rejects_other_group() {
        let mut data = GroupData::empty(EntityGroup::Communities);
        let mutation = PendingMutation::delete(EntityGroup::Guides, "g1");
        assert!(data.apply_mutation(&mutation).is_err());
    }

    #[test]
    fn test_empty_profile_marker() {
        let marker = GroupData::empty(EntityGroup::Profile).marker();
        assert_eq!(marker, RemoteMarker { latest_update: None, row_count: 0 });
    }

    #[test]
    fn test_version_detects_deletion() {
        let at = Utc::now();
        let version = GroupVersion { latest_update: Some(at), row_count: 3, synced_at: at };
        assert!(version.matches(&RemoteMarker { latest_update: Some(at), row_count: 3 }));
        assert!(!version.matches(&RemoteMarker { latest_update: Some(at), row_count: 2 }));
    }

    #[test]
    fn test_advance_last_sync_is_strictly_monotonic() {
        let mut meta = SyncMetadata::default();
        let now = Utc::now();
        let first = meta.advance_last_sync(now);
        let second = meta.advance_last_sync(now);
        let third = meta.advance_last_sync(now - Duration::seconds(30));
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_metadata_serializes_group_keys_as_names() {
        let mut meta = SyncMetadata::default();
        let at = Utc::now();
        meta.record_group(EntityGroup::EmergencyContacts, RemoteMarker { latest_update: None, row_count: 0 }, at);
        let json = serde_json::to_string(&meta).expect("metadata should serialize");
        assert!(json.contains("\"emergency_contacts\""));
        let back: SyncMetadata = serde_json::from_str(&json).expect("metadata should parse");
        assert_eq!(back, meta);
    }
}
