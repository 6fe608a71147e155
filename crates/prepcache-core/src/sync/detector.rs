//! Cheap remote-change detection.
//!
//! Instead of downloading rows, each group is probed for its newest
//! `updated_at` and its row count, and the result is compared with the
//! version recorded at the last successful pull.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::models::{EntityGroup, GroupVersion, RemoteMarker, SyncMetadata};
use crate::remote::RemoteStore;

/// Outcome of a change check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub has_changes: bool,
    pub changed_groups: Vec<EntityGroup>,
}

impl ChangeReport {
    fn from_groups(changed_groups: Vec<EntityGroup>) -> Self {
        Self {
            has_changes: !changed_groups.is_empty(),
            changed_groups,
        }
    }
}

pub struct ChangeDetector {
    remote: Arc<dyn RemoteStore>,
}

impl ChangeDetector {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    /// Probe every group and report those that differ from `metadata`.
    ///
    /// Never fails: a group whose probe errors is treated as unchanged, so a
    /// device without network reports no changes and tries again next time.
    pub async fn check(&self, user_id: &str, metadata: &SyncMetadata) -> ChangeReport {
        let probes = join_all(EntityGroup::ALL.iter().map(|&group| async move {
            (group, self.remote.probe_group(group, user_id).await)
        }))
        .await;

        let mut changed = Vec::new();
        for (group, probe) in probes {
            match probe {
                Ok(marker) => {
                    if Self::group_changed(metadata.version(group), &marker) {
                        debug!(group = %group, ?marker, "Remote change detected");
                        changed.push(group);
                    }
                }
                Err(e) => {
                    warn!(group = %group, error = %e, "Change probe failed, treating group as unchanged");
                }
            }
        }

        ChangeReport::from_groups(changed)
    }

    fn group_changed(version: Option<&GroupVersion>, marker: &RemoteMarker) -> bool {
        match version {
            // Never pulled
            None => true,
            Some(version) => !version.matches(marker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroupData;
    use crate::sync::fake::{self, FakeRemote, USER};
    use chrono::Utc;

    /// Metadata as it would look right after pulling everything from `remote`
    fn synced_metadata(remote: &FakeRemote) -> SyncMetadata {
        let mut metadata = SyncMetadata::default();
        for group in EntityGroup::ALL {
            metadata.record_group(group, remote.group(group).marker(), Utc::now());
        }
        metadata.advance_last_sync(Utc::now());
        metadata
    }

    #[tokio::test]
    async fn test_never_synced_reports_every_group() {
        let remote = Arc::new(FakeRemote::seeded());
        let detector = ChangeDetector::new(remote);
        let report = detector.check(USER, &SyncMetadata::default()).await;
        assert!(report.has_changes);
        assert_eq!(report.changed_groups, EntityGroup::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_up_to_date_reports_no_changes() {
        let remote = Arc::new(FakeRemote::seeded());
        let metadata = synced_metadata(&remote);
        let report = ChangeDetector::new(remote.clone()).check(USER, &metadata).await;
        assert_eq!(report, ChangeReport::default());
        assert_eq!(remote.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_single_group_update_is_reported_alone() {
        let remote = Arc::new(FakeRemote::seeded());
        let metadata = synced_metadata(&remote);
        remote.set_group(GroupData::Guides(vec![fake::guide("g1", "Go bag v2", fake::at(30))]));

        let report = ChangeDetector::new(remote.clone()).check(USER, &metadata).await;
        assert!(report.has_changes);
        assert_eq!(report.changed_groups, vec![EntityGroup::Guides]);
    }

    #[tokio::test]
    async fn test_deletion_is_detected_by_row_count() {
        let remote = Arc::new(FakeRemote::seeded());
        remote.set_group(GroupData::EmergencyContacts(vec![
            fake::contact("e1", "Sam", fake::at(3)),
            fake::contact("e2", "Lee", fake::at(1)),
        ]));
        let metadata = synced_metadata(&remote);
        // Deleting the older row leaves the newest updated_at unchanged
        remote.set_group(GroupData::EmergencyContacts(vec![fake::contact("e1", "Sam", fake::at(3))]));

        let report = ChangeDetector::new(remote.clone()).check(USER, &metadata).await;
        assert_eq!(report.changed_groups, vec![EntityGroup::EmergencyContacts]);
    }

    #[tokio::test]
    async fn test_network_failure_reports_no_changes() {
        let remote = Arc::new(FakeRemote::seeded());
        remote.set_offline(true);
        let report = ChangeDetector::new(remote.clone()).check(USER, &SyncMetadata::default()).await;
        assert!(!report.has_changes);
        assert!(report.changed_groups.is_empty());
        assert_eq!(remote.probe_calls(), EntityGroup::ALL.len());
    }

    #[tokio::test]
    async fn test_failed_probe_only_hides_its_own_group() {
        let remote = Arc::new(FakeRemote::seeded());
        remote.fail_group(EntityGroup::Communities);
        let report = ChangeDetector::new(remote).check(USER, &SyncMetadata::default()).await;
        assert_eq!(
            report.changed_groups,
            vec![EntityGroup::Profile, EntityGroup::Guides, EntityGroup::EmergencyContacts]
        );
    }
}
