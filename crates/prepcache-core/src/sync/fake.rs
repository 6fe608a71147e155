//! In-memory `RemoteStore` for engine, detector and coordinator tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::models::{
    Community, EmergencyContact, EntityGroup, GroupData, Guide, PendingMutation, Profile,
    RemoteMarker,
};
use crate::remote::RemoteStore;

pub const USER: &str = "user-1";

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).single().expect("valid time")
}

pub fn guide(id: &str, title: &str, updated_at: DateTime<Utc>) -> Guide {
    Guide {
        id: id.to_string(),
        title: title.to_string(),
        content: "Keep three days of water per person.".to_string(),
        category: Some("kits".to_string()),
        community_id: None,
        updated_at,
    }
}

pub fn contact(id: &str, name: &str, updated_at: DateTime<Utc>) -> EmergencyContact {
    EmergencyContact {
        id: id.to_string(),
        user_id: USER.to_string(),
        name: name.to_string(),
        relationship: Some("Neighbor".to_string()),
        phone: Some("5550001111".to_string()),
        email: None,
        is_primary: false,
        updated_at,
    }
}

#[derive(Default)]
pub struct FakeRemote {
    groups: Mutex<BTreeMap<EntityGroup, GroupData>>,
    failing: Mutex<HashSet<EntityGroup>>,
    offline: AtomicBool,
    reject_mutations: AtomicBool,
    delay: Mutex<Option<Duration>>,
    fetch_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    applied: Mutex<Vec<PendingMutation>>,
}

impl FakeRemote {
    /// One row in every group
    pub fn seeded() -> Self {
        let remote = Self::default();
        remote.set_group(GroupData::Profile(Some(Profile {
            id: USER.to_string(),
            full_name: Some("Dana Ortiz".to_string()),
            email: Some("dana@example.org".to_string()),
            phone: None,
            avatar_url: None,
            household_size: Some(3),
            medical_notes: None,
            updated_at: at(0),
        })));
        remote.set_group(GroupData::Communities(vec![Community {
            id: "c1".to_string(),
            name: "Maple Street".to_string(),
            description: None,
            location: Some("Ward 3".to_string()),
            created_by: Some(USER.to_string()),
            member_count: Some(12),
            updated_at: at(1),
        }]));
        remote.set_group(GroupData::Guides(vec![guide("g1", "Go bag", at(2))]));
        remote.set_group(GroupData::EmergencyContacts(vec![contact("e1", "Sam", at(3))]));
        remote
    }

    pub fn set_group(&self, data: GroupData) {
        self.groups.lock().expect("lock").insert(data.group(), data);
    }

    pub fn group(&self, group: EntityGroup) -> GroupData {
        self.groups
            .lock()
            .expect("lock")
            .get(&group)
            .cloned()
            .unwrap_or_else(|| GroupData::empty(group))
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_group(&self, group: EntityGroup) {
        self.failing.lock().expect("lock").insert(group);
    }

    pub fn set_reject_mutations(&self, reject: bool) {
        self.reject_mutations.store(reject, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock") = Some(delay);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<PendingMutation> {
        self.applied.lock().expect("lock").clone()
    }

    fn check_reachable(&self, group: EntityGroup) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("Network error: connection refused"));
        }
        if self.failing.lock().expect("lock").contains(&group) {
            return Err(anyhow!("Server error: {} unavailable", group));
        }
        Ok(())
    }

    async fn maybe_wait(&self) {
        let delay = *self.delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn fetch_group(&self, group: EntityGroup, _user_id: &str) -> Result<GroupData> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_wait().await;
        self.check_reachable(group)?;
        Ok(self.group(group))
    }

    async fn probe_group(&self, group: EntityGroup, _user_id: &str) -> Result<RemoteMarker> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(group)?;
        Ok(self.group(group).marker())
    }

    async fn apply_mutation(&self, mutation: &PendingMutation) -> Result<()> {
        self.maybe_wait().await;
        self.check_reachable(mutation.group)?;
        if self.reject_mutations.load(Ordering::SeqCst) {
            return Err(anyhow!("Conflict: {} rejected", mutation.record_id));
        }
        let mut groups = self.groups.lock().expect("lock");
        let data = groups
            .entry(mutation.group)
            .or_insert_with(|| GroupData::empty(mutation.group));
        data.apply_mutation(mutation)?;
        self.applied.lock().expect("lock").push(mutation.clone());
        Ok(())
    }
}
