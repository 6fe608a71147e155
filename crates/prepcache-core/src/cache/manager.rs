use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::CacheCipher;
use crate::models::{
    Community, EmergencyContact, EntityGroup, GroupData, Guide, PendingMutation, Profile,
    SyncMetadata,
};

/// Cache file holding the queue of local writes
const PENDING_FILE: &str = "pending_mutations";

/// Cache file holding the last sync time and group versions
const METADATA_FILE: &str = "sync_metadata";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        format_age(self.age_minutes())
    }
}

/// Render an age in minutes as "just now", "5m ago", "2h ago" or "3d ago"
pub fn format_age(minutes: i64) -> String {
    if minutes < 1 {
        // Negative ages come from clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        let remaining_hours = (minutes % 1440) / 60;
        if remaining_hours >= 12 {
            // Round up: 1d 12h+ becomes 2d
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Everything the UI renders from the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedCollections {
    pub profile: Option<Profile>,
    pub communities: Vec<Community>,
    pub guides: Vec<Guide>,
    pub emergency_contacts: Vec<EmergencyContact>,
}

/// Per-user local cache store.
///
/// Each entity group lives in its own file and is replaced atomically
/// (temp file + rename), so a reader never sees two sync generations mixed.
pub struct CacheManager {
    cache_dir: PathBuf,
    cipher: Option<CacheCipher>,
    // Serializes read-modify-write cycles on the pending queue
    queue_lock: Mutex<()>,
}

impl CacheManager {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            cipher: None,
            queue_lock: Mutex::new(()),
        })
    }

    /// Open a cache whose files are encrypted with a passphrase-derived key
    pub fn with_encryption(cache_dir: PathBuf, passphrase: &str) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        let cipher = CacheCipher::for_dir(&cache_dir, passphrase)?;
        Ok(Self {
            cache_dir,
            cipher: Some(cipher),
            queue_lock: Mutex::new(()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        let ext = if self.cipher.is_some() { "enc" } else { "json" };
        self.cache_dir.join(format!("{}.{}", name, ext))
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<CachedData<T>>> {
        let path = self.cache_path(name);
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read(&path)
            .with_context(|| format!("Failed to read cache file: {}", name))?;
        let contents = match &self.cipher {
            Some(cipher) => cipher
                .decrypt(&raw)
                .with_context(|| format!("Failed to decrypt cache file: {}", name))?,
            None => raw,
        };

        let cached: CachedData<T> = serde_json::from_slice(&contents)
            .with_context(|| format!("Failed to parse cache file: {}", name))?;

        Ok(Some(cached))
    }

    fn save<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let cached = CachedData::new(data);
        let path = self.cache_path(name);
        let mut contents = serde_json::to_vec_pretty(&cached)?;
        if let Some(cipher) = &self.cipher {
            contents = cipher.encrypt(&contents)?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write cache file: {}", name))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace cache file: {}", name))?;
        Ok(())
    }

    // ===== Entity Groups =====

    pub fn load_profile(&self) -> Result<Option<CachedData<Option<Profile>>>> {
        self.load(EntityGroup::Profile.cache_name())
    }

    pub fn load_communities(&self) -> Result<Option<CachedData<Vec<Community>>>> {
        self.load(EntityGroup::Communities.cache_name())
    }

    pub fn load_guides(&self) -> Result<Option<CachedData<Vec<Guide>>>> {
        self.load(EntityGroup::Guides.cache_name())
    }

    pub fn load_emergency_contacts(&self) -> Result<Option<CachedData<Vec<EmergencyContact>>>> {
        self.load(EntityGroup::EmergencyContacts.cache_name())
    }

    /// Load one group as stored, `None` if it was never cached
    pub fn load_group(&self, group: EntityGroup) -> Result<Option<CachedData<GroupData>>> {
        fn wrap<T>(cached: Option<CachedData<T>>, f: fn(T) -> GroupData) -> Option<CachedData<GroupData>> {
            cached.map(|c| CachedData {
                data: f(c.data),
                cached_at: c.cached_at,
            })
        }

        Ok(match group {
            EntityGroup::Profile => wrap(self.load_profile()?, GroupData::Profile),
            EntityGroup::Communities => wrap(self.load_communities()?, GroupData::Communities),
            EntityGroup::Guides => wrap(self.load_guides()?, GroupData::Guides),
            EntityGroup::EmergencyContacts => {
                wrap(self.load_emergency_contacts()?, GroupData::EmergencyContacts)
            }
        })
    }

    /// Replace a whole group with freshly fetched contents
    pub fn save_group(&self, data: &GroupData) -> Result<()> {
        let name = data.group().cache_name();
        match data {
            GroupData::Profile(profile) => self.save(name, profile),
            GroupData::Communities(rows) => self.save(name, rows),
            GroupData::Guides(rows) => self.save(name, rows),
            GroupData::EmergencyContacts(rows) => self.save(name, rows),
        }
    }

    /// Load every group for display. Missing groups come back empty.
    pub fn load_collections(&self) -> Result<CachedCollections> {
        Ok(CachedCollections {
            profile: self.load_profile()?.and_then(|c| c.data),
            communities: self.load_communities()?.map(|c| c.data).unwrap_or_default(),
            guides: self.load_guides()?.map(|c| c.data).unwrap_or_default(),
            emergency_contacts: self.load_emergency_contacts()?.map(|c| c.data).unwrap_or_default(),
        })
    }

    // ===== Optimistic Writes =====

    /// Reflect a local write in the cached group before the server has seen it.
    /// The record is replaced or removed as a whole.
    pub fn apply_local_change(&self, mutation: &PendingMutation) -> Result<()> {
        let mut data = self
            .load_group(mutation.group)?
            .map(|c| c.data)
            .unwrap_or_else(|| GroupData::empty(mutation.group));
        data.apply_mutation(mutation)?;
        self.save_group(&data)
    }

    // ===== Pending Mutations =====

    fn lock_queue(&self) -> MutexGuard<'_, ()> {
        // A panic while holding the guard leaves the file intact; keep going
        self.queue_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_pending(&self) -> Result<Vec<PendingMutation>> {
        Ok(self
            .load::<Vec<PendingMutation>>(PENDING_FILE)?
            .map(|c| c.data)
            .unwrap_or_default())
    }

    pub fn load_pending(&self) -> Result<Vec<PendingMutation>> {
        let _guard = self.lock_queue();
        self.read_pending()
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.load_pending()?.len())
    }

    /// Append a mutation to the queue, returning the new queue length
    pub fn enqueue_mutation(&self, mutation: PendingMutation) -> Result<usize> {
        self.modify_pending(|queue| {
            queue.push(mutation);
            queue.len()
        })
    }

    /// Drop acknowledged mutations from the queue
    pub fn remove_mutations(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.modify_pending(|queue| queue.retain(|m| !ids.contains(&m.id)))
    }

    /// Record a failed upload on each queued mutation that is still present
    pub fn mark_mutations_failed(&self, failures: &[(Uuid, String)]) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        self.modify_pending(|queue| {
            for mutation in queue.iter_mut() {
                if let Some((_, error)) = failures.iter().find(|(id, _)| *id == mutation.id) {
                    mutation.mark_failed(error.clone());
                }
            }
        })
    }

    /// Read, modify and write the queue while holding the queue lock
    fn modify_pending<R>(&self, f: impl FnOnce(&mut Vec<PendingMutation>) -> R) -> Result<R> {
        let _guard = self.lock_queue();
        let mut queue = self.read_pending()?;
        let result = f(&mut queue);
        self.save(PENDING_FILE, &queue)?;
        Ok(result)
    }

    // ===== Sync Metadata =====

    pub fn load_metadata(&self) -> Result<SyncMetadata> {
        Ok(self
            .load::<SyncMetadata>(METADATA_FILE)?
            .map(|c| c.data)
            .unwrap_or_default())
    }

    pub fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        self.save(METADATA_FILE, metadata)
    }

    // ===== Cache Age Information =====

    /// Helper to load cache and log errors without failing
    fn load_age<T>(&self, name: &str, loader: impl FnOnce() -> Result<Option<CachedData<T>>>) -> Option<String> {
        match loader() {
            Ok(Some(cached)) => Some(cached.age_display()),
            Ok(None) => None,
            Err(e) => {
                debug!(cache = name, error = %e, "Failed to load cache for age display");
                None
            }
        }
    }

    pub fn get_cache_ages(&self) -> CacheAges {
        let mut ages = BTreeMap::new();
        for group in EntityGroup::ALL {
            if let Some(age) = self.load_age(group.cache_name(), || self.load_group(group)) {
                ages.insert(group, age);
            }
        }
        CacheAges { ages }
    }
}

#[derive(Debug, Default)]
pub struct CacheAges {
    ages: BTreeMap<EntityGroup, String>,
}

impl CacheAges {
    pub fn age(&self, group: EntityGroup) -> String {
        self.ages.get(&group).cloned().unwrap_or_else(|| "never".to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, CacheManager) {
        let dir = TempDir::new().expect("tempdir");
        let cache = CacheManager::new(dir.path().to_path_buf()).expect("cache");
        (dir, cache)
    }

    fn contact(id: &str, name: &str) -> EmergencyContact {
        EmergencyContact {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: name.to_string(),
            relationship: None,
            phone: None,
            email: None,
            is_primary: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_cached_data_age_display_just_now() {
        let cached = CachedData::new(vec![1, 2, 3]);
        assert_eq!(cached.age_display(), "just now");
    }

    #[test]
    fn test_format_age_rounding() {
        assert_eq!(format_age(-3), "just now");
        assert_eq!(format_age(5), "5m ago");
        assert_eq!(format_age(89), "1h ago");
        assert_eq!(format_age(90), "2h ago");
        assert_eq!(format_age(1440 + 13 * 60), "2d ago");
    }

    #[test]
    fn test_cached_data_age_minutes() {
        let mut cached = CachedData::new(vec![1]);
        cached.cached_at = Utc::now() - Duration::minutes(61);
        assert!(cached.age_minutes() >= 61);
    }

    #[test]
    fn test_missing_groups_load_as_empty() {
        let (_dir, cache) = manager();
        assert!(cache.load_group(EntityGroup::Guides).expect("load").is_none());
        assert_eq!(cache.load_collections().expect("load"), CachedCollections::default());
        assert_eq!(cache.load_metadata().expect("load"), SyncMetadata::default());
    }

    #[test]
    fn test_save_group_replaces_contents() {
        let (_dir, cache) = manager();
        cache
            .save_group(&GroupData::EmergencyContacts(vec![contact("a", "Ann"), contact("b", "Bo")]))
            .expect("save");
        cache
            .save_group(&GroupData::EmergencyContacts(vec![contact("c", "Cy")]))
            .expect("save");

        let stored = cache.load_emergency_contacts().expect("load").expect("cached");
        assert_eq!(stored.data.len(), 1);
        assert_eq!(stored.data[0].name, "Cy");
        assert!(!cache.cache_dir().join("emergency_contacts.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (dir, cache) = manager();
        std::fs::write(dir.path().join("communities.json"), "{not json").expect("write");
        assert!(cache.load_collections().is_err());
        assert_eq!(cache.get_cache_ages().age(EntityGroup::Communities), "never");
    }

    #[test]
    fn test_pending_queue_lifecycle() {
        let (_dir, cache) = manager();
        let first = PendingMutation::delete(EntityGroup::Guides, "g1");
        let second = PendingMutation::delete(EntityGroup::Guides, "g2");
        let (first_id, second_id) = (first.id, second.id);

        assert_eq!(cache.enqueue_mutation(first).expect("enqueue"), 1);
        assert_eq!(cache.enqueue_mutation(second).expect("enqueue"), 2);

        cache
            .mark_mutations_failed(&[(second_id, "timeout".to_string())])
            .expect("mark");
        cache.remove_mutations(&[first_id]).expect("remove");

        let queue = cache.load_pending().expect("load");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, second_id);
        assert_eq!(queue[0].attempts, 1);
        assert_eq!(queue[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_apply_local_change_upserts_and_deletes() {
        let (_dir, cache) = manager();
        cache
            .save_group(&GroupData::EmergencyContacts(vec![contact("a", "Ann")]))
            .expect("save");

        let row = serde_json::to_value(contact("a", "Ann Marie")).expect("row");
        cache
            .apply_local_change(&PendingMutation::update(EntityGroup::EmergencyContacts, "a", row))
            .expect("update");
        let row = serde_json::to_value(contact("b", "Bo")).expect("row");
        cache
            .apply_local_change(&PendingMutation::insert(EntityGroup::EmergencyContacts, "b", row))
            .expect("insert");

        let names: Vec<String> = cache
            .load_collections()
            .expect("load")
            .emergency_contacts
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Ann Marie", "Bo"]);

        cache
            .apply_local_change(&PendingMutation::delete(EntityGroup::EmergencyContacts, "a"))
            .expect("delete");
        assert_eq!(cache.load_collections().expect("load").emergency_contacts.len(), 1);
    }

    #[test]
    fn test_apply_local_change_rejects_mismatched_payload() {
        let (_dir, cache) = manager();
        let row = json!({"id": "other", "name": "X", "updated_at": "2024-01-01T00:00:00Z"});
        let mutation = PendingMutation::insert(EntityGroup::Communities, "c1", row);
        assert!(cache.apply_local_change(&mutation).is_err());
    }

    #[test]
    fn test_encrypted_cache_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let cache = CacheManager::with_encryption(dir.path().to_path_buf(), "pass").expect("cache");
        cache
            .save_group(&GroupData::EmergencyContacts(vec![contact("a", "Ann")]))
            .expect("save");

        let raw = std::fs::read(dir.path().join("emergency_contacts.enc")).expect("read");
        assert!(!raw.windows(3).any(|w| w == b"Ann"));
        assert_eq!(cache.load_collections().expect("load").emergency_contacts.len(), 1);

        let wrong = CacheManager::with_encryption(dir.path().to_path_buf(), "nope").expect("cache");
        assert!(wrong.load_collections().is_err());
    }
}
