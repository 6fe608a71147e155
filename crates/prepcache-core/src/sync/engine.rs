//! Sync engine: uploads queued local writes, then pulls authoritative data.
//!
//! A pass runs in three steps:
//!
//! 1. Flush pending mutations in FIFO order. Acknowledged mutations leave the
//!    queue; failed ones stay for the next pass.
//! 2. Fetch the requested groups (plus any group a flushed mutation touched)
//!    with limited concurrency.
//! 3. Replace each fetched group in the cache as a unit and record its
//!    version marker. `last_sync` only advances when every group succeeded.
//!
//! Only one pass runs at a time; a call made while a pass is in flight
//! returns `SyncOutcome::AlreadyRunning` immediately.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::SyncProgress;
use crate::api::ApiError;
use crate::cache::CacheManager;
use crate::models::{EntityGroup, GroupData, PendingMutation, SyncMetadata};
use crate::remote::RemoteStore;

/// Maximum concurrent group fetches per pass.
const MAX_CONCURRENT_FETCHES: usize = 4;

/// Share of the progress bar spent uploading mutations.
const UPLOAD_PROGRESS: u8 = 20;

/// Result of asking the engine to sync
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Another pass was in flight; nothing was done
    AlreadyRunning,
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::AlreadyRunning => None,
            SyncOutcome::Completed(report) => Some(report),
        }
    }
}

/// A failure during a pass. `group` is `None` for queue or metadata errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupError {
    pub group: Option<EntityGroup>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Every requested group was fetched and stored
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mutations_applied: usize,
    pub mutations_failed: usize,
    /// Rows stored per group
    pub group_counts: BTreeMap<EntityGroup, usize>,
    pub errors: Vec<GroupError>,
    /// `last_sync` after the pass; unchanged when the pass was partial
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        let rows: usize = self.group_counts.values().sum();
        let mut summary = format!(
            "{} group(s), {} row(s), {} change(s) uploaded",
            self.group_counts.len(),
            rows,
            self.mutations_applied
        );
        if self.mutations_failed > 0 {
            summary.push_str(&format!(", {} change(s) pending", self.mutations_failed));
        }
        if !self.errors.is_empty() {
            summary.push_str(&format!(", {} error(s)", self.errors.len()));
        }
        summary
    }
}

#[derive(Default)]
struct FlushResult {
    applied: Vec<Uuid>,
    failed: Vec<(Uuid, String)>,
    touched: BTreeSet<EntityGroup>,
    errors: Vec<GroupError>,
}

/// Releases the in-flight flag however the pass ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<CacheManager>,
    in_flight: AtomicBool,
    progress: watch::Sender<SyncProgress>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: Arc<CacheManager>) -> Self {
        let (progress, _) = watch::channel(SyncProgress::idle());
        Self {
            remote,
            cache,
            in_flight: AtomicBool::new(false),
            progress,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stream of progress updates for status indicators
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    fn report_progress(&self, progress: SyncProgress) {
        // send_replace succeeds with no subscribers
        self.progress.send_replace(progress);
    }

    fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(&self.in_flight))
    }

    /// Sync every entity group
    pub async fn full_sync(&self, user_id: &str) -> SyncOutcome {
        self.sync_groups(user_id, &EntityGroup::ALL).await
    }

    /// Sync only `groups` (and any group touched by a flushed mutation).
    /// Other groups' cache files are left untouched.
    pub async fn sync_groups(&self, user_id: &str, groups: &[EntityGroup]) -> SyncOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("Sync already in flight, skipping");
            return SyncOutcome::AlreadyRunning;
        };

        let started_at = Utc::now();
        info!(user_id = user_id, groups = ?groups, "Sync started");
        self.report_progress(SyncProgress::syncing(0, "Uploading local changes"));

        let flush = self.flush_mutations().await;

        let mut targets: BTreeSet<EntityGroup> = groups.iter().copied().collect();
        targets.extend(flush.touched.iter().copied());
        let targets: Vec<EntityGroup> = targets.into_iter().collect();

        self.report_progress(SyncProgress::syncing(UPLOAD_PROGRESS, "Downloading data"));

        let mut errors = flush.errors;
        let mut metadata = match self.cache.load_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "Failed to read sync metadata, starting fresh");
                SyncMetadata::default()
            }
        };

        let remaining = match self.cache.load_pending() {
            Ok(queue) => queue,
            Err(e) => {
                warn!(error = %e, "Failed to re-read pending queue");
                Vec::new()
            }
        };

        let group_counts = self
            .pull_groups(user_id, &targets, &remaining, &mut metadata, &mut errors)
            .await;

        // A pass that pulled nothing only counts if it had nothing to upload
        if targets.is_empty() && !flush.failed.is_empty() {
            errors.push(GroupError {
                group: None,
                message: format!("{} queued change(s) could not be uploaded", flush.failed.len()),
            });
        }

        let pulled_everything = !targets.is_empty()
            && errors.iter().all(|e| e.group.is_none())
            && group_counts.len() == targets.len();
        let previous_last_sync = metadata.last_sync;
        if pulled_everything {
            metadata.advance_last_sync(Utc::now());
        }
        if let Err(e) = self.cache.save_metadata(&metadata) {
            error!(error = %e, "Failed to save sync metadata");
            errors.push(GroupError {
                group: None,
                message: format!("Failed to save sync metadata: {:#}", e),
            });
            metadata.last_sync = previous_last_sync;
        }

        let report = SyncReport {
            success: errors.is_empty(),
            started_at,
            finished_at: Utc::now(),
            mutations_applied: flush.applied.len(),
            mutations_failed: flush.failed.len(),
            group_counts,
            errors,
            last_sync: metadata.last_sync,
        };

        if report.success {
            info!(summary = %report.summary(), "Sync complete");
            self.report_progress(SyncProgress::success(report.summary()));
        } else {
            warn!(summary = %report.summary(), errors = ?report.errors, "Sync finished with errors");
            self.report_progress(SyncProgress::error(report.summary()));
        }

        SyncOutcome::Completed(report)
    }

    /// Upload queued mutations. Once a mutation fails, later mutations for the
    /// same record wait for the next pass so they are not applied out of order.
    async fn flush_mutations(&self) -> FlushResult {
        let mut result = FlushResult::default();

        let queue = match self.cache.load_pending() {
            Ok(queue) => queue,
            Err(e) => {
                error!(error = %e, "Failed to read pending queue");
                result.errors.push(GroupError {
                    group: None,
                    message: format!("Failed to read pending queue: {:#}", e),
                });
                return result;
            }
        };
        if queue.is_empty() {
            return result;
        }

        debug!(count = queue.len(), "Uploading pending mutations");
        let mut blocked: HashSet<(EntityGroup, String)> = HashSet::new();

        for mutation in &queue {
            let key = (mutation.group, mutation.record_id.clone());
            if blocked.contains(&key) {
                continue;
            }
            match self.remote.apply_mutation(mutation).await {
                Ok(()) => {
                    result.applied.push(mutation.id);
                    result.touched.insert(mutation.group);
                }
                Err(e) => {
                    let transient = e.downcast_ref::<ApiError>().map_or(true, ApiError::is_transient);
                    if transient {
                        warn!(mutation = %mutation.id, group = %mutation.group, error = %e, "Mutation upload failed, keeping it queued");
                    } else {
                        error!(mutation = %mutation.id, group = %mutation.group, error = %e, "Mutation rejected by server, keeping it queued");
                    }
                    result.failed.push((mutation.id, format!("{:#}", e)));
                    blocked.insert(key);
                }
            }
        }

        if let Err(e) = self.cache.remove_mutations(&result.applied) {
            error!(error = %e, "Failed to drop acknowledged mutations");
            result.errors.push(GroupError {
                group: None,
                message: format!("Failed to update pending queue: {:#}", e),
            });
        }
        if let Err(e) = self.cache.mark_mutations_failed(&result.failed) {
            warn!(error = %e, "Failed to record mutation failures");
        }

        result
    }

    /// Fetch `targets`, store each group as a unit and record its version.
    async fn pull_groups(
        &self,
        user_id: &str,
        targets: &[EntityGroup],
        pending: &[PendingMutation],
        metadata: &mut SyncMetadata,
        errors: &mut Vec<GroupError>,
    ) -> BTreeMap<EntityGroup, usize> {
        let mut counts = BTreeMap::new();
        let total = targets.len().max(1);
        let mut done = 0usize;

        let mut fetches = stream::iter(targets.iter().copied())
            .map(|group| async move { (group, self.remote.fetch_group(group, user_id).await) })
            .buffer_unordered(MAX_CONCURRENT_FETCHES);

        while let Some((group, fetched)) = fetches.next().await {
            done += 1;
            match fetched {
                Ok(data) => {
                    let marker = data.marker();
                    let count = data.len();
                    match self.store_group(data, pending) {
                        Ok(()) => {
                            metadata.record_group(group, marker, Utc::now());
                            counts.insert(group, count);
                            debug!(group = %group, count = count, "Group stored");
                        }
                        Err(e) => {
                            error!(group = %group, error = %e, "Failed to store group");
                            errors.push(GroupError {
                                group: Some(group),
                                message: format!("{:#}", e),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!(group = %group, error = %e, "Group fetch failed");
                    errors.push(GroupError {
                        group: Some(group),
                        message: format!("{:#}", e),
                    });
                }
            }

            let progress = UPLOAD_PROGRESS as usize + (100 - UPLOAD_PROGRESS as usize) * done / total;
            self.report_progress(SyncProgress::syncing(
                progress as u8,
                format!("Downloaded {}", group.display_name()),
            ));
        }

        counts
    }

    /// Replace a group in the cache, keeping still-queued local writes visible
    fn store_group(&self, mut data: GroupData, pending: &[PendingMutation]) -> anyhow::Result<()> {
        let group = data.group();
        for mutation in pending.iter().filter(|m| m.group == group) {
            if let Err(e) = data.apply_mutation(mutation) {
                warn!(mutation = %mutation.id, error = %e, "Cannot overlay pending mutation");
            }
        }
        self.cache.save_group(&data)
    }
}
