//! Sync coordinator: decides when to check for changes and when to sync.
//!
//! The coordinator owns the sign-in and connectivity state, runs the event
//! loop that turns triggers into checks and syncs, and guarantees that at
//! most one check or sync is active at a time. Overlapping triggers are
//! dropped, not queued.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    ChangeDetector, CoordinatorEvent, SyncEngine, SyncError, SyncOutcome, SyncProgress, SyncReport,
};
use crate::cache::{CacheManager, CachedCollections};
use crate::config::SyncSettings;
use crate::models::{PendingMutation, SyncMetadata};

/// What the coordinator is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Checking,
    Syncing,
}

/// Result of a change check
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Another check or sync was active
    Skipped,
    /// Nothing changed remotely and nothing was queued locally
    Unchanged,
    Synced(SyncReport),
}

/// Snapshot for status indicators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub phase: SyncPhase,
    pub is_syncing: bool,
    pub progress: SyncProgress,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub online: bool,
    pub signed_in_user: Option<String>,
}

/// Follow-up the event loop performs after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    FullSyncAfter(Duration),
    Check,
    /// Drop any scheduled full sync
    Cancel,
}

struct State {
    phase: SyncPhase,
    user_id: Option<String>,
    online: bool,
}

/// Returns the phase to idle however the operation ends.
struct PhaseGuard<'a> {
    state: &'a Mutex<State>,
}

impl PhaseGuard<'_> {
    fn advance(&self, phase: SyncPhase) {
        lock(self.state).phase = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).phase = SyncPhase::Idle;
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SyncCoordinator {
    engine: SyncEngine,
    detector: ChangeDetector,
    cache: Arc<CacheManager>,
    /// Member whose directory `cache` was opened for
    cache_owner: String,
    settings: SyncSettings,
    state: Mutex<State>,
}

impl SyncCoordinator {
    pub fn new(
        engine: SyncEngine,
        detector: ChangeDetector,
        cache: Arc<CacheManager>,
        cache_owner: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            engine,
            detector,
            cache,
            cache_owner: cache_owner.into(),
            settings,
            state: Mutex::new(State {
                phase: SyncPhase::Idle,
                user_id: None,
                online: true,
            }),
        }
    }

    /// Sign in the member owning the cache. Any other member is refused so
    /// their rows never land in this member's cache directory.
    pub fn sign_in(&self, user_id: impl Into<String>) -> Result<(), SyncError> {
        let user_id = user_id.into();
        if user_id != self.cache_owner {
            return Err(SyncError::WrongMember {
                cache_owner: self.cache_owner.clone(),
                user_id,
            });
        }
        info!(user_id = %user_id, "Member signed in");
        lock(&self.state).user_id = Some(user_id);
        Ok(())
    }

    pub fn sign_out(&self) {
        info!("Member signed out");
        lock(&self.state).user_id = None;
    }

    /// Record connectivity, returning the previous value
    pub fn set_online(&self, online: bool) -> bool {
        let mut state = lock(&self.state);
        let was_online = state.online;
        state.online = online;
        if was_online != online {
            info!(online = online, "Connectivity changed");
        }
        was_online
    }

    /// Claim `phase` if nothing else is active
    fn begin(&self, phase: SyncPhase) -> Result<Option<(PhaseGuard<'_>, String)>, SyncError> {
        let mut state = lock(&self.state);
        let user_id = state.user_id.clone().ok_or(SyncError::NotSignedIn)?;
        if !state.online {
            return Err(SyncError::Offline);
        }
        if state.phase != SyncPhase::Idle {
            debug!(phase = ?state.phase, "Coordinator busy, skipping");
            return Ok(None);
        }
        state.phase = phase;
        Ok(Some((PhaseGuard { state: &self.state }, user_id)))
    }

    /// Run a full sync now
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let Some((_phase, user_id)) = self.begin(SyncPhase::Syncing)? else {
            return Ok(SyncOutcome::AlreadyRunning);
        };
        Ok(self.engine.full_sync(&user_id).await)
    }

    /// Probe the remote and sync only the groups that changed.
    ///
    /// Queued local writes also trigger a sync so they get uploaded.
    pub async fn check_for_changes(&self) -> Result<CheckOutcome, SyncError> {
        let Some((phase, user_id)) = self.begin(SyncPhase::Checking)? else {
            return Ok(CheckOutcome::Skipped);
        };

        let metadata = self.cache.load_metadata().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read sync metadata, treating cache as empty");
            SyncMetadata::default()
        });
        let report = self.detector.check(&user_id, &metadata).await;
        let pending = self.pending_count();

        if !report.has_changes && pending == 0 {
            debug!("No remote changes");
            return Ok(CheckOutcome::Unchanged);
        }

        info!(groups = ?report.changed_groups, pending = pending, "Changes found, syncing");
        phase.advance(SyncPhase::Syncing);
        match self.engine.sync_groups(&user_id, &report.changed_groups).await {
            SyncOutcome::AlreadyRunning => Ok(CheckOutcome::Skipped),
            SyncOutcome::Completed(report) => Ok(CheckOutcome::Synced(report)),
        }
    }

    /// Apply a local write to the cache and queue it for upload.
    /// Returns the queue length.
    pub fn record_local_change(&self, mutation: PendingMutation) -> Result<usize, SyncError> {
        let id = mutation.id;
        let local = mutation.clone();
        let queued = self.cache.enqueue_mutation(mutation)?;

        // The cache only shows writes that are queued for upload
        if let Err(e) = self.cache.apply_local_change(&local) {
            if let Err(rollback) = self.cache.remove_mutations(&[id]) {
                warn!(mutation = %id, error = %rollback, "Failed to drop unapplied change from queue");
            }
            return Err(e.into());
        }

        debug!(pending = queued, "Local change queued");
        Ok(queued)
    }

    /// Everything cached for display; unreadable caches come back empty
    pub fn cached_data(&self) -> CachedCollections {
        self.cache.load_collections().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read cached data");
            CachedCollections::default()
        })
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.engine.subscribe()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let (phase, online, signed_in_user) = {
            let state = lock(&self.state);
            (state.phase, state.online, state.user_id.clone())
        };
        let last_sync_time = match self.cache.load_metadata() {
            Ok(metadata) => metadata.last_sync,
            Err(e) => {
                warn!(error = %e, "Failed to read sync metadata");
                None
            }
        };

        CoordinatorStatus {
            phase,
            is_syncing: self.engine.is_syncing(),
            progress: self.engine.progress(),
            last_sync_time,
            pending_count: self.pending_count(),
            online,
            signed_in_user,
        }
    }

    fn pending_count(&self) -> usize {
        self.cache.pending_count().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read pending queue");
            0
        })
    }

    fn handle_event(&self, event: CoordinatorEvent) -> Action {
        debug!(?event, "Coordinator event");
        match event {
            CoordinatorEvent::SignedIn { user_id } => {
                if let Err(e) = self.sign_in(user_id) {
                    warn!(error = %e, "Sign-in refused");
                    return Action::None;
                }
                if lock(&self.state).online {
                    Action::FullSyncAfter(self.settings.login_delay())
                } else {
                    Action::None
                }
            }
            CoordinatorEvent::SignedOut => {
                self.sign_out();
                Action::Cancel
            }
            CoordinatorEvent::Online => {
                let was_online = self.set_online(true);
                if !was_online && lock(&self.state).user_id.is_some() {
                    Action::FullSyncAfter(self.settings.reconnect_delay())
                } else {
                    Action::None
                }
            }
            CoordinatorEvent::Offline => {
                self.set_online(false);
                Action::Cancel
            }
            CoordinatorEvent::Foregrounded | CoordinatorEvent::Worker(_) => {
                if self.can_check() {
                    Action::Check
                } else {
                    Action::None
                }
            }
        }
    }

    fn can_check(&self) -> bool {
        let state = lock(&self.state);
        state.online && state.user_id.is_some()
    }

    fn spawn_check(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.check_for_changes().await {
                Ok(CheckOutcome::Synced(report)) => {
                    debug!(success = report.success, "Change check synced");
                }
                Ok(outcome) => debug!(?outcome, "Change check finished"),
                Err(e) => debug!(error = %e, "Change check not run"),
            }
        });
    }

    fn spawn_sync(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.sync().await {
                Ok(SyncOutcome::Completed(report)) => {
                    debug!(success = report.success, "Scheduled sync finished");
                }
                Ok(SyncOutcome::AlreadyRunning) => debug!("Scheduled sync skipped"),
                Err(e) => warn!(error = %e, "Scheduled sync not run"),
            }
        });
    }

    /// Process events until the sender side is dropped.
    ///
    /// Checks run every `check_interval` while online and signed in. Passes
    /// already in flight when the channel closes are left to finish.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<CoordinatorEvent>) {
        let period = self.settings.check_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scheduled: Option<Instant> = None;

        info!(interval_secs = period.as_secs(), "Sync coordinator started");

        loop {
            let deadline = scheduled;
            let scheduled_sync = async move {
                match deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed, coordinator stopping");
                        break;
                    };
                    match self.handle_event(event) {
                        Action::None => {}
                        Action::FullSyncAfter(delay) => {
                            debug!(delay_ms = delay.as_millis() as u64, "Full sync scheduled");
                            scheduled = Some(Instant::now() + delay);
                        }
                        Action::Check => self.spawn_check(),
                        Action::Cancel => scheduled = None,
                    }
                }
                _ = scheduled_sync => {
                    scheduled = None;
                    self.spawn_sync();
                }
                _ = ticker.tick() => {
                    if self.can_check() {
                        self.spawn_check();
                    }
                }
            }
        }
    }
}
