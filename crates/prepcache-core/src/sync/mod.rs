//! Offline sync: change detection, the sync engine and the coordinator
//! that schedules them.
//!
//! - `ChangeDetector` probes the remote cheaply and reports changed groups
//! - `SyncEngine` uploads queued writes and pulls authoritative data
//! - `SyncCoordinator` turns sign-in, connectivity and worker signals into
//!   checks and syncs, one at a time

pub mod coordinator;
pub mod detector;
pub mod engine;
pub mod error;
pub mod progress;
pub mod signals;

#[cfg(test)]
pub(crate) mod fake;

pub use coordinator::{CheckOutcome, CoordinatorStatus, SyncCoordinator, SyncPhase};
pub use detector::{ChangeDetector, ChangeReport};
pub use engine::{GroupError, SyncEngine, SyncOutcome, SyncReport};
pub use error::SyncError;
pub use progress::{SyncProgress, SyncStatus};
pub use signals::{CoordinatorEvent, WorkerMessage};
