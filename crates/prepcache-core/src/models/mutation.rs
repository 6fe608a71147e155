use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EntityGroup;

/// Kind of local write waiting for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// A local write not yet confirmed by the remote store.
///
/// Created on an offline edit, attempted on the next sync, removed once the
/// server acknowledges it. Failed attempts keep the mutation queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PendingMutation {
    pub id: Uuid,
    pub group: EntityGroup,
    pub kind: MutationKind,
    pub record_id: String,
    /// Full row for inserts and updates, ignored for deletes
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingMutation {
    pub fn new(
        group: EntityGroup,
        kind: MutationKind,
        record_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group,
            kind,
            record_id: record_id.into(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    pub fn insert(group: EntityGroup, record_id: impl Into<String>, row: serde_json::Value) -> Self {
        Self::new(group, MutationKind::Insert, record_id, row)
    }

    pub fn update(group: EntityGroup, record_id: impl Into<String>, row: serde_json::Value) -> Self {
        Self::new(group, MutationKind::Update, record_id, row)
    }

    pub fn delete(group: EntityGroup, record_id: impl Into<String>) -> Self {
        Self::new(group, MutationKind::Delete, record_id, serde_json::Value::Null)
    }

    /// Record a failed upload attempt
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }
}
