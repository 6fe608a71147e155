use serde::Serialize;

/// Coarse state of the most recent sync pass, for status indicators only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub status: SyncStatus,
    /// 0-100
    pub progress: u8,
    pub message: Option<String>,
}

impl SyncProgress {
    pub fn idle() -> Self {
        Self {
            status: SyncStatus::Idle,
            progress: 0,
            message: None,
        }
    }

    pub fn syncing(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Syncing,
            progress: progress.min(99),
            message: Some(message.into()),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Success,
            progress: 100,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Error,
            progress: 100,
            message: Some(message.into()),
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::idle()
    }
}
