use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CachedEntity;

/// A preparedness guide (evacuation plan, kit checklist, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Guide {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub category: Option<String>,
    pub community_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CachedEntity for Guide {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
