use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CachedEntity;

/// A community the member belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Community {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub created_by: Option<String>,
    pub member_count: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl Community {
    pub fn display_member_count(&self) -> String {
        match self.member_count {
            Some(1) => "1 member".to_string(),
            Some(count) => format!("{} members", count),
            None => "Unknown".to_string(),
        }
    }
}

impl CachedEntity for Community {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
