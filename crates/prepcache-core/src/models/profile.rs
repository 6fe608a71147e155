use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CachedEntity;

/// The signed-in member's profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Profile {
    pub id: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub household_size: Option<i32>,
    pub medical_notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn display_name(&self) -> String {
        match self.full_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => self.email.clone().unwrap_or_else(|| "Unnamed member".to_string()),
        }
    }
}

impl CachedEntity for Profile {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
