use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CachedEntity;
use crate::utils::format_phone;

/// A personal emergency contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct EmergencyContact {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub relationship: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
    pub updated_at: DateTime<Utc>,
}

impl EmergencyContact {
    pub fn display_phone(&self) -> String {
        self.phone
            .as_deref()
            .map(format_phone)
            .unwrap_or_else(|| "No phone".to_string())
    }

    /// One-line summary, primary contacts marked with `*`
    pub fn summary(&self) -> String {
        let marker = if self.is_primary { "*" } else { " " };
        match self.relationship.as_deref() {
            Some(rel) if !rel.is_empty() => {
                format!("{} {} ({}) {}", marker, self.name, rel, self.display_phone())
            }
            _ => format!("{} {} {}", marker, self.name, self.display_phone()),
        }
    }
}

impl CachedEntity for EmergencyContact {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(phone: Option<&str>, relationship: Option<&str>, is_primary: bool) -> EmergencyContact {
        EmergencyContact {
            id: "e1".to_string(),
            user_id: "u1".to_string(),
            name: "Sam Lee".to_string(),
            relationship: relationship.map(String::from),
            phone: phone.map(String::from),
            email: None,
            is_primary,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_summary_formats_phone() {
        let c = contact(Some("5551234567"), Some("Sister"), true);
        assert_eq!(c.summary(), "* Sam Lee (Sister) (555) 123-4567");
    }

    #[test]
    fn test_summary_without_phone_or_relationship() {
        let c = contact(None, None, false);
        assert_eq!(c.summary(), "  Sam Lee No phone");
    }

    #[test]
    fn test_is_primary_defaults_to_false() {
        let json = r#"{"id":"e2","user_id":"u1","name":"Ana","relationship":null,"phone":null,"email":null,"updated_at":"2024-01-01T00:00:00Z"}"#;
        let c: EmergencyContact = serde_json::from_str(json).expect("contact row should parse");
        assert!(!c.is_primary);
    }
}
