//! Messages that drive the coordinator.
//!
//! A background worker posts `{"type": "SYNC_REQUIRED"}` or
//! `{"type": "PERIODIC_SYNC"}`; connectivity and session changes arrive as
//! plain events. Everything travels over one `mpsc` channel.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Signal posted by the background worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SyncRequired,
    PeriodicSync,
}

impl WorkerMessage {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).with_context(|| format!("Unrecognized worker message: {}", json))
    }
}

/// Trigger delivered to `SyncCoordinator::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    SignedIn { user_id: String },
    SignedOut,
    Online,
    Offline,
    /// The app came back to the foreground
    Foregrounded,
    Worker(WorkerMessage),
}

impl CoordinatorEvent {
    /// Parse one line of text from an external event source.
    ///
    /// Accepts worker JSON messages, `signin <user_id>` and the bare words
    /// `online`, `offline`, `foreground` and `signout`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.starts_with('{') {
            return WorkerMessage::parse(line).map(CoordinatorEvent::Worker);
        }
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();
        if command == "signin" {
            let user_id = words
                .next()
                .ok_or_else(|| anyhow::anyhow!("signin requires a user id"))?;
            return Ok(CoordinatorEvent::SignedIn {
                user_id: user_id.to_string(),
            });
        }
        match line.to_ascii_lowercase().as_str() {
            "online" => Ok(CoordinatorEvent::Online),
            "offline" => Ok(CoordinatorEvent::Offline),
            "foreground" => Ok(CoordinatorEvent::Foregrounded),
            "signout" => Ok(CoordinatorEvent::SignedOut),
            other => Err(anyhow::anyhow!("Unrecognized event: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_messages() {
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"SYNC_REQUIRED"}"#).expect("parse"),
            WorkerMessage::SyncRequired
        );
        assert_eq!(
            WorkerMessage::parse(r#"{"type":"PERIODIC_SYNC","tag":"content-sync"}"#).expect("parse"),
            WorkerMessage::PeriodicSync
        );
        assert!(WorkerMessage::parse(r#"{"type":"CACHE_UPDATED"}"#).is_err());
    }

    #[test]
    fn test_worker_message_serializes_with_type_tag() {
        let json = serde_json::to_string(&WorkerMessage::SyncRequired).expect("serialize");
        assert_eq!(json, r#"{"type":"SYNC_REQUIRED"}"#);
    }

    #[test]
    fn test_parse_event_lines() {
        assert_eq!(CoordinatorEvent::parse_line(" Online\n").expect("parse"), CoordinatorEvent::Online);
        assert_eq!(
            CoordinatorEvent::parse_line(r#"{"type":"PERIODIC_SYNC"}"#).expect("parse"),
            CoordinatorEvent::Worker(WorkerMessage::PeriodicSync)
        );
        assert!(CoordinatorEvent::parse_line("reboot").is_err());
    }

    #[test]
    fn test_parse_signin_keeps_user_id_case() {
        assert_eq!(
            CoordinatorEvent::parse_line("SignIn User-7").expect("parse"),
            CoordinatorEvent::SignedIn { user_id: "User-7".to_string() }
        );
        assert_eq!(CoordinatorEvent::parse_line("signout").expect("parse"), CoordinatorEvent::SignedOut);
        assert!(CoordinatorEvent::parse_line("signin").is_err());
    }
}
