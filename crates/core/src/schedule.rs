use serde::{Deserialize, Serialize};

use crate::id::{OwnerId, TargetId};

/// Free-form per-entry plugin settings, forwarded verbatim to the executor.
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// A user's schedule for one plugin.
///
/// The last fire time is deliberately not part of the entry; it lives in the
/// schedule cache keyed by [`ScheduleEntry::cache_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub owner_id: OwnerId,
    pub target_id: TargetId,
    pub target_name: String,
    pub cron_expr: String,
    /// IANA timezone name. Empty or unknown names fall back to UTC.
    pub timezone: String,
    pub enabled: bool,
    #[serde(default)]
    pub settings: Settings,
}

impl ScheduleEntry {
    pub fn cache_key(&self) -> String {
        cache_key(self.owner_id, self.target_id)
    }

    /// Enabled with a non-blank cron expression.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.cron_expr.trim().is_empty()
    }
}

/// `"{owner_id}:{target_id}"`, the field name used by the schedule cache.
pub fn cache_key(owner_id: OwnerId, target_id: TargetId) -> String {
    format!("{owner_id}:{target_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cron: &str, enabled: bool) -> ScheduleEntry {
        ScheduleEntry {
            owner_id: OwnerId::new(3),
            target_id: TargetId::new(11),
            target_name: "hn-digest".into(),
            cron_expr: cron.into(),
            timezone: "Europe/Berlin".into(),
            enabled,
            settings: Settings::new(),
        }
    }

    #[test]
    fn cache_key_is_owner_colon_target() {
        assert_eq!(entry("0 9 * * *", true).cache_key(), "3:11");
    }

    #[test]
    fn disabled_or_blank_entries_are_not_schedulable() {
        assert!(entry("0 9 * * *", true).is_schedulable());
        assert!(!entry("0 9 * * *", false).is_schedulable());
        assert!(!entry("   ", true).is_schedulable());
    }

    #[test]
    fn settings_default_to_empty_when_missing() {
        let json = r#"{"owner_id":1,"target_id":2,"target_name":"x","cron_expr":"* * * * *","timezone":"UTC","enabled":true}"#;
        let entry: ScheduleEntry = serde_json::from_str(json).unwrap();
        assert!(entry.settings.is_empty());
    }
}
