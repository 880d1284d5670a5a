//! Tri-state conditions attached to workflow resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A named fact about a resource's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Conditions of one resource, one entry per type.
///
/// Entries keep insertion order for display; lookups are by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionLedger {
    conditions: Vec<Condition>,
}

impl ConditionLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the condition of the given type.
    #[must_use]
    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Returns the status of a type, `Unknown` if absent.
    #[must_use]
    pub fn status(&self, condition_type: &str) -> ConditionStatus {
        self.get(condition_type)
            .map_or(ConditionStatus::Unknown, |c| c.status)
    }

    /// Returns true if the type is present and `True`.
    #[must_use]
    pub fn is_true(&self, condition_type: &str) -> bool {
        self.status(condition_type) == ConditionStatus::True
    }

    /// Returns true if every listed type is `True`.
    #[must_use]
    pub fn all_true<S: AsRef<str>>(&self, condition_types: &[S]) -> bool {
        condition_types.iter().all(|t| self.is_true(t.as_ref()))
    }

    /// Iterates conditions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Sets a condition, returning true if the ledger changed.
    ///
    /// An existing condition only transitions when `status` differs from the
    /// stored one; the message and transition time move with it.
    pub fn set(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) if existing.status == status => false,
            Some(existing) => {
                existing.status = status;
                existing.message = message.into();
                existing.last_transition_time = now;
                true
            }
            None => {
                self.conditions.push(Condition {
                    condition_type: condition_type.to_string(),
                    status,
                    message: message.into(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    /// Aligns the ledger with the expected types.
    ///
    /// Types no longer expected are removed; missing expected types are
    /// added as `Unknown`. Returns true if the ledger changed.
    pub fn reconcile_expected<S: AsRef<str>>(&mut self, expected: &[S], now: DateTime<Utc>) -> bool {
        let before = self.conditions.len();
        self.conditions
            .retain(|c| expected.iter().any(|t| t.as_ref() == c.condition_type));
        let mut changed = self.conditions.len() != before;

        for condition_type in expected {
            if self.get(condition_type.as_ref()).is_none() {
                self.conditions.push(Condition {
                    condition_type: condition_type.as_ref().to_string(),
                    status: ConditionStatus::Unknown,
                    message: String::new(),
                    last_transition_time: now,
                });
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn set_only_transitions_on_status_change() {
        let mut ledger = ConditionLedger::new();
        let t0 = Utc::now();

        assert!(ledger.set("SynchronizeExist", ConditionStatus::True, "created", t0));
        let later = t0 + Duration::seconds(30);
        assert!(!ledger.set("SynchronizeExist", ConditionStatus::True, "again", later));

        let condition = ledger.get("SynchronizeExist").unwrap();
        assert_eq!(condition.message, "created");
        assert_eq!(condition.last_transition_time, t0);

        assert!(ledger.set("SynchronizeExist", ConditionStatus::False, "gone", later));
        assert_eq!(
            ledger.get("SynchronizeExist").unwrap().last_transition_time,
            later
        );
    }

    #[test]
    fn missing_condition_is_unknown() {
        let ledger = ConditionLedger::new();
        assert_eq!(ledger.status("SignSuccess"), ConditionStatus::Unknown);
        assert!(!ledger.is_true("SignSuccess"));
        assert!(ledger.all_true::<&str>(&[]));
    }

    #[test]
    fn reconcile_expected_prunes_and_initializes() {
        let now = Utc::now();
        let mut ledger = ConditionLedger::new();
        ledger.set("ReplicateSuccess", ConditionStatus::True, "", now);
        ledger.set("SignSuccess", ConditionStatus::False, "key revoked", now);

        let changed = ledger.reconcile_expected(&["ReplicateSuccess", "ScanSuccess"], now);
        assert!(changed);
        assert!(ledger.get("SignSuccess").is_none());
        assert_eq!(ledger.status("ScanSuccess"), ConditionStatus::Unknown);
        assert!(ledger.is_true("ReplicateSuccess"));

        assert!(!ledger.reconcile_expected(&["ReplicateSuccess", "ScanSuccess"], now));
    }

    #[test]
    fn keeps_insertion_order() {
        let now = Utc::now();
        let mut ledger = ConditionLedger::new();
        ledger.set("B", ConditionStatus::True, "", now);
        ledger.set("A", ConditionStatus::True, "", now);
        let types: Vec<&str> = ledger.iter().map(|c| c.condition_type.as_str()).collect();
        assert_eq!(types, ["B", "A"]);
    }

    #[test]
    fn wire_shape() {
        let now = Utc::now();
        let mut ledger = ConditionLedger::new();
        ledger.set("SynchronizeSuccess", ConditionStatus::Unknown, "waiting", now);

        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json[0]["type"], "SynchronizeSuccess");
        assert_eq!(json[0]["status"], "Unknown");
        assert_eq!(json[0]["message"], "waiting");
        assert_eq!(json[0]["lastTransitionTime"], json!(now));
    }
}
