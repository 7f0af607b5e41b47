use chrono::{DateTime, Utc};
use pkg_constants::state::MIGRATION_PREFIX;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::object::impl_object;

// --- Migration phase ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MigrationPhase {
    #[default]
    Pending,
    Scheduling,
    Running,
    Succeeded,
    Failed,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Succeeded | MigrationPhase::Failed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Pending => write!(f, "Pending"),
            MigrationPhase::Scheduling => write!(f, "Scheduling"),
            MigrationPhase::Running => write!(f, "Running"),
            MigrationPhase::Succeeded => write!(f, "Succeeded"),
            MigrationPhase::Failed => write!(f, "Failed"),
        }
    }
}

// --- Conditions ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A typed, timestamped status entry on a migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

// --- Migration spec / status ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSpec {
    /// Name of the VMI being migrated; its launcher pod carries the footprint.
    pub vmi_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationStatus {
    #[serde(default)]
    pub phase: MigrationPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// --- Migration ---

/// A live migration of a VMI, owned by the migration subsystem.
///
/// The quota controller reads `status.phase` and writes exactly one entry of
/// `status.conditions`; everything else belongs to other writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: MigrationSpec,
    #[serde(default)]
    pub status: MigrationStatus,
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl_object!(Migration, MIGRATION_PREFIX, "Migration");

impl Migration {
    pub fn new(namespace: &str, name: &str, vmi_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: MigrationSpec {
                vmi_name: vmi_name.to_string(),
            },
            status: MigrationStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase: MigrationPhase) -> Self {
        self.status.phase = phase;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// True when a condition of this type exists with status `True`.
    pub fn has_true_condition(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(MigrationPhase::Succeeded.is_terminal());
        assert!(MigrationPhase::Failed.is_terminal());
        assert!(!MigrationPhase::Running.is_terminal());
        assert!(!MigrationPhase::Pending.is_terminal());
        assert!(!MigrationPhase::Scheduling.is_terminal());
    }

    #[test]
    fn condition_serializes_with_type_key() {
        let cond = Condition {
            condition_type: "RejectedByResourceQuota".to_string(),
            status: ConditionStatus::True,
            reason: "InsufficientQuota".to_string(),
            message: "short".to_string(),
            last_transition_time: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };
        let value = serde_json::to_value(&cond).unwrap();
        assert_eq!(value["type"], "RejectedByResourceQuota");
        assert_eq!(value["status"], "True");
        assert_eq!(value["lastTransitionTime"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn has_true_condition_checks_status() {
        let mut migration = Migration::new("ns", "m", "vmi");
        assert!(!migration.has_true_condition("X"));
        migration.status.conditions.push(Condition {
            condition_type: "X".to_string(),
            status: ConditionStatus::False,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Utc::now(),
        });
        assert!(!migration.has_true_condition("X"));
        migration.status.conditions[0].status = ConditionStatus::True;
        assert!(migration.has_true_condition("X"));
    }
}
