use chrono::{DateTime, Utc};
use pkg_constants::state::GRANT_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::object::impl_object;
use crate::resource::ResourceList;

// --- Grant spec ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantSpec {
    /// Extra headroom the tenant offers to migrations in this namespace.
    #[serde(default)]
    pub additional: ResourceList,
}

// --- Grant status (written by the controller only) ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantStatus {
    /// Most recent migration that consumed from this grant.
    #[serde(default)]
    pub applied_to: Option<String>,
    /// `additional` minus everything reserved, clamped at zero.
    #[serde(default)]
    pub remaining: ResourceList,
    /// What each migration currently holds, keyed by migration name.
    #[serde(default)]
    pub reservations: BTreeMap<String, ResourceList>,
}

// --- MigrationResourceGrant ---

/// Tenant-issued headroom earmarked for otherwise overcommitting migrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResourceGrant {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: GrantSpec,
    #[serde(default)]
    pub status: GrantStatus,
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl_object!(MigrationResourceGrant, GRANT_PREFIX, "MigrationResourceGrant");

impl MigrationResourceGrant {
    pub fn new(namespace: &str, name: &str, additional: ResourceList) -> Self {
        let mut grant = Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: GrantSpec { additional },
            status: GrantStatus::default(),
            resource_version: 0,
            created_at: Utc::now(),
        };
        grant.refresh_remaining();
        grant
    }

    /// Sum of all reservations currently held against this grant.
    pub fn consumed(&self) -> ResourceList {
        self.status.reservations.values().sum()
    }

    /// What is still free, recomputed from `additional` and the reservations.
    pub fn remaining(&self) -> ResourceList {
        self.spec.additional.sub_clamped(&self.consumed())
    }

    /// Resource names where reservations exceed what the grant offers.
    pub fn overconsumed(&self) -> Vec<String> {
        let consumed = self.consumed();
        consumed
            .exceeding(&self.spec.additional)
            .map(str::to_string)
            .collect()
    }

    pub fn reserved_for(&self, migration: &str) -> Option<&ResourceList> {
        self.status.reservations.get(migration)
    }

    /// Recompute `status.remaining` from spec and reservations.
    pub fn refresh_remaining(&mut self) {
        self.status.remaining = self.remaining();
        if self.status.reservations.is_empty() {
            self.status.applied_to = None;
        }
    }

    /// Ordering used for greedy consumption: oldest grant first, name breaks ties.
    pub fn creation_order(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Quantity;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn new_grant_has_full_remaining() {
        let grant = MigrationResourceGrant::new(
            "ns",
            "g",
            ResourceList::new().with("memory", q("1Gi")),
        );
        assert_eq!(grant.status.remaining.get("memory"), q("1Gi"));
        assert!(grant.status.applied_to.is_none());
    }

    #[test]
    fn remaining_accounts_for_reservations() {
        let mut grant = MigrationResourceGrant::new(
            "ns",
            "g",
            ResourceList::new().with("memory", q("1Gi")).with("cpu", q("2")),
        );
        grant.status.reservations.insert(
            "mig-a".to_string(),
            ResourceList::new().with("memory", q("256Mi")),
        );
        grant.status.reservations.insert(
            "mig-b".to_string(),
            ResourceList::new().with("memory", q("256Mi")).with("cpu", q("1")),
        );
        grant.status.applied_to = Some("mig-b".to_string());
        grant.refresh_remaining();
        assert_eq!(grant.status.remaining.get("memory"), q("512Mi"));
        assert_eq!(grant.status.remaining.get("cpu"), q("1"));
        assert_eq!(grant.status.applied_to.as_deref(), Some("mig-b"));
    }

    #[test]
    fn overconsumption_is_reported_and_clamped() {
        let mut grant = MigrationResourceGrant::new(
            "ns",
            "g",
            ResourceList::new().with("memory", q("256Mi")),
        );
        grant.status.reservations.insert(
            "mig-a".to_string(),
            ResourceList::new().with("memory", q("1Gi")),
        );
        grant.refresh_remaining();
        assert_eq!(grant.overconsumed(), vec!["memory".to_string()]);
        assert_eq!(grant.status.remaining.get("memory"), Quantity::ZERO);
    }
}
