use chrono::{DateTime, Utc};
use pkg_constants::state::QUOTA_PREFIX;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::object::impl_object;
use crate::resource::ResourceList;

/// Resource quota for a namespace: hard caps and current usage per resource name.
///
/// Owned by the orchestration layer; the migration controller only reads it.
/// A resource name absent from `hard` is not capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub hard: ResourceList,
    /// Usage as accounted by the orchestration layer, the sole authority on it.
    #[serde(default)]
    pub used: ResourceList,
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl_object!(ResourceQuota, QUOTA_PREFIX, "ResourceQuota");

impl ResourceQuota {
    pub fn new(namespace: &str, name: &str, hard: ResourceList) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            hard,
            used: ResourceList::default(),
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_used(mut self, used: ResourceList) -> Self {
        self.used = used;
        self
    }

    /// `hard - used` for every enumerated resource, clamped at zero.
    pub fn headroom(&self) -> ResourceList {
        self.hard.sub_clamped(&self.used)
    }
}
