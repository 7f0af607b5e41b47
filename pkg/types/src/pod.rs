use chrono::{DateTime, Utc};
use pkg_constants::controller::LAUNCHER_VMI_LABEL;
use pkg_constants::state::POD_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::object::impl_object;

// --- Resource requirements ---

/// Container requests/limits as raw quantity strings, exactly as the
/// workload author wrote them. Parsing happens at estimation time so one
/// malformed value cannot make the whole pod unreadable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

// --- Container spec ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

// --- Pod phase ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Pod spec ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PodSpec {
    pub containers: Vec<ContainerSpec>,
}

// --- Pod ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodPhase,
    /// Labels for selector-based matching
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
}

impl_object!(Pod, POD_PREFIX, "Pod");

impl Pod {
    /// A running launcher pod for `vmi_name`.
    pub fn launcher(namespace: &str, name: &str, vmi_name: &str, spec: PodSpec) -> Self {
        let mut labels = HashMap::new();
        labels.insert(LAUNCHER_VMI_LABEL.to_string(), vmi_name.to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec,
            status: PodPhase::Running,
            labels,
            resource_version: 0,
            created_at: Utc::now(),
        }
    }

    /// Name of the VMI this pod launches, if it is a launcher pod.
    pub fn launched_vmi(&self) -> Option<&str> {
        self.labels.get(LAUNCHER_VMI_LABEL).map(String::as_str)
    }
}
