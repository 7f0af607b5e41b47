//! Resource names tracked by migration quota enforcement.
//!
//! The bare names are aliases of the request variants, as in Kubernetes quota.

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

pub const REQUESTS_CPU: &str = "requests.cpu";
pub const LIMITS_CPU: &str = "limits.cpu";
pub const REQUESTS_MEMORY: &str = "requests.memory";
pub const LIMITS_MEMORY: &str = "limits.memory";
pub const REQUESTS_EPHEMERAL_STORAGE: &str = "requests.ephemeral-storage";
pub const LIMITS_EPHEMERAL_STORAGE: &str = "limits.ephemeral-storage";

/// Container-level resource keys that feed the estimate.
pub const COMPUTE_RESOURCES: [&str; 3] = [CPU, MEMORY, EPHEMERAL_STORAGE];
