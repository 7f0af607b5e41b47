//! State store key layout.
//!
//! Objects are stored etcd-style under `/registry/<kind>/<namespace>/<name>`.

/// Prefix for `ResourceQuota` objects.
pub const QUOTA_PREFIX: &str = "/registry/resourcequotas/";

/// Prefix for `MigrationResourceGrant` objects.
pub const GRANT_PREFIX: &str = "/registry/migrationresourcegrants/";

/// Prefix for VM migration objects.
pub const MIGRATION_PREFIX: &str = "/registry/migrations/";

/// Prefix for pods (the launcher pods of running VMIs live here).
pub const POD_PREFIX: &str = "/registry/pods/";

/// Capacity of the broadcast channel behind a watch subscription.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;
