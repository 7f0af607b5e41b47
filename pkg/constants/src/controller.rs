//! Migration quota controller constants.

/// The single condition type the controller owns on a migration.
pub const REJECTED_BY_RESOURCE_QUOTA: &str = "RejectedByResourceQuota";

/// Reason set when the migration would overcommit the namespace quota.
pub const REASON_INSUFFICIENT_QUOTA: &str = "InsufficientQuota";

/// Reason set when a previously blocked migration fits again.
pub const REASON_SUFFICIENT_QUOTA: &str = "SufficientQuota";

/// Label on a launcher pod naming the VMI it runs.
pub const LAUNCHER_VMI_LABEL: &str = "kubevirt.io/vmi";

/// Default number of reconcile workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default interval between full resyncs, in seconds.
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// How many times a conflicting write is re-read and reapplied before the
/// key is handed back to the queue.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Attempts for transient store failures inside a single reconcile.
pub const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 4;

/// First delay when a failed key is re-queued, in milliseconds.
pub const REQUEUE_BASE_DELAY_MS: u64 = 200;

/// Upper bound on the re-queue delay, in milliseconds.
pub const REQUEUE_MAX_DELAY_MS: u64 = 30_000;
