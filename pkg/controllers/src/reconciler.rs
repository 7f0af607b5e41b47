use chrono::Utc;
use pkg_metrics::Counter;
use pkg_state::error::StoreError;
use pkg_state::registry::Registry;
use pkg_types::migration::Migration;
use tracing::{debug, info};

use crate::admission::Decision;
use crate::condition::apply_decision;
use crate::retry::{RetryConfig, retry_store};

/// What happened when a decision was applied to a migration.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The condition changed and the new object was stored.
    Written(Migration),
    /// The condition already reflected the decision.
    Unchanged(Migration),
    /// The migration finished in the meantime; nothing was written.
    Terminal(Migration),
    /// The migration no longer exists.
    Gone,
}

/// Writes the `RejectedByResourceQuota` condition with compare-and-swap.
///
/// The decision is applied to the caller's snapshot first. If another writer
/// got there in between, the latest object is re-read and the same decision
/// applied again, up to `max_conflict_retries` times.
pub struct ConditionWriter {
    registry: Registry,
    retry: RetryConfig,
    max_conflict_retries: u32,
    writes: Counter,
    conflicts: Counter,
}

impl ConditionWriter {
    pub fn new(
        registry: Registry,
        retry: RetryConfig,
        max_conflict_retries: u32,
        writes: Counter,
        conflicts: Counter,
    ) -> Self {
        Self {
            registry,
            retry,
            max_conflict_retries,
            writes,
            conflicts,
        }
    }

    pub async fn apply(
        &self,
        snapshot: Migration,
        decision: &Decision,
    ) -> anyhow::Result<WriteOutcome> {
        let mut current = snapshot;
        for _ in 0..=self.max_conflict_retries {
            if current.is_terminal() {
                return Ok(WriteOutcome::Terminal(current));
            }
            let mut updated = current.clone();
            if !apply_decision(&mut updated.status.conditions, decision, Utc::now()) {
                debug!(
                    "Migration {}/{}: condition already reflects {}",
                    current.namespace, current.name, decision
                );
                return Ok(WriteOutcome::Unchanged(current));
            }

            match retry_store(&self.retry, "update migration condition", || {
                self.registry.replace(updated.clone())
            })
            .await
            {
                Ok(written) => {
                    self.writes.inc();
                    info!(
                        "Migration {}/{}: RejectedByResourceQuota updated ({})",
                        written.namespace, written.name, decision
                    );
                    return Ok(WriteOutcome::Written(written));
                }
                Err(StoreError::Conflict { .. }) => {
                    self.conflicts.inc();
                    let latest: Option<Migration> = retry_store(&self.retry, "get migration", || {
                        self.registry.get(&current.namespace, &current.name)
                    })
                    .await?;
                    match latest {
                        Some(latest) => current = latest,
                        None => return Ok(WriteOutcome::Gone),
                    }
                }
                Err(StoreError::NotFound { .. }) => return Ok(WriteOutcome::Gone),
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!(
            "condition write for migration {}/{} kept conflicting after {} retries",
            current.namespace,
            current.name,
            self.max_conflict_retries
        )
    }
}
