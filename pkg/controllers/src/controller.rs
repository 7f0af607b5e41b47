use pkg_constants::controller::{
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_WORKERS,
};
use pkg_constants::state::{GRANT_PREFIX, MIGRATION_PREFIX, POD_PREFIX, QUOTA_PREFIX};
use pkg_metrics::MetricsRegistry;
use pkg_state::registry::Registry;
use pkg_state::watch::{EventType, WatchEvent, WatchItem};
use pkg_types::grant::MigrationResourceGrant;
use pkg_types::migration::Migration;
use pkg_types::object::split_key;
use pkg_types::pod::Pod;
use pkg_types::quota::ResourceQuota;
use pkg_types::resource::ResourceList;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::admission::{Decision, decide, quota_deficit};
use crate::estimator::{estimate, find_launcher};
use crate::grants::GrantRegistry;
use crate::ledger::QuotaLedger;
use crate::metrics::ControllerMetrics;
use crate::queue::{MigrationKey, WorkQueue};
use crate::reconciler::{ConditionWriter, WriteOutcome};
use crate::retry::{RetryConfig, retry_store};
use crate::tracker::MigrationTracker;

/// Tunables of the migration quota controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub resync_interval: Duration,
    pub max_conflict_retries: u32,
    /// Backoff for transient store failures and for requeueing failed keys.
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            retry: RetryConfig::default(),
        }
    }
}

/// Controller that keeps the `RejectedByResourceQuota` condition of every
/// live migration in line with namespace quota and migration grants.
///
/// Quota, grant, migration and launcher pod watch events are turned into
/// migration keys on a deduplicating queue; a fixed pool of workers drains
/// it, one key at a time per worker.
pub struct MigrationQuotaController {
    registry: Registry,
    config: ControllerConfig,
    ledger: QuotaLedger,
    grants: GrantRegistry,
    tracker: MigrationTracker,
    queue: Arc<WorkQueue>,
    writer: ConditionWriter,
    metrics: ControllerMetrics,
    blocked: Mutex<HashSet<MigrationKey>>,
    failures: Mutex<HashMap<MigrationKey, u32>>,
}

/// A started controller. Dropping it leaves the tasks running; call
/// [`RunningController::shutdown`] to stop them.
pub struct RunningController {
    controller: Arc<MigrationQuotaController>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl RunningController {
    pub fn controller(&self) -> &Arc<MigrationQuotaController> {
        &self.controller
    }

    /// Stop watching, let workers finish their current key, then return.
    pub async fn shutdown(self) {
        for task in &self.background {
            task.abort();
        }
        self.controller.queue.shutdown();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Migration quota worker ended abnormally: {}", e);
            }
        }
        info!("MigrationQuotaController stopped");
    }
}

impl MigrationQuotaController {
    pub fn new(
        registry: Registry,
        config: ControllerConfig,
        metrics_registry: &MetricsRegistry,
    ) -> Self {
        let metrics = ControllerMetrics::register(metrics_registry);
        let grants = GrantRegistry::new(
            registry.clone(),
            config.retry.clone(),
            config.max_conflict_retries,
            metrics.write_conflicts.clone(),
        );
        let writer = ConditionWriter::new(
            registry.clone(),
            config.retry.clone(),
            config.max_conflict_retries,
            metrics.condition_writes.clone(),
            metrics.write_conflicts.clone(),
        );
        Self {
            registry,
            config,
            ledger: QuotaLedger::new(),
            grants,
            tracker: MigrationTracker::new(),
            queue: Arc::new(WorkQueue::new()),
            writer,
            metrics,
            blocked: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to watch events, load the current state and start the
    /// event pump, the periodic resync and the worker pool.
    pub async fn start(self) -> anyhow::Result<RunningController> {
        let controller = Arc::new(self);
        let events = controller.registry.store().event_log.watch(vec![
            QUOTA_PREFIX.to_string(),
            GRANT_PREFIX.to_string(),
            MIGRATION_PREFIX.to_string(),
            POD_PREFIX.to_string(),
        ]);

        // Subscribed before listing so nothing between the two is missed.
        controller.resync().await?;

        info!(
            "MigrationQuotaController started (workers={}, resync={}s)",
            controller.config.workers,
            controller.config.resync_interval.as_secs()
        );

        let pump = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let mut events = Box::pin(events);
                while let Some(item) = events.next().await {
                    match item {
                        WatchItem::Event(event) => controller.handle_event(event).await,
                        WatchItem::Lagged(missed) => {
                            warn!("Watch fell behind by {} events, resyncing", missed);
                            if let Err(e) = controller.resync().await {
                                warn!("Resync after lag failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        let resync = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let period = controller.config.resync_interval.max(Duration::from_secs(1));
                let mut interval = tokio::time::interval(period);
                // The first tick completes immediately; startup already synced.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(e) = controller.resync().await {
                        warn!("Periodic resync failed: {}", e);
                    }
                }
            })
        };

        let workers = (0..controller.config.workers.max(1))
            .map(|id| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move { controller.run_worker(id).await })
            })
            .collect();

        Ok(RunningController {
            controller,
            workers,
            background: vec![pump, resync],
        })
    }

    /// Relist everything, rebuild the caches and enqueue every migration
    /// that is live or still holds a grant reservation or quota charge.
    pub async fn resync(&self) -> anyhow::Result<()> {
        let retry = &self.config.retry;
        let quotas: Vec<ResourceQuota> =
            retry_store(retry, "list quotas", || self.registry.list::<ResourceQuota>(None)).await?;
        let grants: Vec<MigrationResourceGrant> = retry_store(retry, "list grants", || {
            self.registry.list::<MigrationResourceGrant>(None)
        })
        .await?;
        let migrations: Vec<Migration> =
            retry_store(retry, "list migrations", || self.registry.list::<Migration>(None)).await?;

        self.ledger.replace_all(&quotas).await;
        self.grants.replace_all(grants).await;
        self.tracker.replace_all(&migrations).await;

        let mut keys: HashSet<MigrationKey> = self.tracker.all().await.into_iter().collect();
        let mut admitted = self.grants.holders().await;
        admitted.extend(self.ledger.charged_migrations().await);
        for (namespace, migration) in admitted {
            keys.insert(MigrationKey::new(&namespace, &migration));
        }
        debug!(
            "Resync: {} quotas, {} migrations, {} keys enqueued",
            quotas.len(),
            migrations.len(),
            keys.len()
        );
        for key in keys {
            self.enqueue(key);
        }
        Ok(())
    }

    fn enqueue(&self, key: MigrationKey) {
        self.queue.add(key);
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    async fn enqueue_namespace(&self, namespace: &str) {
        for key in self.tracker.in_namespace(namespace).await {
            self.enqueue(key);
        }
    }

    async fn handle_event(&self, event: WatchEvent) {
        if event.key.starts_with(QUOTA_PREFIX) {
            self.on_quota_event(&event).await;
        } else if event.key.starts_with(GRANT_PREFIX) {
            self.on_grant_event(&event).await;
        } else if event.key.starts_with(MIGRATION_PREFIX) {
            self.on_migration_event(&event).await;
        } else if event.key.starts_with(POD_PREFIX) {
            self.on_pod_event(&event).await;
        }
    }

    async fn on_quota_event(&self, event: &WatchEvent) {
        let Some((namespace, name)) = split_key(QUOTA_PREFIX, &event.key) else {
            return;
        };
        let changed = match event.event_type {
            EventType::Put => match event.decode::<ResourceQuota>() {
                Some(quota) => self.ledger.apply(&quota).await,
                None => {
                    warn!("Ignoring undecodable ResourceQuota at {}", event.key);
                    false
                }
            },
            EventType::Delete => self.ledger.remove(namespace, name).await,
        };
        if changed {
            debug!("ResourceQuota {}/{} changed, re-evaluating namespace", namespace, name);
            self.enqueue_namespace(namespace).await;
        }
    }

    async fn on_grant_event(&self, event: &WatchEvent) {
        let Some((namespace, name)) = split_key(GRANT_PREFIX, &event.key) else {
            return;
        };
        match event.event_type {
            EventType::Put => match event.decode::<MigrationResourceGrant>() {
                Some(grant) => self.grants.observe(grant).await,
                None => {
                    warn!("Ignoring undecodable MigrationResourceGrant at {}", event.key);
                    return;
                }
            },
            EventType::Delete => {
                self.grants.forget(namespace, name).await;
            }
        }
        self.enqueue_namespace(namespace).await;
    }

    async fn on_migration_event(&self, event: &WatchEvent) {
        let Some((namespace, name)) = split_key(MIGRATION_PREFIX, &event.key) else {
            return;
        };
        match event.event_type {
            EventType::Put => match event.decode::<Migration>() {
                Some(migration) => self.tracker.observe(&migration).await,
                None => {
                    warn!("Ignoring undecodable Migration at {}", event.key);
                    return;
                }
            },
            EventType::Delete => {
                self.tracker.untrack(namespace, name).await;
            }
        }
        // Terminal and deleted migrations are enqueued too: the worker
        // releases whatever they hold.
        self.enqueue(MigrationKey::new(namespace, name));
    }

    async fn on_pod_event(&self, event: &WatchEvent) {
        let Some((namespace, _)) = split_key(POD_PREFIX, &event.key) else {
            return;
        };
        let affected = match event.decode::<Pod>() {
            Some(pod) => match pod.launched_vmi() {
                Some(vmi) => self.tracker.for_vmi(namespace, vmi).await,
                None => return,
            },
            // Deleted pods carry no labels any more.
            None => self.tracker.in_namespace(namespace).await,
        };
        for key in affected {
            self.enqueue(key);
        }
    }

    async fn run_worker(&self, id: usize) {
        debug!("Migration quota worker {} started", id);
        while let Some(key) = self.queue.get().await {
            self.metrics.queue_depth.set(self.queue.len() as i64);
            match self.reconcile(&key).await {
                Ok(()) => {
                    self.failures().remove(&key);
                }
                Err(e) => {
                    self.metrics.reconcile_errors.inc();
                    let failures = {
                        let mut failures = self.failures();
                        let count = failures.entry(key.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let delay = self.config.retry.jittered_delay_for(failures);
                    warn!(
                        "Migration {}: evaluation failed (attempt {}), requeueing in {}ms: {:#}",
                        key,
                        failures,
                        delay.as_millis(),
                        e
                    );
                    self.queue.add_after(key.clone(), delay);
                }
            }
            self.metrics.reconciles.inc();
            self.queue.done(&key);
        }
        debug!("Migration quota worker {} stopped", id);
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<MigrationKey, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_blocked(&self, key: &MigrationKey, blocked: bool) {
        let mut set = self.blocked.lock().unwrap_or_else(PoisonError::into_inner);
        if blocked {
            set.insert(key.clone());
        } else {
            set.remove(key);
        }
        self.metrics.blocked_migrations.set(set.len() as i64);
    }

    /// Evaluate one migration end to end.
    pub async fn reconcile(&self, key: &MigrationKey) -> anyhow::Result<()> {
        let retry = &self.config.retry;
        let migration: Option<Migration> = retry_store(retry, "get migration", || {
            self.registry.get(&key.namespace, &key.name)
        })
        .await?;
        let migration = match migration {
            Some(m) if !m.is_terminal() => m,
            other => {
                if let Some(m) = &other {
                    debug!("Migration {} reached phase {}", key, m.status.phase);
                }
                return self.finish(key).await;
            }
        };
        self.tracker.observe(&migration).await;

        let pods: Vec<Pod> = retry_store(retry, "list pods", || {
            self.registry.list::<Pod>(Some(&key.namespace))
        })
        .await?;
        let launcher = find_launcher(&pods, &migration.spec.vmi_name);
        let usage = estimate(&migration, launcher);
        if launcher.is_none() {
            debug!(
                "Migration {}: no running launcher for VMI {}, nothing to charge",
                key, migration.spec.vmi_name
            );
        }

        let decision = self.decide_and_reserve(key, &usage.per_resource).await?;

        match self.writer.apply(migration, &decision).await? {
            WriteOutcome::Written(_) | WriteOutcome::Unchanged(_) => {
                self.set_blocked(key, !decision.is_allow());
                Ok(())
            }
            WriteOutcome::Terminal(_) | WriteOutcome::Gone => self.finish(key).await,
        }
    }

    /// Under the namespace lock: decide, and on Allow charge the quota and
    /// reserve from grants the part of the estimate the quota cannot cover.
    /// A blocked migration holds neither.
    async fn decide_and_reserve(
        &self,
        key: &MigrationKey,
        estimate: &ResourceList,
    ) -> anyhow::Result<Decision> {
        let namespace = key.namespace.as_str();
        let _guard = self.grants.lock(namespace).await;

        let headroom = self.ledger.headroom_for(namespace, &key.name).await;
        let held = self.grants.reserved_for(namespace, &key.name).await;
        let grant_available = self.grants.total_available(namespace).await + &held;
        let decision = decide(estimate, &headroom, &grant_available);
        if !decision.is_allow() {
            self.drop_admission(key).await?;
            debug!("Migration {}: {}", key, decision);
            return Ok(decision);
        }

        let deficit = quota_deficit(estimate, &headroom);
        let needed = deficit.sub_clamped(&held).positive();
        if !needed.is_empty() {
            let reserved = self.grants.reserve(namespace, &key.name, &needed).await?;
            let uncovered = needed.sub_clamped(&reserved).positive();
            if !uncovered.is_empty() {
                // The grants held less than the cache said.
                self.drop_admission(key).await?;
                let decision = Decision::Block {
                    shortfall: uncovered,
                };
                debug!("Migration {}: {}", key, decision);
                return Ok(decision);
            }
        }
        self.ledger
            .charge(namespace, &key.name, estimate.sub_clamped(&deficit))
            .await;
        debug!("Migration {}: {}", key, decision);
        Ok(decision)
    }

    /// Give back everything a migration was admitted with. Callers hold the
    /// namespace lock.
    async fn drop_admission(&self, key: &MigrationKey) -> anyhow::Result<ResourceList> {
        self.ledger.discharge(&key.namespace, &key.name).await;
        self.grants.release(&key.namespace, &key.name).await
    }

    /// The migration is finished or deleted: release its reservations and
    /// stop tracking it.
    async fn finish(&self, key: &MigrationKey) -> anyhow::Result<()> {
        self.tracker.untrack(&key.namespace, &key.name).await;
        self.set_blocked(key, false);
        let _guard = self.grants.lock(&key.namespace).await;
        let released = self.drop_admission(key).await?;
        if !released.is_empty() {
            info!("Migration {}: finished, released {} to grants", key, released);
        }
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub async fn tracked(&self) -> usize {
        self.tracker.len().await
    }
}
