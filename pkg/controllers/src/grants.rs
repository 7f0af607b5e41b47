use pkg_metrics::Counter;
use pkg_state::error::StoreError;
use pkg_state::registry::Registry;
use pkg_types::grant::MigrationResourceGrant;
use pkg_types::resource::ResourceList;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::retry::{RetryConfig, retry_store};

/// Work out how to take `needed` from `grants` for `migration`.
///
/// `grants` must be in creation order; the oldest grant is drained first and
/// a deficit may be split across several grants. Returns each grant that
/// changes, already updated, paired with the amount taken from it. Whatever
/// the grants cannot cover is simply not taken.
pub fn plan_reservation(
    grants: &[MigrationResourceGrant],
    migration: &str,
    needed: &ResourceList,
) -> Vec<(MigrationResourceGrant, ResourceList)> {
    let mut outstanding = needed.positive();
    let mut plan = Vec::new();
    for grant in grants {
        if outstanding.is_empty() {
            break;
        }
        let free = grant.remaining();
        let take: ResourceList = outstanding
            .iter()
            .filter_map(|(name, wanted)| {
                let taken = wanted.min(free.get(name));
                taken.is_positive().then(|| (name.to_string(), taken))
            })
            .collect();
        if take.is_empty() {
            continue;
        }
        outstanding = outstanding.sub_clamped(&take).positive();

        let mut updated = grant.clone();
        *updated
            .status
            .reservations
            .entry(migration.to_string())
            .or_default() += &take;
        updated.status.applied_to = Some(migration.to_string());
        updated.refresh_remaining();
        plan.push((updated, take));
    }
    plan
}

/// Grant with `migration`'s reservation removed, or `None` if it held nothing.
pub fn without_reservation(
    grant: &MigrationResourceGrant,
    migration: &str,
) -> Option<(MigrationResourceGrant, ResourceList)> {
    let held = grant.reserved_for(migration)?.clone();
    let mut updated = grant.clone();
    updated.status.reservations.remove(migration);
    if updated.status.applied_to.as_deref() == Some(migration) {
        updated.status.applied_to = None;
    }
    updated.refresh_remaining();
    Some((updated, held))
}

/// Cache of MigrationResourceGrants per namespace plus the reservation
/// bookkeeping kept in their status.
///
/// Callers must hold the namespace lock from [`GrantRegistry::lock`] across
/// "decide, then reserve" so two migrations never both count the same
/// remaining amount.
pub struct GrantRegistry {
    registry: Registry,
    retry: RetryConfig,
    max_conflict_retries: u32,
    conflicts: Counter,
    namespaces: RwLock<HashMap<String, BTreeMap<String, MigrationResourceGrant>>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GrantRegistry {
    pub fn new(
        registry: Registry,
        retry: RetryConfig,
        max_conflict_retries: u32,
        conflicts: Counter,
    ) -> Self {
        Self {
            registry,
            retry,
            max_conflict_retries,
            conflicts,
            namespaces: RwLock::new(HashMap::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to a namespace's grant consumption.
    pub async fn lock(&self, namespace: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(namespace.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Record the latest state of a grant. Older versions than the cached one
    /// are ignored.
    pub async fn observe(&self, grant: MigrationResourceGrant) {
        let overconsumed = grant.overconsumed();
        if !overconsumed.is_empty() {
            warn!(
                "Grant {}/{}: reservations exceed additional for {:?}, clamping remaining to zero",
                grant.namespace, grant.name, overconsumed
            );
        }
        let mut namespaces = self.namespaces.write().await;
        let grants = namespaces.entry(grant.namespace.clone()).or_default();
        match grants.get(&grant.name) {
            Some(cached) if cached.resource_version > grant.resource_version => {
                debug!(
                    "Grant {}/{}: ignoring stale version {} (cached {})",
                    grant.namespace, grant.name, grant.resource_version, cached.resource_version
                );
            }
            _ => {
                grants.insert(grant.name.clone(), grant);
            }
        }
    }

    pub async fn forget(&self, namespace: &str, name: &str) -> bool {
        let mut namespaces = self.namespaces.write().await;
        let Some(grants) = namespaces.get_mut(namespace) else {
            return false;
        };
        let removed = grants.remove(name).is_some();
        if grants.is_empty() {
            namespaces.remove(namespace);
        }
        removed
    }

    /// Replace the whole cache, as after a relist.
    pub async fn replace_all(&self, grants: Vec<MigrationResourceGrant>) {
        let mut fresh: HashMap<String, BTreeMap<String, MigrationResourceGrant>> = HashMap::new();
        for grant in grants {
            fresh
                .entry(grant.namespace.clone())
                .or_default()
                .insert(grant.name.clone(), grant);
        }
        *self.namespaces.write().await = fresh;
    }

    /// Re-read one namespace's grants from the store.
    pub async fn refresh(&self, namespace: &str) -> anyhow::Result<()> {
        let grants: Vec<MigrationResourceGrant> = retry_store(&self.retry, "list grants", || {
            self.registry.list::<MigrationResourceGrant>(Some(namespace))
        })
        .await?;
        let mut namespaces = self.namespaces.write().await;
        if grants.is_empty() {
            namespaces.remove(namespace);
        } else {
            namespaces.insert(
                namespace.to_string(),
                grants.into_iter().map(|g| (g.name.clone(), g)).collect(),
            );
        }
        Ok(())
    }

    /// A namespace's grants, oldest first.
    pub async fn in_creation_order(&self, namespace: &str) -> Vec<MigrationResourceGrant> {
        let namespaces = self.namespaces.read().await;
        let mut grants: Vec<MigrationResourceGrant> = namespaces
            .get(namespace)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default();
        grants.sort_by(|a, b| a.creation_order().cmp(&b.creation_order()));
        grants
    }

    /// Σ remaining over the namespace's grants.
    pub async fn total_available(&self, namespace: &str) -> ResourceList {
        let namespaces = self.namespaces.read().await;
        namespaces
            .get(namespace)
            .map(|grants| {
                grants
                    .values()
                    .map(|g| g.remaining())
                    .fold(ResourceList::new(), |acc, r| acc + &r)
            })
            .unwrap_or_default()
    }

    /// Everything `migration` currently holds across the namespace's grants.
    pub async fn reserved_for(&self, namespace: &str, migration: &str) -> ResourceList {
        let namespaces = self.namespaces.read().await;
        namespaces
            .get(namespace)
            .map(|grants| grants.values().filter_map(|g| g.reserved_for(migration)).sum())
            .unwrap_or_default()
    }

    /// Every (namespace, migration) that holds a reservation somewhere.
    pub async fn holders(&self) -> Vec<(String, String)> {
        let namespaces = self.namespaces.read().await;
        let mut holders: Vec<(String, String)> = namespaces
            .iter()
            .flat_map(|(ns, grants)| {
                grants
                    .values()
                    .flat_map(|g| g.status.reservations.keys())
                    .map(move |migration| (ns.clone(), migration.clone()))
            })
            .collect();
        holders.sort();
        holders.dedup();
        holders
    }

    /// Reserve `needed` for `migration`, persisting it in grant status.
    ///
    /// Returns what was actually reserved, which is less than `needed` only
    /// if the grants ran out.
    pub async fn reserve(
        &self,
        namespace: &str,
        migration: &str,
        needed: &ResourceList,
    ) -> anyhow::Result<ResourceList> {
        let mut outstanding = needed.positive();
        let mut reserved = ResourceList::new();
        for attempt in 0..=self.max_conflict_retries {
            if outstanding.is_empty() {
                break;
            }
            if attempt > 0 {
                self.refresh(namespace).await?;
            }
            let grants = self.in_creation_order(namespace).await;
            let mut conflicted = false;
            for (updated, take) in plan_reservation(&grants, migration, &outstanding) {
                let grant_name = updated.name.clone();
                match self.write(updated).await {
                    Ok(()) => {
                        info!(
                            "Grant {}/{}: reserved {} for migration {}",
                            namespace, grant_name, take, migration
                        );
                        outstanding = outstanding.sub_clamped(&take).positive();
                        reserved += &take;
                    }
                    Err(e) if is_stale(&e) => {
                        self.conflicts.inc();
                        debug!("Grant {}/{}: {}, re-reading", namespace, grant_name, e);
                        conflicted = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !conflicted {
                if !outstanding.is_empty() {
                    warn!(
                        "Migration {}/{}: grants could not cover {}",
                        namespace, migration, outstanding
                    );
                }
                return Ok(reserved);
            }
        }
        if outstanding.is_empty() {
            Ok(reserved)
        } else {
            anyhow::bail!(
                "reserving {} for migration {}/{} kept conflicting after {} retries",
                outstanding,
                namespace,
                migration,
                self.max_conflict_retries
            )
        }
    }

    /// Return everything `migration` holds to the grants it came from.
    pub async fn release(&self, namespace: &str, migration: &str) -> anyhow::Result<ResourceList> {
        let mut released = ResourceList::new();
        for attempt in 0..=self.max_conflict_retries {
            if attempt > 0 {
                self.refresh(namespace).await?;
            }
            let grants = self.in_creation_order(namespace).await;
            let mut conflicted = false;
            for (updated, held) in grants.iter().filter_map(|g| without_reservation(g, migration)) {
                let grant_name = updated.name.clone();
                match self.write(updated).await {
                    Ok(()) => {
                        info!(
                            "Grant {}/{}: released {} held by migration {}",
                            namespace, grant_name, held, migration
                        );
                        released += &held;
                    }
                    Err(e) if is_stale(&e) => {
                        self.conflicts.inc();
                        debug!("Grant {}/{}: {}, re-reading", namespace, grant_name, e);
                        conflicted = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !conflicted {
                return Ok(released);
            }
        }
        anyhow::bail!(
            "releasing grants of migration {}/{} kept conflicting after {} retries",
            namespace,
            migration,
            self.max_conflict_retries
        )
    }

    async fn write(&self, grant: MigrationResourceGrant) -> Result<(), StoreError> {
        let written = retry_store(&self.retry, "update grant status", || {
            self.registry.replace(grant.clone())
        })
        .await?;
        self.observe(written).await;
        Ok(())
    }
}

/// The cached copy was out of date: someone else wrote or deleted the grant.
fn is_stale(err: &StoreError) -> bool {
    matches!(err, StoreError::Conflict { .. } | StoreError::NotFound { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pkg_state::client::StateStore;
    use pkg_types::quantity::Quantity;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn memory(s: &str) -> ResourceList {
        ResourceList::new().with("memory", q(s))
    }

    fn grant(name: &str, age_secs: i64, additional: ResourceList) -> MigrationResourceGrant {
        let mut g = MigrationResourceGrant::new("ns", name, additional);
        g.created_at -= Duration::seconds(age_secs);
        g
    }

    async fn grant_registry() -> (Registry, GrantRegistry) {
        let registry = Registry::new(StateStore::in_memory().await.unwrap());
        let grants = GrantRegistry::new(
            registry.clone(),
            RetryConfig::with_max_attempts(2),
            3,
            Counter::default(),
        );
        (registry, grants)
    }

    #[test]
    fn plan_drains_oldest_grant_first() {
        let grants = vec![grant("old", 60, memory("256Mi")), grant("new", 0, memory("1Gi"))];
        let plan = plan_reservation(&grants, "mig", &memory("512Mi"));
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].0.name, "old");
        assert_eq!(plan[0].1, memory("256Mi"));
        assert_eq!(plan[0].0.status.remaining.get("memory"), Quantity::ZERO);
        assert_eq!(plan[1].1, memory("256Mi"));
        assert_eq!(plan[1].0.status.remaining, memory("768Mi"));
        assert_eq!(plan[1].0.status.applied_to.as_deref(), Some("mig"));
    }

    #[test]
    fn plan_takes_what_exists() {
        let grants = vec![grant("g", 0, memory("128Mi"))];
        let plan = plan_reservation(&grants, "mig", &memory("1Gi").with("cpu", q("1")));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].1, memory("128Mi"));
        assert!(plan_reservation(&grants, "mig", &ResourceList::new()).is_empty());
    }

    #[test]
    fn release_restores_remaining() {
        let g = grant("g", 0, memory("1Gi"));
        let (held, _) = plan_reservation(&[g], "mig", &memory("512Mi")).remove(0);
        let (freed, amount) = without_reservation(&held, "mig").unwrap();
        assert_eq!(amount, memory("512Mi"));
        assert_eq!(freed.status.remaining, memory("1Gi"));
        assert!(freed.status.applied_to.is_none());
        assert!(without_reservation(&freed, "mig").is_none());
    }

    #[tokio::test]
    async fn reserve_and_release_persist_status() {
        let (registry, grants) = grant_registry().await;
        let created = registry.create(grant("g", 0, memory("1Gi"))).await.unwrap();
        grants.observe(created).await;

        let _guard = grants.lock("ns").await;
        let reserved = grants.reserve("ns", "mig", &memory("768Mi")).await.unwrap();
        assert_eq!(reserved, memory("768Mi"));
        assert_eq!(grants.total_available("ns").await, memory("256Mi"));
        assert_eq!(grants.reserved_for("ns", "mig").await, memory("768Mi"));

        let stored: MigrationResourceGrant = registry.get("ns", "g").await.unwrap().unwrap();
        assert_eq!(stored.status.remaining, memory("256Mi"));
        assert_eq!(stored.status.applied_to.as_deref(), Some("mig"));

        assert_eq!(grants.holders().await, vec![("ns".to_string(), "mig".to_string())]);
        let released = grants.release("ns", "mig").await.unwrap();
        assert_eq!(released, memory("768Mi"));
        let stored: MigrationResourceGrant = registry.get("ns", "g").await.unwrap().unwrap();
        assert_eq!(stored.status.remaining, memory("1Gi"));
        assert!(stored.status.reservations.is_empty());
        assert!(grants.holders().await.is_empty());
    }

    #[tokio::test]
    async fn reserve_recovers_from_stale_cache() {
        let (registry, grants) = grant_registry().await;
        let created = registry.create(grant("g", 0, memory("1Gi"))).await.unwrap();
        grants.observe(created.clone()).await;

        // Another writer takes part of the grant behind the cache's back.
        let mut other = created;
        other
            .status
            .reservations
            .insert("other-mig".to_string(), memory("512Mi"));
        other.refresh_remaining();
        registry.replace(other).await.unwrap();

        let reserved = grants.reserve("ns", "mig", &memory("768Mi")).await.unwrap();
        assert_eq!(reserved, memory("512Mi"));
        let stored: MigrationResourceGrant = registry.get("ns", "g").await.unwrap().unwrap();
        assert_eq!(stored.consumed(), memory("1Gi"));
        assert_eq!(stored.reserved_for("other-mig"), Some(&memory("512Mi")));
    }

    #[tokio::test]
    async fn stale_versions_do_not_regress_cache() {
        let (_, grants) = grant_registry().await;
        let mut newer = grant("g", 0, memory("1Gi"));
        newer.resource_version = 3;
        let mut older = newer.clone();
        older.resource_version = 2;
        older.spec.additional = memory("1Mi");
        grants.observe(newer).await;
        grants.observe(older).await;
        assert_eq!(grants.total_available("ns").await, memory("1Gi"));
        assert!(grants.forget("ns", "g").await);
        assert!(grants.total_available("ns").await.is_empty());
    }
}
