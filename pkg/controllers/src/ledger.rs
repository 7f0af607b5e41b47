use pkg_types::quantity::Quantity;
use pkg_types::quota::ResourceQuota;
use pkg_types::resource::ResourceList;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Last observed `hard`/`used` of one quota object.
#[derive(Debug, Clone, PartialEq)]
struct QuotaEntry {
    hard: ResourceList,
    used: ResourceList,
}

/// Quota headroom of a namespace at one instant.
///
/// Only resource names that some quota enumerates appear here; anything else
/// is unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headroom {
    bounded: ResourceList,
}

impl Headroom {
    /// `None` means no quota caps this resource.
    pub fn available(&self, resource: &str) -> Option<Quantity> {
        self.bounded.lookup(resource)
    }

    pub fn is_bounded(&self, resource: &str) -> bool {
        self.bounded.contains(resource)
    }

    pub fn bounded(&self) -> &ResourceList {
        &self.bounded
    }

    /// Headroom left after `charged` is taken. Unbounded resources stay
    /// unbounded.
    pub fn less(&self, charged: &ResourceList) -> Headroom {
        Headroom {
            bounded: self.bounded.sub_clamped(charged),
        }
    }
}

impl From<ResourceList> for Headroom {
    fn from(bounded: ResourceList) -> Self {
        Self { bounded }
    }
}

/// Per-namespace view of quota limits and usage, fed only by quota watch
/// events. The orchestration layer is the authority on `used`; the ledger
/// never recomputes it.
///
/// On top of `used` the ledger charges each admitted migration the part of
/// its estimate that the quota covers, so migrations admitted one after the
/// other in a namespace cannot spend the same headroom twice. Charges are
/// only touched under the namespace lock and survive quota relists.
#[derive(Default)]
pub struct QuotaLedger {
    namespaces: RwLock<HashMap<String, BTreeMap<String, QuotaEntry>>>,
    charges: RwLock<HashMap<String, BTreeMap<String, ResourceList>>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest state of a quota. Returns true if anything changed.
    pub async fn apply(&self, quota: &ResourceQuota) -> bool {
        let entry = QuotaEntry {
            hard: quota.hard.clone(),
            used: quota.used.clone(),
        };
        let mut namespaces = self.namespaces.write().await;
        let quotas = namespaces.entry(quota.namespace.clone()).or_default();
        quotas.insert(quota.name.clone(), entry.clone()) != Some(entry)
    }

    /// Forget a deleted quota. Returns true if it was known.
    pub async fn remove(&self, namespace: &str, name: &str) -> bool {
        let mut namespaces = self.namespaces.write().await;
        let Some(quotas) = namespaces.get_mut(namespace) else {
            return false;
        };
        let removed = quotas.remove(name).is_some();
        if quotas.is_empty() {
            namespaces.remove(namespace);
        }
        removed
    }

    /// Replace everything known about the cluster's quotas, as after a relist.
    pub async fn replace_all(&self, quotas: &[ResourceQuota]) {
        let mut fresh: HashMap<String, BTreeMap<String, QuotaEntry>> = HashMap::new();
        for quota in quotas {
            fresh.entry(quota.namespace.clone()).or_default().insert(
                quota.name.clone(),
                QuotaEntry {
                    hard: quota.hard.clone(),
                    used: quota.used.clone(),
                },
            );
        }
        *self.namespaces.write().await = fresh;
    }

    /// `hard - used` for one resource, clamped at zero; `None` when unbounded.
    /// With several quotas enumerating the resource the tightest one wins.
    pub async fn available(&self, namespace: &str, resource: &str) -> Option<Quantity> {
        self.headroom(namespace).await.available(resource)
    }

    /// Snapshot of every bounded resource's headroom in a namespace.
    pub async fn headroom(&self, namespace: &str) -> Headroom {
        let namespaces = self.namespaces.read().await;
        let mut bounded = ResourceList::new();
        if let Some(quotas) = namespaces.get(namespace) {
            for entry in quotas.values() {
                for (resource, hard) in entry.hard.iter() {
                    let free = hard.sub_clamped(entry.used.get(resource));
                    let tightest = match bounded.lookup(resource) {
                        Some(current) => current.min(free),
                        None => free,
                    };
                    bounded.insert(resource, tightest);
                }
            }
        }
        Headroom { bounded }
    }

    /// Headroom as seen by `migration`: quota headroom minus what every
    /// other admitted migration in the namespace has been charged.
    pub async fn headroom_for(&self, namespace: &str, migration: &str) -> Headroom {
        let headroom = self.headroom(namespace).await;
        let charges = self.charges.read().await;
        let others: ResourceList = charges
            .get(namespace)
            .map(|by_migration| {
                by_migration
                    .iter()
                    .filter(|(name, _)| name.as_str() != migration)
                    .map(|(_, charge)| charge)
                    .sum::<ResourceList>()
            })
            .unwrap_or_default();
        headroom.less(&others)
    }

    /// Record what an admitted migration takes from quota headroom,
    /// replacing any earlier charge.
    pub async fn charge(&self, namespace: &str, migration: &str, amount: ResourceList) {
        let amount = amount.positive();
        let mut charges = self.charges.write().await;
        if amount.is_empty() {
            drop_charge(&mut charges, namespace, migration);
        } else {
            charges
                .entry(namespace.to_string())
                .or_default()
                .insert(migration.to_string(), amount);
        }
    }

    /// Drop a migration's charge. Returns true if it had one.
    pub async fn discharge(&self, namespace: &str, migration: &str) -> bool {
        drop_charge(&mut *self.charges.write().await, namespace, migration)
    }

    pub async fn charged(&self, namespace: &str, migration: &str) -> ResourceList {
        self.charges
            .read()
            .await
            .get(namespace)
            .and_then(|by_migration| by_migration.get(migration))
            .cloned()
            .unwrap_or_default()
    }

    /// Every (namespace, migration) currently holding a charge.
    pub async fn charged_migrations(&self) -> Vec<(String, String)> {
        let charges = self.charges.read().await;
        charges
            .iter()
            .flat_map(|(ns, by_migration)| {
                by_migration
                    .keys()
                    .map(move |name| (ns.clone(), name.clone()))
            })
            .collect()
    }

    pub async fn namespaces(&self) -> Vec<String> {
        self.namespaces.read().await.keys().cloned().collect()
    }
}

fn drop_charge(
    charges: &mut HashMap<String, BTreeMap<String, ResourceList>>,
    namespace: &str,
    migration: &str,
) -> bool {
    let Some(by_migration) = charges.get_mut(namespace) else {
        return false;
    };
    let removed = by_migration.remove(migration).is_some();
    if by_migration.is_empty() {
        charges.remove(namespace);
    }
    removed
}
