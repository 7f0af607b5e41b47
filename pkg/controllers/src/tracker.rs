use pkg_types::migration::Migration;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::queue::MigrationKey;

/// Non-terminal migrations per namespace, with the VMI each one moves.
///
/// Quota and grant events fan out to a namespace's tracked migrations; pod
/// events find migrations through the VMI.
#[derive(Default)]
pub struct MigrationTracker {
    namespaces: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a live migration, or forget it once it is terminal.
    pub async fn observe(&self, migration: &Migration) {
        if migration.is_terminal() {
            self.untrack(&migration.namespace, &migration.name).await;
        } else {
            self.namespaces
                .write()
                .await
                .entry(migration.namespace.clone())
                .or_default()
                .insert(migration.name.clone(), migration.spec.vmi_name.clone());
        }
    }

    /// Rebuild from a full listing; terminal migrations are skipped.
    pub async fn replace_all(&self, migrations: &[Migration]) {
        let mut fresh: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        for migration in migrations.iter().filter(|m| !m.is_terminal()) {
            fresh
                .entry(migration.namespace.clone())
                .or_default()
                .insert(migration.name.clone(), migration.spec.vmi_name.clone());
        }
        *self.namespaces.write().await = fresh;
    }

    pub async fn untrack(&self, namespace: &str, name: &str) -> bool {
        let mut namespaces = self.namespaces.write().await;
        let Some(migrations) = namespaces.get_mut(namespace) else {
            return false;
        };
        let removed = migrations.remove(name).is_some();
        if migrations.is_empty() {
            namespaces.remove(namespace);
        }
        removed
    }

    pub async fn is_tracked(&self, namespace: &str, name: &str) -> bool {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .is_some_and(|m| m.contains_key(name))
    }

    pub async fn in_namespace(&self, namespace: &str) -> Vec<MigrationKey> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|m| m.keys().map(|name| MigrationKey::new(namespace, name)).collect())
            .unwrap_or_default()
    }

    pub async fn for_vmi(&self, namespace: &str, vmi_name: &str) -> Vec<MigrationKey> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|m| {
                m.iter()
                    .filter(|(_, vmi)| vmi.as_str() == vmi_name)
                    .map(|(name, _)| MigrationKey::new(namespace, name))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<MigrationKey> {
        self.namespaces
            .read()
            .await
            .iter()
            .flat_map(|(ns, m)| m.keys().map(move |name| MigrationKey::new(ns, name)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.namespaces.read().await.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::migration::MigrationPhase;

    #[tokio::test]
    async fn terminal_migrations_are_dropped() {
        let tracker = MigrationTracker::new();
        tracker.observe(&Migration::new("ns", "m1", "vmi-a")).await;
        tracker
            .observe(&Migration::new("ns", "m2", "vmi-b").with_phase(MigrationPhase::Running))
            .await;
        assert_eq!(tracker.len().await, 2);

        tracker
            .observe(&Migration::new("ns", "m1", "vmi-a").with_phase(MigrationPhase::Succeeded))
            .await;
        assert!(!tracker.is_tracked("ns", "m1").await);
        assert_eq!(tracker.in_namespace("ns").await, vec![MigrationKey::new("ns", "m2")]);
    }

    #[tokio::test]
    async fn lookup_by_vmi_is_namespace_scoped() {
        let tracker = MigrationTracker::new();
        tracker.observe(&Migration::new("a", "m1", "vmi")).await;
        tracker.observe(&Migration::new("b", "m1", "vmi")).await;
        tracker.observe(&Migration::new("a", "m2", "other")).await;
        assert_eq!(tracker.for_vmi("a", "vmi").await, vec![MigrationKey::new("a", "m1")]);
        assert_eq!(tracker.all().await.len(), 3);
        assert!(tracker.untrack("b", "m1").await);
        assert!(tracker.in_namespace("b").await.is_empty());
    }

    #[tokio::test]
    async fn replace_all_skips_finished() {
        let tracker = MigrationTracker::new();
        tracker.observe(&Migration::new("ns", "gone", "vmi")).await;
        tracker
            .replace_all(&[
                Migration::new("ns", "live", "vmi"),
                Migration::new("ns", "done", "vmi").with_phase(MigrationPhase::Failed),
            ])
            .await;
        assert_eq!(tracker.all().await, vec![MigrationKey::new("ns", "live")]);
    }
}
