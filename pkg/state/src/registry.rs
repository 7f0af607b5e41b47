use pkg_types::object::{Object, object_key};
use serde::Deserialize;
use tracing::warn;

use crate::client::StateStore;
use crate::error::StoreError;

/// Typed access to registry objects with optimistic concurrency.
///
/// `replace` only succeeds when the caller's `resource_version` still matches
/// the stored one, which is how status writers detect that someone else
/// changed the object since it was read.
#[derive(Clone)]
pub struct Registry {
    store: StateStore,
}

/// Just enough of any stored object to read its version.
#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    resource_version: u64,
}

fn encode<T: Object>(key: &str, obj: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(obj).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })
}

fn decode<T: Object>(key: &str, data: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(data).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    async fn stored_version(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.store.get(key).await? {
            Some(data) => {
                let probe: VersionProbe =
                    serde_json::from_slice(&data).map_err(|source| StoreError::Serialization {
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(probe.resource_version))
            }
            None => Ok(None),
        }
    }

    pub async fn get<T: Object>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<T>, StoreError> {
        let key = object_key(T::PREFIX, namespace, name);
        match self.store.get(&key).await? {
            Some(data) => Ok(Some(decode(&key, &data)?)),
            None => Ok(None),
        }
    }

    /// List objects of one kind, in one namespace or across all of them.
    /// Entries that fail to decode are skipped with a warning.
    pub async fn list<T: Object>(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        let prefix = match namespace {
            Some(ns) => format!("{}{}/", T::PREFIX, ns),
            None => T::PREFIX.to_string(),
        };
        let entries = self.store.list_prefix(&prefix).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_slice(&value) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!("Skipping undecodable {} at {}: {}", T::KIND, key, e);
                    None
                }
            })
            .collect())
    }

    /// Create a new object; fails if the key is taken.
    pub async fn create<T: Object>(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let _guard = self.store.write_guard().await;
        if self.store.get(&key).await?.is_some() {
            return Err(StoreError::AlreadyExists { key });
        }
        obj.set_resource_version(1);
        self.store.put(&key, &encode(&key, &obj)?).await?;
        Ok(obj)
    }

    /// Compare-and-swap: write `obj` only if the stored version equals
    /// `obj.resource_version()`. Returns the object with its new version.
    pub async fn replace<T: Object>(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let _guard = self.store.write_guard().await;
        let found = self
            .stored_version(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        let expected = obj.resource_version();
        if found != expected {
            return Err(StoreError::Conflict {
                key,
                expected,
                found,
            });
        }
        obj.set_resource_version(found + 1);
        self.store.put(&key, &encode(&key, &obj)?).await?;
        Ok(obj)
    }

    /// Unconditional create-or-overwrite, for owners of the whole object.
    pub async fn apply<T: Object>(&self, mut obj: T) -> Result<T, StoreError> {
        let key = obj.key();
        let _guard = self.store.write_guard().await;
        let current = self.stored_version(&key).await?.unwrap_or(0);
        obj.set_resource_version(current + 1);
        self.store.put(&key, &encode(&key, &obj)?).await?;
        Ok(obj)
    }

    /// Delete an object. Returns whether it existed.
    pub async fn delete<T: Object>(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let key = object_key(T::PREFIX, namespace, name);
        let _guard = self.store.write_guard().await;
        if self.store.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(&key).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::migration::{Migration, MigrationPhase};

    async fn registry() -> Registry {
        Registry::new(StateStore::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_assigns_first_version() {
        let reg = registry().await;
        let created = reg.create(Migration::new("ns", "m", "vmi")).await.unwrap();
        assert_eq!(created.resource_version, 1);
        let err = reg.create(Migration::new("ns", "m", "vmi")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn replace_detects_stale_writers() {
        let reg = registry().await;
        let created = reg.create(Migration::new("ns", "m", "vmi")).await.unwrap();

        let mut first = created.clone();
        first.status.phase = MigrationPhase::Running;
        let first = reg.replace(first).await.unwrap();
        assert_eq!(first.resource_version, 2);

        let mut stale = created;
        stale.status.phase = MigrationPhase::Failed;
        let err = reg.replace(stale).await.unwrap_err();
        assert!(err.is_conflict());

        let stored: Migration = reg.get("ns", "m").await.unwrap().unwrap();
        assert_eq!(stored.status.phase, MigrationPhase::Running);
    }

    #[tokio::test]
    async fn replace_of_missing_object_is_not_found() {
        let reg = registry().await;
        let err = reg
            .replace(Migration::new("ns", "ghost", "vmi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn apply_overwrites_and_bumps_version() {
        let reg = registry().await;
        reg.create(Migration::new("ns", "m", "vmi")).await.unwrap();
        let applied = reg
            .apply(Migration::new("ns", "m", "vmi").with_phase(MigrationPhase::Running))
            .await
            .unwrap();
        assert_eq!(applied.resource_version, 2);
    }

    #[tokio::test]
    async fn list_is_namespace_scoped() {
        let reg = registry().await;
        reg.create(Migration::new("a", "m1", "vmi")).await.unwrap();
        reg.create(Migration::new("a", "m2", "vmi")).await.unwrap();
        reg.create(Migration::new("b", "m1", "vmi")).await.unwrap();
        assert_eq!(reg.list::<Migration>(Some("a")).await.unwrap().len(), 2);
        assert_eq!(reg.list::<Migration>(None).await.unwrap().len(), 3);
        assert!(reg.delete::<Migration>("b", "m1").await.unwrap());
        assert!(!reg.delete::<Migration>("b", "m1").await.unwrap());
    }
}
