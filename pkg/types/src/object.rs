use serde::Serialize;
use serde::de::DeserializeOwned;

/// A namespaced object kept in the registry under `<prefix><namespace>/<name>`.
///
/// `resource_version` is owned by the store: it is bumped on every write and
/// compared on replace to detect concurrent modification.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Registry key prefix for this kind, ending in `/`.
    const PREFIX: &'static str;
    /// Human-readable kind, used in logs.
    const KIND: &'static str;

    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn resource_version(&self) -> u64;
    fn set_resource_version(&mut self, version: u64);

    fn key(&self) -> String {
        object_key(Self::PREFIX, self.namespace(), self.name())
    }
}

pub fn object_key(prefix: &str, namespace: &str, name: &str) -> String {
    format!("{}{}/{}", prefix, namespace, name)
}

/// Split a registry key back into `(namespace, name)` given the kind prefix.
pub fn split_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(prefix)?;
    let (ns, name) = rest.split_once('/')?;
    if ns.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((ns, name))
}

macro_rules! impl_object {
    ($r:ty, $prefix:expr, $kind:literal) => {
        impl $crate::object::Object for $r {
            const PREFIX: &'static str = $prefix;
            const KIND: &'static str = $kind;

            fn name(&self) -> &str {
                &self.name
            }
            fn namespace(&self) -> &str {
                &self.namespace
            }
            fn resource_version(&self) -> u64 {
                self.resource_version
            }
            fn set_resource_version(&mut self, version: u64) {
                self.resource_version = version;
            }
        }
    };
}

pub(crate) use impl_object;
