use pkg_constants::resources::{
    COMPUTE_RESOURCES, LIMITS_CPU, LIMITS_EPHEMERAL_STORAGE, LIMITS_MEMORY,
};
use pkg_constants::resources::{CPU, EPHEMERAL_STORAGE, MEMORY};
use pkg_constants::resources::{REQUESTS_CPU, REQUESTS_EPHEMERAL_STORAGE, REQUESTS_MEMORY};
use pkg_types::migration::Migration;
use pkg_types::pod::{Pod, PodPhase, PodSpec};
use pkg_types::quantity::Quantity;
use pkg_types::resource::ResourceList;
use std::collections::BTreeMap;
use tracing::warn;

/// What a migration would additionally charge against the namespace quota
/// while source and target instances coexist.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEstimate {
    pub namespace: String,
    pub migration_name: String,
    pub per_resource: ResourceList,
}

/// Quota resource names charged for a container-level resource key.
fn charged_names(resource: &str) -> (&'static str, &'static str, &'static str) {
    match resource {
        CPU => (CPU, REQUESTS_CPU, LIMITS_CPU),
        MEMORY => (MEMORY, REQUESTS_MEMORY, LIMITS_MEMORY),
        _ => (
            EPHEMERAL_STORAGE,
            REQUESTS_EPHEMERAL_STORAGE,
            LIMITS_EPHEMERAL_STORAGE,
        ),
    }
}

/// Parse one raw quantity; unset or malformed counts as zero.
fn parse_or_zero(
    pod: &str,
    container: &str,
    values: &BTreeMap<String, String>,
    resource: &str,
) -> Quantity {
    match values.get(resource) {
        None => Quantity::ZERO,
        Some(raw) => match raw.parse::<Quantity>() {
            Ok(q) => q.clamp_non_negative(),
            Err(e) => {
                warn!(
                    "Pod {} container {}: ignoring malformed {} quantity {:?}: {}",
                    pod, container, resource, raw, e
                );
                Quantity::ZERO
            }
        },
    }
}

/// Sum of container requests/limits, expressed in quota resource names.
///
/// The bare names (`cpu`, `memory`, `ephemeral-storage`) are charged the
/// request amount, as Kubernetes quota does.
pub fn pod_footprint(pod_name: &str, spec: &PodSpec) -> ResourceList {
    let mut footprint = ResourceList::new();
    for resource in COMPUTE_RESOURCES {
        let (bare, requests_name, limits_name) = charged_names(resource);
        let mut requested = Quantity::ZERO;
        let mut limited = Quantity::ZERO;
        for container in &spec.containers {
            let resources = &container.resources;
            requested += parse_or_zero(pod_name, &container.name, &resources.requests, resource);
            limited += parse_or_zero(pod_name, &container.name, &resources.limits, resource);
        }
        footprint.insert(bare, requested);
        footprint.insert(requests_name, requested);
        footprint.insert(limits_name, limited);
    }
    footprint
}

/// The running launcher pod of a VMI. When several exist (a target pod was
/// already started) the oldest one is the source instance.
pub fn find_launcher<'a>(pods: &'a [Pod], vmi_name: &str) -> Option<&'a Pod> {
    pods.iter()
        .filter(|p| p.status == PodPhase::Running && p.launched_vmi() == Some(vmi_name))
        .min_by_key(|p| (p.created_at, p.name.clone()))
}

/// Estimate for `migration` given its source launcher pod.
///
/// Without a running launcher there is nothing to charge yet and the
/// estimate is empty.
pub fn estimate(migration: &Migration, launcher: Option<&Pod>) -> UsageEstimate {
    let per_resource = launcher
        .map(|pod| pod_footprint(&pod.name, &pod.spec))
        .unwrap_or_default();
    UsageEstimate {
        namespace: migration.namespace.clone(),
        migration_name: migration.name.clone(),
        per_resource,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pkg_types::pod::{ContainerSpec, ResourceRequirements};

    fn container(requests: &[(&str, &str)], limits: &[(&str, &str)]) -> ContainerSpec {
        ContainerSpec {
            name: "compute".to_string(),
            image: "virt-launcher".to_string(),
            resources: ResourceRequirements {
                requests: requests
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                limits: limits
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn footprint_sums_containers_and_aliases_requests() {
        let spec = PodSpec {
            containers: vec![
                container(&[("memory", "512Mi"), ("cpu", "1")], &[("memory", "1Gi")]),
                container(&[("memory", "64Mi"), ("cpu", "100m")], &[("cpu", "2")]),
            ],
        };
        let footprint = pod_footprint("virt-launcher-a", &spec);
        assert_eq!(footprint.get("memory"), q("576Mi"));
        assert_eq!(footprint.get("requests.memory"), q("576Mi"));
        assert_eq!(footprint.get("limits.memory"), q("1Gi"));
        assert_eq!(footprint.get("cpu"), q("1100m"));
        assert_eq!(footprint.get("limits.cpu"), q("2"));
        assert_eq!(footprint.get("ephemeral-storage"), Quantity::ZERO);
        assert_eq!(footprint.len(), 9);
    }

    #[test]
    fn malformed_quantities_count_as_zero() {
        let spec = PodSpec {
            containers: vec![container(
                &[("memory", "lots"), ("cpu", "250m")],
                &[("ephemeral-storage", "1Gi")],
            )],
        };
        let footprint = pod_footprint("virt-launcher-a", &spec);
        assert_eq!(footprint.get("memory"), Quantity::ZERO);
        assert_eq!(footprint.get("cpu"), q("250m"));
        assert_eq!(footprint.get("limits.ephemeral-storage"), q("1Gi"));
    }

    #[test]
    fn oversized_quantities_count_as_zero() {
        let spec = PodSpec {
            containers: vec![container(
                &[("cpu", "170141183460469231731687303715884105n")],
                &[("cpu", "2")],
            )],
        };
        let footprint = pod_footprint("virt-launcher-a", &spec);
        assert_eq!(footprint.get("cpu"), Quantity::ZERO);
        assert_eq!(footprint.get("limits.cpu"), q("2"));
    }

    #[test]
    fn estimate_is_deterministic() {
        let migration = Migration::new("ns", "mig", "vmi-a");
        let pod = Pod::launcher(
            "ns",
            "virt-launcher-a",
            "vmi-a",
            PodSpec {
                containers: vec![container(&[("memory", "512Mi")], &[])],
            },
        );
        let a = estimate(&migration, Some(&pod));
        let b = estimate(&migration, Some(&pod));
        assert_eq!(a, b);
        assert_eq!(a.per_resource.get("memory"), q("512Mi"));
        assert!(estimate(&migration, None).per_resource.is_empty());
    }

    #[test]
    fn launcher_lookup_prefers_oldest_running_pod() {
        let spec = PodSpec::default();
        let mut source = Pod::launcher("ns", "virt-launcher-src", "vmi-a", spec.clone());
        source.created_at -= Duration::seconds(60);
        let target = Pod::launcher("ns", "virt-launcher-dst", "vmi-a", spec.clone());
        let mut finished = Pod::launcher("ns", "virt-launcher-old", "vmi-a", spec.clone());
        finished.status = PodPhase::Succeeded;
        finished.created_at -= Duration::seconds(600);
        let other = Pod::launcher("ns", "virt-launcher-b", "vmi-b", spec);

        let pods = vec![target, finished, other, source];
        let found = find_launcher(&pods, "vmi-a").unwrap();
        assert_eq!(found.name, "virt-launcher-src");
        assert!(find_launcher(&pods, "vmi-c").is_none());
    }
}
