use pkg_metrics::{Counter, Gauge, MetricsRegistry};

/// Handles for everything the migration quota controller reports.
#[derive(Clone)]
pub struct ControllerMetrics {
    pub reconciles: Counter,
    pub reconcile_errors: Counter,
    pub condition_writes: Counter,
    pub write_conflicts: Counter,
    pub blocked_migrations: Gauge,
    pub queue_depth: Gauge,
}

impl ControllerMetrics {
    pub fn register(registry: &MetricsRegistry) -> Self {
        Self {
            reconciles: registry.counter("mtq_reconciles_total", "Migration evaluations completed"),
            reconcile_errors: registry.counter(
                "mtq_reconcile_errors_total",
                "Migration evaluations that failed and were requeued",
            ),
            condition_writes: registry.counter(
                "mtq_condition_writes_total",
                "RejectedByResourceQuota condition updates written",
            ),
            write_conflicts: registry.counter(
                "mtq_write_conflicts_total",
                "Compare-and-swap writes rejected because the object changed",
            ),
            blocked_migrations: registry.gauge(
                "mtq_blocked_migrations",
                "Migrations currently blocked by resource quota",
            ),
            queue_depth: registry.gauge("mtq_queue_depth", "Migration keys waiting for a worker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_series_are_exported() {
        let registry = MetricsRegistry::new();
        let metrics = ControllerMetrics::register(&registry);
        metrics.reconciles.inc();
        metrics.blocked_migrations.set(2);
        let text = registry.render();
        for name in [
            "mtq_reconciles_total 1",
            "mtq_reconcile_errors_total 0",
            "mtq_condition_writes_total 0",
            "mtq_write_conflicts_total 0",
            "mtq_blocked_migrations 2",
            "mtq_queue_depth 0",
        ] {
            assert!(text.contains(name), "missing {} in\n{}", name, text);
        }
    }
}
