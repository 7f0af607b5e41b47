use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
///
/// Registration hands back a cheap handle so hot paths never touch the
/// registry's lock; only `render` does.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Registered<Counter>>>,
    gauges: RwLock<BTreeMap<String, Registered<Gauge>>>,
}

struct Registered<T> {
    help: String,
    handle: T,
}

/// Monotonically increasing counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

/// Value that can go up or down.
#[derive(Clone, Default)]
pub struct Gauge(Arc<AtomicI64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Gauge {
    pub fn set(&self, val: i64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter, or return the existing one with that name.
    pub fn counter(&self, name: &str, help: &str) -> Counter {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(name.to_string())
            .or_insert_with(|| Registered {
                help: help.to_string(),
                handle: Counter::default(),
            })
            .handle
            .clone()
    }

    /// Register a gauge, or return the existing one with that name.
    pub fn gauge(&self, name: &str, help: &str) -> Gauge {
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Registered {
                help: help.to_string(),
                handle: Gauge::default(),
            })
            .handle
            .clone()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        for (name, c) in counters.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, c.help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, c.handle.get()));
        }

        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        for (name, g) in gauges.iter() {
            output.push_str(&format!("# HELP {} {}\n", name, g.help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{} {}\n", name, g.handle.get()));
        }

        output
    }
}
