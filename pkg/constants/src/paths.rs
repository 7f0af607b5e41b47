//! Filesystem path and port defaults.

/// Default config file path for the controller.
pub const DEFAULT_CONTROLLER_CONFIG: &str = "/etc/mtq/config.yaml";

/// Default data directory for the state store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/mtq-data";

/// Default port for `/healthz` and `/metrics`.
pub const DEFAULT_METRICS_PORT: u16 = 9090;
