use serde::{Deserialize, Serialize};

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/mtq/data
/// workers: 8
/// resync-interval-secs: 30
/// max-conflict-retries: 5
/// metrics-port: 9090
/// log-format: json
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "max-conflict-retries")]
    pub max_conflict_retries: Option<u32>,
    #[serde(default, alias = "metrics-port")]
    pub metrics_port: Option<u16>,
    #[serde(default, alias = "log-format")]
    pub log_format: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: ControllerConfigFile =
            load_config_file("/nonexistent/mtq/config.yaml").unwrap();
        assert!(cfg.workers.is_none());
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn kebab_case_aliases_parse() {
        let cfg: ControllerConfigFile = serde_yaml::from_str(
            "data-dir: /data\nworkers: 8\nresync-interval-secs: 15\nlog-format: json\n",
        )
        .unwrap();
        assert_eq!(cfg.data_dir.as_deref(), Some("/data"));
        assert_eq!(cfg.workers, Some(8));
        assert_eq!(cfg.resync_interval_secs, Some(15));
        assert_eq!(cfg.log_format.as_deref(), Some("json"));
    }
}
