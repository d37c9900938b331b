//! Metrics server configuration
//!
//! Loaded from an optional YAML file layered under `METRICSSERVER__*`
//! environment overrides, e.g. `METRICSSERVER__COLLECTOR__WS_PORT=7200`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "METRICSSERVER";

/// Metrics server configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub policy_store: PolicyStoreConfig,
    #[serde(default)]
    pub metrics_store: MetricsStoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Query server and cluster layout
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Host of every metrics server node, in node index order
    #[serde(default = "default_node_addrs")]
    pub node_addrs: Vec<String>,
    #[serde(default)]
    pub node_index: usize,
    /// Scheme used in redirect locations
    #[serde(default = "default_redirect_scheme")]
    pub redirect_scheme: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            node_addrs: default_node_addrs(),
            node_index: 0,
            redirect_scheme: default_redirect_scheme(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

/// Ingestion, processing and caching settings
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_ws_keep_alive_time", with = "humantime_serde")]
    pub ws_keep_alive_time: Duration,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(default = "default_collect_interval", with = "humantime_serde")]
    pub collect_interval: Duration,
    #[serde(default = "default_save_interval", with = "humantime_serde")]
    pub save_interval: Duration,
    #[serde(default = "default_metric_cache_size_per_app")]
    pub metric_cache_size_per_app: usize,
    #[serde(default = "default_true")]
    pub persist_metrics: bool,
    #[serde(default = "default_envelope_processor_count")]
    pub envelope_processor_count: usize,
    #[serde(default = "default_channel_size")]
    pub envelope_channel_size: usize,
    #[serde(default = "default_channel_size")]
    pub metric_channel_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            ws_keep_alive_time: default_ws_keep_alive_time(),
            refresh_interval: default_refresh_interval(),
            collect_interval: default_collect_interval(),
            save_interval: default_save_interval(),
            metric_cache_size_per_app: default_metric_cache_size_per_app(),
            persist_metrics: true,
            envelope_processor_count: default_envelope_processor_count(),
            envelope_channel_size: default_channel_size(),
            metric_channel_size: default_channel_size(),
        }
    }
}

/// Source of the application ids bound to the autoscaler
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyStoreConfig {
    #[serde(default)]
    pub app_ids: Vec<String>,
    /// JSON array of app ids, re-read on every refresh; wins over `app_ids`
    #[serde(default)]
    pub app_ids_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsStoreConfig {
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for MetricsStoreConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            snapshot_path: None,
            prune_interval: default_prune_interval(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_node_addrs() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_redirect_scheme() -> String {
    "https".to_string()
}

fn default_health_port() -> u16 {
    8081
}

fn default_ws_port() -> u16 {
    7103
}

fn default_ws_keep_alive_time() -> Duration {
    Duration::from_secs(60)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_collect_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_save_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_metric_cache_size_per_app() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_envelope_processor_count() -> usize {
    5
}

fn default_channel_size() -> usize {
    1000
}

fn default_retention() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Config {
    /// Load configuration from an optional file and the environment, then
    /// validate it
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.node_addrs")
                    .with_list_parse_key("policy_store.app_ids"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        let collector = &self.collector;

        if collector.collect_interval.is_zero() {
            bail!("Configuration error: collector.collect_interval is 0");
        }
        if collector.refresh_interval.is_zero() {
            bail!("Configuration error: collector.refresh_interval is 0");
        }
        if collector.save_interval.is_zero() {
            bail!("Configuration error: collector.save_interval is 0");
        }
        if collector.metric_cache_size_per_app == 0 {
            bail!("Configuration error: invalid collector.metric_cache_size_per_app");
        }
        if self.server.node_addrs.is_empty() {
            bail!("Configuration error: server.node_addrs is empty");
        }
        if self.server.node_index >= self.server.node_addrs.len() {
            bail!("Configuration error: server.node_index out of range");
        }
        if collector.ws_keep_alive_time.is_zero() {
            bail!("Configuration error: ws_keep_alive_time is less-equal than 0");
        }
        if collector.envelope_processor_count == 0 {
            bail!("Configuration error: envelope_processor_count is less-equal than 0");
        }
        if collector.envelope_channel_size == 0 {
            bail!("Configuration error: envelope_channel_size is less-equal than 0");
        }
        if collector.metric_channel_size == 0 {
            bail!("Configuration error: metric_channel_size is less-equal than 0");
        }
        if self.metrics_store.retention.is_zero() {
            bail!("Configuration error: metrics_store.retention is 0");
        }
        if self.metrics_store.prune_interval.is_zero() {
            bail!("Configuration error: metrics_store.prune_interval is 0");
        }

        Ok(())
    }

    /// `host:port` query address of every node, in node index order
    pub fn node_query_addrs(&self) -> Vec<String> {
        self.server
            .node_addrs
            .iter()
            .map(|addr| format!("{}:{}", addr, self.server.port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    fn validation_error(config: &Config) -> String {
        config.validate().unwrap_err().to_string()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.node_addrs, vec!["127.0.0.1"]);
        assert_eq!(config.server.redirect_scheme, "https");
        assert_eq!(config.health.port, 8081);
        assert_eq!(config.collector.ws_port, 7103);
        assert_eq!(config.collector.ws_keep_alive_time, Duration::from_secs(60));
        assert_eq!(config.collector.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.collector.collect_interval, Duration::from_secs(30));
        assert_eq!(config.collector.save_interval, Duration::from_secs(5));
        assert_eq!(config.collector.metric_cache_size_per_app, 1000);
        assert!(config.collector.persist_metrics);
        assert_eq!(config.collector.envelope_processor_count, 5);
        assert_eq!(config.metrics_store.retention, Duration::from_secs(172_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let file = write_config(
            r#"
logging:
  level: debug
server:
  port: 9000
  node_addrs: ["10.0.0.1", "10.0.0.2"]
  node_index: 1
  redirect_scheme: http
collector:
  refresh_interval: 2m
  collect_interval: 10s
  persist_metrics: false
  envelope_processor_count: 3
policy_store:
  app_ids: ["app-1", "app-2"]
metrics_store:
  retention: 1h
"#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.node_index, 1);
        assert_eq!(config.server.redirect_scheme, "http");
        assert_eq!(config.collector.refresh_interval, Duration::from_secs(120));
        assert_eq!(config.collector.collect_interval, Duration::from_secs(10));
        assert!(!config.collector.persist_metrics);
        assert_eq!(config.collector.envelope_processor_count, 3);
        assert_eq!(config.collector.save_interval, Duration::from_secs(5));
        assert_eq!(config.policy_store.app_ids, vec!["app-1", "app-2"]);
        assert_eq!(config.metrics_store.retention, Duration::from_secs(3600));
        assert_eq!(
            config.node_query_addrs(),
            vec!["10.0.0.1:9000", "10.0.0.2:9000"]
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/metricsserver.yml"))).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = write_config(
            r#"
server:
  node_addrs: ["10.0.0.1"]
  node_index: 3
"#,
        );

        let err = Config::load(Some(file.path())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: server.node_index out of range"
        );
    }

    #[test]
    fn test_validation_messages() {
        let mut config = Config::default();
        config.collector.collect_interval = Duration::ZERO;
        assert_eq!(
            validation_error(&config),
            "Configuration error: collector.collect_interval is 0"
        );

        let mut config = Config::default();
        config.collector.refresh_interval = Duration::ZERO;
        assert_eq!(
            validation_error(&config),
            "Configuration error: collector.refresh_interval is 0"
        );

        let mut config = Config::default();
        config.collector.save_interval = Duration::ZERO;
        assert_eq!(
            validation_error(&config),
            "Configuration error: collector.save_interval is 0"
        );

        let mut config = Config::default();
        config.collector.metric_cache_size_per_app = 0;
        assert_eq!(
            validation_error(&config),
            "Configuration error: invalid collector.metric_cache_size_per_app"
        );

        let mut config = Config::default();
        config.server.node_addrs.clear();
        assert_eq!(
            validation_error(&config),
            "Configuration error: server.node_addrs is empty"
        );

        let mut config = Config::default();
        config.collector.ws_keep_alive_time = Duration::ZERO;
        assert_eq!(
            validation_error(&config),
            "Configuration error: ws_keep_alive_time is less-equal than 0"
        );

        let mut config = Config::default();
        config.collector.envelope_processor_count = 0;
        assert_eq!(
            validation_error(&config),
            "Configuration error: envelope_processor_count is less-equal than 0"
        );

        let mut config = Config::default();
        config.collector.envelope_channel_size = 0;
        assert_eq!(
            validation_error(&config),
            "Configuration error: envelope_channel_size is less-equal than 0"
        );

        let mut config = Config::default();
        config.collector.metric_channel_size = 0;
        assert_eq!(
            validation_error(&config),
            "Configuration error: metric_channel_size is less-equal than 0"
        );

        let mut config = Config::default();
        config.metrics_store.retention = Duration::ZERO;
        assert_eq!(
            validation_error(&config),
            "Configuration error: metrics_store.retention is 0"
        );

        let mut config = Config::default();
        config.metrics_store.prune_interval = Duration::ZERO;
        assert_eq!(
            validation_error(&config),
            "Configuration error: metrics_store.prune_interval is 0"
        );
    }

    #[test]
    fn test_load_rejects_zero_prune_interval() {
        let file = write_config(
            r#"
metrics_store:
  prune_interval: 0s
"#,
        );

        let err = Config::load(Some(file.path())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: metrics_store.prune_interval is 0"
        );
    }
}
