//! Loads the writer's single YAML config file into strongly-typed structs.
//!
//! Unlike a layered config merge, this is a single document: `serde_yaml`
//! deserializes it directly into [`AppConfig`], `#[serde(default)]` on every
//! section so a partial file (or an empty one) still produces sane defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cgtw_geo::GpsFilterConfig;
use cgtw_history::HistoryPolicyConfig;

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MqttCfg {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: bool,
    pub client_id: String,
    pub keepalive: u64,
    pub reconnect_min_delay: u64,
    pub reconnect_max_delay: u64,
    pub sub_decoded: String,
    pub sub_telemetry: String,
}

impl Default for MqttCfg {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            tls: false,
            client_id: "cg-db-writer".to_string(),
            keepalive: 60,
            reconnect_min_delay: 1,
            reconnect_max_delay: 60,
            sub_decoded: "cg/v1/decoded/SN/+/pcc/+".to_string(),
            sub_telemetry: "cg/v1/telemetry/SN/+".to_string(),
        }
    }
}

impl std::fmt::Debug for MqttCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttCfg")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field(
                "password",
                &if self.password.is_empty() {
                    "<empty>"
                } else {
                    "<REDACTED>"
                },
            )
            .field("tls", &self.tls)
            .field("client_id", &self.client_id)
            .field("keepalive", &self.keepalive)
            .field("reconnect_min_delay", &self.reconnect_min_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .field("sub_decoded", &self.sub_decoded)
            .field("sub_telemetry", &self.sub_telemetry)
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresCfg {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

impl Default for PostgresCfg {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "cg_telemetry".to_string(),
            user: String::new(),
            password: String::new(),
            pool_min: 2,
            pool_max: 10,
        }
    }
}

impl PostgresCfg {
    /// The connection string handed to `sqlx::postgres::PgPoolOptions::connect`.
    /// Never logged directly — it embeds the password.
    pub fn dsn(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.dbname
        )
    }
}

impl std::fmt::Debug for PostgresCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCfg")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field(
                "password",
                &if self.password.is_empty() {
                    "<empty>"
                } else {
                    "<REDACTED>"
                },
            )
            .field("pool_min", &self.pool_min)
            .field("pool_max", &self.pool_max)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestCfg {
    pub decoded_queue_maxsize: usize,
    pub telemetry_queue_maxsize: usize,
    pub worker_count: usize,
    pub drop_decoded_when_full: bool,
    pub drop_decoded_policy: DropPolicy,
    pub worker_max_retries: u32,
    pub worker_retry_delay_sec: f64,
}

impl Default for IngestCfg {
    fn default() -> Self {
        Self {
            decoded_queue_maxsize: 5000,
            telemetry_queue_maxsize: 200,
            worker_count: 1,
            drop_decoded_when_full: true,
            drop_decoded_policy: DropPolicy::DropOldest,
            worker_max_retries: 3,
            worker_retry_delay_sec: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    DropOldest,
    DropNew,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsPolicyCfg {
    pub router_stale_sec: i64,
    pub router_offline_sec: i64,
    pub panel_stale_sec: i64,
    pub panel_offline_sec: i64,
    pub check_interval_sec: u64,
    pub enable_gps_reject_events: bool,
    pub enable_unknown_register_events: bool,
}

impl Default for EventsPolicyCfg {
    fn default() -> Self {
        Self {
            router_stale_sec: 120,
            router_offline_sec: 300,
            panel_stale_sec: 120,
            panel_offline_sec: 300,
            check_interval_sec: 30,
            enable_gps_reject_events: true,
            enable_unknown_register_events: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionCfg {
    pub gps_raw_hours: i64,
    pub history_days: i64,
    pub events_days: i64,
    pub cleanup_interval_hours: u64,
    pub batch_size: i64,
}

impl Default for RetentionCfg {
    fn default() -> Self {
        Self {
            gps_raw_hours: 72,
            history_days: 30,
            events_days: 90,
            cleanup_interval_hours: 24,
            batch_size: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingCfg {
    pub level: String,
    pub log_file: String,
    pub json_logs: bool,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: String::new(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttCfg,
    pub postgres: PostgresCfg,
    pub ingest: IngestCfg,
    pub gps_filter: GpsFilterConfig,
    pub history_policy: HistoryPolicyConfig,
    pub events_policy: EventsPolicyCfg,
    pub retention: RetentionCfg,
    pub logging: LoggingCfg,
}

/// Load configuration from a YAML file on disk.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: AppConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config yaml: {}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.mqtt.host, "localhost");
        assert_eq!(cfg.postgres.pool_max, 10);
        assert_eq!(cfg.ingest.worker_count, 1);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let yaml = r#"
mqtt:
  host: broker.example.com
  port: 8883
postgres:
  dbname: cg_prod
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.mqtt.host, "broker.example.com");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.client_id, "cg-db-writer");
        assert_eq!(cfg.postgres.dbname, "cg_prod");
        assert_eq!(cfg.postgres.host, "localhost");
    }

    #[test]
    fn debug_redacts_passwords() {
        let mut cfg = PostgresCfg::default();
        cfg.password = "hunter2".to_string();
        let s = format!("{cfg:?}");
        assert!(!s.contains("hunter2"));
        assert!(s.contains("REDACTED"));
    }

    #[test]
    fn history_policy_and_gps_filter_reuse_shared_crates() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.history_policy.defaults.heartbeat_sec, 900);
        assert_eq!(cfg.gps_filter.max_jump_m, 500.0);
    }
}
