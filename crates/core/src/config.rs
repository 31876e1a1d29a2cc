//! Agent configuration.
//!
//! One precedence rule everywhere: environment variable over config file over
//! built-in default. The config file is optional TOML; every knob has an env
//! name, and the three connection settings are required.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8735";
const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 600;
const DEFAULT_UPLOAD_INTERVAL_MINS: u64 = 15;
const DEFAULT_SYNC_INTERVAL_MINS: u64 = 45;
const DEFAULT_CONNECTIVITY_INTERVAL_SECS: u64 = 60;
const DEFAULT_BACNET_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BACNET_READ_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_BACNET_BIND_ADDR: &str = "0.0.0.0:0";
const DEFAULT_BACNET_POOL_SIZE: usize = 8;
const DEFAULT_UPLOAD_BATCH_SIZE: i64 = 500;
const DEFAULT_MAX_RETRIES: i32 = 5;
const DEFAULT_UPLOAD_DEADLINE_SECS: u64 = 600;
const DEFAULT_EDGE_TRIGGER_MIN: i64 = 50;
const DEFAULT_INSERT_BATCH_SIZE: usize = 100;
const DEFAULT_PENDING_HIGH_WATER: usize = 50_000;
const DEFAULT_MAX_CONCURRENT_METERS: usize = 4;
const DEFAULT_DB_POOL_SIZE: usize = 10;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Optional TOML config file. Every field mirrors an env var; absent fields
/// fall through to the defaults above.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub database_url: Option<String>,
    pub client_api_url: Option<String>,
    pub client_api_key: Option<String>,
    pub listen_addr: Option<String>,
    pub collection_interval_seconds: Option<u64>,
    pub upload_interval_minutes: Option<u64>,
    pub sync_interval_minutes: Option<u64>,
    pub connectivity_interval_seconds: Option<u64>,
    pub bacnet_connect_timeout_ms: Option<u64>,
    pub bacnet_read_timeout_ms: Option<u64>,
    pub bacnet_bind_addr: Option<String>,
    pub bacnet_pool_size: Option<usize>,
    pub upload_batch_size: Option<i64>,
    pub max_retries: Option<i32>,
    pub upload_deadline_seconds: Option<u64>,
    pub edge_trigger_min: Option<i64>,
    pub insert_batch_size: Option<usize>,
    pub pending_high_water: Option<usize>,
    pub max_concurrent_meters: Option<usize>,
    pub cycle_deadline_seconds: Option<u64>,
    pub db_pool_size: Option<usize>,
    pub shutdown_grace_seconds: Option<u64>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Fully resolved agent configuration, shared read-only by every engine.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database_url: String,
    pub client_api_url: String,
    pub client_api_key: String,
    pub listen_addr: SocketAddr,

    pub collection_interval: Duration,
    pub upload_interval: Duration,
    pub sync_interval: Duration,
    pub connectivity_interval: Duration,

    pub bacnet_connect_timeout: Duration,
    pub bacnet_read_timeout: Duration,
    pub bacnet_bind_addr: SocketAddr,
    pub bacnet_pool_size: usize,

    pub upload_batch_size: i64,
    pub max_retries: i32,
    pub upload_deadline: Duration,
    pub edge_trigger_min: i64,

    pub insert_batch_size: usize,
    pub pending_high_water: usize,

    pub max_concurrent_meters: usize,
    /// Wall-clock budget for one collection pass. Defaults to the collection
    /// interval, so a cycle never runs into its own next tick.
    pub cycle_deadline: Duration,

    pub db_pool_size: usize,
    pub shutdown_grace: Duration,
}

impl AgentConfig {
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) => ConfigFile::read(path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, &|name| std::env::var(name).ok())
    }

    fn resolve(file: ConfigFile, env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = env("DATABASE_URL")
            .or(file.database_url)
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let client_api_url = env("CLIENT_API_URL")
            .or(file.client_api_url)
            .ok_or(ConfigError::Missing("CLIENT_API_URL"))?;
        let client_api_key = env("CLIENT_API_KEY")
            .or(file.client_api_key)
            .ok_or(ConfigError::Missing("CLIENT_API_KEY"))?;

        let listen_addr = parse_addr(
            "LISTEN_ADDR",
            env("LISTEN_ADDR")
                .or(file.listen_addr)
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned()),
        )?;
        let bacnet_bind_addr = parse_addr(
            "BACNET_BIND_ADDR",
            env("BACNET_BIND_ADDR")
                .or(file.bacnet_bind_addr)
                .unwrap_or_else(|| DEFAULT_BACNET_BIND_ADDR.to_owned()),
        )?;

        let collection_interval = Duration::from_secs(
            parsed(env, "COLLECTION_INTERVAL_SECONDS")?
                .or(file.collection_interval_seconds)
                .unwrap_or(DEFAULT_COLLECTION_INTERVAL_SECS),
        );

        Ok(Self {
            database_url,
            client_api_url,
            client_api_key,
            listen_addr,
            collection_interval,
            upload_interval: Duration::from_secs(
                60 * parsed(env, "UPLOAD_INTERVAL_MINUTES")?
                    .or(file.upload_interval_minutes)
                    .unwrap_or(DEFAULT_UPLOAD_INTERVAL_MINS),
            ),
            sync_interval: Duration::from_secs(
                60 * parsed(env, "SYNC_INTERVAL_MINUTES")?
                    .or(file.sync_interval_minutes)
                    .unwrap_or(DEFAULT_SYNC_INTERVAL_MINS),
            ),
            connectivity_interval: Duration::from_secs(
                parsed(env, "CONNECTIVITY_INTERVAL_SECONDS")?
                    .or(file.connectivity_interval_seconds)
                    .unwrap_or(DEFAULT_CONNECTIVITY_INTERVAL_SECS),
            ),
            bacnet_connect_timeout: Duration::from_millis(
                parsed(env, "BACNET_CONNECT_TIMEOUT_MS")?
                    .or(file.bacnet_connect_timeout_ms)
                    .unwrap_or(DEFAULT_BACNET_CONNECT_TIMEOUT_MS),
            ),
            bacnet_read_timeout: Duration::from_millis(
                parsed(env, "BACNET_READ_TIMEOUT_MS")?
                    .or(file.bacnet_read_timeout_ms)
                    .unwrap_or(DEFAULT_BACNET_READ_TIMEOUT_MS),
            ),
            bacnet_bind_addr,
            bacnet_pool_size: parsed(env, "BACNET_POOL_SIZE")?
                .or(file.bacnet_pool_size)
                .unwrap_or(DEFAULT_BACNET_POOL_SIZE),
            upload_batch_size: parsed(env, "UPLOAD_BATCH_SIZE")?
                .or(file.upload_batch_size)
                .unwrap_or(DEFAULT_UPLOAD_BATCH_SIZE),
            max_retries: parsed(env, "MAX_RETRIES")?
                .or(file.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            upload_deadline: Duration::from_secs(
                parsed(env, "UPLOAD_DEADLINE_SECONDS")?
                    .or(file.upload_deadline_seconds)
                    .unwrap_or(DEFAULT_UPLOAD_DEADLINE_SECS),
            ),
            edge_trigger_min: parsed(env, "EDGE_TRIGGER_MIN")?
                .or(file.edge_trigger_min)
                .unwrap_or(DEFAULT_EDGE_TRIGGER_MIN),
            insert_batch_size: parsed(env, "INSERT_BATCH_SIZE")?
                .or(file.insert_batch_size)
                .unwrap_or(DEFAULT_INSERT_BATCH_SIZE),
            pending_high_water: parsed(env, "PENDING_HIGH_WATER")?
                .or(file.pending_high_water)
                .unwrap_or(DEFAULT_PENDING_HIGH_WATER),
            max_concurrent_meters: parsed(env, "MAX_CONCURRENT_METERS")?
                .or(file.max_concurrent_meters)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_METERS),
            cycle_deadline: Duration::from_secs(
                parsed(env, "CYCLE_DEADLINE_SECONDS")?
                    .or(file.cycle_deadline_seconds)
                    .unwrap_or(collection_interval.as_secs()),
            ),
            db_pool_size: parsed(env, "DB_POOL_SIZE")?
                .or(file.db_pool_size)
                .unwrap_or(DEFAULT_DB_POOL_SIZE),
            shutdown_grace: Duration::from_secs(
                parsed(env, "SHUTDOWN_GRACE_SECONDS")?
                    .or(file.shutdown_grace_seconds)
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
        })
    }

    /// A config with dummy endpoints and tight timings, for tests that wire
    /// engines together without a real database or network.
    pub fn for_testing() -> Self {
        Self {
            database_url: "postgres://localhost/metersync_test".to_owned(),
            client_api_url: "http://127.0.0.1:0".to_owned(),
            client_api_key: "test-key".to_owned(),
            listen_addr: DEFAULT_LISTEN_ADDR.parse().unwrap(),
            collection_interval: Duration::from_millis(200),
            upload_interval: Duration::from_millis(200),
            sync_interval: Duration::from_millis(200),
            connectivity_interval: Duration::from_millis(50),
            bacnet_connect_timeout: Duration::from_millis(50),
            bacnet_read_timeout: Duration::from_millis(50),
            bacnet_bind_addr: DEFAULT_BACNET_BIND_ADDR.parse().unwrap(),
            bacnet_pool_size: 2,
            upload_batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            upload_deadline: Duration::from_secs(5),
            edge_trigger_min: DEFAULT_EDGE_TRIGGER_MIN,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            pending_high_water: DEFAULT_PENDING_HIGH_WATER,
            max_concurrent_meters: DEFAULT_MAX_CONCURRENT_METERS,
            cycle_deadline: Duration::from_secs(5),
            db_pool_size: 2,
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

fn parsed<T: FromStr>(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name: name.to_owned(),
                value: raw,
                message: e.to_string(),
            }),
    }
}

fn parse_addr(name: &str, raw: String) -> Result<SocketAddr, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        name: name.to_owned(),
        value: raw,
        message: "expected host:port".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn base_file() -> ConfigFile {
        ConfigFile {
            database_url: Some("postgres://db/agent".to_owned()),
            client_api_url: Some("https://api.example.net".to_owned()),
            client_api_key: Some("k".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn file_values_fill_in_for_missing_env() {
        let file = ConfigFile {
            collection_interval_seconds: Some(30),
            upload_interval_minutes: Some(1),
            ..base_file()
        };
        let cfg = AgentConfig::resolve(file, &no_env).unwrap();
        assert_eq!(cfg.collection_interval, Duration::from_secs(30));
        assert_eq!(cfg.upload_interval, Duration::from_secs(60));
        // Deadline follows the collection interval unless set explicitly.
        assert_eq!(cfg.cycle_deadline, Duration::from_secs(30));
        assert_eq!(cfg.db_pool_size, DEFAULT_DB_POOL_SIZE);
    }

    #[test]
    fn env_wins_over_file() {
        let file = ConfigFile {
            collection_interval_seconds: Some(30),
            ..base_file()
        };
        let env = |name: &str| (name == "COLLECTION_INTERVAL_SECONDS").then(|| "90".to_owned());
        let cfg = AgentConfig::resolve(file, &env).unwrap();
        assert_eq!(cfg.collection_interval, Duration::from_secs(90));
    }

    #[test]
    fn missing_required_keys_are_fatal() {
        let err = AgentConfig::resolve(ConfigFile::default(), &no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn invalid_numeric_env_is_rejected() {
        let env = |name: &str| (name == "DB_POOL_SIZE").then(|| "lots".to_owned());
        let err = AgentConfig::resolve(base_file(), &env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        let err = toml::from_str::<ConfigFile>("colection_interval_seconds = 60").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }
}
