// service-backup/src/config/mod.rs
//!
//! Configuration is resolved once at startup, in increasing precedence:
//! built-in defaults, `config.json`, the JSON document in
//! `SERVICE_BACKUP_CONFIG`, and finally the single-value variables
//! `SERVICE_BACKUP_USERNAME`, `SERVICE_BACKUP_PASSWORD`,
//! `SERVICE_BACKUP_ENCRYPTION_KEY` and `SERVICE_BACKUP_LOG_LEVEL`.

mod credentials;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::retention::RetentionPolicy;
use crate::service::{
    Binding, DEFAULT_TIMEOUT, ExecutorOptions, ServiceInstance, ServiceSettings, ServiceType,
    validate_identifier,
};

pub use credentials::Credentials;

pub const CONFIG_ENV: &str = "SERVICE_BACKUP_CONFIG";
pub const USERNAME_ENV: &str = "SERVICE_BACKUP_USERNAME";
pub const PASSWORD_ENV: &str = "SERVICE_BACKUP_PASSWORD";
pub const ENCRYPTION_KEY_ENV: &str = "SERVICE_BACKUP_ENCRYPTION_KEY";
pub const LOG_LEVEL_ENV: &str = "SERVICE_BACKUP_LOG_LEVEL";

const DEFAULT_REGION: &str = "us-east-1";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3Config {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    #[serde(alias = "host")]
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: Option<bool>,
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetention {
    pub days: Option<i64>,
    pub files: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBinding {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
    pub uri: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

/// A timeout given either as seconds or as a duration string like `1h30m`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsonTimeout {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonServiceConfig {
    pub schedule: Option<String>,
    pub timeout: Option<JsonTimeout>,
    pub retention: Option<JsonRetention>,
    pub direct_s3: Option<bool>,
    pub ignore_tables: Option<Vec<String>>,
    pub backup_options: Option<Vec<String>>,
    pub restore_options: Option<Vec<String>>,
    pub disable_column_statistics: Option<bool>,
    pub binding: Option<JsonBinding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub log_level: Option<String>,
    pub logging_timestamp: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub disable_restore: Option<bool>,
    pub max_concurrent_jobs: Option<usize>,
    pub s3: Option<JsonS3Config>,
    #[serde(default)]
    pub services: HashMap<String, JsonServiceConfig>,
}

fn pick<T>(base: &mut Option<T>, top: Option<T>) {
    if top.is_some() {
        *base = top;
    }
}

fn pick_str(base: &mut Option<String>, top: Option<String>) {
    pick(base, top.filter(|s| !s.trim().is_empty()));
}

fn pick_list(base: &mut Option<Vec<String>>, top: Option<Vec<String>>) {
    pick(base, top.filter(|v| !v.is_empty()));
}

impl JsonS3Config {
    fn overlay(mut self, top: Self) -> Self {
        pick_str(&mut self.bucket_name, top.bucket_name);
        pick_str(&mut self.region, top.region);
        pick_str(&mut self.endpoint_url, top.endpoint_url);
        pick_str(&mut self.access_key, top.access_key);
        pick_str(&mut self.secret_key, top.secret_key);
        pick(&mut self.force_path_style, top.force_path_style);
        pick_str(&mut self.encryption_key, top.encryption_key);
        self
    }
}

impl JsonBinding {
    fn overlay(mut self, top: Self) -> Self {
        pick_str(&mut self.service_type, top.service_type);
        pick_str(&mut self.uri, top.uri);
        pick_str(&mut self.host, top.host);
        pick(&mut self.port, top.port.filter(|p| *p > 0));
        pick_str(&mut self.username, top.username);
        pick_str(&mut self.password, top.password);
        pick_str(&mut self.database, top.database);
        self
    }
}

impl JsonServiceConfig {
    fn overlay(mut self, top: Self) -> Self {
        pick_str(&mut self.schedule, top.schedule);
        pick(&mut self.timeout, top.timeout);
        if let Some(top_retention) = top.retention {
            let retention = self.retention.get_or_insert_with(Default::default);
            pick(&mut retention.days, top_retention.days.filter(|d| *d > 0));
            pick(&mut retention.files, top_retention.files.filter(|f| *f > 0));
        }
        pick(&mut self.direct_s3, top.direct_s3);
        pick_list(&mut self.ignore_tables, top.ignore_tables);
        pick_list(&mut self.backup_options, top.backup_options);
        pick_list(&mut self.restore_options, top.restore_options);
        pick(&mut self.disable_column_statistics, top.disable_column_statistics);
        self.binding = match (self.binding, top.binding) {
            (Some(base), Some(top)) => Some(base.overlay(top)),
            (base, top) => top.or(base),
        };
        self
    }
}

impl RawJsonConfig {
    /// Merges `top` over `self`. Empty values in `top` never erase.
    pub fn overlay(mut self, top: Self) -> Self {
        pick_str(&mut self.log_level, top.log_level);
        pick(&mut self.logging_timestamp, top.logging_timestamp);
        pick_str(&mut self.username, top.username);
        pick_str(&mut self.password, top.password);
        pick(&mut self.disable_restore, top.disable_restore);
        pick(&mut self.max_concurrent_jobs, top.max_concurrent_jobs);
        self.s3 = match (self.s3, top.s3) {
            (Some(base), Some(top)) => Some(base.overlay(top)),
            (base, top) => top.or(base),
        };
        for (name, top_service) in top.services {
            let base = self.services.remove(&name).unwrap_or_default();
            self.services.insert(name, base.overlay(top_service));
        }
        self
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: bool,
}

/// Immutable snapshot of the resolved configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub logging_timestamp: bool,
    pub credentials: Option<Credentials>,
    pub disable_restore: bool,
    pub max_concurrent_jobs: Option<usize>,
    pub s3: Option<S3Settings>,
    pub encryption_key: Option<String>,
    pub services: Vec<ServiceInstance>,
}

impl AppConfig {
    fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let encryption_key = raw
            .s3
            .as_ref()
            .and_then(|s3| s3.encryption_key.clone())
            .filter(|k| !k.is_empty());

        let s3 = raw.s3.map(s3_settings).transpose()?;

        let credentials = match (raw.username, raw.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Credentials::new(u, p)),
            _ => None,
        };

        let mut services = raw
            .services
            .into_iter()
            .map(|(name, cfg)| {
                service_instance(&name, cfg)
                    .with_context(|| format!("Invalid configuration for service '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        services.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(Self {
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
            logging_timestamp: raw.logging_timestamp.unwrap_or(false),
            credentials,
            disable_restore: raw.disable_restore.unwrap_or(false),
            max_concurrent_jobs: raw.max_concurrent_jobs.filter(|n| *n > 0),
            s3,
            encryption_key,
            services,
        })
    }
}

fn s3_settings(raw: JsonS3Config) -> Result<S3Settings> {
    let bucket_name = raw
        .bucket_name
        .filter(|b| !b.is_empty())
        .context("s3.bucket_name must be set when s3 storage is configured")?;
    let endpoint_url = raw.endpoint_url.filter(|e| !e.is_empty());
    if raw.access_key.is_some() != raw.secret_key.is_some() {
        bail!("s3.access_key and s3.secret_key must be given together");
    }
    Ok(S3Settings {
        bucket_name,
        region: raw
            .region
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        force_path_style: raw.force_path_style.unwrap_or(endpoint_url.is_some()),
        endpoint_url,
        access_key: raw.access_key,
        secret_key: raw.secret_key,
    })
}

fn service_instance(name: &str, cfg: JsonServiceConfig) -> Result<ServiceInstance> {
    validate_identifier("service name", name)?;
    let binding = cfg.binding.unwrap_or_default();
    let service_type: ServiceType = binding
        .service_type
        .as_deref()
        .context("binding.type must be set")?
        .parse()?;

    // a zero timeout keeps the default
    let timeout = match cfg.timeout {
        Some(JsonTimeout::Seconds(secs)) => Duration::from_secs(secs),
        Some(JsonTimeout::Text(text)) => parse_duration(&text)?,
        None => Duration::ZERO,
    };
    let timeout = if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout };

    let retention = cfg.retention.unwrap_or_default();
    let settings = ServiceSettings {
        timeout,
        retention: RetentionPolicy {
            days: retention.days.unwrap_or_default(),
            files: retention.files.unwrap_or_default(),
        },
        executor: ExecutorOptions {
            ignore_tables: cfg.ignore_tables.unwrap_or_default(),
            backup_options: cfg.backup_options.unwrap_or_default(),
            restore_options: cfg.restore_options.unwrap_or_default(),
            disable_column_statistics: cfg.disable_column_statistics.unwrap_or(false),
        },
        schedule: cfg.schedule.filter(|s| !s.is_empty()),
        direct_s3: cfg.direct_s3.unwrap_or(false),
    };

    Ok(ServiceInstance::new(
        service_type,
        name,
        Binding {
            uri: binding.uri,
            host: binding.host,
            port: binding.port,
            username: binding.username,
            password: binding.password,
            database: binding.database,
        },
    )
    .with_settings(settings))
}

/// Parses durations such as `90`, `45s`, `15m`, `2h` or `1h30m`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        bail!("invalid duration: empty value");
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut number = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => bail!("invalid duration '{text}': unknown unit '{c}'"),
        };
        let value: u64 = number
            .parse()
            .with_context(|| format!("invalid duration '{text}'"))?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .with_context(|| format!("duration '{text}' is too large"))?;
        number.clear();
    }
    if !number.is_empty() {
        bail!("invalid duration '{text}': missing unit after {number}");
    }
    Ok(Duration::from_secs(total))
}

/// Resolves the configuration from the config file contents and an
/// environment lookup. Pure apart from calling `env`.
pub fn resolve_config(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig> {
    let mut raw: RawJsonConfig = match file_contents {
        Some(contents) => {
            serde_json::from_str(contents).context("Failed to parse JSON from config file")?
        }
        None => RawJsonConfig::default(),
    };

    if let Some(env_json) = env(CONFIG_ENV).filter(|v| !v.trim().is_empty()) {
        let top: RawJsonConfig = serde_json::from_str(&env_json)
            .with_context(|| format!("Failed to parse environment variable {CONFIG_ENV}"))?;
        raw = raw.overlay(top);
    }

    pick_str(&mut raw.username, env(USERNAME_ENV));
    pick_str(&mut raw.password, env(PASSWORD_ENV));
    pick_str(&mut raw.log_level, env(LOG_LEVEL_ENV));
    let env_key = env(ENCRYPTION_KEY_ENV).filter(|k| !k.is_empty());

    let mut config = AppConfig::from_raw(raw)?;
    // the key applies to the catalog even without an s3 section
    if env_key.is_some() {
        config.encryption_key = env_key;
    }
    Ok(config)
}

/// Loads `config_path` (if present) and applies the environment overlay.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let contents = if config_path.exists() {
        Some(
            fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file at {}", config_path.display()))?,
        )
    } else {
        None
    };
    resolve_config(contents.as_deref(), |key| std::env::var(key).ok()).with_context(|| {
        format!(
            "Failed to resolve configuration from {}",
            config_path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_of(vars: &[(&str, String)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn file() -> String {
        json!({
            "log_level": "debug",
            "username": "admin",
            "password": "from-file",
            "s3": {
                "bucket_name": "backups",
                "host": "https://s3.internal",
                "access_key": "AK",
                "secret_key": "SK"
            },
            "services": {
                "orders": {
                    "timeout": "2h",
                    "retention": { "days": 7, "files": 3 },
                    "ignore_tables": ["audit_log"],
                    "disable_column_statistics": true,
                    "binding": { "type": "postgresql", "uri": "postgres://u:p@db/orders" }
                },
                "sessions": {
                    "binding": { "type": "redis", "host": "cache", "port": 6379 }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn file_only_resolution() -> anyhow::Result<()> {
        let config = resolve_config(Some(&file()), env_of(&[]))?;
        assert_eq!(config.log_level, "debug");
        assert!(config.credentials.as_ref().is_some_and(|c| c.verify("admin", "from-file")));

        let s3 = config.s3.expect("s3 configured");
        assert_eq!(s3.bucket_name, "backups");
        assert_eq!(s3.region, DEFAULT_REGION);
        assert_eq!(s3.endpoint_url.as_deref(), Some("https://s3.internal"));
        assert!(s3.force_path_style);

        assert_eq!(config.services.len(), 2);
        let orders = &config.services[0];
        assert_eq!(orders.service_type(), ServiceType::Postgres);
        assert_eq!(orders.settings.timeout, Duration::from_secs(7200));
        assert_eq!(orders.settings.retention, RetentionPolicy { days: 7, files: 3 });
        assert_eq!(orders.settings.executor.ignore_tables, ["audit_log"]);
        assert!(orders.settings.executor.disable_column_statistics);

        let sessions = &config.services[1];
        assert!(sessions.settings.retention.is_unbounded());
        assert_eq!(sessions.settings.timeout, DEFAULT_TIMEOUT);
        Ok(())
    }

    #[test]
    fn environment_overrides_file() -> anyhow::Result<()> {
        let overlay = json!({
            "log_level": "",
            "disable_restore": true,
            "s3": { "bucket_name": "other-bucket" },
            "services": {
                "orders": { "retention": { "files": 10 } },
                "catalog": { "binding": { "type": "mongodb", "uri": "mongodb://m/catalog" } }
            }
        })
        .to_string();
        let env = env_of(&[
            (CONFIG_ENV, overlay),
            (PASSWORD_ENV, "from-env".to_string()),
            (ENCRYPTION_KEY_ENV, "passphrase".to_string()),
        ]);

        let config = resolve_config(Some(&file()), env)?;
        // empty values in the overlay do not erase
        assert_eq!(config.log_level, "debug");
        assert!(config.disable_restore);
        assert_eq!(config.s3.as_ref().map(|s| s.bucket_name.as_str()), Some("other-bucket"));
        assert_eq!(config.s3.as_ref().and_then(|s| s.access_key.as_deref()), Some("AK"));
        assert!(config.credentials.as_ref().is_some_and(|c| c.verify("admin", "from-env")));
        assert_eq!(config.encryption_key.as_deref(), Some("passphrase"));

        let orders = config
            .services
            .iter()
            .find(|s| s.name() == "orders")
            .expect("orders kept");
        assert_eq!(orders.settings.retention, RetentionPolicy { days: 7, files: 10 });
        assert_eq!(config.services.len(), 3);
        Ok(())
    }

    #[test]
    fn defaults_without_any_source() -> anyhow::Result<()> {
        let config = resolve_config(None, env_of(&[]))?;
        assert_eq!(config.log_level, "info");
        assert!(config.s3.is_none());
        assert!(config.credentials.is_none());
        assert!(config.services.is_empty());
        Ok(())
    }

    #[test]
    fn invalid_services_are_rejected() {
        let unknown_type = json!({
            "services": { "x": { "binding": { "type": "couchdb", "host": "h" } } }
        })
        .to_string();
        assert!(resolve_config(Some(&unknown_type), env_of(&[])).is_err());

        let missing_type = json!({ "services": { "x": { "binding": { "host": "h" } } } }).to_string();
        assert!(resolve_config(Some(&missing_type), env_of(&[])).is_err());

        let bad_name = json!({
            "services": { "../x": { "binding": { "type": "redis", "host": "h" } } }
        })
        .to_string();
        assert!(resolve_config(Some(&bad_name), env_of(&[])).is_err());
    }

    #[test]
    fn s3_requires_a_bucket() {
        let contents = json!({ "s3": { "region": "eu-central-1" } }).to_string();
        assert!(resolve_config(Some(&contents), env_of(&[])).is_err());
    }

    #[test]
    fn durations() -> anyhow::Result<()> {
        assert_eq!(parse_duration("90")?, Duration::from_secs(90));
        assert_eq!(parse_duration("45s")?, Duration::from_secs(45));
        assert_eq!(parse_duration("1h30m")?, Duration::from_secs(5400));
        assert_eq!(parse_duration("0")?, Duration::ZERO);
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("9999999999999999h").is_err());
        Ok(())
    }

    #[test]
    fn zero_timeouts_keep_the_default() -> anyhow::Result<()> {
        for timeout in [json!("0"), json!("0s"), json!(0)] {
            let contents = json!({
                "services": {
                    "orders": {
                        "timeout": timeout,
                        "binding": { "type": "postgres", "uri": "postgres://u:p@db/orders" }
                    }
                }
            })
            .to_string();
            let config = resolve_config(Some(&contents), env_of(&[]))?;
            assert_eq!(config.services[0].settings.timeout, DEFAULT_TIMEOUT);
        }
        Ok(())
    }

    #[test]
    fn load_from_file_on_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(&path, file())?;
        let config = load_config(&path)?;
        assert_eq!(config.services.len(), 2);

        let missing = load_config(&dir.path().join("absent.json"))?;
        assert!(missing.services.is_empty());
        Ok(())
    }
}
