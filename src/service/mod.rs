//! Service instances bound to the platform and the identifiers used to
//! address them.

mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{BackupError, Result};
use crate::retention::RetentionPolicy;

pub use registry::ServiceRegistry;

/// Default job timeout when a service does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,254}$").expect("identifier pattern is valid")
});

/// Checks that a service name or artifact filename is safe to embed in a
/// storage key.
pub fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(BackupError::Validation(format!("invalid {what}: {value:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Postgres,
    Mysql,
    Mongodb,
    Redis,
}

impl ServiceType {
    pub const ALL: [Self; 4] = [Self::Postgres, Self::Mysql, Self::Mongodb, Self::Redis];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mongodb => "mongodb",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" | "elephantsql" => Ok(Self::Postgres),
            "mysql" | "mariadb" | "mariadbent" | "pxc" => Ok(Self::Mysql),
            "mongodb" | "mongo" | "mongodbent" | "mongodb-2" => Ok(Self::Mongodb),
            "redis" | "redis-2" | "redis-ha" | "redis-enterprise" => Ok(Self::Redis),
            _ => Err(BackupError::Validation(format!(
                "unsupported service type: {s}"
            ))),
        }
    }
}

/// Identity of a service instance: `(type, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceKey {
    pub service_type: ServiceType,
    pub name: String,
}

impl ServiceKey {
    pub fn new(service_type: ServiceType, name: impl Into<String>) -> Self {
        Self {
            service_type,
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_type, self.name)
    }
}

/// Connection credentials of a bound service. Explicit fields take
/// precedence over the values embedded in `uri`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("uri", &self.uri.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

/// Connection parameters after merging a [`Binding`]'s URI and fields.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl Binding {
    pub fn connection(&self) -> Result<Connection> {
        let parsed = match self.uri.as_deref().filter(|u| !u.is_empty()) {
            Some(uri) => Some(
                Url::parse(uri)
                    .map_err(|e| BackupError::Validation(format!("invalid binding uri: {e}")))?,
            ),
            None => None,
        };

        let from_uri = |f: fn(&Url) -> Option<String>| parsed.as_ref().and_then(f);

        let host = self
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .or_else(|| from_uri(|u| u.host_str().map(str::to_string)))
            .ok_or_else(|| BackupError::Validation("binding has neither host nor uri".into()))?;

        Ok(Connection {
            host,
            port: self.port.or_else(|| parsed.as_ref().and_then(Url::port)),
            username: self
                .username
                .clone()
                .or_else(|| from_uri(|u| Some(u.username().to_string()).filter(|s| !s.is_empty()))),
            password: self
                .password
                .clone()
                .or_else(|| from_uri(|u| u.password().map(str::to_string))),
            database: self.database.clone().or_else(|| {
                from_uri(|u| {
                    Some(u.path().trim_start_matches('/').to_string()).filter(|s| !s.is_empty())
                })
            }),
        })
    }
}

/// Options handed through to the dump/restore tooling of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub ignore_tables: Vec<String>,
    pub backup_options: Vec<String>,
    pub restore_options: Vec<String>,
    /// Passes `--column-statistics=0` to mysqldump, for servers without
    /// column statistics.
    pub disable_column_statistics: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub timeout: Duration,
    pub retention: RetentionPolicy,
    pub executor: ExecutorOptions,
    /// Carried for the scheduler collaborator; not interpreted here.
    pub schedule: Option<String>,
    pub direct_s3: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retention: RetentionPolicy::default(),
            executor: ExecutorOptions::default(),
            schedule: None,
            direct_s3: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub key: ServiceKey,
    pub binding: Binding,
    pub settings: ServiceSettings,
}

impl ServiceInstance {
    pub fn new(service_type: ServiceType, name: impl Into<String>, binding: Binding) -> Self {
        Self {
            key: ServiceKey::new(service_type, name),
            binding,
            settings: ServiceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn service_type(&self) -> ServiceType {
        self.key.service_type
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }
}
