//! Connection descriptors: engine kinds, validated connection settings,
//! and per-engine connection-string construction with secret redaction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DalResult, DataAccessError};

/// Placeholder substituted for the secret in redacted connection strings.
pub const REDACTED: &str = "***";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MIN_POOL_SIZE: u32 = 5;
const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// Supported storage engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Postgres,
    MySql,
    /// Wire-compatible with the MySQL driver; kept as a distinct kind so
    /// descriptors and pool status report what they actually target.
    MariaDb,
    Sqlite,
    Mongo,
}

impl EngineKind {
    /// All engines served by the relational (SQL) binding.
    pub fn is_relational(self) -> bool {
        matches!(self, Self::Postgres | Self::MySql | Self::MariaDb | Self::Sqlite)
    }

    /// File-based engines need a path instead of host/port/credentials.
    pub fn is_file_based(self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Default port when the descriptor leaves it unset. `None` for
    /// file-based engines.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql | Self::MariaDb => Some(3306),
            Self::Sqlite => None,
            Self::Mongo => Some(27017),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MariaDb => "mariadb",
            Self::Sqlite => "sqlite",
            Self::Mongo => "mongo",
        };
        f.write_str(name)
    }
}

impl FromStr for EngineKind {
    type Err = DataAccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            "mariadb" | "maria" => Ok(Self::MariaDb),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            other => Err(DataAccessError::configuration(format!(
                "unknown engine kind '{other}'"
            ))),
        }
    }
}

/// Immutable connection settings for one storage instance.
///
/// Built once at startup via [`ConnectionDescriptor::builder`]; the
/// builder validates engine-specific requirements before any I/O is
/// attempted. For file-based engines `database` holds the file path and
/// host/port/credentials must be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    engine: EngineKind,
    host: Option<String>,
    port: Option<u16>,
    database: String,
    username: Option<String>,
    secret: Option<String>,
    connect_timeout_secs: u64,
    command_timeout_secs: u64,
    min_pool_size: u32,
    max_pool_size: u32,
    trust_certificate: bool,
}

impl ConnectionDescriptor {
    pub fn builder(engine: EngineKind) -> ConnectionDescriptorBuilder {
        ConnectionDescriptorBuilder::new(engine)
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Explicit port, or the engine default.
    pub fn port(&self) -> Option<u16> {
        self.port.or_else(|| self.engine.default_port())
    }

    /// Database name, or the file path for file-based engines.
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
    }

    pub fn command_timeout_secs(&self) -> u64 {
        self.command_timeout_secs
    }

    pub fn min_pool_size(&self) -> u32 {
        self.min_pool_size
    }

    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size
    }

    pub fn trust_certificate(&self) -> bool {
        self.trust_certificate
    }

    /// Driver connection string including the secret. Never log this;
    /// use [`redacted_connection_string`](Self::redacted_connection_string)
    /// for anything user- or log-visible.
    pub fn connection_string(&self) -> String {
        self.render_connection_string(self.secret.as_deref())
    }

    /// Connection string with the secret replaced by `***`.
    pub fn redacted_connection_string(&self) -> String {
        let secret = self.secret.as_deref().map(|_| REDACTED);
        self.render_connection_string(secret)
    }

    /// Scrub any occurrence of the secret from free-form text (driver
    /// error messages may echo the connection string back).
    pub fn redact_text(&self, text: &str) -> String {
        match self.secret.as_deref() {
            Some(secret) if !secret.is_empty() => text.replace(secret, REDACTED),
            _ => text.to_string(),
        }
    }

    /// Stable name for pool status/metrics reporting.
    pub fn pool_name(&self) -> String {
        match self.host() {
            Some(host) => format!("{}/{}@{}", self.engine, self.database, host),
            None => format!("{}/{}", self.engine, self.database),
        }
    }

    fn render_connection_string(&self, secret: Option<&str>) -> String {
        let host = self.host().unwrap_or("localhost");
        let port = self.port().unwrap_or(0);
        let auth = match (self.username(), secret) {
            (Some(user), Some(secret)) => format!("{user}:{secret}@"),
            (Some(user), None) => format!("{user}@"),
            _ => String::new(),
        };

        match self.engine {
            EngineKind::Postgres => {
                let sslmode = if self.trust_certificate {
                    "require"
                } else {
                    "prefer"
                };
                format!(
                    "postgres://{auth}{host}:{port}/{}?connect_timeout={}&sslmode={sslmode}",
                    self.database, self.connect_timeout_secs
                )
            }
            EngineKind::MySql | EngineKind::MariaDb => format!(
                "mysql://{auth}{host}:{port}/{}?connect_timeout={}",
                self.database, self.connect_timeout_secs
            ),
            EngineKind::Sqlite => format!("sqlite://{}?mode=rwc", self.database),
            EngineKind::Mongo => format!(
                "mongodb://{auth}{host}:{port}/{}?connectTimeoutMS={}&minPoolSize={}&maxPoolSize={}",
                self.database,
                self.connect_timeout_secs * 1000,
                self.min_pool_size,
                self.max_pool_size
            ),
        }
    }

    /// Engine-specific validation. The builder runs this before handing
    /// out a descriptor; managers may call it again defensively.
    pub fn validate(&self) -> DalResult<()> {
        if self.database.is_empty() {
            return Err(DataAccessError::configuration(match self.engine {
                EngineKind::Sqlite => "sqlite requires a database file path",
                _ => "database name is required",
            }));
        }
        if self.min_pool_size == 0 {
            return Err(DataAccessError::configuration(
                "min_pool_size must be at least 1",
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(DataAccessError::configuration(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }

        if self.engine.is_file_based() {
            if self.host.is_some() || self.port.is_some() {
                return Err(DataAccessError::configuration(
                    "file-based engines take a path, not host/port",
                ));
            }
            if self.username.is_some() || self.secret.is_some() {
                return Err(DataAccessError::configuration(
                    "file-based engines do not take credentials",
                ));
            }
            return Ok(());
        }

        match self.host.as_deref() {
            None | Some("") => {
                return Err(DataAccessError::configuration(format!(
                    "{} requires a host",
                    self.engine
                )))
            }
            Some(_) => {}
        }
        if self.port() == Some(0) {
            return Err(DataAccessError::configuration("port must be non-zero"));
        }
        if !self.trust_certificate && (self.username.is_none() || self.secret.is_none()) {
            return Err(DataAccessError::configuration(format!(
                "{} requires username and secret unless trust_certificate is set",
                self.engine
            )));
        }

        Ok(())
    }
}

/// Builder for [`ConnectionDescriptor`]; `build` validates.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptorBuilder {
    descriptor: ConnectionDescriptor,
}

impl ConnectionDescriptorBuilder {
    fn new(engine: EngineKind) -> Self {
        Self {
            descriptor: ConnectionDescriptor {
                engine,
                host: None,
                port: None,
                database: String::new(),
                username: None,
                secret: None,
                connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
                command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
                min_pool_size: DEFAULT_MIN_POOL_SIZE,
                max_pool_size: DEFAULT_MAX_POOL_SIZE,
                trust_certificate: false,
            },
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.descriptor.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.descriptor.port = Some(port);
        self
    }

    /// Database name, or the file path for file-based engines.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.descriptor.database = database.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.descriptor.username = Some(username.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.descriptor.secret = Some(secret.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.descriptor.connect_timeout_secs = secs;
        self
    }

    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.descriptor.command_timeout_secs = secs;
        self
    }

    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.descriptor.min_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.descriptor.max_pool_size = size;
        self
    }

    pub fn trust_certificate(mut self, trust: bool) -> Self {
        self.descriptor.trust_certificate = trust;
        self
    }

    pub fn build(self) -> DalResult<ConnectionDescriptor> {
        self.descriptor.validate()?;
        Ok(self.descriptor)
    }
}
