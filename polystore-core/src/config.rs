//! Descriptor construction from external configuration.
//!
//! Hosts deserialize a TOML document into [`AccessConfig`] at startup and
//! turn each [`EngineConfig`] into a validated [`ConnectionDescriptor`].
//! Secrets may be indirected through an environment variable so they stay
//! out of config files.

use std::path::Path;

use serde::Deserialize;

use crate::descriptor::{ConnectionDescriptor, EngineKind};
use crate::error::{DalResult, DataAccessError};

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    30
}

fn default_min_pool() -> u32 {
    5
}

fn default_max_pool() -> u32 {
    100
}

/// One engine entry in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub engine: EngineKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Database name, or the file path for file-based engines.
    pub database: Option<String>,
    pub username: Option<String>,
    pub secret: Option<String>,
    /// Environment variable to read the secret from; takes precedence
    /// over `secret`.
    pub secret_env: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_min_pool")]
    pub min_pool_size: u32,
    #[serde(default = "default_max_pool")]
    pub max_pool_size: u32,
    #[serde(default)]
    pub trust_certificate: bool,
}

impl EngineConfig {
    /// Resolve secrets and validate into an immutable descriptor.
    pub fn into_descriptor(self) -> DalResult<ConnectionDescriptor> {
        let secret = match &self.secret_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                DataAccessError::configuration(format!(
                    "secret environment variable '{var}' is not set"
                ))
            })?),
            None => self.secret,
        };

        let mut builder = ConnectionDescriptor::builder(self.engine)
            .connect_timeout_secs(self.connect_timeout_secs)
            .command_timeout_secs(self.command_timeout_secs)
            .min_pool_size(self.min_pool_size)
            .max_pool_size(self.max_pool_size)
            .trust_certificate(self.trust_certificate);

        if let Some(host) = self.host {
            builder = builder.host(host);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(database) = self.database {
            builder = builder.database(database);
        }
        if let Some(username) = self.username {
            builder = builder.username(username);
        }
        if let Some(secret) = secret {
            builder = builder.secret(secret);
        }

        builder.build()
    }
}

/// Full data-access configuration: a default engine plus one entry per
/// configured backend.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub default_engine: EngineKind,
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
}

impl AccessConfig {
    pub fn from_toml_str(content: &str) -> DalResult<Self> {
        toml::from_str(content).map_err(|err| {
            DataAccessError::configuration(format!("invalid data-access config: {err}"))
        })
    }

    pub fn from_path(path: &Path) -> DalResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            DataAccessError::configuration(format!(
                "cannot read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Config entry for an engine kind, if present.
    pub fn engine(&self, kind: EngineKind) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.engine == kind)
    }
}
