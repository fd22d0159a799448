//! SQL dialect differences between the relational engines.
//!
//! The `Any` driver passes SQL through verbatim, so placeholder and
//! quoting syntax must match the backend.

use polystore_core::{DalResult, DataAccessError, EngineKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    /// Also serves MariaDB (wire-compatible).
    MySql,
    Sqlite,
}

impl SqlDialect {
    pub fn for_engine(engine: EngineKind) -> DalResult<Self> {
        match engine {
            EngineKind::Postgres => Ok(Self::Postgres),
            EngineKind::MySql | EngineKind::MariaDb => Ok(Self::MySql),
            EngineKind::Sqlite => Ok(Self::Sqlite),
            EngineKind::Mongo => Err(DataAccessError::configuration(
                "mongo is not a relational engine",
            )),
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }

    /// Quote an already-validated identifier.
    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{ident}`"),
            Self::Postgres | Self::Sqlite => format!("\"{ident}\""),
        }
    }
}
