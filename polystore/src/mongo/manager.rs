//! Document-store connection management.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use tracing::{debug, info};

use polystore_core::{
    ConnectionDescriptor, ConnectionManager, ConnectionPoolStatus, ConnectionTestResult,
    DalResult, DataAccessError, EngineKind,
};

/// Connection manager for MongoDB. Owns the driver client (which pools
/// internally); repositories borrow it per call.
pub struct MongoConnectionManager {
    descriptor: ConnectionDescriptor,
    client: Client,
    created_at: Instant,
    error_count: AtomicU64,
}

impl MongoConnectionManager {
    /// Validate the descriptor and build the client. Pool bounds and the
    /// connect timeout are applied explicitly, not left to URI parsing.
    pub async fn connect(descriptor: ConnectionDescriptor) -> DalResult<Self> {
        descriptor.validate()?;
        if descriptor.engine() != EngineKind::Mongo {
            return Err(DataAccessError::configuration(format!(
                "{} is not a document engine",
                descriptor.engine()
            )));
        }

        debug!(url = %descriptor.redacted_connection_string(), "configuring document client");

        let mut options = ClientOptions::parse(descriptor.connection_string())
            .await
            .map_err(|err| {
                DataAccessError::configuration(
                    descriptor.redact_text(&format!("invalid mongodb connection string: {err}")),
                )
            })?;
        options.min_pool_size = Some(descriptor.min_pool_size());
        options.max_pool_size = Some(descriptor.max_pool_size());
        options.connect_timeout = Some(Duration::from_secs(descriptor.connect_timeout_secs()));
        options.server_selection_timeout =
            Some(Duration::from_secs(descriptor.connect_timeout_secs()));

        let client = Client::with_options(options).map_err(|err| {
            DataAccessError::connection(
                descriptor.redact_text(&format!("failed to build mongodb client: {err}")),
            )
        })?;

        info!(pool = %descriptor.pool_name(), "document client ready");

        Ok(Self {
            descriptor,
            client,
            created_at: Instant::now(),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Handle to the configured database.
    pub fn database(&self) -> Database {
        self.client.database(self.descriptor.database())
    }

    /// Per-command timeout from the descriptor.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.descriptor.command_timeout_secs())
    }

    pub(crate) fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ConnectionManager for MongoConnectionManager {
    fn engine(&self) -> EngineKind {
        EngineKind::Mongo
    }

    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        let started = Instant::now();
        match self.database().run_command(doc! { "ping": 1 }).await {
            Ok(_) => ConnectionTestResult::ok(started.elapsed().as_secs_f64() * 1000.0),
            Err(err) => {
                self.note_error();
                ConnectionTestResult::failed(self.descriptor.redact_text(&err.to_string()))
            }
        }
    }

    async fn pool_status(&self) -> ConnectionPoolStatus {
        // The driver does not expose checked-out connection counts, so the
        // snapshot reports configuration plus health, with active unknown.
        let healthy = self
            .database()
            .run_command(doc! { "ping": 1 })
            .await
            .is_ok();
        ConnectionPoolStatus {
            engine: EngineKind::Mongo,
            pool_name: self.descriptor.pool_name(),
            min_pool_size: self.descriptor.min_pool_size(),
            max_pool_size: self.descriptor.max_pool_size(),
            active_connections: 0,
            healthy,
            error_count: self.error_count.load(Ordering::Relaxed),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Map a driver error into the taxonomy. Transaction labels win, then
/// network/pool kinds, then authentication/argument problems; the rest is
/// an unclassified backend failure.
pub(crate) fn map_mongo_error(
    operation: &str,
    descriptor: &ConnectionDescriptor,
    err: mongodb::error::Error,
) -> DataAccessError {
    use mongodb::error::ErrorKind;

    if err.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR) {
        return DataAccessError::transient_with(
            descriptor.redact_text(&format!("{operation}: transient transaction error")),
            err,
        );
    }

    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::DnsResolve { .. } => DataAccessError::connection_with(
            descriptor.redact_text(&format!("{operation}: {err}")),
            err,
        ),
        ErrorKind::Authentication { .. } => {
            DataAccessError::configuration(descriptor.redact_text(&format!("{operation}: {err}")))
        }
        ErrorKind::InvalidArgument { .. } => {
            DataAccessError::validation(descriptor.redact_text(&format!("{operation}: {err}")))
        }
        _ => DataAccessError::backend(operation, err),
    }
}
