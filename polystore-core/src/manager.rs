//! Connection-manager contract and its read models.

use async_trait::async_trait;
use serde::Serialize;

use crate::descriptor::{ConnectionDescriptor, EngineKind};

/// Outcome of a connectivity probe. Ephemeral; produced per check.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub latency_ms: f64,
    pub message: String,
    pub error: Option<String>,
}

impl ConnectionTestResult {
    pub fn ok(latency_ms: f64) -> Self {
        Self {
            success: true,
            latency_ms,
            message: format!("connected in {latency_ms:.1}ms"),
            error: None,
        }
    }

    /// Failed probe. `error` must already be redacted by the caller.
    pub fn failed(error: String) -> Self {
        Self {
            success: false,
            latency_ms: 0.0,
            message: format!("connection failed: {error}"),
            error: Some(error),
        }
    }
}

/// Point-in-time pool snapshot, recomputed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPoolStatus {
    pub engine: EngineKind,
    pub pool_name: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub active_connections: u32,
    pub healthy: bool,
    pub error_count: u64,
    pub age_secs: u64,
}

/// One per engine kind. Implementations own the driver's pool; every
/// logical operation acquires a connection from that pool, so concurrent
/// callers never contend on a manager-held handle.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    fn engine(&self) -> EngineKind;

    fn descriptor(&self) -> &ConnectionDescriptor;

    /// Round-trip a trivial query and measure wall-clock latency. Error
    /// text is redacted; the secret never appears in it.
    async fn test_connection(&self) -> ConnectionTestResult;

    /// Current pool snapshot.
    async fn pool_status(&self) -> ConnectionPoolStatus;
}
