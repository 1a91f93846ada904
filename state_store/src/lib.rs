//! Shared state used by executors and gateways to coordinate connect
//! requests.
//!
//! The traits below describe what the executor needs from the store: a
//! gateway registry, a registry of worker connections, request leases and
//! buffered responses, and per-worker capacity accounting. Any key-value
//! store with TTLs and an atomic set-if-absent can back them;
//! [`in_memory::InMemoryStateManager`] is the implementation used for local
//! development and tests.

use std::{
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use proto_api::connect_pb::SdkResponse;
use ulid::Ulid;
use uuid::Uuid;

pub mod in_memory;

/// Buffered responses are only kept long enough for the executor to pick
/// them up.
pub const BUFFERED_RESPONSE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request already leased")]
    RequestLeased,

    #[error("request not leased")]
    RequestLeaseNotFound,

    #[error("response already buffered")]
    ResponseAlreadyBuffered,

    #[error("executor not found")]
    ExecutorNotFound,

    #[error("gateway {0} not found")]
    GatewayNotFound(Ulid),

    #[error("worker {instance_id} has no capacity left")]
    WorkerCapacityExceeded { instance_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Starting,
    Active,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub id: Ulid,
    pub status: GatewayStatus,
    pub last_heartbeat_at_ms: u64,
    pub hostname: String,
    pub ip_address: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Ready,
    Draining,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRegistration {
    pub app_id: Uuid,
    pub app_name: String,
}

/// A worker connected to a gateway through a connect tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConnection {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub connection_id: Ulid,
    pub gateway_id: Ulid,
    pub instance_id: String,
    pub worker_ip: String,
    pub apps: Vec<AppRegistration>,
    pub status: ConnectionStatus,
    pub last_heartbeat_at_ms: u64,
}

impl WorkerConnection {
    pub fn app(&self, app_id: Uuid) -> Option<&AppRegistration> {
        self.apps.iter().find(|app| app.app_id == app_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: Ulid,
    pub executor_ip: IpAddr,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
pub trait GatewayRegistry: Send + Sync {
    async fn upsert_gateway(&self, gateway: Gateway) -> Result<()>;

    async fn delete_gateway(&self, gateway_id: Ulid) -> Result<()>;

    /// Fails with [`Error::GatewayNotFound`] for unknown gateways.
    async fn get_gateway(&self, gateway_id: Ulid) -> Result<Gateway>;

    async fn get_all_gateways(&self) -> Result<Vec<Gateway>>;

    async fn get_all_gateway_ids(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn upsert_connection(&self, connection: WorkerConnection) -> Result<()>;

    async fn delete_connection(&self, env_id: Uuid, connection_id: Ulid) -> Result<()>;

    async fn get_connections_by_app_id(
        &self,
        env_id: Uuid,
        app_id: Uuid,
    ) -> Result<Vec<WorkerConnection>>;
}

#[async_trait]
pub trait RequestStateManager: Send + Sync {
    /// Leases `request_id` for `duration`. Fails with [`Error::RequestLeased`]
    /// while another unexpired lease exists.
    async fn lease_request(
        &self,
        env_id: Uuid,
        request_id: &str,
        duration: Duration,
        executor_ip: IpAddr,
    ) -> Result<Option<Ulid>>;

    /// Replaces the current lease with a new one. Fails with
    /// [`Error::RequestLeaseNotFound`] if the lease expired and with
    /// [`Error::RequestLeased`] if `lease_id` is not the current lease. A
    /// zero duration deletes the lease and returns `None`.
    async fn extend_request_lease(
        &self,
        env_id: Uuid,
        request_id: &str,
        lease_id: Ulid,
        duration: Duration,
    ) -> Result<Option<Ulid>>;

    async fn is_request_leased(&self, env_id: Uuid, request_id: &str) -> Result<bool>;

    async fn delete_lease(&self, env_id: Uuid, request_id: &str) -> Result<()>;

    async fn get_executor_ip(&self, env_id: Uuid, request_id: &str) -> Result<IpAddr>;

    /// Idempotent set-if-absent write of the worker response.
    async fn save_response(
        &self,
        env_id: Uuid,
        request_id: &str,
        response: &SdkResponse,
    ) -> Result<()>;

    async fn get_response(&self, env_id: Uuid, request_id: &str) -> Result<Option<SdkResponse>>;

    async fn delete_response(&self, env_id: Uuid, request_id: &str) -> Result<()>;
}

#[async_trait]
pub trait WorkerCapacityManager: Send + Sync {
    /// `None` removes the limit.
    async fn set_worker_capacity(
        &self,
        env_id: Uuid,
        instance_id: &str,
        max_concurrent_requests: Option<u64>,
    ) -> Result<()>;

    async fn worker_has_capacity(&self, env_id: Uuid, instance_id: &str) -> Result<bool>;

    /// Fails with [`Error::WorkerCapacityExceeded`] when the worker is full.
    async fn assign_request_to_worker(
        &self,
        env_id: Uuid,
        instance_id: &str,
        request_id: &str,
    ) -> Result<()>;

    async fn delete_request_from_worker(
        &self,
        env_id: Uuid,
        instance_id: &str,
        request_id: &str,
    ) -> Result<()>;

    async fn get_worker_request_count(&self, env_id: Uuid, instance_id: &str) -> Result<u64>;

    async fn get_request_worker_instance_id(
        &self,
        env_id: Uuid,
        request_id: &str,
    ) -> Result<Option<String>>;
}

pub trait StateManager:
    GatewayRegistry + ConnectionRegistry + RequestStateManager + WorkerCapacityManager
{
}

impl<T> StateManager for T where
    T: GatewayRegistry + ConnectionRegistry + RequestStateManager + WorkerCapacityManager
{
}
