use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use proto_api::connect_pb::SdkResponse;
use tokio::{sync::RwLock, time::Instant};
use tracing::trace;
use ulid::Ulid;
use uuid::Uuid;

use crate::{
    ConnectionRegistry,
    Error,
    Gateway,
    GatewayRegistry,
    Lease,
    RequestStateManager,
    Result,
    WorkerCapacityManager,
    WorkerConnection,
    BUFFERED_RESPONSE_TTL,
};

type RequestKey = (Uuid, String);
type WorkerKey = (Uuid, String);

#[derive(Debug, Clone)]
struct LeaseEntry {
    lease: Lease,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct BufferedResponse {
    response: SdkResponse,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    gateways: HashMap<Ulid, Gateway>,
    connections: HashMap<(Uuid, Ulid), WorkerConnection>,
    leases: HashMap<RequestKey, LeaseEntry>,
    responses: HashMap<RequestKey, BufferedResponse>,
    worker_capacity: HashMap<WorkerKey, u64>,
    worker_requests: HashMap<WorkerKey, HashSet<String>>,
    request_workers: HashMap<RequestKey, String>,
}

impl Inner {
    fn active_lease(&self, key: &RequestKey, now: Instant) -> Option<&LeaseEntry> {
        self.leases.get(key).filter(|entry| entry.expires_at > now)
    }
}

/// Process-local state store. All operations happen under a single lock,
/// which makes lease acquisition atomic.
#[derive(Debug, Default)]
pub struct InMemoryStateManager {
    inner: RwLock<Inner>,
}

impl InMemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

fn request_key(env_id: Uuid, request_id: &str) -> RequestKey {
    (env_id, request_id.to_string())
}

fn worker_key(env_id: Uuid, instance_id: &str) -> WorkerKey {
    (env_id, instance_id.to_string())
}

/// Lease IDs carry their expiry as the ULID timestamp.
fn new_lease_id(duration: Duration) -> Ulid {
    Ulid::from_datetime(SystemTime::now() + duration)
}

#[async_trait]
impl GatewayRegistry for InMemoryStateManager {
    async fn upsert_gateway(&self, gateway: Gateway) -> Result<()> {
        self.inner.write().await.gateways.insert(gateway.id, gateway);
        Ok(())
    }

    async fn delete_gateway(&self, gateway_id: Ulid) -> Result<()> {
        self.inner.write().await.gateways.remove(&gateway_id);
        Ok(())
    }

    async fn get_gateway(&self, gateway_id: Ulid) -> Result<Gateway> {
        self.inner
            .read()
            .await
            .gateways
            .get(&gateway_id)
            .cloned()
            .ok_or(Error::GatewayNotFound(gateway_id))
    }

    async fn get_all_gateways(&self) -> Result<Vec<Gateway>> {
        Ok(self.inner.read().await.gateways.values().cloned().collect())
    }

    async fn get_all_gateway_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .gateways
            .keys()
            .map(|id| id.to_string())
            .collect())
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryStateManager {
    async fn upsert_connection(&self, connection: WorkerConnection) -> Result<()> {
        let key = (connection.env_id, connection.connection_id);
        self.inner.write().await.connections.insert(key, connection);
        Ok(())
    }

    async fn delete_connection(&self, env_id: Uuid, connection_id: Ulid) -> Result<()> {
        self.inner
            .write()
            .await
            .connections
            .remove(&(env_id, connection_id));
        Ok(())
    }

    async fn get_connections_by_app_id(
        &self,
        env_id: Uuid,
        app_id: Uuid,
    ) -> Result<Vec<WorkerConnection>> {
        Ok(self
            .inner
            .read()
            .await
            .connections
            .values()
            .filter(|conn| conn.env_id == env_id && conn.app(app_id).is_some())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RequestStateManager for InMemoryStateManager {
    async fn lease_request(
        &self,
        env_id: Uuid,
        request_id: &str,
        duration: Duration,
        executor_ip: IpAddr,
    ) -> Result<Option<Ulid>> {
        let key = request_key(env_id, request_id);
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        if inner.active_lease(&key, now).is_some() {
            return Err(Error::RequestLeased);
        }

        let lease_id = new_lease_id(duration);
        inner.leases.insert(
            key,
            LeaseEntry {
                lease: Lease {
                    lease_id,
                    executor_ip,
                },
                expires_at: now + duration,
            },
        );
        trace!(request_id, lease_id = %lease_id, "leased request");
        Ok(Some(lease_id))
    }

    async fn extend_request_lease(
        &self,
        env_id: Uuid,
        request_id: &str,
        lease_id: Ulid,
        duration: Duration,
    ) -> Result<Option<Ulid>> {
        let key = request_key(env_id, request_id);
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        let current = match inner.active_lease(&key, now) {
            Some(entry) => entry.clone(),
            None => return Err(Error::RequestLeaseNotFound),
        };
        if current.lease.lease_id != lease_id {
            return Err(Error::RequestLeased);
        }

        if duration.is_zero() {
            inner.leases.remove(&key);
            return Ok(None);
        }

        let new_lease_id = new_lease_id(duration);
        inner.leases.insert(
            key,
            LeaseEntry {
                lease: Lease {
                    lease_id: new_lease_id,
                    executor_ip: current.lease.executor_ip,
                },
                expires_at: now + duration,
            },
        );
        Ok(Some(new_lease_id))
    }

    async fn is_request_leased(&self, env_id: Uuid, request_id: &str) -> Result<bool> {
        let key = request_key(env_id, request_id);
        Ok(self
            .inner
            .read()
            .await
            .active_lease(&key, Instant::now())
            .is_some())
    }

    async fn delete_lease(&self, env_id: Uuid, request_id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .leases
            .remove(&request_key(env_id, request_id));
        Ok(())
    }

    async fn get_executor_ip(&self, env_id: Uuid, request_id: &str) -> Result<IpAddr> {
        self.inner
            .read()
            .await
            .active_lease(&request_key(env_id, request_id), Instant::now())
            .map(|entry| entry.lease.executor_ip)
            .ok_or(Error::ExecutorNotFound)
    }

    async fn save_response(
        &self,
        env_id: Uuid,
        request_id: &str,
        response: &SdkResponse,
    ) -> Result<()> {
        let key = request_key(env_id, request_id);
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        if inner
            .responses
            .get(&key)
            .is_some_and(|buffered| buffered.expires_at > now)
        {
            return Err(Error::ResponseAlreadyBuffered);
        }
        inner.responses.insert(
            key,
            BufferedResponse {
                response: response.clone(),
                expires_at: now + BUFFERED_RESPONSE_TTL,
            },
        );
        Ok(())
    }

    async fn get_response(&self, env_id: Uuid, request_id: &str) -> Result<Option<SdkResponse>> {
        let now = Instant::now();
        Ok(self
            .inner
            .read()
            .await
            .responses
            .get(&request_key(env_id, request_id))
            .filter(|buffered| buffered.expires_at > now)
            .map(|buffered| buffered.response.clone()))
    }

    async fn delete_response(&self, env_id: Uuid, request_id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .responses
            .remove(&request_key(env_id, request_id));
        Ok(())
    }
}

#[async_trait]
impl WorkerCapacityManager for InMemoryStateManager {
    async fn set_worker_capacity(
        &self,
        env_id: Uuid,
        instance_id: &str,
        max_concurrent_requests: Option<u64>,
    ) -> Result<()> {
        let key = worker_key(env_id, instance_id);
        let mut inner = self.inner.write().await;
        match max_concurrent_requests {
            Some(limit) => inner.worker_capacity.insert(key, limit),
            None => inner.worker_capacity.remove(&key),
        };
        Ok(())
    }

    async fn worker_has_capacity(&self, env_id: Uuid, instance_id: &str) -> Result<bool> {
        let key = worker_key(env_id, instance_id);
        let inner = self.inner.read().await;
        let Some(limit) = inner.worker_capacity.get(&key) else {
            return Ok(true);
        };
        let in_flight = inner.worker_requests.get(&key).map_or(0, |r| r.len()) as u64;
        Ok(in_flight < *limit)
    }

    async fn assign_request_to_worker(
        &self,
        env_id: Uuid,
        instance_id: &str,
        request_id: &str,
    ) -> Result<()> {
        let key = worker_key(env_id, instance_id);
        let mut inner = self.inner.write().await;

        let limit = inner.worker_capacity.get(&key).copied();
        let requests = inner.worker_requests.entry(key).or_default();
        if requests.contains(request_id) {
            return Ok(());
        }
        if limit.is_some_and(|limit| requests.len() as u64 >= limit) {
            return Err(Error::WorkerCapacityExceeded {
                instance_id: instance_id.to_string(),
            });
        }
        requests.insert(request_id.to_string());
        inner
            .request_workers
            .insert(request_key(env_id, request_id), instance_id.to_string());
        Ok(())
    }

    async fn delete_request_from_worker(
        &self,
        env_id: Uuid,
        instance_id: &str,
        request_id: &str,
    ) -> Result<()> {
        let key = worker_key(env_id, instance_id);
        let mut inner = self.inner.write().await;
        if let Some(requests) = inner.worker_requests.get_mut(&key) {
            requests.remove(request_id);
            if requests.is_empty() {
                inner.worker_requests.remove(&key);
            }
        }
        inner
            .request_workers
            .remove(&request_key(env_id, request_id));
        Ok(())
    }

    async fn get_worker_request_count(&self, env_id: Uuid, instance_id: &str) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .worker_requests
            .get(&worker_key(env_id, instance_id))
            .map_or(0, |requests| requests.len() as u64))
    }

    async fn get_request_worker_instance_id(
        &self,
        env_id: Uuid,
        request_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .inner
            .read()
            .await
            .request_workers
            .get(&request_key(env_id, request_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc};

    use proto_api::connect_pb::SdkResponseStatus;

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_leases_have_single_winner() -> anyhow::Result<()> {
        let state = Arc::new(InMemoryStateManager::new());
        let env_id = Uuid::new_v4();

        let attempts = (0..64).map(|_| {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .lease_request(env_id, "req", Duration::from_secs(20), LOCALHOST)
                    .await
            })
        });

        let mut acquired = 0;
        let mut contended = 0;
        for result in futures::future::join_all(attempts).await {
            match result? {
                Ok(Some(_)) => acquired += 1,
                Err(Error::RequestLeased) => contended += 1,
                other => panic!("unexpected lease outcome: {other:?}"),
            }
        }

        assert_eq!(acquired, 1);
        assert_eq!(contended, 63);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() -> anyhow::Result<()> {
        let state = InMemoryStateManager::new();
        let env_id = Uuid::new_v4();

        state
            .lease_request(env_id, "req", Duration::from_secs(20), LOCALHOST)
            .await?;
        assert!(state.is_request_leased(env_id, "req").await?);
        assert_eq!(state.get_executor_ip(env_id, "req").await?, LOCALHOST);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(!state.is_request_leased(env_id, "req").await?);
        assert!(matches!(
            state.get_executor_ip(env_id, "req").await,
            Err(Error::ExecutorNotFound)
        ));

        // An expired lease can be taken over.
        let lease_id = state
            .lease_request(env_id, "req", Duration::from_secs(20), LOCALHOST)
            .await?;
        assert!(lease_id.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lease() -> anyhow::Result<()> {
        let state = InMemoryStateManager::new();
        let env_id = Uuid::new_v4();
        let duration = Duration::from_secs(20);

        let lease_id = state
            .lease_request(env_id, "req", duration, LOCALHOST)
            .await?
            .expect("lease id");

        assert!(matches!(
            state
                .extend_request_lease(env_id, "req", Ulid::new(), duration)
                .await,
            Err(Error::RequestLeased)
        ));

        tokio::time::advance(Duration::from_secs(15)).await;
        let extended = state
            .extend_request_lease(env_id, "req", lease_id, duration)
            .await?
            .expect("extended lease id");
        assert_ne!(extended, lease_id);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(state.is_request_leased(env_id, "req").await?);

        assert!(state
            .extend_request_lease(env_id, "req", extended, Duration::ZERO)
            .await?
            .is_none());
        assert!(!state.is_request_leased(env_id, "req").await?);

        assert!(matches!(
            state
                .extend_request_lease(env_id, "req", extended, duration)
                .await,
            Err(Error::RequestLeaseNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_buffered_response_is_written_once() -> anyhow::Result<()> {
        let state = InMemoryStateManager::new();
        let env_id = Uuid::new_v4();
        let response = SdkResponse {
            request_id: "req".to_string(),
            status: SdkResponseStatus::Done.into(),
            ..Default::default()
        };

        assert!(state.get_response(env_id, "req").await?.is_none());
        state.save_response(env_id, "req", &response).await?;
        assert!(matches!(
            state.save_response(env_id, "req", &response).await,
            Err(Error::ResponseAlreadyBuffered)
        ));
        assert_eq!(state.get_response(env_id, "req").await?, Some(response));

        state.delete_response(env_id, "req").await?;
        assert!(state.get_response(env_id, "req").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_capacity() -> anyhow::Result<()> {
        let state = InMemoryStateManager::new();
        let env_id = Uuid::new_v4();

        state.set_worker_capacity(env_id, "worker", Some(1)).await?;
        assert!(state.worker_has_capacity(env_id, "worker").await?);

        state
            .assign_request_to_worker(env_id, "worker", "req-1")
            .await?;
        assert!(!state.worker_has_capacity(env_id, "worker").await?);
        assert!(matches!(
            state
                .assign_request_to_worker(env_id, "worker", "req-2")
                .await,
            Err(Error::WorkerCapacityExceeded { .. })
        ));
        assert_eq!(
            state
                .get_request_worker_instance_id(env_id, "req-1")
                .await?
                .as_deref(),
            Some("worker")
        );

        state
            .delete_request_from_worker(env_id, "worker", "req-1")
            .await?;
        assert_eq!(state.get_worker_request_count(env_id, "worker").await?, 0);
        assert!(state
            .get_request_worker_instance_id(env_id, "req-1")
            .await?
            .is_none());

        state.set_worker_capacity(env_id, "worker", None).await?;
        for i in 0..5 {
            state
                .assign_request_to_worker(env_id, "worker", &format!("req-{i}"))
                .await?;
        }
        assert_eq!(state.get_worker_request_count(env_id, "worker").await?, 5);
        Ok(())
    }
}
