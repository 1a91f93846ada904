use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use proto_api::{
    connect_pb::{connect_gateway_client::ConnectGatewayClient, PingRequest},
    PING_OK,
};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway clients must answer a health check before they are pooled.
#[async_trait]
pub trait PingClient: Clone + Send + Sync + 'static {
    async fn ping(&self) -> Result<String, tonic::Status>;
}

#[async_trait]
impl PingClient for ConnectGatewayClient<Channel> {
    async fn ping(&self) -> Result<String, tonic::Status> {
        let mut client = self.clone();
        let response = ConnectGatewayClient::ping(&mut client, PingRequest {}).await?;
        Ok(response.into_inner().message)
    }
}

pub type Dialer = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Channel>> + Send + Sync>;

/// Opens a plain-text HTTP/2 channel. Gateways are only reachable inside the
/// cluster.
pub fn default_dialer() -> Dialer {
    Arc::new(|address: String| {
        Box::pin(async move {
            let channel = Endpoint::from_shared(format!("http://{address}"))?
                .connect_timeout(CONNECT_TIMEOUT)
                .connect()
                .await?;
            Ok(channel)
        })
    })
}

struct Pool<T> {
    clients: HashMap<String, T>,
    connections: HashMap<String, Channel>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            connections: HashMap::new(),
        }
    }
}

/// Keyed cache of health-checked gRPC clients. A key is present in the pool
/// only after its client answered a ping.
///
/// The pool lock is never held across network calls. Concurrent creation of
/// the same key is serialized by a per-key lock instead, so a gateway that
/// stops answering only delays callers asking for that gateway.
pub struct ClientManager<T: PingClient> {
    pool: RwLock<Pool<T>>,
    creating: DashMap<String, Arc<Mutex<()>>>,
    factory: Arc<dyn Fn(Channel) -> T + Send + Sync>,
    dialer: Dialer,
}

impl<T: PingClient> ClientManager<T> {
    pub fn new(factory: impl Fn(Channel) -> T + Send + Sync + 'static) -> Self {
        Self::with_dialer(factory, default_dialer())
    }

    pub fn with_dialer(
        factory: impl Fn(Channel) -> T + Send + Sync + 'static,
        dialer: Dialer,
    ) -> Self {
        Self {
            pool: RwLock::new(Pool::default()),
            creating: DashMap::new(),
            factory: Arc::new(factory),
            dialer,
        }
    }

    pub async fn get_client(&self, key: &str) -> Option<T> {
        self.pool.read().await.clients.get(key).cloned()
    }

    pub async fn get_or_create_client(&self, key: &str, address: &str) -> Result<T> {
        self.get_or_create(key, address)
            .await
            .map(|(client, _created)| client)
    }

    /// Like [`ClientManager::get_or_create_client`], also reporting whether
    /// the client was created by this call.
    pub async fn get_or_create(&self, key: &str, address: &str) -> Result<(T, bool)> {
        if let Some(client) = self.get_client(key).await {
            return Ok((client, false));
        }

        let creating = self
            .creating
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        let _creating = creating.lock().await;
        if let Some(client) = self.get_client(key).await {
            return Ok((client, false));
        }

        let channel = (self.dialer)(address.to_string())
            .await
            .with_context(|| format!("could not connect to {address}"))?;
        let client = (self.factory)(channel.clone());

        // On failure the channel is dropped here without being pooled.
        let message = tokio::time::timeout(PING_TIMEOUT, client.ping())
            .await
            .map_err(|_| anyhow!("timed out pinging {address} after {PING_TIMEOUT:?}"))?
            .with_context(|| format!("could not ping {address}"))?;
        if message != PING_OK {
            return Err(anyhow!(
                "unexpected ping response from {address}: {message:?}"
            ));
        }

        let mut pool = self.pool.write().await;
        pool.clients.insert(key.to_string(), client.clone());
        pool.connections.insert(key.to_string(), channel);
        info!(key, address, "created grpc client");
        Ok((client, true))
    }

    pub async fn remove_client(&self, key: &str) {
        let mut pool = self.pool.write().await;
        pool.clients.remove(key);
        self.creating.remove(key);
        if pool.connections.remove(key).is_some() {
            debug!(key, "closed grpc connection");
        }
    }

    pub async fn get_client_keys(&self) -> Vec<String> {
        self.pool.read().await.clients.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::TestGatewayServer;

    fn gateway_client_manager() -> ClientManager<ConnectGatewayClient<Channel>> {
        ClientManager::new(ConnectGatewayClient::new)
    }

    #[tokio::test]
    async fn test_create_and_reuse_client() -> Result<()> {
        let gateway = TestGatewayServer::start().await?;
        let clients = gateway_client_manager();
        let address = gateway.addr().to_string();

        assert!(clients.get_client("gw-1").await.is_none());
        let (_, created) = clients.get_or_create("gw-1", &address).await?;
        assert!(created);
        let (_, created) = clients.get_or_create("gw-1", &address).await?;
        assert!(!created);

        assert!(clients.get_client("gw-1").await.is_some());
        assert_eq!(clients.get_client_keys().await, vec!["gw-1".to_string()]);
        assert_eq!(gateway.ping_count(), 1);

        clients.remove_client("gw-1").await;
        assert!(clients.get_client("gw-1").await.is_none());
        assert!(clients.get_client_keys().await.is_empty());

        // Removing an unknown key is a no-op.
        clients.remove_client("gw-1").await;
        Ok(())
    }

    #[tokio::test]
    async fn test_unhealthy_gateway_is_not_cached() -> Result<()> {
        let gateway = TestGatewayServer::start().await?;
        gateway.set_ping_message("draining");
        let clients = gateway_client_manager();
        let address = gateway.addr().to_string();

        let err = clients
            .get_or_create_client("gw-1", &address)
            .await
            .expect_err("unhealthy gateway must be rejected");
        assert!(err.to_string().contains(&address));
        assert!(clients.get_client_keys().await.is_empty());

        gateway.set_ping_message(PING_OK);
        clients.get_or_create_client("gw-1", &address).await?;
        assert_eq!(clients.get_client_keys().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_dial_failure_names_address() -> Result<()> {
        let dials = Arc::new(AtomicUsize::new(0));
        let dialer: Dialer = {
            let dials = dials.clone();
            Arc::new(move |_address| {
                dials.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(anyhow!("connection refused")) })
            })
        };
        let clients = ClientManager::with_dialer(ConnectGatewayClient::new, dialer);

        let err = clients
            .get_or_create_client("gw-1", "10.0.0.1:50052")
            .await
            .expect_err("dial must fail");
        assert!(err.to_string().contains("10.0.0.1:50052"));
        assert!(clients.get_client("gw-1").await.is_none());

        // No retries inside the pool.
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_creation_dials_once() -> Result<()> {
        let gateway = TestGatewayServer::start().await?;
        let clients = Arc::new(gateway_client_manager());
        let address = gateway.addr().to_string();

        let tasks = (0..8).map(|_| {
            let clients = clients.clone();
            let address = address.clone();
            tokio::spawn(async move { clients.get_or_create_client("gw-1", &address).await })
        });
        for result in futures::future::join_all(tasks).await {
            result??;
        }

        assert_eq!(gateway.ping_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unresponsive_gateway_does_not_block_pool() -> Result<()> {
        let healthy = TestGatewayServer::start().await?;
        let stuck = TestGatewayServer::start().await?;
        stuck.hang_pings(true);
        let clients = Arc::new(gateway_client_manager());
        clients
            .get_or_create_client("gw-ok", &healthy.addr().to_string())
            .await?;

        let stuck_address = stuck.addr().to_string();
        let creating = {
            let clients = clients.clone();
            let address = stuck_address.clone();
            tokio::spawn(async move { clients.get_or_create_client("gw-stuck", &address).await })
        };
        // Let the stuck creation reach its ping.
        while stuck.ping_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let lookup = tokio::time::timeout(Duration::from_secs(1), clients.get_client("gw-ok")).await;
        assert!(matches!(lookup, Ok(Some(_))));
        let keys =
            tokio::time::timeout(Duration::from_secs(1), clients.get_client_keys()).await?;
        assert_eq!(keys, vec!["gw-ok".to_string()]);

        let err = tokio::time::timeout(PING_TIMEOUT + Duration::from_secs(5), creating)
            .await??
            .expect_err("ping never answered");
        assert!(err.to_string().contains(&stuck_address));
        assert!(clients.get_client("gw-stuck").await.is_none());
        Ok(())
    }
}
