use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::ConnectMetrics;
use opentelemetry::KeyValue;
use proto_api::{
    connect_pb::{
        connect_executor_server::{ConnectExecutor, ConnectExecutorServer},
        connect_gateway_client::ConnectGatewayClient,
        AckMessage,
        AckResponse,
        ForwardRequest,
        GatewayExecutorRequestData,
        PingRequest,
        PingResponse,
        ReplyRequest,
        ReplyResponse,
        SdkResponse,
    },
    PING_OK,
};
use state_store::StateManager;
use tokio::sync::{mpsc, watch};
use tonic::{transport::Channel, Request, Response, Status};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::client_manager::{ClientManager, Dialer};
use crate::consts::{GATEWAY_GC_INTERVAL, GATEWAY_GC_TIMEOUT};

/// Sends requests to gateways.
#[async_trait]
pub trait GatewayGrpcForwarder: Send + Sync {
    /// Creates a client for every registered gateway. Individual failures are
    /// logged and skipped.
    async fn connect_to_gateways(&self) -> Result<()>;

    async fn forward(
        &self,
        gateway_id: Ulid,
        connection_id: Ulid,
        data: GatewayExecutorRequestData,
    ) -> Result<()>;
}

/// Per-request channels for replies and acks pushed by gateways.
#[async_trait]
pub trait GatewayGrpcReceiver: Send + Sync {
    async fn subscribe(&self, request_id: &str) -> mpsc::Receiver<SdkResponse>;

    async fn subscribe_worker_ack(&self, request_id: &str) -> mpsc::Receiver<AckMessage>;

    fn unsubscribe(&self, request_id: &str);

    fn unsubscribe_worker_ack(&self, request_id: &str);
}

pub trait GatewayGrpcManager: GatewayGrpcForwarder + GatewayGrpcReceiver {}

impl<T> GatewayGrpcManager for T where T: GatewayGrpcForwarder + GatewayGrpcReceiver {}

/// Subscribers keyed by request ID. Each channel holds a single message; a
/// delivery that finds the slot taken, the receiver gone or no subscriber is
/// dropped instead of blocking the sender.
#[derive(Default)]
pub struct Subscriptions {
    replies: DashMap<String, mpsc::Sender<SdkResponse>>,
    acks: DashMap<String, mpsc::Sender<AckMessage>>,
}

impl Subscriptions {
    pub fn subscribe(&self, request_id: &str) -> mpsc::Receiver<SdkResponse> {
        let (tx, rx) = mpsc::channel(1);
        self.replies.insert(request_id.to_string(), tx);
        rx
    }

    pub fn subscribe_ack(&self, request_id: &str) -> mpsc::Receiver<AckMessage> {
        let (tx, rx) = mpsc::channel(1);
        self.acks.insert(request_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, request_id: &str) {
        self.replies.remove(request_id);
    }

    pub fn unsubscribe_ack(&self, request_id: &str) {
        self.acks.remove(request_id);
    }

    pub fn deliver_reply(&self, reply: SdkResponse) -> bool {
        let Some(tx) = self.replies.get(&reply.request_id).map(|tx| tx.clone()) else {
            return false;
        };
        tx.try_send(reply).is_ok()
    }

    pub fn deliver_ack(&self, ack: AckMessage) -> bool {
        let Some(tx) = self.acks.get(&ack.request_id).map(|tx| tx.clone()) else {
            return false;
        };
        tx.try_send(ack).is_ok()
    }

    #[cfg(test)]
    pub fn counts(&self) -> (usize, usize) {
        (self.replies.len(), self.acks.len())
    }
}

/// The `ConnectExecutor` gRPC service gateways push replies and acks to.
pub struct ConnectExecutorService {
    subscriptions: Arc<Subscriptions>,
    metrics: ConnectMetrics,
}

impl ConnectExecutorService {
    pub fn new(subscriptions: Arc<Subscriptions>, metrics: ConnectMetrics) -> Self {
        Self {
            subscriptions,
            metrics,
        }
    }
}

#[tonic::async_trait]
impl ConnectExecutor for ConnectExecutorService {
    async fn reply(
        &self,
        request: Request<ReplyRequest>,
    ) -> Result<Response<ReplyResponse>, Status> {
        let reply = request
            .into_inner()
            .data
            .ok_or_else(|| Status::invalid_argument("missing reply data"))?;
        let request_id = reply.request_id.clone();

        self.metrics.grpc_replies_received.add(1, &[]);
        let success = self.subscriptions.deliver_reply(reply);
        if !success {
            self.metrics
                .grpc_replies_dropped
                .add(1, &[KeyValue::new("kind", "reply")]);
            debug!(%request_id, "no ready subscriber for reply");
        }
        Ok(Response::new(ReplyResponse { success }))
    }

    async fn ack(&self, request: Request<AckMessage>) -> Result<Response<AckResponse>, Status> {
        let ack = request.into_inner();
        let request_id = ack.request_id.clone();

        let success = self.subscriptions.deliver_ack(ack);
        if !success {
            self.metrics
                .grpc_replies_dropped
                .add(1, &[KeyValue::new("kind", "ack")]);
            debug!(%request_id, "no ready subscriber for ack");
        }
        Ok(Response::new(AckResponse { success }))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            message: PING_OK.to_string(),
        }))
    }
}

pub type GatewayClient = ConnectGatewayClient<Channel>;

/// Executor side of the executor <-> gateway link: a pool of gateway
/// clients plus the subscriptions fed by the executor gRPC service.
pub struct GatewayManager {
    clients: ClientManager<GatewayClient>,
    subscriptions: Arc<Subscriptions>,
    state: Arc<dyn StateManager>,
    gateway_grpc_port: u16,
    metrics: ConnectMetrics,
}

impl GatewayManager {
    pub fn new(
        state: Arc<dyn StateManager>,
        gateway_grpc_port: u16,
        metrics: ConnectMetrics,
    ) -> Self {
        Self::with_clients(
            state,
            gateway_grpc_port,
            metrics,
            ClientManager::new(ConnectGatewayClient::new),
        )
    }

    pub fn with_dialer(
        state: Arc<dyn StateManager>,
        gateway_grpc_port: u16,
        metrics: ConnectMetrics,
        dialer: Dialer,
    ) -> Self {
        Self::with_clients(
            state,
            gateway_grpc_port,
            metrics,
            ClientManager::with_dialer(ConnectGatewayClient::new, dialer),
        )
    }

    fn with_clients(
        state: Arc<dyn StateManager>,
        gateway_grpc_port: u16,
        metrics: ConnectMetrics,
        clients: ClientManager<GatewayClient>,
    ) -> Self {
        Self {
            clients,
            subscriptions: Arc::new(Subscriptions::default()),
            state,
            gateway_grpc_port,
            metrics,
        }
    }

    pub fn executor_service(&self) -> ConnectExecutorServer<ConnectExecutorService> {
        ConnectExecutorServer::new(ConnectExecutorService::new(
            self.subscriptions.clone(),
            self.metrics.clone(),
        ))
    }

    #[cfg(test)]
    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    fn gateway_address(&self, ip: std::net::IpAddr) -> String {
        SocketAddr::new(ip, self.gateway_grpc_port).to_string()
    }

    async fn get_or_create_client(&self, gateway_id: Ulid) -> Result<GatewayClient> {
        let key = gateway_id.to_string();
        if let Some(client) = self.clients.get_client(&key).await {
            return Ok(client);
        }

        let gateway = match self.state.get_gateway(gateway_id).await {
            Ok(gateway) => gateway,
            Err(state_store::Error::GatewayNotFound(_)) => {
                return Err(anyhow!("gateway {gateway_id} not found"));
            }
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("could not find gateway {gateway_id}")));
            }
        };

        self.get_or_create_pooled(&key, &self.gateway_address(gateway.ip_address))
            .await
            .with_context(|| {
                format!("could not find or create grpc client for gateway {gateway_id}")
            })
    }

    // Counts creations and failures, not cache hits.
    async fn get_or_create_pooled(&self, key: &str, address: &str) -> Result<GatewayClient> {
        match self.clients.get_or_create(key, address).await {
            Ok((client, created)) => {
                if created {
                    self.metrics.grpc_client_created.add(1, &[]);
                }
                Ok(client)
            }
            Err(err) => {
                self.metrics.grpc_client_failures.add(1, &[]);
                Err(err)
            }
        }
    }

    /// Drops clients of gateways that are no longer registered and returns
    /// how many were removed.
    pub async fn garbage_collect_clients(&self) -> Result<usize> {
        let gateway_ids =
            tokio::time::timeout(GATEWAY_GC_TIMEOUT, self.state.get_all_gateway_ids())
                .await
                .context("timed out listing gateways")?
                .context("could not list gateways")?;
        let live: HashSet<String> = gateway_ids.into_iter().collect();

        let mut deleted = 0;
        for key in self.clients.get_client_keys().await {
            if !live.contains(&key) {
                self.clients.remove_client(&key).await;
                deleted += 1;
            }
        }

        if deleted > 0 {
            self.metrics.grpc_clients_collected.add(deleted as u64, &[]);
            info!(deleted, "garbage collected gateway clients");
        }
        Ok(deleted)
    }

    pub async fn start_garbage_collect_clients(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(GATEWAY_GC_INTERVAL);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("gateway client garbage collector shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.garbage_collect_clients().await {
                        error!(?err, "failed to garbage collect gateway clients");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GatewayGrpcForwarder for GatewayManager {
    async fn connect_to_gateways(&self) -> Result<()> {
        let gateways = self
            .state
            .get_all_gateways()
            .await
            .context("could not list gateways")?;

        for gateway in gateways {
            let key = gateway.id.to_string();
            let address = self.gateway_address(gateway.ip_address);
            if let Err(err) = self.get_or_create_pooled(&key, &address).await {
                warn!(gateway_id = %key, %address, ?err, "could not connect to gateway");
            }
        }
        Ok(())
    }

    async fn forward(
        &self,
        gateway_id: Ulid,
        connection_id: Ulid,
        data: GatewayExecutorRequestData,
    ) -> Result<()> {
        let mut client = self.get_or_create_client(gateway_id).await?;
        let request_id = data.request_id.clone();

        let result = client
            .forward(ForwardRequest {
                connection_id: connection_id.to_string(),
                data: Some(data),
            })
            .await;

        match result {
            Ok(_) => {
                self.metrics.grpc_forward_total.add(1, &[]);
                debug!(
                    %request_id,
                    %gateway_id,
                    %connection_id,
                    "forwarded request"
                );
                Ok(())
            }
            Err(status) => {
                self.metrics.grpc_forward_failures.add(1, &[]);
                Err(anyhow!(
                    "could not forward request {request_id} to gateway {gateway_id}: {status}"
                ))
            }
        }
    }
}

#[async_trait]
impl GatewayGrpcReceiver for GatewayManager {
    async fn subscribe(&self, request_id: &str) -> mpsc::Receiver<SdkResponse> {
        self.subscriptions.subscribe(request_id)
    }

    async fn subscribe_worker_ack(&self, request_id: &str) -> mpsc::Receiver<AckMessage> {
        self.subscriptions.subscribe_ack(request_id)
    }

    fn unsubscribe(&self, request_id: &str) {
        self.subscriptions.unsubscribe(request_id);
    }

    fn unsubscribe_worker_ack(&self, request_id: &str) {
        self.subscriptions.unsubscribe_ack(request_id);
    }
}
