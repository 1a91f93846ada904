use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use proto_api::{
    connect_pb::{
        connect_gateway_server::{ConnectGateway, ConnectGatewayServer},
        AckMessage,
        ForwardRequest,
        ForwardResponse,
        GatewayExecutorRequestData,
        PingRequest,
        PingResponse,
        SdkResponse,
    },
    PING_OK,
};
use state_store::{
    now_ms,
    AppRegistration,
    ConnectionStatus,
    Gateway,
    GatewayStatus,
    WorkerConnection,
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{transport::Server, Request, Response, Status};
use ulid::Ulid;
use uuid::Uuid;

use crate::connect::{
    gateway_manager::{GatewayGrpcForwarder, GatewayGrpcReceiver, Subscriptions},
    routing::{Route, RouteError, Router},
};

pub fn test_gateway() -> Gateway {
    Gateway {
        id: Ulid::new(),
        status: GatewayStatus::Active,
        last_heartbeat_at_ms: now_ms(),
        hostname: "gateway-test".to_string(),
        ip_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

pub fn test_connection(
    env_id: Uuid,
    app_id: Uuid,
    gateway_id: Ulid,
    instance_id: &str,
) -> WorkerConnection {
    WorkerConnection {
        account_id: Uuid::new_v4(),
        env_id,
        connection_id: Ulid::new(),
        gateway_id,
        instance_id: instance_id.to_string(),
        worker_ip: "127.0.0.1".to_string(),
        apps: vec![AppRegistration {
            app_id,
            app_name: "test-app".to_string(),
        }],
        status: ConnectionStatus::Ready,
        last_heartbeat_at_ms: now_ms(),
    }
}

pub fn test_request_data(
    account_id: Uuid,
    env_id: Uuid,
    app_id: Uuid,
    request_id: &str,
) -> GatewayExecutorRequestData {
    GatewayExecutorRequestData {
        request_id: request_id.to_string(),
        account_id: account_id.to_string(),
        env_id: env_id.to_string(),
        app_id: app_id.to_string(),
        function_id: Uuid::new_v4().to_string(),
        function_slug: "test-app-hello".to_string(),
        request_payload: br#"{"event":{"name":"test/hello"}}"#.to_vec(),
        run_id: Ulid::new().to_string(),
        ..Default::default()
    }
}

/// In-process stand-in for the gateway link. Forwarded requests are
/// reported on the receiver returned by [`MockGatewayManager::new`] and
/// replies are injected with [`MockGatewayManager::push_reply`].
pub struct MockGatewayManager {
    subscriptions: Subscriptions,
    forwards: mpsc::UnboundedSender<GatewayExecutorRequestData>,
    forward_count: AtomicUsize,
    fail_forwards: AtomicBool,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl MockGatewayManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayExecutorRequestData>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            subscriptions: Subscriptions::default(),
            forwards: tx,
            forward_count: AtomicUsize::new(0),
            fail_forwards: AtomicBool::new(false),
            subscribe_delay: Mutex::new(None),
        };
        (manager, rx)
    }

    pub fn push_reply(&self, reply: SdkResponse) -> bool {
        self.subscriptions.deliver_reply(reply)
    }

    pub fn push_ack(&self, ack: AckMessage) -> bool {
        self.subscriptions.deliver_ack(ack)
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_forwards(&self, fail: bool) {
        self.fail_forwards.store(fail, Ordering::SeqCst);
    }

    pub fn forward_count(&self) -> usize {
        self.forward_count.load(Ordering::SeqCst)
    }

    pub fn subscription_counts(&self) -> (usize, usize) {
        self.subscriptions.counts()
    }
}

#[async_trait]
impl GatewayGrpcForwarder for MockGatewayManager {
    async fn connect_to_gateways(&self) -> Result<()> {
        Ok(())
    }

    async fn forward(
        &self,
        _gateway_id: Ulid,
        _connection_id: Ulid,
        data: GatewayExecutorRequestData,
    ) -> Result<()> {
        if self.fail_forwards.load(Ordering::SeqCst) {
            return Err(anyhow!("gateway unavailable"));
        }
        self.forward_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.forwards.send(data);
        Ok(())
    }
}

#[async_trait]
impl GatewayGrpcReceiver for MockGatewayManager {
    async fn subscribe(&self, request_id: &str) -> mpsc::Receiver<SdkResponse> {
        let delay = *self.subscribe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
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

type RouteFn = Box<dyn Fn() -> Result<Route, RouteError> + Send + Sync>;

/// Router with a fixed answer.
pub struct StaticRouter(RouteFn);

impl StaticRouter {
    pub fn route(route: Route) -> Self {
        Self(Box::new(move || Ok(route.clone())))
    }

    pub fn error(err: fn() -> RouteError) -> Self {
        Self(Box::new(move || Err(err())))
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn get_route(&self, _data: &mut GatewayExecutorRequestData) -> Result<Route, RouteError> {
        (self.0)()
    }
}

struct GatewayState {
    ping_message: Mutex<String>,
    pings: AtomicUsize,
    hang_pings: AtomicBool,
    fail_forwards: AtomicBool,
    forwarded: Mutex<Vec<ForwardRequest>>,
    forward_listeners: Mutex<Vec<mpsc::UnboundedSender<ForwardRequest>>>,
}

#[derive(Clone)]
struct TestGatewayService {
    state: Arc<GatewayState>,
}

#[tonic::async_trait]
impl ConnectGateway for TestGatewayService {
    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.hang_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let message = self.state.ping_message.lock().unwrap().clone();
        Ok(Response::new(PingResponse { message }))
    }

    async fn forward(
        &self,
        request: Request<ForwardRequest>,
    ) -> Result<Response<ForwardResponse>, Status> {
        if self.state.fail_forwards.load(Ordering::SeqCst) {
            return Err(Status::unavailable("connection is draining"));
        }
        let request = request.into_inner();
        self.state.forwarded.lock().unwrap().push(request.clone());
        self.state
            .forward_listeners
            .lock()
            .unwrap()
            .retain(|tx| tx.send(request.clone()).is_ok());
        Ok(Response::new(ForwardResponse {}))
    }
}

/// A `ConnectGateway` gRPC server on an ephemeral local port. Stops when
/// dropped.
pub struct TestGatewayServer {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    _shutdown: DropGuard,
}

impl TestGatewayServer {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(GatewayState {
            ping_message: Mutex::new(PING_OK.to_string()),
            pings: AtomicUsize::new(0),
            hang_pings: AtomicBool::new(false),
            fail_forwards: AtomicBool::new(false),
            forwarded: Mutex::new(Vec::new()),
            forward_listeners: Mutex::new(Vec::new()),
        });

        let shutdown = CancellationToken::new();
        let service = TestGatewayService {
            state: state.clone(),
        };
        let cancelled = shutdown.clone();
        tokio::spawn(async move {
            Server::builder()
                .add_service(ConnectGatewayServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    cancelled.cancelled().await
                })
                .await
        });

        Ok(Self {
            addr,
            state,
            _shutdown: shutdown.drop_guard(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn set_ping_message(&self, message: &str) {
        *self.state.ping_message.lock().unwrap() = message.to_string();
    }

    /// Pings are counted but never answered.
    pub fn hang_pings(&self, hang: bool) {
        self.state.hang_pings.store(hang, Ordering::SeqCst);
    }

    pub fn fail_forwards(&self, fail: bool) {
        self.state.fail_forwards.store(fail, Ordering::SeqCst);
    }

    pub fn forwarded(&self) -> Vec<ForwardRequest> {
        self.state.forwarded.lock().unwrap().clone()
    }

    /// Receives every request forwarded from now on.
    pub fn forwards(&self) -> mpsc::UnboundedReceiver<ForwardRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.forward_listeners.lock().unwrap().push(tx);
        rx
    }
}
