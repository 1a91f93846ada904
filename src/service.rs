use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use metrics::{init_provider, ConnectMetrics};
use proto_api::descriptor::CONNECT_FILE_DESCRIPTOR_SET;
use state_store::{
    in_memory::InMemoryStateManager,
    now_ms,
    Gateway,
    GatewayRegistry,
    GatewayStatus,
};
use tokio::{net::TcpListener, signal, sync::watch};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    connect::{
        gateway_manager::GatewayGrpcForwarder,
        Connector,
        GatewayManager,
        LeaseEnforcement,
        StateRouter,
    },
    consts::GATEWAY_HEARTBEAT_INTERVAL,
};

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state: Arc<InMemoryStateManager>,
    pub gateway_manager: Arc<GatewayManager>,
    pub connector: Arc<Connector>,
    static_gateways: Vec<Gateway>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval,
            &config.instance_id(),
            env!("CARGO_PKG_VERSION"),
        )
        .context("error initializing metrics provider")?;
        let metrics = ConnectMetrics::new();

        let state = Arc::new(InMemoryStateManager::new());
        let static_gateways: Vec<Gateway> = config
            .gateways
            .iter()
            .map(|gateway| Gateway {
                id: gateway.id.unwrap_or_else(Ulid::new),
                status: GatewayStatus::Active,
                last_heartbeat_at_ms: now_ms(),
                hostname: gateway.hostname.clone(),
                ip_address: gateway.ip,
            })
            .collect();
        for gateway in &static_gateways {
            state
                .upsert_gateway(gateway.clone())
                .await
                .with_context(|| format!("error registering gateway {}", gateway.hostname))?;
        }

        let gateway_manager = Arc::new(GatewayManager::new(
            state.clone(),
            config.gateway_grpc_port,
            metrics.clone(),
        ));
        let router = Arc::new(StateRouter::new(state.clone()));
        let connector = Arc::new(
            Connector::new(
                state.clone(),
                gateway_manager.clone(),
                router,
                config.executor_ip,
                metrics,
            )
            .with_lease_enforcement(lease_enforcement(&config)),
        );

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state,
            gateway_manager,
            connector,
            static_gateways,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        if let Err(err) = self.gateway_manager.connect_to_gateways().await {
            warn!(?err, "could not connect to gateways");
        }

        let gateway_manager = self.gateway_manager.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(gateway_manager.start_garbage_collect_clients(shutdown_rx));

        if !self.static_gateways.is_empty() {
            tokio::spawn(refresh_gateway_heartbeats(
                self.state.clone(),
                self.static_gateways.clone(),
                self.shutdown_rx.clone(),
            ));
        }

        let addr: SocketAddr = self.config.listen_addr_grpc.parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("error binding executor grpc address {addr}"))?;
        info!("executor grpc listening on {}", addr);

        serve_executor_api(
            self.gateway_manager.clone(),
            listener,
            self.shutdown_rx.clone(),
        )
        .await
    }
}

fn lease_enforcement(config: &ServerConfig) -> LeaseEnforcement {
    let enforce = config.enforce_lease_expiry;
    Arc::new(move |_account_id: Uuid| enforce)
}

/// Serves the API gateways push worker replies and acks to, until shutdown.
pub async fn serve_executor_api(
    gateway_manager: Arc<GatewayManager>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<()> {
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(CONNECT_FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .add_service(gateway_manager.executor_service())
        .add_service(reflection_service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown_rx.changed().await.ok();
        })
        .await?;
    Ok(())
}

// Gateways from config never heartbeat on their own.
async fn refresh_gateway_heartbeats(
    state: Arc<InMemoryStateManager>,
    gateways: Vec<Gateway>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut interval = tokio::time::interval(GATEWAY_HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                for gateway in &gateways {
                    let gateway = Gateway {
                        last_heartbeat_at_ms: now_ms(),
                        ..gateway.clone()
                    };
                    if let Err(err) = state.upsert_gateway(gateway).await {
                        error!(?err, "could not refresh gateway heartbeat");
                    }
                }
            }
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(?err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    if shutdown_tx.send(()).is_err() {
        warn!("no shutdown listeners left");
    }
    info!("signal received, shutting down server gracefully");
}
