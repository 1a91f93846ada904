use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use proto_api::connect_pb::GatewayExecutorRequestData;
use rand::seq::IndexedRandom;
use state_store::{
    now_ms,
    ConnectionStatus,
    GatewayStatus,
    StateManager,
    WorkerConnection,
};
use tracing::{debug, error, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::consts::{
    GATEWAY_HEARTBEAT_INTERVAL,
    MISSED_HEARTBEATS_THRESHOLD,
    WORKER_HEARTBEAT_INTERVAL,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub gateway_id: Ulid,
    pub connection_id: Ulid,
    pub instance_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("all workers are at capacity")]
    AllWorkersAtCapacity,

    #[error("no healthy connection")]
    NoHealthyConnection,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Picks the worker connection a request is sent to. Implementations may
/// fill in fields of the request, such as the app name.
#[async_trait]
pub trait Router: Send + Sync {
    async fn get_route(&self, data: &mut GatewayExecutorRequestData) -> Result<Route, RouteError>;
}

/// Routes to a random healthy connection registered in the state store.
pub struct StateRouter {
    state: Arc<dyn StateManager>,
}

enum Health {
    Healthy,
    Unhealthy,
    DeleteConnection,
    DeleteConnectionAndGateway,
}

fn heartbeat_missed(last_heartbeat_at_ms: u64, interval: std::time::Duration) -> bool {
    let max_age = (interval * MISSED_HEARTBEATS_THRESHOLD).as_millis() as u64;
    now_ms().saturating_sub(last_heartbeat_at_ms) > max_age
}

impl StateRouter {
    pub fn new(state: Arc<dyn StateManager>) -> Self {
        Self { state }
    }

    async fn health(&self, conn: &WorkerConnection) -> Health {
        match conn.status {
            ConnectionStatus::Ready => {}
            ConnectionStatus::Disconnected => return Health::DeleteConnection,
            _ => return Health::Unhealthy,
        }

        if heartbeat_missed(conn.last_heartbeat_at_ms, WORKER_HEARTBEAT_INTERVAL) {
            debug!(connection_id = %conn.connection_id, "last heartbeat is too old");
            return Health::DeleteConnection;
        }

        let gateway = match self.state.get_gateway(conn.gateway_id).await {
            Ok(gateway) => gateway,
            Err(err) => {
                warn!(gateway_id = %conn.gateway_id, ?err, "could not get gateway");
                return Health::DeleteConnection;
            }
        };

        // A gateway that stopped heartbeating is gone along with its
        // connections. A live gateway that is not active (e.g. draining) only
        // loses this connection.
        if heartbeat_missed(gateway.last_heartbeat_at_ms, GATEWAY_HEARTBEAT_INTERVAL) {
            return Health::DeleteConnectionAndGateway;
        }
        if gateway.status != GatewayStatus::Active {
            return Health::DeleteConnection;
        }

        Health::Healthy
    }

    async fn cleanup(&self, conn: &WorkerConnection, delete_gateway: bool) {
        if delete_gateway {
            if let Err(err) = self.state.delete_gateway(conn.gateway_id).await {
                error!(gateway_id = %conn.gateway_id, ?err, "could not clean up unhealthy gateway");
            }
        }
        if let Err(err) = self
            .state
            .delete_connection(conn.env_id, conn.connection_id)
            .await
        {
            error!(connection_id = %conn.connection_id, ?err, "could not clean up unhealthy connection");
        }
    }
}

#[async_trait]
impl Router for StateRouter {
    async fn get_route(&self, data: &mut GatewayExecutorRequestData) -> Result<Route, RouteError> {
        let env_id = Uuid::parse_str(&data.env_id).context("could not parse env ID")?;
        let app_id = Uuid::parse_str(&data.app_id).context("could not parse app ID")?;

        let conns = self
            .state
            .get_connections_by_app_id(env_id, app_id)
            .await
            .context("could not get connections by app ID")?;

        let mut healthy = Vec::with_capacity(conns.len());
        for conn in conns {
            match self.health(&conn).await {
                Health::Healthy => healthy.push(conn),
                Health::Unhealthy => {}
                Health::DeleteConnection => self.cleanup(&conn, false).await,
                Health::DeleteConnectionAndGateway => self.cleanup(&conn, true).await,
            }
        }
        if healthy.is_empty() {
            warn!(%env_id, %app_id, "no healthy connections");
            return Err(RouteError::NoHealthyConnection);
        }

        let mut candidates = Vec::with_capacity(healthy.len());
        for conn in healthy {
            let has_capacity = self
                .state
                .worker_has_capacity(env_id, &conn.instance_id)
                .await
                .context("could not check worker capacity")?;
            if has_capacity {
                candidates.push(conn);
            }
        }

        let Some(conn) = candidates.choose(&mut rand::rng()) else {
            return Err(RouteError::AllWorkersAtCapacity);
        };

        if let Some(app) = conn.app(app_id) {
            data.app_name = app.app_name.clone();
        }

        Ok(Route {
            gateway_id: conn.gateway_id,
            connection_id: conn.connection_id,
            instance_id: conn.instance_id.clone(),
        })
    }
}
