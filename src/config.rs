use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "CONNECT_";

/// A gateway registered from configuration instead of announcing itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticGateway {
    #[serde(default)]
    pub id: Option<Ulid>,
    pub hostname: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    /// Address of the executor gRPC server gateways push replies to.
    pub listen_addr_grpc: String,
    /// IP recorded in request leases.
    pub executor_ip: IpAddr,
    pub gateway_grpc_port: u16,
    pub gateways: Vec<StaticGateway>,
    /// Fail requests whose lease is no longer extended. Leases in the
    /// in-memory store are only extended by gateways sharing it, so this is
    /// off by default.
    pub enforce_lease_expiry: bool,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr_grpc: "0.0.0.0:50053".to_string(),
            executor_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            gateway_grpc_port: 50052,
            gateways: Vec::new(),
            enforce_lease_expiry: false,
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Loads the YAML file at `path`. `CONNECT_` prefixed environment
    /// variables override file values, e.g. `CONNECT_GATEWAY_GRPC_PORT`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<ServerConfig> {
        Self::from_figment(Figment::new().merge(Yaml::file(path.as_ref())))
    }

    /// Defaults overridden by environment variables only.
    pub fn from_env() -> Result<ServerConfig> {
        Self::from_figment(Figment::new())
    }

    fn from_figment(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(figment)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr_grpc.parse::<SocketAddr>().is_err() {
            return Err(anyhow!(
                "invalid listen address grpc: {}",
                self.listen_addr_grpc
            ));
        }
        if self.gateway_grpc_port == 0 {
            return Err(anyhow!("invalid gateway grpc port: 0"));
        }
        if self.executor_ip.is_unspecified() {
            return Err(anyhow!(
                "executor ip must be routable: {}",
                self.executor_ip
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Otlp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Enable metrics.
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317.
    pub endpoint: Option<String>,
    // Traces are only exported when an exporter is set.
    pub tracing_exporter: Option<TracingExporter>,
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    // Used as the metric attribute "connect.instance.id".
    pub instance_id: Option<String>,
}

impl TelemetryConfig {
    pub fn tracing_enabled(&self) -> bool {
        self.tracing_exporter.is_some()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

// Durations are configured in whole seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
