use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "connect"))
        .with_attribute(KeyValue::new("service.name", "connect-executor"))
        .with_attribute(KeyValue::new(
            "connect.instance.id",
            instance_id.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    tracing::info!(?interval, "metrics provider installed");
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between creation and drop into `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, Vec::new())
    }

    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: Vec<KeyValue>) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }

    /// Labels known only once the timed operation finished, such as its
    /// outcome.
    pub fn add_label(&mut self, label: KeyValue) {
        self.labels.push(label);
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

/// Instruments of the connect request path. Clones share the underlying
/// instruments.
#[derive(Debug, Clone)]
pub struct ConnectMetrics {
    pub grpc_client_created: Counter<u64>,
    pub grpc_client_failures: Counter<u64>,
    pub grpc_forward_total: Counter<u64>,
    pub grpc_forward_failures: Counter<u64>,
    pub grpc_replies_received: Counter<u64>,
    pub proxy_replies_consumed: Counter<u64>,
    pub grpc_replies_dropped: Counter<u64>,
    pub grpc_clients_collected: Counter<u64>,
    pub router_messages_sent: Counter<u64>,
    pub worker_ack_latency: Histogram<f64>,
    pub proxy_duration: Histogram<f64>,
}

impl Default for ConnectMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectMetrics {
    pub fn new() -> ConnectMetrics {
        let meter = opentelemetry::global::meter("connect-executor");

        let grpc_client_created = meter
            .u64_counter("connect.grpc.client_created")
            .with_description("gateway gRPC clients created")
            .build();
        let grpc_client_failures = meter
            .u64_counter("connect.grpc.client_failures")
            .with_description("failed attempts to create a gateway gRPC client")
            .build();
        let grpc_forward_total = meter
            .u64_counter("connect.grpc.forward_total")
            .with_description("requests forwarded to gateways")
            .build();
        let grpc_forward_failures = meter
            .u64_counter("connect.grpc.forward_failures")
            .with_description("requests that could not be forwarded to a gateway")
            .build();
        let grpc_replies_received = meter
            .u64_counter("connect.grpc.replies_received")
            .with_description("worker replies pushed by gateways")
            .build();
        let proxy_replies_consumed = meter
            .u64_counter("connect.proxy.replies_consumed")
            .with_description("worker responses returned by a proxy call, by delivery path")
            .build();
        let grpc_replies_dropped = meter
            .u64_counter("connect.grpc.replies_dropped")
            .with_description("pushed replies or acks without a ready subscriber")
            .build();
        let grpc_clients_collected = meter
            .u64_counter("connect.grpc.clients_collected")
            .with_description("gateway clients removed by garbage collection")
            .build();
        let router_messages_sent = meter
            .u64_counter("connect.router.messages_sent")
            .with_description("requests routed to a worker")
            .build();
        let worker_ack_latency = meter
            .f64_histogram("connect.worker.ack_latency")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("time between forwarding a request and the worker ack")
            .build();
        let proxy_duration = meter
            .f64_histogram("connect.proxy.duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("end-to-end duration of proxied requests")
            .build();

        ConnectMetrics {
            grpc_client_created,
            grpc_client_failures,
            grpc_forward_total,
            grpc_forward_failures,
            grpc_replies_received,
            proxy_replies_consumed,
            grpc_replies_dropped,
            grpc_clients_collected,
            router_messages_sent,
            worker_ack_latency,
            proxy_duration,
        }
    }
}
