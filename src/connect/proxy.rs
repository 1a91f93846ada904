use std::{
    net::IpAddr,
    sync::{Arc, OnceLock},
};

use anyhow::{anyhow, Context as _};
use metrics::{ConnectMetrics, Timer};
use opentelemetry::{trace::TraceContextExt, KeyValue};
use proto_api::connect_pb::{GatewayExecutorRequestData, SdkResponse};
use rand::Rng;
use state_store::StateManager;
use tokio::{
    sync::oneshot,
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use ulid::Ulid;
use uuid::Uuid;

use super::{
    gateway_manager::GatewayGrpcManager,
    routing::{RouteError, Router},
    trace_ctx::{system_trace_ctx, user_trace_ctx},
};
use crate::{
    consts::{
        CONNECT_WORKER_REQUEST_EXTEND_LEASE_INTERVAL,
        CONNECT_WORKER_REQUEST_GRACE_PERIOD,
        CONNECT_WORKER_REQUEST_LEASE_DURATION,
        MAX_FUNCTION_TIMEOUT,
        REPLY_SUBSCRIPTION_TIMEOUT,
        RESPONSE_POLL_INTERVAL,
        RESPONSE_POLL_MAX_JITTER,
    },
    errors::ConnectError,
};

/// Decides per account whether an expired lease fails the request.
pub type LeaseEnforcement = Arc<dyn Fn(Uuid) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProxyOpts {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub app_id: Uuid,
    /// Span the worker should parent its spans under.
    pub span_id: String,
    pub data: GatewayExecutorRequestData,
}

/// Drives a request to a connected worker and waits for its response.
pub struct Connector {
    state: Arc<dyn StateManager>,
    gateway_manager: Arc<dyn GatewayGrpcManager>,
    router: Arc<dyn Router>,
    enforce_lease_expiry: Option<LeaseEnforcement>,
    executor_ip: IpAddr,
    metrics: ConnectMetrics,
}

impl Connector {
    pub fn new(
        state: Arc<dyn StateManager>,
        gateway_manager: Arc<dyn GatewayGrpcManager>,
        router: Arc<dyn Router>,
        executor_ip: IpAddr,
        metrics: ConnectMetrics,
    ) -> Self {
        Self {
            state,
            gateway_manager,
            router,
            enforce_lease_expiry: None,
            executor_ip,
            metrics,
        }
    }

    /// Without a predicate lease expiry is enforced for every account.
    pub fn with_lease_enforcement(mut self, enforce: LeaseEnforcement) -> Self {
        self.enforce_lease_expiry = Some(enforce);
        self
    }

    /// Sends `opts.data` to a worker, or attaches to the worker already
    /// running it, and returns the worker response.
    ///
    /// `request_ctx` cancels the wait. `trace_ctx` carries the trace the
    /// request belongs to and is propagated to the worker.
    #[tracing::instrument(
        name = "proxy",
        skip_all,
        fields(
            request_id = %opts.data.request_id,
            env_id = %opts.env_id,
            app_id = %opts.app_id,
            run_id = %opts.data.run_id,
        )
    )]
    pub async fn proxy(
        &self,
        request_ctx: CancellationToken,
        trace_ctx: opentelemetry::Context,
        opts: ProxyOpts,
    ) -> Result<SdkResponse, ConnectError> {
        Span::current().set_parent(trace_ctx.clone());

        let mut timer = Timer::start(&self.metrics.proxy_duration);
        let result = self.proxy_request(request_ctx, trace_ctx, opts).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ConnectError::Cancelled) => "cancelled",
            Err(err) => err.code().unwrap_or("error"),
        };
        timer.add_label(KeyValue::new("outcome", outcome));

        if let Err(err) = &result {
            match err {
                ConnectError::Internal(err) => error!(?err, "proxy failed"),
                err => info!(
                    %err,
                    code = err.code(),
                    retriable = err.is_retriable(),
                    "proxy failed"
                ),
            }
        }
        result
    }

    async fn proxy_request(
        &self,
        request_ctx: CancellationToken,
        trace_ctx: opentelemetry::Context,
        mut opts: ProxyOpts,
    ) -> Result<SdkResponse, ConnectError> {
        let started_at = Instant::now();
        let env_id = opts.env_id;
        let request_id = opts.data.request_id.clone();

        // The worker may have replied while no executor was waiting.
        if let Some(response) = self
            .state
            .get_response(env_id, &request_id)
            .await
            .context("could not check for buffered response")?
        {
            debug!("returning buffered response");
            if let Err(err) = self.state.delete_response(env_id, &request_id).await {
                warn!(?err, "could not delete buffered response");
            }
            return Ok(response);
        }

        let span_ctx = Span::current().context();
        let system_ctx = if span_ctx.span().span_context().is_valid() {
            span_ctx
        } else {
            trace_ctx.clone()
        };
        opts.data.system_trace_ctx = system_trace_ctx(&system_ctx)?;
        opts.data.user_trace_ctx = user_trace_ctx(
            &trace_ctx,
            &opts.span_id,
            &opts.app_id.to_string(),
            &opts.data.function_id,
        )?;

        // Background tasks of this call stop once `scope` is cancelled, which
        // happens at the latest when this future returns or is dropped.
        let scope = CancellationToken::new();
        let _scope_guard = scope.clone().drop_guard();

        let _ack_subscription = self.watch_worker_ack(&scope, &request_id, started_at).await;

        let reply = Arc::new(OnceLock::new());
        let wait = CancellationToken::new();
        self.poll_response(&scope, &wait, &reply, env_id, &request_id);
        let _reply_subscription = self
            .subscribe_reply(&scope, &wait, &reply, &request_id)
            .await?;

        let lease_id = match self
            .state
            .lease_request(
                env_id,
                &request_id,
                CONNECT_WORKER_REQUEST_LEASE_DURATION,
                self.executor_ip,
            )
            .await
        {
            Ok(Some(lease_id)) => Some(lease_id),
            Ok(None) => return Err(anyhow!("missing initial lease ID").into()),
            Err(state_store::Error::RequestLeased) => {
                debug!("request already leased, waiting for response");
                None
            }
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context("failed to lease request")
                    .into())
            }
        };

        let mut cleanup = RequestCleanup::new(
            self.state.clone(),
            env_id,
            request_id.clone(),
            lease_id.is_some(),
        );

        let lease = CancellationToken::new();
        self.monitor_lease(&scope, &wait, &lease, opts.account_id, env_id, &request_id);

        let result = self
            .forward_and_wait(
                &request_ctx,
                &wait,
                &lease,
                &reply,
                lease_id,
                &mut opts.data,
                &mut cleanup,
            )
            .await;

        cleanup.run(result.is_ok()).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_and_wait(
        &self,
        request_ctx: &CancellationToken,
        wait: &CancellationToken,
        lease: &CancellationToken,
        reply: &OnceLock<SdkResponse>,
        lease_id: Option<Ulid>,
        data: &mut GatewayExecutorRequestData,
        cleanup: &mut RequestCleanup,
    ) -> Result<SdkResponse, ConnectError> {
        // Only the lease holder sends the request. Everyone else waits for
        // the response of the worker already running it.
        let routed = match lease_id {
            Some(lease_id) => {
                data.lease_id = lease_id.to_string();
                tokio::select! {
                    biased;
                    _ = request_ctx.cancelled() => return Err(ConnectError::Cancelled),
                    result = self.route_and_forward(data, cleanup) => result?,
                }
                true
            }
            None => false,
        };

        tokio::select! {
            _ = request_ctx.cancelled() => Err(ConnectError::Cancelled),
            _ = sleep(MAX_FUNCTION_TIMEOUT) => Err(ConnectError::RequestTooLong),
            _ = wait.cancelled() => {
                lease.cancel();
                match reply.get().filter(|reply| !reply.request_id.is_empty()) {
                    Some(reply) => {
                        debug!(status = reply.status, "returning reply");
                        Ok(reply.clone())
                    }
                    None => Err(anyhow!("did not receive worker response").into()),
                }
            }
            _ = lease.cancelled() => {
                // Someone else may hold the lease by now.
                cleanup.disown_lease();
                if routed {
                    Err(ConnectError::WorkerStoppedResponding)
                } else {
                    Err(ConnectError::AllWorkersAtCapacity)
                }
            }
        }
    }

    async fn route_and_forward(
        &self,
        data: &mut GatewayExecutorRequestData,
        cleanup: &mut RequestCleanup,
    ) -> Result<(), ConnectError> {
        let route = self.router.get_route(data).await.map_err(|err| match err {
            RouteError::AllWorkersAtCapacity => ConnectError::AllWorkersAtCapacity,
            RouteError::NoHealthyConnection => ConnectError::NoHealthyConnection,
            RouteError::Other(err) => err.context("failed to route message").into(),
        })?;

        match self
            .state
            .assign_request_to_worker(cleanup.env_id, &route.instance_id, &data.request_id)
            .await
        {
            Ok(()) => cleanup.set_worker(route.instance_id.clone()),
            Err(state_store::Error::WorkerCapacityExceeded { instance_id }) => {
                return Err(ConnectError::WorkerCapacityExceeded { instance_id });
            }
            Err(err) => {
                warn!(
                    instance_id = %route.instance_id,
                    ?err,
                    "could not assign request to worker"
                );
            }
        }

        self.gateway_manager
            .forward(route.gateway_id, route.connection_id, data.clone())
            .await
            .context("failed to route request to gateway")?;

        self.metrics
            .router_messages_sent
            .add(1, &[KeyValue::new("transport", "grpc")]);
        debug!(
            gateway_id = %route.gateway_id,
            connection_id = %route.connection_id,
            instance_id = %route.instance_id,
            "forwarded executor request to gateway"
        );
        Ok(())
    }

    async fn watch_worker_ack(
        &self,
        scope: &CancellationToken,
        request_id: &str,
        started_at: Instant,
    ) -> AckSubscription {
        let mut acks = self.gateway_manager.subscribe_worker_ack(request_id).await;
        let subscription = AckSubscription {
            gateway_manager: self.gateway_manager.clone(),
            request_id: request_id.to_string(),
        };

        let scope = scope.clone();
        let histogram = self.metrics.worker_ack_latency.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = scope.cancelled() => {}
                    ack = acks.recv() => {
                        if ack.is_some() {
                            let latency = started_at.elapsed();
                            histogram.record(
                                latency.as_secs_f64(),
                                &[
                                    KeyValue::new("kind", "worker"),
                                    KeyValue::new("transport", "grpc"),
                                ],
                            );
                            debug!(?latency, "worker acknowledged request");
                        }
                    }
                }
            }
            .in_current_span(),
        );
        subscription
    }

    /// Checks the state store for a response the gateway buffered.
    fn poll_response(
        &self,
        scope: &CancellationToken,
        wait: &CancellationToken,
        reply: &Arc<OnceLock<SdkResponse>>,
        env_id: Uuid,
        request_id: &str,
    ) {
        let state = self.state.clone();
        let scope = scope.clone();
        let wait = wait.clone();
        let reply = reply.clone();
        let replies_consumed = self.metrics.proxy_replies_consumed.clone();
        let request_id = request_id.to_string();

        tokio::spawn(
            async move {
                loop {
                    let jitter = rand::rng()
                        .random_range(0..RESPONSE_POLL_MAX_JITTER.as_millis() as u64);
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = wait.cancelled() => return,
                        _ = sleep(RESPONSE_POLL_INTERVAL + std::time::Duration::from_millis(jitter)) => {}
                    }

                    match state.get_response(env_id, &request_id).await {
                        Ok(Some(response)) => {
                            if reply.set(response).is_ok() {
                                replies_consumed.add(1, &[KeyValue::new("path", "poll")]);
                                debug!("received response via polling");
                            }
                            wait.cancel();
                            return;
                        }
                        Ok(None) => trace!("no buffered response yet"),
                        Err(err) => warn!(?err, "could not check for response"),
                    }
                }
            }
            .in_current_span(),
        );
    }

    /// Listens for the response pushed by the gateway. Fails if the
    /// subscription is not in place within [`REPLY_SUBSCRIPTION_TIMEOUT`].
    async fn subscribe_reply(
        &self,
        scope: &CancellationToken,
        wait: &CancellationToken,
        reply: &Arc<OnceLock<SdkResponse>>,
        request_id: &str,
    ) -> Result<ReplySubscription, ConnectError> {
        let (subscribed_tx, subscribed_rx) = oneshot::channel();

        let gateway_manager = self.gateway_manager.clone();
        let scope = scope.clone();
        let wait = wait.clone();
        let reply = reply.clone();
        let replies_consumed = self.metrics.proxy_replies_consumed.clone();
        let task_request_id = request_id.to_string();
        tokio::spawn(
            async move {
                let mut replies = gateway_manager.subscribe(&task_request_id).await;
                if subscribed_tx.send(()).is_err() {
                    // Nobody is waiting for this subscription anymore.
                    gateway_manager.unsubscribe(&task_request_id);
                    return;
                }

                tokio::select! {
                    _ = scope.cancelled() => {}
                    response = replies.recv() => {
                        if let Some(response) = response {
                            if reply.set(response).is_ok() {
                                replies_consumed.add(1, &[KeyValue::new("path", "grpc")]);
                                debug!("received response via grpc");
                            }
                            wait.cancel();
                        }
                    }
                }
            }
            .in_current_span(),
        );

        match timeout(REPLY_SUBSCRIPTION_TIMEOUT, subscribed_rx).await {
            Ok(Ok(())) => Ok(ReplySubscription {
                gateway_manager: self.gateway_manager.clone(),
                request_id: request_id.to_string(),
            }),
            _ => Err(anyhow!(
                "did not subscribe to grpc reply within {:?}",
                REPLY_SUBSCRIPTION_TIMEOUT
            )
            .into()),
        }
    }

    /// Cancels `lease` once the request is no longer leased and no response
    /// arrived within the grace period.
    fn monitor_lease(
        &self,
        scope: &CancellationToken,
        wait: &CancellationToken,
        lease: &CancellationToken,
        account_id: Uuid,
        env_id: Uuid,
        request_id: &str,
    ) {
        let state = self.state.clone();
        let enforce_lease_expiry = self.enforce_lease_expiry.clone();
        let scope = scope.clone();
        let wait = wait.clone();
        let lease = lease.clone();
        let request_id = request_id.to_string();

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = wait.cancelled() => return,
                        _ = lease.cancelled() => return,
                        _ = sleep(CONNECT_WORKER_REQUEST_EXTEND_LEASE_INTERVAL) => {}
                    }

                    match state.is_request_leased(env_id, &request_id).await {
                        Ok(true) => {
                            trace!("request is still leased by worker");
                            continue;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(?err, "could not get lease status");
                            continue;
                        }
                    }

                    if let Some(enforce) = &enforce_lease_expiry {
                        if !enforce(account_id) {
                            continue;
                        }
                    }

                    tokio::select! {
                        _ = scope.cancelled() => return,
                        _ = wait.cancelled() => {
                            debug!("response arrived during lease expiry grace period");
                            return;
                        }
                        _ = sleep(CONNECT_WORKER_REQUEST_GRACE_PERIOD) => {}
                    }

                    debug!("request lease expired");
                    lease.cancel();
                    return;
                }
            }
            .in_current_span(),
        );
    }
}

struct AckSubscription {
    gateway_manager: Arc<dyn GatewayGrpcManager>,
    request_id: String,
}

impl Drop for AckSubscription {
    fn drop(&mut self) {
        self.gateway_manager.unsubscribe_worker_ack(&self.request_id);
    }
}

struct ReplySubscription {
    gateway_manager: Arc<dyn GatewayGrpcManager>,
    request_id: String,
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        self.gateway_manager.unsubscribe(&self.request_id);
    }
}

/// State written on behalf of a request once it was leased.
struct CleanupState {
    state: Arc<dyn StateManager>,
    env_id: Uuid,
    request_id: String,
    delete_lease: bool,
    worker_instance_id: Option<String>,
}

impl CleanupState {
    async fn run(self) {
        if let Some(instance_id) = &self.worker_instance_id {
            if let Err(err) = self
                .state
                .delete_request_from_worker(self.env_id, instance_id, &self.request_id)
                .await
            {
                warn!(%instance_id, ?err, "could not release worker assignment");
            }
        }

        if self.delete_lease {
            if let Err(err) = self.state.delete_lease(self.env_id, &self.request_id).await {
                warn!(?err, "could not delete lease");
            }
        }

        if let Err(err) = self
            .state
            .delete_response(self.env_id, &self.request_id)
            .await
        {
            warn!(?err, "could not delete response");
        }
    }
}

/// Releases request state on every exit path. Runs inline when the call
/// returns and on a spawned task if the call is dropped.
struct RequestCleanup {
    env_id: Uuid,
    pending: Option<CleanupState>,
}

impl RequestCleanup {
    fn new(
        state: Arc<dyn StateManager>,
        env_id: Uuid,
        request_id: String,
        owns_lease: bool,
    ) -> Self {
        Self {
            env_id,
            pending: Some(CleanupState {
                state,
                env_id,
                request_id,
                delete_lease: owns_lease,
                worker_instance_id: None,
            }),
        }
    }

    fn set_worker(&mut self, instance_id: String) {
        if let Some(pending) = self.pending.as_mut() {
            pending.worker_instance_id = Some(instance_id);
        }
    }

    fn disown_lease(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.delete_lease = false;
        }
    }

    async fn run(mut self, success: bool) {
        if let Some(mut pending) = self.pending.take() {
            // The request is done, so whoever holds the lease can let go.
            if success {
                pending.delete_lease = true;
            }
            pending.run().await;
        }
    }
}

impl Drop for RequestCleanup {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(pending.run().in_current_span());
            }
        }
    }
}
