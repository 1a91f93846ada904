use std::collections::HashMap;

use anyhow::{Context as _, Result};
use opentelemetry::{
    propagation::{Injector, TextMapPropagator},
    trace::{SpanContext, TraceContextExt},
    Context,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;

const TRACEPARENT: &str = "traceparent";
const TRACE_STATE_APP_KEY: &str = "connect@app";
const TRACE_STATE_FN_KEY: &str = "connect@fn";

#[derive(Default)]
struct HeaderMap(HashMap<String, String>);

impl Injector for HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

fn inject(ctx: &Context) -> HashMap<String, String> {
    let mut headers = HeaderMap::default();
    TraceContextPropagator::new().inject_context(ctx, &mut headers);
    headers.0
}

/// W3C trace context headers of `ctx`, JSON encoded.
pub fn system_trace_ctx(ctx: &Context) -> Result<Vec<u8>> {
    serde_json::to_vec(&inject(ctx)).context("could not marshal system trace ctx")
}

/// Trace headers handed to the worker so that spans recorded by the SDK nest
/// under the function run. The app and function IDs travel in the trace
/// state and the parent span is replaced by `span_id`.
pub fn user_trace_ctx(
    ctx: &Context,
    span_id: &str,
    app_id: &str,
    function_id: &str,
) -> Result<Vec<u8>> {
    let span = ctx.span();
    let sc = span.span_context();

    let trace_state = sc
        .trace_state()
        .insert(TRACE_STATE_APP_KEY, app_id)
        .context("failed to add app ID to trace state")?
        .insert(TRACE_STATE_FN_KEY, function_id)
        .context("failed to add function ID to trace state")?;

    let sc = SpanContext::new(
        sc.trace_id(),
        sc.span_id(),
        sc.trace_flags(),
        sc.is_remote(),
        trace_state,
    );
    let mut headers = inject(&Context::new().with_remote_span_context(sc));

    if let Some(traceparent) = headers.get_mut(TRACEPARENT) {
        let mut parts: Vec<&str> = traceparent.split('-').collect();
        if parts.len() == 4 {
            parts[2] = span_id;
            *traceparent = parts.join("-");
        }
    }

    serde_json::to_vec(&headers).context("could not marshal user trace ctx")
}
