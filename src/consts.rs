use std::time::Duration;

pub use state_store::BUFFERED_RESPONSE_TTL;

/// How long a lease on a request is valid before it must be extended.
pub const CONNECT_WORKER_REQUEST_LEASE_DURATION: Duration = Duration::from_secs(20);

/// How often the lease holder checks the lease. A quarter of the lease
/// duration.
pub const CONNECT_WORKER_REQUEST_EXTEND_LEASE_INTERVAL: Duration =
    Duration::from_millis(CONNECT_WORKER_REQUEST_LEASE_DURATION.as_millis() as u64 / 4);

/// Time allowed for a reply to arrive after the lease was lost.
pub const CONNECT_WORKER_REQUEST_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub const REPLY_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(5);

pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const RESPONSE_POLL_MAX_JITTER: Duration = Duration::from_secs(3);

pub const MAX_FUNCTION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

pub const GATEWAY_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const GATEWAY_GC_TIMEOUT: Duration = Duration::from_secs(10);

pub const WORKER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const GATEWAY_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Peers that missed two consecutive heartbeats are considered unhealthy.
pub const MISSED_HEARTBEATS_THRESHOLD: u32 = 2;
