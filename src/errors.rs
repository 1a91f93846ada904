use crate::consts::MAX_FUNCTION_TIMEOUT;

/// Failures returned by [`crate::connect::Connector::proxy`].
///
/// Domain errors carry a stable code so callers can map them onto their
/// retry policy without matching on messages.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("all workers are at capacity")]
    AllWorkersAtCapacity,

    #[error("no healthy worker connection")]
    NoHealthyConnection,

    #[error("worker {instance_id} is at capacity")]
    WorkerCapacityExceeded { instance_id: String },

    #[error("request ran longer than {:?}", MAX_FUNCTION_TIMEOUT)]
    RequestTooLong,

    #[error("worker stopped responding")]
    WorkerStoppedResponding,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ConnectError {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ConnectError::AllWorkersAtCapacity => Some("connect_all_workers_at_capacity"),
            ConnectError::NoHealthyConnection => Some("connect_no_healthy_connection"),
            ConnectError::WorkerCapacityExceeded { .. } => {
                Some("connect_worker_capacity_exceeded")
            }
            ConnectError::RequestTooLong => Some("request_too_long"),
            ConnectError::WorkerStoppedResponding => Some("connect_worker_stopped_responding"),
            ConnectError::Cancelled | ConnectError::Internal(_) => None,
        }
    }

    /// Whether retrying the request later may succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ConnectError::RequestTooLong)
    }
}
