pub mod client_manager;
pub mod gateway_manager;
pub mod proxy;
pub mod routing;
pub mod trace_ctx;

pub use gateway_manager::{GatewayGrpcManager, GatewayManager};
pub use proxy::{Connector, LeaseEnforcement, ProxyOpts};
pub use routing::{Route, RouteError, Router, StateRouter};
