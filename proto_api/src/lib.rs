//! Generated protobuf definitions for the connect executor <-> gateway
//! protocol.
//!
//! - `ConnectGateway`: served by gateways, the executor forwards requests and
//!   health-checks gateways through it.
//! - `ConnectExecutor`: served by executors, gateways push worker replies and
//!   acknowledgements through it.

#[allow(non_camel_case_types)]
pub mod connect_pb {
    tonic::include_proto!("connect.v1");
}

pub mod descriptor {
    pub const CONNECT_FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("connect_descriptor");
}

/// Message every healthy peer returns from `Ping`.
pub const PING_OK: &str = "ok";
