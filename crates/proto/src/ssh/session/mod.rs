//! Session-level machinery on top of the connection protocol: keepalive
//! traffic and the reconnect supervisor.

pub mod keepalive;
pub mod supervisor;

pub use keepalive::{create_keepalive_message, discard_requests_except_keepalives, KeepaliveTask};
pub use supervisor::{
    Connector, DirectTcpTarget, Endpoint, Supervisor, SupervisorConfig, SupervisorStatus,
};
