//! unity-bridge: transport and instance management for driving Unity
//! editors from a tool-calling server.

pub mod bridge;
pub mod config;
pub mod connection;
mod context;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod pool;

pub use config::{BridgeConfig, ConnectionConfig, TransportMode};
pub use connection::Connection;
pub use context::{BridgeContext, ContextFactory};
pub use discovery::{Discovery, InstanceInfo, InstanceStatus, LivenessProbe, TcpProbe};
pub use error::{
    BridgeError, CommandError, DiscoveryError, MiddlewareError, ResolutionError, TransportError,
};
pub use logging::init_tracing;
pub use middleware::{
    CallContext, CallState, InstanceDirectory, InstanceRoutingMiddleware, SessionNotifier,
    ToolRegistry, ToolSpec, ToolTarget, ToolWatch,
};
pub use pool::ConnectionPool;
