//! sockflow runtime: pooled operation contexts, completion dispatch, client
//! connections and a server accept loop on tokio.

pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod pool;
pub mod registry;
mod socket;

pub use config::{GrowthPolicy, ListenerConfig, NetworkConfig, PoolConfig};
pub use connection::{ClientConnection, ClientConnectionBuilder, ClientHandler, ConnectionId};
pub use context::{OperationContext, RemoteEndpoint, UserToken};
pub use dispatch::{DispatchEngine, Disposition, HookSet};
pub use error::NetError;
pub use lifecycle::{ConnectionState, Lifecycle};
pub use listener::{ServerHandler, ServerListener, ServerListenerBuilder};
pub use pool::{ContextPool, ContextSource};
pub use registry::ConnectionRegistry;
