//! Echo server: frames every received message straight back to its sender.
//!
//! ```text
//! RUST_LOG=debug echo-server --port 44485 --xor
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sockflow_core::{
    FramingConfig, IdentityTransform, MessageFramer, OperationKind, PayloadTransform,
    RawSerializer, SocketError, XorTransform,
};
use sockflow_net::{
    ClientConnection, ClientHandler, ConnectionRegistry, ContextPool, GrowthPolicy,
    ListenerConfig, NetworkConfig, PoolConfig, ServerHandler, ServerListener,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "echo-server", version, about = "Length-prefixed TCP echo server")]
struct Args {
    #[arg(long, env = "SOCKFLOW_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "SOCKFLOW_PORT", default_value_t = 44485)]
    port: u16,

    #[arg(long, env = "SOCKFLOW_BACKLOG", default_value_t = 100)]
    backlog: u32,

    /// Operation contexts allocated up front.
    #[arg(long, env = "SOCKFLOW_POOL_SIZE", default_value_t = 100)]
    pool_size: usize,

    /// Largest single receive, in bytes.
    #[arg(long, env = "SOCKFLOW_CHUNK_SIZE", default_value_t = 512)]
    chunk_size: usize,

    /// Largest payload a client may declare, in bytes.
    #[arg(long, env = "SOCKFLOW_MAX_PAYLOAD", default_value_t = 16 * 1024 * 1024)]
    max_payload: usize,

    /// XOR-obfuscate payloads with the default key.
    #[arg(long, env = "SOCKFLOW_XOR")]
    xor: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SOCKFLOW_LOG_JSON")]
    json_logs: bool,
}

impl Args {
    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            listener: ListenerConfig {
                host: self.host.clone(),
                port: self.port,
                backlog: self.backlog,
            },
            pool: PoolConfig {
                initial_size: self.pool_size,
                growth: GrowthPolicy::Percent(10),
                buffer_size: self.chunk_size,
            },
            framing: FramingConfig {
                chunk_size: self.chunk_size,
                max_payload_len: self.max_payload,
            },
        }
    }
}

/// Per-connection callbacks shared by every accepted client.
struct EchoPeers {
    registry: Arc<ConnectionRegistry<Vec<u8>>>,
}

impl EchoPeers {
    fn evict(&self, conn: &ClientConnection<Vec<u8>>) {
        self.registry.remove(conn.id());
        conn.dispose();
    }
}

impl ClientHandler<Vec<u8>> for EchoPeers {
    fn on_closed(&self, conn: &ClientConnection<Vec<u8>>) {
        info!(conn_id = %conn.id(), peer = ?conn.peer_addr(), "client left");
        self.evict(conn);
    }

    fn on_error(
        &self,
        conn: &ClientConnection<Vec<u8>>,
        operation: OperationKind,
        error: SocketError,
    ) {
        match (operation, error) {
            (OperationKind::Receive, SocketError::MessageSize) => {
                warn!(conn_id = %conn.id(), "client sent an oversized message, disconnecting");
                self.evict(conn);
            }
            (OperationKind::Receive, _) => {
                warn!(conn_id = %conn.id(), %error, "receive failed, disconnecting");
                self.evict(conn);
            }
            _ => warn!(conn_id = %conn.id(), %operation, %error, "operation failed"),
        }
    }

    fn on_message(&self, conn: &ClientConnection<Vec<u8>>, message: Vec<u8>) {
        debug!(conn_id = %conn.id(), len = message.len(), "echo");
        if let Err(err) = conn.send(&message) {
            warn!(conn_id = %conn.id(), error = %err, "echo failed");
        }
    }
}

struct EchoServer {
    pool: Arc<ContextPool>,
    peers: Arc<EchoPeers>,
    transform: Arc<dyn PayloadTransform>,
    framing: FramingConfig,
}

impl ServerHandler for EchoServer {
    fn on_accepted(&self, stream: TcpStream) {
        let handler: Arc<dyn ClientHandler<Vec<u8>>> = self.peers.clone();
        let conn = ClientConnection::builder()
            .pool(Arc::clone(&self.pool))
            .serializer(RawSerializer)
            .shared_transform(Arc::clone(&self.transform))
            .handler(handler)
            .accepted(stream);

        info!(conn_id = %conn.id(), peer = ?conn.peer_addr(), "client joined");
        self.peers.registry.register(conn.clone());
        if let Err(err) = conn.receive(|| MessageFramer::new(&self.framing)) {
            warn!(conn_id = %conn.id(), error = %err, "could not start receiving");
            self.peers.evict(&conn);
        }
    }

    fn on_accept_error(&self, error: SocketError) {
        warn!(%error, "accept failed");
    }
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs)?;
    let config = args.network_config();

    let pool = Arc::new(ContextPool::new(config.pool.clone()));
    let registry = Arc::new(ConnectionRegistry::new());
    let transform: Arc<dyn PayloadTransform> = if args.xor {
        Arc::new(XorTransform::default())
    } else {
        Arc::new(IdentityTransform)
    };
    let server = Arc::new(EchoServer {
        pool: Arc::clone(&pool),
        peers: Arc::new(EchoPeers {
            registry: Arc::clone(&registry),
        }),
        transform,
        framing: config.framing.clone(),
    });

    let listener = ServerListener::builder()
        .pool(Arc::clone(&pool))
        .handler(server)
        .build();
    let addr = listener
        .start_with(&config.listener)
        .context("failed to start listener")?;
    info!(%addr, xor = args.xor, "echo server listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    listener.stop();
    let closed = registry.shutdown_all();
    pool.dispose();
    info!(closed, "echo server stopped");
    Ok(())
}
