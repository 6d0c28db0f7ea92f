//! Loopback harness shared by the integration tests.

#![allow(dead_code)]

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sockflow_core::{
    FramingConfig, MessageFramer, MessageSerializer, OperationKind, PayloadTransform, SocketError,
};
use sockflow_net::{
    ClientConnection, ClientHandler, ConnectionRegistry, ContextPool, PoolConfig, ServerHandler,
    ServerListener,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum Event<M> {
    Opened,
    Closed,
    Error(OperationKind, SocketError),
    Message(M),
}

/// Forwards every callback into a channel; optionally echoes messages back.
pub struct Recorder<M> {
    events: mpsc::UnboundedSender<Event<M>>,
    echo: bool,
}

impl<M: Send + 'static> ClientHandler<M> for Recorder<M> {
    fn on_opened(&self, _conn: &ClientConnection<M>) {
        let _ = self.events.send(Event::Opened);
    }

    fn on_closed(&self, _conn: &ClientConnection<M>) {
        let _ = self.events.send(Event::Closed);
    }

    fn on_error(&self, _conn: &ClientConnection<M>, operation: OperationKind, error: SocketError) {
        let _ = self.events.send(Event::Error(operation, error));
    }

    fn on_message(&self, conn: &ClientConnection<M>, message: M) {
        if self.echo {
            let _ = conn.send(&message);
        }
        let _ = self.events.send(Event::Message(message));
    }
}

pub struct Events<M>(mpsc::UnboundedReceiver<Event<M>>);

impl<M: Debug> Events<M> {
    pub async fn next(&mut self) -> Event<M> {
        tokio::time::timeout(EVENT_TIMEOUT, self.0.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed")
    }

    /// The next event, if one arrives within `window`.
    pub async fn next_within(&mut self, window: Duration) -> Option<Event<M>> {
        tokio::time::timeout(window, self.0.recv()).await.ok().flatten()
    }

    /// Fails if any event arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(window, self.0.recv()).await {
            panic!("unexpected event: {event:?}");
        }
    }
}

pub fn recorder<M>(echo: bool) -> (Arc<Recorder<M>>, Events<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { events: tx, echo }), Events(rx))
}

pub fn small_pool() -> Arc<ContextPool> {
    Arc::new(ContextPool::new(PoolConfig {
        initial_size: 8,
        ..PoolConfig::default()
    }))
}

/// Wraps accepted sockets into receiving connections.
pub struct Acceptor<M> {
    pool: Arc<ContextPool>,
    serializer: Arc<dyn MessageSerializer<M>>,
    transform: Arc<dyn PayloadTransform>,
    framing: FramingConfig,
    handler: Arc<Recorder<M>>,
    registry: Arc<ConnectionRegistry<M>>,
    pub accept_errors: AtomicUsize,
}

impl<M: Send + 'static> ServerHandler for Acceptor<M> {
    fn on_accepted(&self, stream: TcpStream) {
        let handler: Arc<dyn ClientHandler<M>> = self.handler.clone();
        let conn = ClientConnection::builder()
            .pool(Arc::clone(&self.pool))
            .shared_serializer(Arc::clone(&self.serializer))
            .shared_transform(Arc::clone(&self.transform))
            .handler(handler)
            .accepted(stream);
        self.registry.register(conn.clone());
        conn.receive(|| MessageFramer::new(&self.framing)).unwrap();
    }

    fn on_accept_error(&self, _error: SocketError) {
        self.accept_errors.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Server<M> {
    pub pool: Arc<ContextPool>,
    pub listener: ServerListener,
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry<M>>,
    pub acceptor: Arc<Acceptor<M>>,
    pub events: Events<M>,
}

/// Starts a listener on an ephemeral loopback port.
pub fn start_server<M: Send + 'static>(
    serializer: Arc<dyn MessageSerializer<M>>,
    transform: Arc<dyn PayloadTransform>,
    framing: FramingConfig,
    echo: bool,
) -> Server<M> {
    let pool = small_pool();
    let registry = Arc::new(ConnectionRegistry::new());
    let (handler, events) = recorder(echo);
    let acceptor = Arc::new(Acceptor {
        pool: Arc::clone(&pool),
        serializer,
        transform,
        framing,
        handler,
        registry: Arc::clone(&registry),
        accept_errors: AtomicUsize::new(0),
    });
    let server_handler: Arc<dyn ServerHandler> = acceptor.clone();
    let listener = ServerListener::builder()
        .pool(Arc::clone(&pool))
        .handler(server_handler)
        .build();
    let addr = listener
        .start_on("127.0.0.1:0".parse().unwrap(), 64)
        .unwrap();

    Server {
        pool,
        listener,
        addr,
        registry,
        acceptor,
        events,
    }
}

/// Connects a client, waits for `on_opened` and arms its receive loop.
pub async fn connect_client<M: Debug + Send + 'static>(
    pool: &Arc<ContextPool>,
    serializer: Arc<dyn MessageSerializer<M>>,
    transform: Arc<dyn PayloadTransform>,
    framing: FramingConfig,
    addr: SocketAddr,
) -> (ClientConnection<M>, Events<M>) {
    let (handler, mut events) = recorder(false);
    let handler: Arc<dyn ClientHandler<M>> = handler;
    let conn = ClientConnection::builder()
        .pool(Arc::clone(pool))
        .shared_serializer(serializer)
        .shared_transform(transform)
        .handler(handler)
        .build();
    conn.connect("127.0.0.1", addr.port()).unwrap();
    let opened = events.next().await;
    assert!(matches!(opened, Event::Opened), "expected open, got {opened:?}");
    conn.receive(move || MessageFramer::new(&framing)).unwrap();
    (conn, events)
}

/// Drops `stream` with `SO_LINGER=0`, so the peer sees a reset instead of FIN.
pub fn reset(stream: TcpStream) {
    socket2::SockRef::from(&stream)
        .set_linger(Some(Duration::ZERO))
        .expect("set SO_LINGER");
    drop(stream);
}

/// Polls `condition` until it holds or the event timeout elapses.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
