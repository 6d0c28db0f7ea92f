//! Client connection state machine over one TCP socket.
//!
//! A [`ClientConnection`] is a cheap, cloneable handle. Each entry point
//! (`connect`, `receive`, `send`, `disconnect`) validates state and
//! collaborators synchronously, acquires a pooled [`OperationContext`], and
//! spawns the I/O on the tokio runtime. The spawned task hands the finished
//! context to the connection's [`DispatchEngine`], whose hooks drive the state
//! machine and call the [`ClientHandler`].
//!
//! Writes (`send` and `disconnect`) enter a per-connection outbox in call
//! order. Only the head of the outbox is on the socket; its completion starts
//! the next one.

use std::collections::VecDeque;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use sockflow_core::{
    FrameStatus, IdentityTransform, MessageFramer, MessageSerializer, OperationKind,
    OutgoingFrame, PayloadTransform, SocketError,
};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::context::{OperationContext, RemoteEndpoint, UserToken};
use crate::dispatch::{DispatchEngine, Disposition, HookSet};
use crate::error::NetError;
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::pool::ContextSource;
use crate::socket::SocketIo;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application callbacks for one connection. Every method defaults to a
/// no-op.
///
/// Callbacks run on tokio worker threads, one completion at a time per
/// operation kind. They must not block.
pub trait ClientHandler<M>: Send + Sync {
    /// The outbound connect succeeded.
    fn on_opened(&self, _conn: &ClientConnection<M>) {}

    /// The connection closed. Called at most once per connection.
    fn on_closed(&self, _conn: &ClientConnection<M>) {}

    /// An operation failed. The connection stays in its current state.
    fn on_error(
        &self,
        _conn: &ClientConnection<M>,
        _operation: OperationKind,
        _error: SocketError,
    ) {
    }

    /// A complete message arrived.
    fn on_message(&self, _conn: &ClientConnection<M>, _message: M) {}
}

struct Unhandled;

impl<M> ClientHandler<M> for Unhandled {}

/// Configures and creates [`ClientConnection`]s.
pub struct ClientConnectionBuilder<M> {
    contexts: Option<Arc<dyn ContextSource>>,
    serializer: Option<Arc<dyn MessageSerializer<M>>>,
    transform: Arc<dyn PayloadTransform>,
    handler: Arc<dyn ClientHandler<M>>,
    runtime: Option<Handle>,
}

impl<M: Send + 'static> ClientConnectionBuilder<M> {
    fn new() -> Self {
        Self {
            contexts: None,
            serializer: None,
            transform: Arc::new(IdentityTransform),
            handler: Arc::new(Unhandled),
            runtime: None,
        }
    }

    /// Context source for every operation. Required.
    #[must_use]
    pub fn pool<P: ContextSource + 'static>(mut self, pool: Arc<P>) -> Self {
        let contexts: Arc<dyn ContextSource> = pool;
        self.contexts = Some(contexts);
        self
    }

    /// Message serializer. Required for `receive` and `send`.
    #[must_use]
    pub fn serializer(mut self, serializer: impl MessageSerializer<M> + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// Same as [`serializer`](Self::serializer), sharing an existing instance.
    #[must_use]
    pub fn shared_serializer(mut self, serializer: Arc<dyn MessageSerializer<M>>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Payload transform. Defaults to the identity.
    #[must_use]
    pub fn transform(mut self, transform: impl PayloadTransform + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    #[must_use]
    pub fn shared_transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ClientHandler<M>>) -> Self {
        self.handler = handler;
        self
    }

    /// Runtime that runs the I/O tasks. Defaults to the runtime current at
    /// build time, if any.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Creates an idle connection, ready for [`ClientConnection::connect`].
    #[must_use]
    pub fn build(self) -> ClientConnection<M> {
        ClientConnection::assemble(self, ConnectionState::Idle, None)
    }

    /// Wraps a socket produced by a listener. The connection starts `Open`.
    #[must_use]
    pub fn accepted(self, stream: TcpStream) -> ClientConnection<M> {
        ClientConnection::assemble(self, ConnectionState::Open, Some(SocketIo::new(stream)))
    }
}

struct Shared<M> {
    id: ConnectionId,
    lifecycle: Arc<Lifecycle>,
    engine: DispatchEngine,
    contexts: Option<Arc<dyn ContextSource>>,
    serializer: Option<Arc<dyn MessageSerializer<M>>>,
    transform: Arc<dyn PayloadTransform>,
    handler: Arc<dyn ClientHandler<M>>,
    runtime: Option<Handle>,
    socket: OnceLock<SocketIo>,
    receiving: AtomicBool,
    outbox: Mutex<Outbox>,
}

/// Writes accepted by `send`/`disconnect`, waiting for the one on the socket.
#[derive(Default)]
struct Outbox {
    writing: bool,
    queued: VecDeque<OperationContext>,
}

/// Handle to one client-side or accepted TCP connection.
pub struct ClientConnection<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for ClientConnection<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for ClientConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.shared.id)
            .field("state", &self.shared.lifecycle.state())
            .field("disposed", &self.shared.lifecycle.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<M: Send + 'static> ClientConnection<M> {
    #[must_use]
    pub fn builder() -> ClientConnectionBuilder<M> {
        ClientConnectionBuilder::new()
    }

    fn assemble(
        parts: ClientConnectionBuilder<M>,
        state: ConnectionState,
        socket: Option<SocketIo>,
    ) -> Self {
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let lifecycle = Arc::new(Lifecycle::new(state));
        let runtime = parts.runtime.or_else(|| Handle::try_current().ok());

        let shared = Arc::new_cyclic(|weak| Shared {
            id,
            engine: DispatchEngine::new(
                Self::hooks(weak),
                parts.contexts.clone(),
                Arc::clone(&lifecycle),
            ),
            lifecycle,
            contexts: parts.contexts,
            serializer: parts.serializer,
            transform: parts.transform,
            handler: parts.handler,
            runtime,
            socket: socket.map_or_else(OnceLock::new, OnceLock::from),
            receiving: AtomicBool::new(false),
            outbox: Mutex::new(Outbox::default()),
        });

        Self { shared }
    }

    fn hooks(weak: &Weak<Shared<M>>) -> HookSet {
        let connect = weak.clone();
        let receive = weak.clone();
        let send = weak.clone();
        let disconnect = weak.clone();

        HookSet::new()
            .on_connect(move |ctx| {
                if let Some(conn) = Self::upgrade(&connect) {
                    conn.complete_connect(ctx);
                }
            })
            .on_receive(move |ctx| match Self::upgrade(&receive) {
                Some(conn) => conn.complete_receive(ctx),
                None => Disposition::Complete(ctx),
            })
            .on_send(move |ctx| match Self::upgrade(&send) {
                Some(conn) => conn.complete_send(ctx),
                None => Disposition::Complete(ctx),
            })
            .on_disconnect(move |ctx| {
                if let Some(conn) = Self::upgrade(&disconnect) {
                    conn.complete_disconnect(ctx);
                }
            })
    }

    fn upgrade(weak: &Weak<Shared<M>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.lifecycle.is_disposed()
    }

    /// Remote address, once a socket is attached.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.socket.get().and_then(SocketIo::peer_addr)
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.socket.get().and_then(SocketIo::local_addr)
    }

    // -- entry points -------------------------------------------------------

    /// Starts an outbound connect. Legal only while `Idle`.
    ///
    /// The result arrives through [`ClientHandler::on_opened`] or
    /// [`ClientHandler::on_error`]; a failed connect leaves the connection
    /// `Closed` without `on_closed`.
    ///
    /// # Errors
    ///
    /// [`NetError::Configuration`] if the pool or runtime is missing,
    /// [`NetError::InvalidState`] if the connection is not `Idle`.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), NetError> {
        let contexts = self.require_contexts()?;
        self.require_runtime()?;
        self.shared
            .lifecycle
            .transition(ConnectionState::Idle, ConnectionState::Connecting)
            .map_err(|state| NetError::InvalidState {
                operation: OperationKind::Connect,
                state,
            })?;

        let remote = RemoteEndpoint {
            host: host.into(),
            port,
        };
        debug!(conn_id = %self.id(), host = %remote.host, port, "connecting");

        let mut ctx = contexts.acquire();
        ctx.prepare(OperationKind::Connect);
        ctx.set_remote(remote);
        self.submit(ctx);
        Ok(())
    }

    /// Arms the receive loop with a framer from `framer_factory`.
    ///
    /// The loop keeps re-arming until the connection closes, a receive fails,
    /// or a message is rejected.
    ///
    /// # Errors
    ///
    /// [`NetError::Configuration`] if the pool, serializer or runtime is
    /// missing, [`NetError::InvalidState`] unless `Open`,
    /// [`NetError::ReceiveArmed`] if a receive loop is already running.
    pub fn receive<F>(&self, framer_factory: F) -> Result<(), NetError>
    where
        F: FnOnce() -> MessageFramer,
    {
        let contexts = self.require_contexts()?;
        self.require_serializer()?;
        self.require_runtime()?;
        self.require_open(OperationKind::Receive)?;
        if self.shared.receiving.swap(true, Ordering::AcqRel) {
            return Err(NetError::ReceiveArmed);
        }

        let framer = framer_factory();
        let mut ctx = contexts.acquire();
        ctx.prepare(OperationKind::Receive);
        ctx.set_window(framer.window());
        ctx.set_token(UserToken::Receive(framer));
        trace!(conn_id = %self.id(), "receive armed");
        self.submit(ctx);
        Ok(())
    }

    /// Serializes, transforms and frames `message`, then sends it.
    ///
    /// Frames leave in the order `send` was called and never interleave on
    /// the wire. Transport failures are reported through
    /// [`ClientHandler::on_error`] and do not close the connection.
    ///
    /// # Errors
    ///
    /// [`NetError::Configuration`] if the pool, serializer or runtime is
    /// missing, [`NetError::InvalidState`] unless `Open`,
    /// [`NetError::Serialization`] or [`NetError::Frame`] if the message
    /// cannot be encoded.
    pub fn send(&self, message: &M) -> Result<(), NetError> {
        let contexts = self.require_contexts()?;
        let serializer = self.require_serializer()?;
        self.require_runtime()?;
        self.require_open(OperationKind::Send)?;

        let payload = self.shared.transform.forward(serializer.serialize(message)?);

        let mut ctx = contexts.acquire();
        ctx.prepare(OperationKind::Send);
        let frame = match OutgoingFrame::encode_into(&payload, ctx.buffer_mut()) {
            Ok(frame) => frame,
            Err(err) => {
                contexts.release(ctx);
                return Err(err.into());
            }
        };
        ctx.set_window(frame.window());
        ctx.set_token(UserToken::Send(frame));
        trace!(conn_id = %self.id(), len = frame.total_len(), "send queued");
        self.enqueue_write(ctx);
        Ok(())
    }

    /// Gracefully closes the connection once every frame sent before this
    /// call is on the wire: sends FIN, then shuts the read side.
    ///
    /// # Errors
    ///
    /// [`NetError::Configuration`] if the pool or runtime is missing,
    /// [`NetError::InvalidState`] unless `Open`.
    pub fn disconnect(&self) -> Result<(), NetError> {
        let contexts = self.require_contexts()?;
        self.require_runtime()?;
        self.require_open(OperationKind::Disconnect)?;

        debug!(conn_id = %self.id(), "disconnecting");
        let mut ctx = contexts.acquire();
        ctx.prepare(OperationKind::Disconnect);
        self.enqueue_write(ctx);
        Ok(())
    }

    /// Immediately shuts the socket down in both directions.
    ///
    /// Pending operations complete with zero bytes or an error, which the
    /// receive loop reports as closure. Errors are ignored.
    pub fn shutdown(&self) {
        if let Some(socket) = self.shared.socket.get() {
            if let Err(err) = socket.shutdown(Shutdown::Both) {
                trace!(conn_id = %self.id(), error = %err, "shutdown ignored error");
            }
        }
    }

    /// Suppresses every further callback and tears the socket down.
    /// Idempotent; never fails.
    pub fn dispose(&self) {
        if !self.shared.lifecycle.dispose() {
            return;
        }
        self.shared.lifecycle.close();
        self.shutdown();

        let queued: Vec<OperationContext> = self.shared.outbox.lock().queued.drain(..).collect();
        for ctx in queued {
            self.shared.engine.release(ctx);
        }
        debug!(conn_id = %self.id(), "connection disposed");
    }

    // -- validation ---------------------------------------------------------

    fn require_contexts(&self) -> Result<&Arc<dyn ContextSource>, NetError> {
        self.shared
            .contexts
            .as_ref()
            .ok_or(NetError::Configuration {
                collaborator: "context pool",
            })
    }

    fn require_serializer(&self) -> Result<&Arc<dyn MessageSerializer<M>>, NetError> {
        self.shared
            .serializer
            .as_ref()
            .ok_or(NetError::Configuration {
                collaborator: "message serializer",
            })
    }

    fn require_runtime(&self) -> Result<&Handle, NetError> {
        self.shared
            .runtime
            .as_ref()
            .ok_or(NetError::Configuration {
                collaborator: "tokio runtime",
            })
    }

    fn require_open(&self, operation: OperationKind) -> Result<(), NetError> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            state => Err(NetError::InvalidState { operation, state }),
        }
    }

    // -- submission ---------------------------------------------------------

    /// Puts a write on the socket now if none is in flight, otherwise queues
    /// it behind the writes already accepted.
    fn enqueue_write(&self, ctx: OperationContext) {
        let mut outbox = self.shared.outbox.lock();
        if self.is_disposed() {
            drop(outbox);
            self.shared.engine.release(ctx);
            return;
        }
        if outbox.writing {
            outbox.queued.push_back(ctx);
            return;
        }
        outbox.writing = true;
        drop(outbox);
        self.submit(ctx);
    }

    /// The write in flight has finished; starts the next queued one.
    fn advance_writes(&self) {
        let next = {
            let mut outbox = self.shared.outbox.lock();
            let next = outbox.queued.pop_front();
            outbox.writing = next.is_some();
            next
        };
        if let Some(ctx) = next {
            self.submit(ctx);
        }
    }

    fn submit(&self, mut ctx: OperationContext) {
        let Some(runtime) = self.shared.runtime.as_ref() else {
            ctx.fail(SocketError::NotConnected);
            self.shared.engine.complete(ctx);
            return;
        };

        let conn = self.clone();
        runtime.spawn(async move {
            conn.perform(&mut ctx).await;
            conn.shared.engine.complete(ctx);
        });
    }

    async fn perform(&self, ctx: &mut OperationContext) {
        match ctx.kind() {
            Some(OperationKind::Connect) => {
                let Some(remote) = ctx.remote().cloned() else {
                    ctx.fail(SocketError::HostUnreachable);
                    return;
                };
                match TcpStream::connect((remote.host.as_str(), remote.port)).await {
                    Ok(stream) => {
                        ctx.set_token(UserToken::Stream(stream));
                        ctx.record(Ok(0));
                    }
                    Err(err) => ctx.record(Err(err)),
                }
            }
            Some(OperationKind::Receive) => {
                let Some(socket) = self.shared.socket.get() else {
                    ctx.fail(SocketError::NotConnected);
                    return;
                };
                let result = socket.read(ctx.window_bytes_mut()).await;
                ctx.record(result);
            }
            Some(OperationKind::Send) => {
                let Some(socket) = self.shared.socket.get() else {
                    ctx.fail(SocketError::NotConnected);
                    return;
                };
                let result = socket.write(ctx.window_bytes()).await;
                ctx.record(result);
            }
            Some(OperationKind::Disconnect) => {
                let Some(socket) = self.shared.socket.get() else {
                    ctx.fail(SocketError::NotConnected);
                    return;
                };
                let result = socket.shutdown(Shutdown::Write).and_then(|()| {
                    match socket.shutdown(Shutdown::Read) {
                        Err(err) if err.kind() != std::io::ErrorKind::NotConnected => Err(err),
                        _ => Ok(0),
                    }
                });
                ctx.record(result);
            }
            Some(OperationKind::Accept) | None => ctx.fail(SocketError::OperationAborted),
        }
    }

    // -- completion hooks ---------------------------------------------------

    fn complete_connect(&self, ctx: &mut OperationContext) {
        if let Some(error) = ctx.error() {
            self.shared.lifecycle.close();
            warn!(conn_id = %self.id(), %error, "connect failed");
            self.shared
                .handler
                .on_error(self, OperationKind::Connect, error);
            return;
        }

        let UserToken::Stream(stream) = ctx.take_token() else {
            self.shared.lifecycle.close();
            self.shared
                .handler
                .on_error(self, OperationKind::Connect, SocketError::NotConnected);
            return;
        };
        // The slot is empty: only a connect installs a socket, and connect is
        // legal once.
        let _ = self.shared.socket.set(SocketIo::new(stream));

        if self
            .shared
            .lifecycle
            .transition(ConnectionState::Connecting, ConnectionState::Open)
            .is_err()
        {
            trace!(conn_id = %self.id(), "connect completed after close");
            return;
        }
        debug!(conn_id = %self.id(), peer = ?self.peer_addr(), "connection opened");
        self.shared.handler.on_opened(self);
    }

    fn complete_receive(&self, mut ctx: OperationContext) -> Disposition {
        if let Some(error) = ctx.error() {
            self.stop_receiving();
            if error.is_reset_class() {
                self.mark_closed();
            } else {
                self.report(OperationKind::Receive, error);
            }
            return Disposition::Complete(ctx);
        }
        if ctx.bytes_transferred() == 0 {
            self.stop_receiving();
            self.mark_closed();
            return Disposition::Complete(ctx);
        }

        let Some((framer, bytes)) = ctx.receive_parts() else {
            warn!(conn_id = %self.id(), "receive completed without a framer");
            self.stop_receiving();
            return Disposition::Complete(ctx);
        };
        let status = framer.complete_receive(bytes);
        let payload = if status == FrameStatus::Complete {
            let payload = framer.take_payload();
            framer.reset();
            payload
        } else {
            None
        };

        match status {
            FrameStatus::NeedMore => {}
            FrameStatus::SizeExceeded { declared, limit } => {
                warn!(conn_id = %self.id(), declared, limit, "peer declared an oversized message");
                self.stop_receiving();
                self.report(OperationKind::Receive, SocketError::MessageSize);
                return Disposition::Complete(ctx);
            }
            FrameStatus::Complete => {
                if !self.deliver(payload.unwrap_or_default()) {
                    self.stop_receiving();
                    return Disposition::Complete(ctx);
                }
            }
        }

        self.rearm_receive(ctx)
    }

    fn complete_send(&self, mut ctx: OperationContext) -> Disposition {
        if let Some(error) = ctx.error() {
            self.report(OperationKind::Send, error);
            self.advance_writes();
            return Disposition::Complete(ctx);
        }
        let transferred = ctx.bytes_transferred();
        if transferred == 0 {
            self.report(OperationKind::Send, SocketError::WriteZero);
            self.advance_writes();
            return Disposition::Complete(ctx);
        }

        let UserToken::Send(frame) = ctx.token_mut() else {
            warn!(conn_id = %self.id(), "send completed without a frame");
            self.advance_writes();
            return Disposition::Complete(ctx);
        };
        if frame.complete_send(transferred) {
            trace!(conn_id = %self.id(), len = frame.total_len(), "frame sent");
            self.advance_writes();
            return Disposition::Complete(ctx);
        }

        let window = frame.window();
        ctx.prepare(OperationKind::Send);
        ctx.set_window(window);
        self.submit(ctx);
        Disposition::Continue
    }

    fn complete_disconnect(&self, ctx: &mut OperationContext) {
        match ctx.error() {
            Some(error) => self.report(OperationKind::Disconnect, error),
            None => self.mark_closed(),
        }
        self.advance_writes();
    }

    // -- helpers ------------------------------------------------------------

    fn rearm_receive(&self, mut ctx: OperationContext) -> Disposition {
        let window = match ctx.token() {
            UserToken::Receive(framer) => framer.window(),
            _ => return Disposition::Complete(ctx),
        };
        ctx.prepare(OperationKind::Receive);
        ctx.set_window(window);
        self.submit(ctx);
        Disposition::Continue
    }

    /// Transform inverse, deserialize, `on_message`. Returns `false` if the
    /// payload was rejected.
    fn deliver(&self, payload: Vec<u8>) -> bool {
        let Some(serializer) = self.shared.serializer.as_ref() else {
            return false;
        };
        let payload = self.shared.transform.inverse(payload);
        match serializer.deserialize(&payload) {
            Ok(message) => {
                self.shared.handler.on_message(self, message);
                true
            }
            Err(err) => {
                warn!(conn_id = %self.id(), error = %err, "dropping undecodable message");
                self.report(OperationKind::Receive, SocketError::InvalidMessage);
                false
            }
        }
    }

    fn report(&self, operation: OperationKind, error: SocketError) {
        debug!(conn_id = %self.id(), %operation, %error, "operation failed");
        self.shared.handler.on_error(self, operation, error);
    }

    fn mark_closed(&self) {
        if self.shared.lifecycle.close() {
            debug!(conn_id = %self.id(), "connection closed");
            self.shared.handler.on_closed(self);
        }
    }

    fn stop_receiving(&self) {
        self.shared.receiving.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sockflow_core::RawSerializer;

    use std::sync::atomic::AtomicUsize;

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::ContextPool;

    #[derive(Default)]
    struct Captured {
        errors: Mutex<Vec<(OperationKind, SocketError)>>,
        closed: AtomicUsize,
    }

    impl ClientHandler<Vec<u8>> for Captured {
        fn on_closed(&self, _conn: &ClientConnection<Vec<u8>>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(
            &self,
            _conn: &ClientConnection<Vec<u8>>,
            operation: OperationKind,
            error: SocketError,
        ) {
            self.errors.lock().push((operation, error));
        }
    }

    async fn accepted_with(
        pool: &Arc<ContextPool>,
        handler: Arc<Captured>,
    ) -> (ClientConnection<Vec<u8>>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let conn = ClientConnection::builder()
            .pool(Arc::clone(pool))
            .serializer(RawSerializer)
            .handler(handler)
            .accepted(accepted.unwrap().0);
        (conn, peer.unwrap())
    }

    #[test]
    fn ids_are_unique() {
        let a = ClientConnection::<Vec<u8>>::builder().build();
        let b = ClientConnection::<Vec<u8>>::builder().build();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_without_pool_is_a_configuration_error() {
        let conn = ClientConnection::<Vec<u8>>::builder().build();
        let err = conn.connect("127.0.0.1", 1).unwrap_err();
        assert!(matches!(
            err,
            NetError::Configuration {
                collaborator: "context pool"
            }
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_without_runtime_is_a_configuration_error() {
        let conn = ClientConnection::<Vec<u8>>::builder()
            .pool(Arc::new(ContextPool::new(PoolConfig::default())))
            .build();
        let err = conn.connect("127.0.0.1", 1).unwrap_err();
        assert!(matches!(
            err,
            NetError::Configuration {
                collaborator: "tokio runtime"
            }
        ));
    }

    #[tokio::test]
    async fn send_requires_open_state() {
        let conn = ClientConnection::<Vec<u8>>::builder()
            .pool(Arc::new(ContextPool::default()))
            .serializer(RawSerializer)
            .build();
        let err = conn.send(&b"PING".to_vec()).unwrap_err();
        assert!(matches!(
            err,
            NetError::InvalidState {
                operation: OperationKind::Send,
                state: ConnectionState::Idle
            }
        ));
    }

    #[tokio::test]
    async fn receive_requires_serializer() {
        let conn = ClientConnection::<Vec<u8>>::builder()
            .pool(Arc::new(ContextPool::default()))
            .build();
        let err = conn.receive(MessageFramer::default).unwrap_err();
        assert!(matches!(
            err,
            NetError::Configuration {
                collaborator: "message serializer"
            }
        ));
    }

    #[test]
    fn dispose_is_idempotent_and_closes() {
        let conn = ClientConnection::<Vec<u8>>::builder().build();
        conn.dispose();
        conn.dispose();
        assert!(conn.is_disposed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.shutdown();
    }

    #[tokio::test]
    async fn receive_transport_error_is_reported_and_not_rearmed() {
        let pool = Arc::new(ContextPool::new(PoolConfig {
            initial_size: 2,
            ..PoolConfig::default()
        }));
        let handler = Arc::new(Captured::default());
        let (conn, _peer) = accepted_with(&pool, Arc::clone(&handler)).await;

        let mut ctx = pool.acquire();
        ctx.prepare(OperationKind::Receive);
        ctx.set_token(UserToken::Receive(MessageFramer::default()));
        ctx.fail(SocketError::TimedOut);
        conn.shared.receiving.store(true, Ordering::SeqCst);
        conn.shared.engine.complete(ctx);

        assert_eq!(
            *handler.errors.lock(),
            vec![(OperationKind::Receive, SocketError::TimedOut)]
        );
        assert_eq!(handler.closed.load(Ordering::SeqCst), 0);
        assert!(!conn.shared.receiving.load(Ordering::SeqCst));
        assert_eq!(pool.idle_count(), pool.total_created());
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn writes_queue_behind_the_one_in_flight() {
        let pool = Arc::new(ContextPool::default());
        let (conn, _peer) = accepted_with(&pool, Arc::new(Captured::default())).await;

        conn.shared.outbox.lock().writing = true;
        conn.send(&b"first".to_vec()).unwrap();
        conn.disconnect().unwrap();
        {
            let outbox = conn.shared.outbox.lock();
            let kinds: Vec<_> = outbox.queued.iter().map(OperationContext::kind).collect();
            assert_eq!(
                kinds,
                vec![Some(OperationKind::Send), Some(OperationKind::Disconnect)]
            );
        }

        conn.dispose();
        assert!(conn.shared.outbox.lock().queued.is_empty());
        assert_eq!(pool.idle_count(), pool.total_created());
    }

    #[test]
    fn debug_shows_id_and_state() {
        let conn = ClientConnection::<Vec<u8>>::builder().build();
        let rendered = format!("{conn:?}");
        assert!(rendered.contains("ClientConnection"));
        assert!(rendered.contains("Idle"));
    }
}
