//! Server accept loop over one listening socket.
//!
//! The listener runs on the same [`DispatchEngine`] as client connections,
//! configured with only an accept hook. Each accept completion re-arms the
//! next accept with a fresh context. [`ServerListener::stop`] closes the
//! listening socket and signals the pending accept, which completes with
//! [`SocketError::OperationAborted`] and ends the loop quietly.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use sockflow_core::{OperationKind, SocketError};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::ListenerConfig;
use crate::context::{OperationContext, UserToken};
use crate::dispatch::{DispatchEngine, HookSet};
use crate::error::NetError;
use crate::lifecycle::{ConnectionState, Lifecycle};
use crate::pool::ContextSource;

/// Receives accepted sockets.
///
/// Typically wraps each stream with
/// [`ClientConnectionBuilder::accepted`](crate::ClientConnectionBuilder::accepted).
pub trait ServerHandler: Send + Sync {
    fn on_accepted(&self, stream: TcpStream);

    /// An accept failed. The loop keeps going.
    fn on_accept_error(&self, _error: SocketError) {}
}

/// Configures and creates a [`ServerListener`].
pub struct ServerListenerBuilder {
    contexts: Option<Arc<dyn ContextSource>>,
    handler: Option<Arc<dyn ServerHandler>>,
    runtime: Option<Handle>,
}

impl ServerListenerBuilder {
    /// Context source for accepts. Required.
    #[must_use]
    pub fn pool<P: ContextSource + 'static>(mut self, pool: Arc<P>) -> Self {
        let contexts: Arc<dyn ContextSource> = pool;
        self.contexts = Some(contexts);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ServerHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    #[must_use]
    pub fn build(self) -> ServerListener {
        let lifecycle = Arc::new(Lifecycle::new(ConnectionState::Idle));
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let (stop_tx, _stop_rx) = watch::channel(false);

        let shared = Arc::new_cyclic(|weak: &Weak<ListenerShared>| {
            let accept = weak.clone();
            let hooks = HookSet::new().on_accept(move |ctx| {
                if let Some(shared) = accept.upgrade() {
                    ServerListener { shared }.complete_accept(ctx);
                }
            });
            ListenerShared {
                engine: DispatchEngine::new(hooks, self.contexts.clone(), Arc::clone(&lifecycle)),
                lifecycle,
                contexts: self.contexts,
                handler: self.handler,
                runtime,
                listener: Mutex::new(None),
                stop: stop_tx,
                local_addr: OnceLock::new(),
            }
        });

        ServerListener { shared }
    }
}

struct ListenerShared {
    lifecycle: Arc<Lifecycle>,
    engine: DispatchEngine,
    contexts: Option<Arc<dyn ContextSource>>,
    handler: Option<Arc<dyn ServerHandler>>,
    runtime: Option<Handle>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    stop: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

/// Cloneable handle to a listening socket and its accept loop.
#[derive(Clone)]
pub struct ServerListener {
    shared: Arc<ListenerShared>,
}

impl fmt::Debug for ServerListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerListener")
            .field("state", &self.shared.lifecycle.state())
            .field("local_addr", &self.shared.local_addr.get())
            .finish_non_exhaustive()
    }
}

impl ServerListener {
    #[must_use]
    pub fn builder() -> ServerListenerBuilder {
        ServerListenerBuilder {
            contexts: None,
            handler: None,
            runtime: None,
        }
    }

    /// `Open` while listening, `Closed` after stop.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    /// Bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.shared.stop.borrow()
    }

    /// Listens on `0.0.0.0:port` and arms the first accept.
    ///
    /// # Errors
    ///
    /// See [`start_on`](Self::start_on).
    pub fn start(&self, port: u16, backlog: u32) -> Result<SocketAddr, NetError> {
        self.start_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), backlog)
    }

    /// Listens with the host, port and backlog from `config`.
    ///
    /// # Errors
    ///
    /// [`NetError::Io`] if the host is not an IP literal, otherwise see
    /// [`start_on`](Self::start_on).
    pub fn start_with(&self, config: &ListenerConfig) -> Result<SocketAddr, NetError> {
        let addr = config.bind_addr().map_err(|err| {
            NetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
        })?;
        self.start_on(addr, config.backlog)
    }

    /// Binds `addr` with `SO_REUSEADDR`, listens with `backlog`, arms the
    /// first accept and returns the bound address.
    ///
    /// # Errors
    ///
    /// [`NetError::Configuration`] if the pool or runtime is missing,
    /// [`NetError::InvalidState`] if already started or stopped,
    /// [`NetError::Io`] if binding fails. A failed bind leaves the listener
    /// startable again.
    pub fn start_on(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr, NetError> {
        let runtime = self
            .shared
            .runtime
            .as_ref()
            .ok_or(NetError::Configuration {
                collaborator: "tokio runtime",
            })?;
        if self.shared.contexts.is_none() {
            return Err(NetError::Configuration {
                collaborator: "context pool",
            });
        }
        self.shared
            .lifecycle
            .transition(ConnectionState::Idle, ConnectionState::Open)
            .map_err(|state| NetError::InvalidState {
                operation: OperationKind::Accept,
                state,
            })?;

        let listener = match Self::bind(runtime, addr, backlog) {
            Ok(listener) => listener,
            Err(err) => {
                let _ = self
                    .shared
                    .lifecycle
                    .transition(ConnectionState::Open, ConnectionState::Idle);
                return Err(err.into());
            }
        };
        let local = listener.local_addr()?;
        let _ = self.shared.local_addr.set(local);
        *self.shared.listener.lock() = Some(Arc::new(listener));
        info!(%local, backlog, "listener started");

        self.arm_accept();
        Ok(local)
    }

    /// Closes the listening socket and ends the accept loop. Idempotent.
    pub fn stop(&self) {
        if self.shared.stop.send_replace(true) {
            return;
        }
        let listener = self.shared.listener.lock().take();
        self.shared.lifecycle.close();
        if listener.is_some() {
            info!(local = ?self.local_addr(), "listener stopped");
        }
    }

    /// Suppresses further callbacks, then stops.
    pub fn dispose(&self) {
        self.shared.lifecycle.dispose();
        self.stop();
    }

    fn bind(runtime: &Handle, addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
        let _guard = runtime.enter();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    }

    fn arm_accept(&self) {
        let Some(contexts) = self.shared.contexts.as_ref() else {
            return;
        };
        let mut ctx = contexts.acquire();
        ctx.prepare(OperationKind::Accept);
        self.submit(ctx);
    }

    fn submit(&self, mut ctx: OperationContext) {
        let Some(runtime) = self.shared.runtime.as_ref() else {
            self.shared.engine.release(ctx);
            return;
        };

        let listener = self.shared.listener.lock().clone();
        let mut stopped = self.shared.stop.subscribe();
        let this = self.clone();
        runtime.spawn(async move {
            match listener {
                None => ctx.fail(SocketError::OperationAborted),
                Some(listener) => {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                trace!(%peer, "accepted");
                                ctx.set_token(UserToken::Stream(stream));
                                ctx.record(Ok(0));
                            }
                            Err(err) => ctx.record(Err(err)),
                        },
                        _ = stopped.wait_for(|stop| *stop) => {
                            ctx.fail(SocketError::OperationAborted);
                        }
                    }
                }
            }
            this.shared.engine.complete(ctx);
        });
    }

    fn complete_accept(&self, ctx: &mut OperationContext) {
        if let Some(error) = ctx.error() {
            if error == SocketError::OperationAborted && self.is_stopped() {
                debug!("accept loop ended");
                return;
            }
            self.arm_accept();
            warn!(%error, "accept failed");
            if let Some(handler) = &self.shared.handler {
                handler.on_accept_error(error);
            }
            return;
        }

        self.arm_accept();
        let UserToken::Stream(stream) = ctx.take_token() else {
            return;
        };
        match &self.shared.handler {
            Some(handler) => handler.on_accepted(stream),
            None => debug!("no server handler, dropping accepted socket"),
        }
    }
}
