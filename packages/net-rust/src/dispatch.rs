//! Completion routing shared by client connections and server listeners.
//!
//! A [`DispatchEngine`] is built once per owner with a [`HookSet`]. Every I/O
//! task hands its finished [`OperationContext`] to [`DispatchEngine::complete`],
//! which picks the hook for the operation kind and decides whether the context
//! goes back to its source.

use std::fmt;
use std::sync::Arc;

use sockflow_core::OperationKind;
use tracing::{trace, warn};

use crate::context::OperationContext;
use crate::lifecycle::Lifecycle;
use crate::pool::ContextSource;

/// What a receive or send hook did with its context.
#[derive(Debug)]
pub enum Disposition {
    /// The operation is finished; the engine releases the context.
    Complete(OperationContext),
    /// The hook moved the context into a re-armed I/O call.
    Continue,
}

type BorrowHook = Box<dyn Fn(&mut OperationContext) + Send + Sync>;
type OwnedHook = Box<dyn Fn(OperationContext) -> Disposition + Send + Sync>;

/// Per-kind completion hooks. Unset hooks do nothing and complete.
pub struct HookSet {
    on_connect: BorrowHook,
    on_receive: OwnedHook,
    on_send: OwnedHook,
    on_disconnect: BorrowHook,
    on_accept: BorrowHook,
}

impl HookSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_connect: Box::new(|_| {}),
            on_receive: Box::new(Disposition::Complete),
            on_send: Box::new(Disposition::Complete),
            on_disconnect: Box::new(|_| {}),
            on_accept: Box::new(|_| {}),
        }
    }

    #[must_use]
    pub fn on_connect(
        mut self,
        hook: impl Fn(&mut OperationContext) + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Box::new(hook);
        self
    }

    #[must_use]
    pub fn on_receive(
        mut self,
        hook: impl Fn(OperationContext) -> Disposition + Send + Sync + 'static,
    ) -> Self {
        self.on_receive = Box::new(hook);
        self
    }

    #[must_use]
    pub fn on_send(
        mut self,
        hook: impl Fn(OperationContext) -> Disposition + Send + Sync + 'static,
    ) -> Self {
        self.on_send = Box::new(hook);
        self
    }

    #[must_use]
    pub fn on_disconnect(
        mut self,
        hook: impl Fn(&mut OperationContext) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Box::new(hook);
        self
    }

    #[must_use]
    pub fn on_accept(
        mut self,
        hook: impl Fn(&mut OperationContext) + Send + Sync + 'static,
    ) -> Self {
        self.on_accept = Box::new(hook);
        self
    }
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet").finish_non_exhaustive()
    }
}

/// Routes completed operations to hooks and returns contexts to their source.
pub struct DispatchEngine {
    hooks: HookSet,
    contexts: Option<Arc<dyn ContextSource>>,
    lifecycle: Arc<Lifecycle>,
}

impl DispatchEngine {
    #[must_use]
    pub fn new(
        hooks: HookSet,
        contexts: Option<Arc<dyn ContextSource>>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            hooks,
            contexts,
            lifecycle,
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Handles one finished operation.
    ///
    /// If the owner is disposed no hook runs and the context is released
    /// straight away.
    pub fn complete(&self, mut ctx: OperationContext) {
        if self.lifecycle.is_disposed() {
            trace!(kind = ?ctx.kind(), "completion after dispose, releasing context");
            self.release(ctx);
            return;
        }

        let Some(kind) = ctx.kind() else {
            warn!("completion for an unstamped context");
            self.release(ctx);
            return;
        };

        trace!(
            %kind,
            bytes = ctx.bytes_transferred(),
            error = ?ctx.error(),
            "operation completed"
        );

        match kind {
            OperationKind::Connect => (self.hooks.on_connect)(&mut ctx),
            OperationKind::Disconnect => (self.hooks.on_disconnect)(&mut ctx),
            OperationKind::Accept => (self.hooks.on_accept)(&mut ctx),
            OperationKind::Receive => match (self.hooks.on_receive)(ctx) {
                Disposition::Complete(done) => ctx = done,
                Disposition::Continue => return,
            },
            OperationKind::Send => match (self.hooks.on_send)(ctx) {
                Disposition::Complete(done) => ctx = done,
                Disposition::Continue => return,
            },
        }

        self.release(ctx);
    }

    /// Returns a context to the source, or drops it when there is none.
    pub fn release(&self, ctx: OperationContext) {
        if let Some(contexts) = &self.contexts {
            contexts.release(ctx);
        }
    }
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("has_contexts", &self.contexts.is_some())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}
