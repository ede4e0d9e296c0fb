//! The resource lifecycle protocol (spec §4.1, component C1).
//!
//! Every resource in this crate — the DHCP server family and the HTTP
//! caching proxy — implements [`Resource`]. State that must survive
//! concurrent `watch`/`check_apply` calls lives behind interior
//! mutability (`parking_lot::Mutex`/`RwLock`) inside the concrete
//! resource rather than behind a lock the engine holds, which is what
//! lets `watch` run concurrently with `check_apply` as required by the
//! ordering invariant in §3 ("Watch runs concurrently with
//! checkApply").

pub mod autoedge;
pub mod autogroup;
pub mod engine;
pub mod event;

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use event::EventSender;

/// `(kind, name)` — the identity of a resource instance (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: &'static str,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.name)
    }
}

/// Cancellation signal threaded through `watch` and long-running
/// `check_apply` work. A plain `tokio::sync::watch` bool rather than a
/// `Notify`: every resource needs to observe the *current* shutdown
/// state on first poll, not just a future transition.
#[derive(Clone)]
pub struct ShutdownCtx(watch::Receiver<bool>);

impl ShutdownCtx {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    /// Resolves once shutdown has been requested. Cancel-safe: callers
    /// select! this alongside their real I/O.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow() {
                return;
            }

            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// One-shot "I have started observing" signal (spec §4.1: watch "must
/// signal running exactly once before first event").
#[derive(Clone)]
pub struct RunningSignal(Arc<tokio::sync::Notify>);

impl RunningSignal {
    pub fn new() -> Self {
        Self(Arc::new(tokio::sync::Notify::new()))
    }

    pub fn signal(&self) {
        self.0.notify_waiters();
    }

    pub async fn wait(&self) {
        self.0.notified().await;
    }
}

impl Default for RunningSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The handle supplied to a resource's `init` (spec §4.1 and §6,
/// "Engine-facing contract"): structured logging, a debug flag, a
/// shutdown context, a running callback, an event callback, a
/// send/recv wiring lookup, and a var-dir lookup.
pub struct Services {
    pub debug: bool,
    id: ResourceId,
    shutdown: ShutdownCtx,
    running: RunningSignal,
    events: EventSender,
    var_dir_root: PathBuf,
    recv: Arc<parking_lot::RwLock<ahash::AHashMap<String, String>>>,
}

impl Services {
    pub fn new(
        id: ResourceId,
        debug: bool,
        shutdown: ShutdownCtx,
        running: RunningSignal,
        events: EventSender,
        var_dir_root: PathBuf,
        recv: Arc<parking_lot::RwLock<ahash::AHashMap<String, String>>>,
    ) -> Self {
        Self {
            debug,
            id,
            shutdown,
            running,
            events,
            var_dir_root,
            recv,
        }
    }

    /// Structured, kind-tagged log line (spec §7: "logs with
    /// kind-tagged prefixes").
    pub fn logf(&self, level: log::Level, args: fmt::Arguments<'_>) {
        log::log!(level, "{}: {}", self.id, args);
    }

    pub fn shutdown_ctx(&self) -> ShutdownCtx {
        self.shutdown.clone()
    }

    /// Signal that `watch` has started observing. Must be called
    /// exactly once, before the first `event()`.
    pub fn running(&self) {
        self.running.signal();
    }

    /// Publish a coalesced change notification (component C4).
    pub fn event(&self) {
        self.events.publish();
    }

    /// A clone of the running-signal handle, for resources that need
    /// to call `running()` from inside `watch` after `init` has
    /// already consumed this `Services` value by move.
    pub fn running_signal(&self) -> RunningSignal {
        self.running.clone()
    }

    /// A clone of the event-sender handle, for the same reason as
    /// [`Services::running_signal`].
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Builds a `Services` for an absorbed child, sharing this
    /// resource's shutdown/running/event/var-dir wiring under the
    /// child's own identity (spec §4.2: "the parent may call
    /// `child.init(services)` itself").
    pub fn for_child(&self, id: ResourceId) -> Services {
        Services {
            debug: self.debug,
            id,
            shutdown: self.shutdown.clone(),
            running: self.running.clone(),
            events: self.events.clone(),
            var_dir_root: self.var_dir_root.clone(),
            recv: self.recv.clone(),
        }
    }

    /// A value received via this resource's send/recv wiring, if any
    /// peer resource exported one under `key`.
    pub fn recv(&self, key: &str) -> Option<String> {
        self.recv.read().get(key).cloned()
    }

    /// A private, per-resource directory under the engine's var dir,
    /// e.g. for a lease-persistence file (not implemented: see
    /// spec §9(b)).
    pub fn var_dir(&self, suffix: &str) -> PathBuf {
        self.var_dir_root.join(&self.id.name).join(suffix)
    }
}

/// The engine-facing contract every resource implements (spec §4.1).
///
/// Ordering invariant: `validate` → `init` → (`watch` concurrent with
/// zero or more `check_apply`) → `cleanup`. No other interleaving is
/// legal; the [`engine`] module is the only caller that may invoke
/// these methods, and it upholds the ordering.
#[async_trait]
pub trait Resource: Send + Sync + Any {
    fn id(&self) -> ResourceId;

    /// Pure check of the declaration. No I/O. Callable before `init`.
    fn validate(&self) -> Result<()>;

    /// Populate private derived state. Failure here is fatal for the
    /// node (the engine may still retry per the `InitFailure` policy).
    async fn init(&self, services: Services) -> Result<()>;

    /// Long-running observer. Must signal `running()` exactly once
    /// before the first `event()`, and return `Ok(())` on
    /// cancellation.
    async fn watch(&self, ctx: ShutdownCtx) -> Result<()>;

    /// Reconcile. Returns whether the resource was already in the
    /// desired state. Must be idempotent and, when `apply_permitted`
    /// is false, must not mutate external state.
    async fn check_apply(&self, apply_permitted: bool) -> Result<bool>;

    /// Structural equality of declared attributes. Returns the first
    /// reason the two differ, or `None` if equal.
    fn cmp(&self, other: &dyn Resource) -> Option<String>;

    /// Release owned resources. Called once, after `watch` returned.
    async fn cleanup(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    /// Autogrouping: `Some(self)` if this resource can act as a
    /// grouping parent (component C2). Default: not a parent.
    fn as_group_parent(&self) -> Option<&dyn autogroup::GroupParent> {
        None
    }

    /// Autogrouping: `Some(self)` if this resource is a groupable
    /// child (component C2). Default: not groupable.
    fn as_group_child(&self) -> Option<&dyn autogroup::GroupChild> {
        None
    }

    /// Autoedge: candidate edge batches derived from this resource's
    /// content (component C3). Default: none.
    fn autoedges(&self) -> Option<Box<dyn autoedge::AutoEdge>> {
        None
    }
}
