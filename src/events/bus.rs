use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, trace};

/// An event that can be routed by its kind.
pub trait Event {
    type Kind: Copy + Eq + Hash + std::fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type Handler<E> = Arc<dyn Fn(&E) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of one [`EventBus::emit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Registration side of a dispatcher.
pub trait Subscribe<E: Event> {
    fn on(&self, kind: E::Kind, handler: Handler<E>) -> SubscriptionId;

    /// Returns `false` if the id was not registered for `kind`.
    fn off(&self, kind: E::Kind, id: SubscriptionId) -> bool;
}

/// Emission side of a dispatcher.
pub trait Publish<E: Event> {
    fn emit(&self, event: &E) -> EmitReport;
}

/// Synchronous fan-out of events to handlers registered per kind.
///
/// Handlers run in registration order on the emitting thread. Each emission works on
/// a snapshot of the handler list, so handlers may register or remove handlers while
/// being called; the change applies from the next emission on. A handler that fails
/// or panics is logged and does not keep the others from running.
pub struct EventBus<E: Event> {
    handlers: RwLock<HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>>,
    next_id: AtomicU64,
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure for `kind`.
    pub fn on_fn<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.on(kind, Arc::new(handler))
    }

    pub fn handler_count(&self, kind: E::Kind) -> usize {
        self.read().get(&kind).map_or(0, Vec::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>> {
        self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>> {
        self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E: Event> Subscribe<E> for EventBus<E> {
    fn on(&self, kind: E::Kind, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().entry(kind).or_default().push((id, handler));
        trace!("Registered handler {:?} for {:?}", id, kind);
        id
    }

    fn off(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        let mut handlers = self.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        list.len() != before
    }
}

impl<E: Event> Publish<E> for EventBus<E> {
    fn emit(&self, event: &E) -> EmitReport {
        let kind = event.kind();
        let snapshot: Vec<Handler<E>> = match self.read().get(&kind) {
            Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
            None => return EmitReport::default(),
        };

        let mut report = EmitReport::default();
        for handler in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!("Handler for {:?} failed: {}", kind, e);
                }
                Err(_) => {
                    report.failed += 1;
                    error!("Handler for {:?} panicked", kind);
                }
            }
        }
        report
    }
}
