//! Event routing for push events
//!
//! Maps each [`EventKind`] to an ordered list of handlers. Registrations belong
//! to the router, not to a particular connection, so they stay active across
//! reconnects without being re-attached.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, error};

use crate::core::message_types::{EventKind, InboundEvent};
use crate::error::Result;

/// Receives push events
pub trait EventHandler: Send + Sync {
    /// Called for every event of a kind the handler is registered for
    fn on_event(&self, event: &InboundEvent) -> Result<()>;
}

/// Simple callback-based event handler
pub struct CallbackHandler<F>
where
    F: Fn(&InboundEvent) -> Result<()> + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(&InboundEvent) -> Result<()> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        CallbackHandler { callback }
    }
}

impl<F> EventHandler for CallbackHandler<F>
where
    F: Fn(&InboundEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &InboundEvent) -> Result<()> {
        (self.callback)(event)
    }
}

/// Identifies one registration, returned by [`EventRouter::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

struct Registration {
    handle: SubscriptionHandle,
    handler: Arc<dyn EventHandler>,
}

/// Outcome of delivering one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct EventRouter {
    registrations: RwLock<HashMap<EventKind, Vec<Registration>>>,
    next_handle: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an event kind.
    ///
    /// Registering the same handler twice for the same kind returns the
    /// original handle and does not add a second delivery.
    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Result<SubscriptionHandle> {
        let mut registrations = self.registrations.write()?;
        let entries = registrations.entry(kind).or_default();

        if let Some(existing) = entries
            .iter()
            .find(|r| Arc::ptr_eq(&r.handler, &handler))
        {
            debug!("Handler already registered for {}", kind);
            return Ok(existing.handle);
        }

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        entries.push(Registration { handle, handler });
        debug!("Registered handler {:?} for {}", handle, kind);
        Ok(handle)
    }

    /// Convenience wrapper registering a closure
    pub fn register_fn<F>(&self, kind: EventKind, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&InboundEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(CallbackHandler::new(callback)))
    }

    /// Removes a registration, returns false if it was unknown
    pub fn unregister(&self, kind: EventKind, handle: SubscriptionHandle) -> Result<bool> {
        let mut registrations = self.registrations.write()?;
        let Some(entries) = registrations.get_mut(&kind) else {
            return Ok(false);
        };

        let before = entries.len();
        entries.retain(|r| r.handle != handle);
        let removed = entries.len() != before;
        if entries.is_empty() {
            registrations.remove(&kind);
        }
        Ok(removed)
    }

    /// Removes every registration for an event kind
    pub fn unregister_all(&self, kind: EventKind) -> Result<usize> {
        Ok(self
            .registrations
            .write()?
            .remove(&kind)
            .map(|entries| entries.len())
            .unwrap_or(0))
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registrations
            .read()
            .map(|r| r.get(&kind).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Event kinds that currently have at least one handler
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .registrations
            .read()
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default();
        kinds.sort();
        kinds
    }

    /// Delivers an event to every handler registered for its kind, in
    /// registration order. A failing or panicking handler is logged and
    /// skipped; the remaining handlers still run.
    pub fn dispatch(&self, event: &InboundEvent) -> DispatchReport {
        let kind = event.kind();

        // Handlers run without the lock held so they may (un)register freely
        let handlers: Vec<(SubscriptionHandle, Arc<dyn EventHandler>)> = match self.registrations.read() {
            Ok(registrations) => registrations
                .get(&kind)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|r| (r.handle, r.handler.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                error!("Router lock poisoned, dropping {} event: {}", kind, e);
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        for (handle, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    error!("Handler {:?} failed on {}: {}", handle, kind, e);
                    report.failed += 1;
                }
                Err(_) => {
                    error!("Handler {:?} panicked on {}", handle, kind);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Thread-safe wrapper for EventRouter
pub type SharedRouter = Arc<EventRouter>;
