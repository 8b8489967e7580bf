use super::{CommandInvoker, Invocation};
use crate::command::{Argument, ArgumentPrototype};
use crate::error::panic_message;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by `add_observer`, used to remove the observer again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer {
    id: ObserverId,
    handler: Arc<dyn CommandInvoker>,
}

/// Multicast point: firing invokes every observer in registration order
pub(crate) struct EventSource {
    name: String,
    interface: String,
    argument: Option<ArgumentPrototype>,
    observers: Mutex<Vec<Observer>>,
    next_id: AtomicU64,
}

impl EventSource {
    pub(crate) fn new(name: &str, interface: &str, argument: Option<ArgumentPrototype>) -> Self {
        Self {
            name: name.to_string(),
            interface: interface.to_string(),
            argument,
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn argument_prototype(&self) -> Option<ArgumentPrototype> {
        self.argument
    }

    pub(crate) fn add_observer(&self, handler: Arc<dyn CommandInvoker>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push(Observer { id, handler });
        id
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|observer| observer.id != id);
        observers.len() != before
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Deliver to every observer. A failing observer is logged and does not stop delivery.
    /// Returns the number of observers that accepted the event.
    pub(crate) fn fire(&self, make_argument: &dyn Fn() -> Option<Argument>) -> usize {
        let handlers: Vec<Arc<dyn CommandInvoker>> = self
            .observers
            .lock()
            .iter()
            .map(|observer| observer.handler.clone())
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.invoke(make_argument(), false)
            }));
            match outcome {
                Ok(Ok(Invocation::Queued)) | Ok(Ok(Invocation::Completed(_))) => delivered += 1,
                Ok(Err(err)) => log::warn!(
                    "Event '{}' on '{}': observer '{}' failed: {}",
                    self.name,
                    self.interface,
                    handler.name(),
                    err
                ),
                Err(payload) => log::error!(
                    "Event '{}' on '{}': observer '{}' panicked: {}",
                    self.name,
                    self.interface,
                    handler.name(),
                    panic_message(payload.as_ref())
                ),
            }
        }
        delivered
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.name)
            .field("interface", &self.interface)
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Generator for an event without payload
#[derive(Debug, Clone)]
pub struct EventVoid {
    source: Arc<EventSource>,
}

impl EventVoid {
    pub(crate) fn new(source: Arc<EventSource>) -> Self {
        Self { source }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn observer_count(&self) -> usize {
        self.source.observer_count()
    }

    pub fn fire(&self) -> usize {
        self.source.fire(&|| None)
    }
}

/// Generator for an event carrying a `T`; each observer receives its own copy
pub struct EventWrite<T> {
    source: Arc<EventSource>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for EventWrite<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static> EventWrite<T> {
    pub(crate) fn new(source: Arc<EventSource>) -> Self {
        Self {
            source,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn observer_count(&self) -> usize {
        self.source.observer_count()
    }

    pub fn fire(&self, value: &T) -> usize {
        self.source.fire(&|| Some(Box::new(value.clone()) as Argument))
    }
}

impl<T> fmt::Debug for EventWrite<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWrite")
            .field("source", &self.source)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
