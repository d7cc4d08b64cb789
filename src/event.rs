//! Server event bus.
//!
//! The exchange engine publishes a small set of lifecycle events. Delivery
//! is fire-and-forget on the connection's worker; subscribers must be quick
//! and must not block.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// An event published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A request head was fully parsed.
    RequestHeadReceived {
        /// Monotonic span from the request's first byte to this event.
        elapsed: Duration,
        /// Wire length of the request head.
        byte_count: u64,
    },
    /// A final response was fully written.
    ResponseSent {
        /// Monotonic span from response scheduling to this event.
        elapsed: Duration,
        /// Wire length of the response.
        byte_count: u64,
    },
    /// The server stopped. Fires once per successful `stop()`.
    HttpServerStopped,
}

/// A subscriber to server [`Event`]s.
pub trait Subscriber: Send + Sync + 'static {
    /// Called for each published event, on the publishing worker.
    fn on_event(&self, event: &Event);
}

impl<F> Subscriber for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Handle to the event bus.
///
/// Cloning is cheap; all clones publish to and subscribe on the same list.
/// The subscription list is copy-on-write: emitting never contends with
/// subscribing.
#[derive(Clone, Default)]
pub struct Events {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: RwLock<Arc<Vec<Arc<dyn Subscriber>>>>,
}

impl Events {
    pub(crate) fn new() -> Events {
        Events::default()
    }

    /// Registers a subscriber. Takes effect for events emitted afterwards.
    pub fn subscribe<S: Subscriber>(&self, subscriber: S) {
        let mut guard = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Arc<dyn Subscriber>> = (**guard).clone();
        list.push(Arc::new(subscriber));
        *guard = Arc::new(list);
    }

    pub(crate) fn emit(&self, event: Event) {
        let list = {
            let guard = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        for subscriber in list.iter() {
            // A panicking subscriber must not take the exchange down.
            if catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event))).is_err() {
                tracing::error!("event subscriber panicked on {:?}", event);
            }
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events").finish()
    }
}
