//! Event Controller
//!
//! Handler registration and event fan-out. The control plane only depends on
//! the `EventDelegate` and `Emitter` traits; `EventController` is the
//! in-process implementation of both.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Event;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from handler registration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegateError {
    #[error("handler already registered: {0}")]
    AlreadyRegistered(String),

    #[error("handler not registered: {0}")]
    NotRegistered(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Receives events from a delegate
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: Event);
}

/// Something handlers can be registered with by name
pub trait EventDelegate: Send + Sync {
    fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), DelegateError>;

    fn unregister_handler(&self, name: &str) -> Result<(), DelegateError>;
}

/// Something events can be published to
pub trait Emitter: Send + Sync {
    /// Publish an event, returning how many handlers it was dispatched to
    fn emit(&self, event: Event) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Controller
// ─────────────────────────────────────────────────────────────────────────────

/// In-process event delegate and emitter
///
/// Each emitted event is handed to every registered handler on its own tokio
/// task. Delivery is fire-and-forget; use `emit_and_wait` when the caller
/// needs all handlers to have finished.
#[derive(Default)]
pub struct EventController {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl EventController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new controller wrapped in an Arc
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Deliver an event to all handlers and wait for every one to return
    pub async fn emit_and_wait(&self, event: Event) -> usize {
        let handlers = self.snapshot();
        let count = handlers.len();
        futures::future::join_all(
            handlers
                .into_iter()
                .map(|h| {
                    let event = event.clone();
                    async move { h.handle_event(event).await }
                }),
        )
        .await;
        count
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.read().values().cloned().collect()
    }
}

impl EventDelegate for EventController {
    fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), DelegateError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            return Err(DelegateError::AlreadyRegistered(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        tracing::debug!(handler = name, "Event handler registered");
        Ok(())
    }

    fn unregister_handler(&self, name: &str) -> Result<(), DelegateError> {
        if self.handlers.write().remove(name).is_none() {
            return Err(DelegateError::NotRegistered(name.to_string()));
        }
        tracing::debug!(handler = name, "Event handler unregistered");
        Ok(())
    }
}

impl Emitter for EventController {
    fn emit(&self, event: Event) -> usize {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                namespace = event.namespace(),
                "No async runtime available, dropping event"
            );
            return 0;
        };

        let handlers = self.snapshot();
        let count = handlers.len();
        for handler in handlers {
            let event = event.clone();
            runtime.spawn(async move { handler.handle_event(event).await });
        }
        count
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlEvent, DemandEvent};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, event: Event) {
            self.seen.lock().push(event);
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let controller = EventController::new();
        let handler = Arc::new(RecordingHandler::default());

        assert_ok!(controller.register_handler("runner", handler.clone()));
        assert!(controller.has_handler("runner"));

        let dup = controller.register_handler("runner", handler);
        assert_eq!(dup, Err(DelegateError::AlreadyRegistered("runner".into())));

        assert_ok!(controller.unregister_handler("runner"));
        assert_err!(controller.unregister_handler("runner"));
        assert_eq!(controller.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_emit_and_wait_reaches_every_handler() {
        let controller = EventController::new();
        let a = Arc::new(RecordingHandler::default());
        let b = Arc::new(RecordingHandler::default());
        controller.register_handler("a", a.clone()).unwrap();
        controller.register_handler("b", b.clone()).unwrap();

        let event = Event::from(DemandEvent::publisher_subscription("file", 1));
        let reached = controller.emit_and_wait(event.clone()).await;

        assert_eq!(reached, 2);
        assert_eq!(a.seen.lock().as_slice(), &[event.clone()]);
        assert_eq!(b.seen.lock().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn test_emit_dispatches_in_background() {
        let controller = EventController::new();
        let handler = Arc::new(RecordingHandler::default());
        controller.register_handler("h", handler.clone()).unwrap();

        let reached = controller.emit(Event::from(ControlEvent::DeadAvailablePlugin {
            id: 1,
            name: "mock".into(),
            version: 1,
            failures: 3,
        }));
        assert_eq!(reached, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[test]
    fn test_emit_without_runtime_drops_event() {
        let controller = EventController::new();
        controller
            .register_handler("h", Arc::new(RecordingHandler::default()))
            .unwrap();

        let reached = controller.emit(Event::from(DemandEvent::publisher_subscription("x", 1)));
        assert_eq!(reached, 0);
    }
}
