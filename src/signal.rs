//! Synchronous multi-subscriber signals.
//!
//! Handlers run on the emitting thread, in connection order. The handler list
//! is cloned before emission so a handler may connect or disconnect others
//! without deadlocking. Handler ids are unique across all signals.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Identifies one connected handler; pass it back to `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

pub struct Signal<T> {
    handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn disconnect_all(&self) {
        self.lock().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(value);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Handler<T>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_connected_handlers_in_order() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            signal.connect(move |v| seen.lock().unwrap().push(format!("{}:{}", tag, v)));
        }
        signal.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let signal = Signal::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&());
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_disconnect_itself() {
        let signal = Arc::new(Signal::<()>::new());
        let slot = Arc::new(Mutex::new(None::<HandlerId>));
        let (s, sl) = (signal.clone(), slot.clone());
        let id = signal.connect(move |_| {
            if let Some(id) = sl.lock().unwrap().take() {
                s.disconnect(id);
            }
        });
        *slot.lock().unwrap() = Some(id);
        signal.emit(&());
        assert_eq!(signal.handler_count(), 0);
    }
}
