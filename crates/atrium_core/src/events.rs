//! # Event Bus
//!
//! Named local events: `on` / `off` / `emit`.
//!
//! ## Isolation
//!
//! Every listener runs inside its own try: a failing listener is logged and
//! the remaining listeners for the same event still fire. Dispatch walks a
//! buffered copy of the listener list, so subscription changes queued while
//! an emit is in flight cannot destabilize the iteration.

use std::collections::HashMap;

use atrium_shared::Value;

/// Error a listener may surface. It is logged, never rethrown.
#[derive(Debug)]
pub struct ListenerError(pub String);

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ListenerError {}

/// Handle for unsubscribing a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&Value) -> Result<(), ListenerError>>;

/// Named local event emitter.
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to `name`. Returns the handle for `off`.
    pub fn on<F>(&mut self, name: &str, listener: F) -> ListenerId
    where
        F: FnMut(&Value) -> Result<(), ListenerError> + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(name.to_owned())
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Unsubscribes a listener. Unknown handles are ignored.
    pub fn off(&mut self, name: &str, id: ListenerId) {
        if let Some(list) = self.listeners.get_mut(name) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                self.listeners.remove(name);
            }
        }
    }

    /// Number of listeners currently subscribed to `name`.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }

    /// Emits `name` with `payload` to every subscribed listener.
    ///
    /// Returns the number of listeners that ran (including ones that
    /// failed; failures are logged).
    pub fn emit(&mut self, name: &str, payload: &Value) -> usize {
        // Buffer the current list; the map entry is free for re-insertion
        // while the batch runs.
        let Some(mut batch) = self.listeners.remove(name) else {
            return 0;
        };
        let ran = batch.len();
        for (_, listener) in &mut batch {
            if let Err(err) = listener(payload) {
                tracing::warn!(event = name, %err, "event listener failed");
            }
        }
        // Merge back: listeners registered during dispatch were appended to
        // a fresh entry and must survive; removed ones must stay removed.
        match self.listeners.remove(name) {
            Some(added_during_dispatch) => {
                batch.extend(added_during_dispatch);
                self.listeners.insert(name.to_owned(), batch);
            }
            None => {
                self.listeners.insert(name.to_owned(), batch);
            }
        }
        ran
    }

    /// Drops every listener.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_emit_reaches_all_listeners() {
        let mut bus = EventBus::new();
        let hits = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let hits = Rc::clone(&hits);
            bus.on("tick", move |_| {
                *hits.borrow_mut() += 1;
                Ok(())
            });
        }
        assert_eq!(bus.emit("tick", &Value::Null), 3);
        assert_eq!(*hits.borrow(), 3);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let mut bus = EventBus::new();
        let hits = Rc::new(RefCell::new(0));
        bus.on("boom", |_| Err(ListenerError("deliberate".to_owned())));
        {
            let hits = Rc::clone(&hits);
            bus.on("boom", move |_| {
                *hits.borrow_mut() += 1;
                Ok(())
            });
        }
        bus.emit("boom", &Value::Null);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_off_removes_listener() {
        let mut bus = EventBus::new();
        let hits = Rc::new(RefCell::new(0));
        let id = {
            let hits = Rc::clone(&hits);
            bus.on("x", move |_| {
                *hits.borrow_mut() += 1;
                Ok(())
            })
        };
        bus.off("x", id);
        bus.emit("x", &Value::Null);
        assert_eq!(*hits.borrow(), 0);
        assert_eq!(bus.listener_count("x"), 0);
    }

    #[test]
    fn test_listeners_survive_emit() {
        let mut bus = EventBus::new();
        bus.on("e", |_| Ok(()));
        bus.emit("e", &Value::Null);
        assert_eq!(bus.listener_count("e"), 1);
    }

    #[test]
    fn test_payload_passed_through() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(None));
        {
            let seen = Rc::clone(&seen);
            bus.on("msg", move |v| {
                *seen.borrow_mut() = v.as_int();
                Ok(())
            });
        }
        bus.emit("msg", &Value::Int(41));
        assert_eq!(*seen.borrow(), Some(41));
    }
}
