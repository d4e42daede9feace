//! Fan-out of device-level events to registered application callbacks.

use std::sync::Mutex;

use flint::logging::{trace, Logger};

use crate::types::{Event, EventFn};

pub(crate) struct EventBus {
    subs: Mutex<Vec<(usize, EventFn)>>,
    next_id: Mutex<usize>,
    log: Logger,
}

impl EventBus {
    pub fn new(log: Logger) -> EventBus {
        EventBus {
            subs: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            log,
        }
    }

    /// Register a callback for all future events. Returns a token for
    /// [`EventBus::unregister`].
    pub fn register(&self, callback: EventFn) -> usize {
        let mut next_id = self.next_id.lock().expect("Event id lock poisoned");
        let id = *next_id;
        *next_id += 1;

        self.subs
            .lock()
            .expect("Event bus lock poisoned")
            .push((id, callback));
        id
    }

    pub fn unregister(&self, id: usize) {
        self.subs
            .lock()
            .expect("Event bus lock poisoned")
            .retain(|(sub_id, _)| *sub_id != id);
    }

    /// Invoke every registered callback. Called from the processor thread
    /// with no engine locks held.
    pub fn dispatch(&self, event: &Event) {
        trace!(self.log, "dispatching event"; "event" => ?event);

        let subs = self.subs.lock().expect("Event bus lock poisoned").clone();
        for (_, callback) in &subs {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_register_dispatch_unregister() {
        let bus = EventBus::new(logging::discard());
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_cb = hits.clone();
        let id = bus.register(Arc::new(move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        }));

        bus.dispatch(&Event::KeepAlive);
        bus.dispatch(&Event::WifiConnected);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        bus.unregister(id);
        bus.dispatch(&Event::KeepAlive);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_multiple_subscribers_all_hit() {
        let bus = EventBus::new(logging::discard());
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits_cb = hits.clone();
            bus.register(Arc::new(move |_| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.dispatch(&Event::Ready);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
