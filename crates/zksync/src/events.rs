//! Mirror events and their subscribers.
//!
//! Every disk mutation the engine performs is published as a `MirrorEvent`.
//! Subscribers either see everything or only the events under one
//! coordination path; `Ready` has no path and reaches all of them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Mirror events emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MirrorEvent {
    /// Leaf value written to disk.
    Written {
        path: String,
        /// Bytes written.
        size: usize,
    },
    /// Mirror entry (file or subtree) removed.
    Removed { path: String },
    /// Data watch not renewed.
    WatchDropped { path: String },
    /// Done marker written; the subtree will not be watched again.
    Done { path: String },
    /// Initial population finished.
    Ready,
}

impl MirrorEvent {
    /// Coordination path the event is about, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            MirrorEvent::Written { path, .. }
            | MirrorEvent::Removed { path }
            | MirrorEvent::WatchDropped { path }
            | MirrorEvent::Done { path } => Some(path),
            MirrorEvent::Ready => None,
        }
    }

    fn is_under(&self, scope: &str) -> bool {
        let Some(path) = self.path() else {
            return true;
        };
        let scope = scope.trim_end_matches('/');
        scope.is_empty()
            || path == scope
            || path
                .strip_prefix(scope)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

type Callback = Arc<dyn Fn(&MirrorEvent) + Send + Sync>;

struct Subscriber {
    id: usize,
    scope: Option<String>,
    callback: Callback,
}

/// Keeps a subscriber registered; dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|s| s.id != self.id);
        }
    }
}

/// Fan-out of mirror events. Shared as `Arc<EventBus>`.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicUsize,
    emitted: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&MirrorEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(callback))
    }

    /// Receive the events for `scope` and everything below it.
    pub fn subscribe_under(
        self: &Arc<Self>,
        scope: &str,
        callback: impl Fn(&MirrorEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(scope.to_string()), Arc::new(callback))
    }

    fn register(self: &Arc<Self>, scope: Option<String>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                id,
                scope,
                callback,
            });
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Number of events published since the bus was created.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Publish an event to the matching subscribers.
    ///
    /// Callbacks run without the subscriber lock held, so they may subscribe
    /// or drop subscriptions themselves.
    pub fn emit(&self, event: MirrorEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);

        let matching: Vec<Callback> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.scope.as_deref().is_none_or(|scope| event.is_under(scope)))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for callback in matching {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(bus: &Arc<EventBus>, scope: Option<&str>) -> (Arc<Mutex<Vec<MirrorEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let record = move |event: &MirrorEvent| sink.lock().unwrap().push(event.clone());
        let sub = match scope {
            Some(scope) => bus.subscribe_under(scope, record),
            None => bus.subscribe(record),
        };
        (seen, sub)
    }

    #[test]
    fn test_scoped_subscription() {
        let bus = Arc::new(EventBus::new());
        let (servers, _a) = collect(&bus, Some("/servers"));
        let (all, _b) = collect(&bus, None);

        bus.emit(MirrorEvent::Written {
            path: "/servers/host1".into(),
            size: 1,
        });
        bus.emit(MirrorEvent::Removed {
            path: "/servers-old/host1".into(),
        });
        bus.emit(MirrorEvent::Done {
            path: "/servers".into(),
        });
        bus.emit(MirrorEvent::Ready);

        let servers = servers.lock().unwrap();
        assert_eq!(servers.len(), 3);
        assert!(!servers.iter().any(|e| e.path() == Some("/servers-old/host1")));
        assert_eq!(all.lock().unwrap().len(), 4);
        assert_eq!(bus.emitted(), 4);
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let (seen, sub) = collect(&bus, None);

        bus.emit(MirrorEvent::Ready);
        drop(sub);
        bus.emit(MirrorEvent::Ready);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.emitted(), 2);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);

        let sub = bus.subscribe(move |_event| {
            slot_clone.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit(MirrorEvent::Ready);
        assert!(slot.lock().unwrap().is_none());
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_event_serialization() {
        let event = MirrorEvent::Written {
            path: "/servers/host1".into(),
            size: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"written\""));
        assert!(json.contains("\"path\":\"/servers/host1\""));

        let json = serde_json::to_string(&MirrorEvent::WatchDropped { path: "/a".into() }).unwrap();
        assert!(json.contains("\"type\":\"watchDropped\""));
    }
}
