//! Request lifecycle events and listener bookkeeping.

use crate::xhr::XmlHttpRequest;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The fixed set of events a request emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReadyStateChange,
    LoadStart,
    Progress,
    Abort,
    Error,
    Load,
    Timeout,
    LoadEnd,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ReadyStateChange,
        EventKind::LoadStart,
        EventKind::Progress,
        EventKind::Abort,
        EventKind::Error,
        EventKind::Load,
        EventKind::Timeout,
        EventKind::LoadEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ReadyStateChange => "readystatechange",
            EventKind::LoadStart => "loadstart",
            EventKind::Progress => "progress",
            EventKind::Abort => "abort",
            EventKind::Error => "error",
            EventKind::Load => "load",
            EventKind::Timeout => "timeout",
            EventKind::LoadEnd => "loadend",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("on").unwrap_or(s);
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// An event delivered to handlers.
pub struct Event {
    kind: EventKind,
    target: XmlHttpRequest,
}

impl Event {
    pub(crate) fn new(kind: EventKind, target: XmlHttpRequest) -> Self {
        Self { kind, target }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The request that emitted this event.
    pub fn target(&self) -> &XmlHttpRequest {
        &self.target
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("kind", &self.kind).finish()
    }
}

/// A shared event handler. Removal compares handlers by identity.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`].
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-kind ordered listener lists plus one `on<kind>` slot each.
#[derive(Default)]
pub(crate) struct Listeners {
    lists: [Vec<EventHandler>; 8],
    slots: [Option<EventHandler>; 8],
}

impl Listeners {
    pub(crate) fn add(&mut self, kind: EventKind, handler: EventHandler) {
        self.lists[kind.index()].push(handler);
    }

    /// Remove every registration of `handler` for `kind`.
    pub(crate) fn remove(&mut self, kind: EventKind, handler: &EventHandler) {
        self.lists[kind.index()].retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub(crate) fn set_slot(&mut self, kind: EventKind, handler: Option<EventHandler>) {
        self.slots[kind.index()] = handler;
    }

    pub(crate) fn slot(&self, kind: EventKind) -> Option<EventHandler> {
        self.slots[kind.index()].clone()
    }

    /// Handlers to invoke for `kind`: listeners in order, then the slot.
    pub(crate) fn handlers(&self, kind: EventKind) -> Vec<EventHandler> {
        let mut handlers = self.lists[kind.index()].clone();
        handlers.extend(self.slot(kind));
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::ReadyStateChange.to_string(), "readystatechange");
        assert_eq!("loadend".parse::<EventKind>().unwrap(), EventKind::LoadEnd);
        assert_eq!("onload".parse::<EventKind>().unwrap(), EventKind::Load);
        assert!("click".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_slot_runs_after_listeners() {
        let first = handler(|_| {});
        let second = handler(|_| {});
        let slot = handler(|_| {});

        let mut listeners = Listeners::default();
        listeners.set_slot(EventKind::Load, Some(slot.clone()));
        listeners.add(EventKind::Load, first.clone());
        listeners.add(EventKind::Load, second.clone());

        let handlers = listeners.handlers(EventKind::Load);
        assert_eq!(handlers.len(), 3);
        assert!(Arc::ptr_eq(&handlers[0], &first));
        assert!(Arc::ptr_eq(&handlers[1], &second));
        assert!(Arc::ptr_eq(&handlers[2], &slot));
        assert!(listeners.handlers(EventKind::Error).is_empty());
    }

    #[test]
    fn test_remove_drops_every_registration() {
        let repeated = handler(|_| {});
        let other = handler(|_| {});

        let mut listeners = Listeners::default();
        listeners.add(EventKind::Abort, repeated.clone());
        listeners.add(EventKind::Abort, other.clone());
        listeners.add(EventKind::Abort, repeated.clone());
        listeners.remove(EventKind::Abort, &repeated);

        let handlers = listeners.handlers(EventKind::Abort);
        assert_eq!(handlers.len(), 1);
        assert!(Arc::ptr_eq(&handlers[0], &other));
    }

    #[test]
    fn test_clear_slot() {
        let mut listeners = Listeners::default();
        listeners.set_slot(EventKind::Timeout, Some(handler(|_| {})));
        listeners.set_slot(EventKind::Timeout, None);
        assert!(listeners.slot(EventKind::Timeout).is_none());
    }
}
