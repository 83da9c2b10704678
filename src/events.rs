//! Host-event subscription (§6): the typed channel device models use to
//! learn about host-side input without the core knowing anything about
//! keyboards, mice, serial lines, or network packets itself — it only
//! knows how to fan a tagged event out to whichever devices subscribed to
//! that tag.

/// The kinds of host events a device model can subscribe to. Each variant
/// carries just enough to drive an emulated device's internal state
/// machine; anything more specific (scan-code tables, PS/2 protocol
/// framing, virtio descriptor layouts) is that device's own business, not
/// the core's.
#[derive(Debug, Clone)]
pub enum HostEvent {
    KeyboardKey { scancode: u8, pressed: bool },
    MouseMotion { dx: i32, dy: i32 },
    MouseButton { button: u8, pressed: bool },
    /// A periodic timer the host fires at a configured rate (e.g. the
    /// host's own wall-clock tick, used to drive an emulated PIT/RTC).
    TimerTick { timer_id: u32 },
    SerialRx { port: u16, byte: u8 },
    ConsoleResize { cols: u16, rows: u16 },
    /// A raw network frame arriving from the host's side of a virtual
    /// network link.
    PacketRx { link_id: u32, bytes: Vec<u8> },
}

/// A tag identifying which `HostEvent` variants a subscriber wants,
/// without requiring the subscriber to pattern-match variants it doesn't
/// care about receiving in the first place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Keyboard,
    Mouse,
    Timer,
    Serial,
    Console,
    Packet,
}

impl HostEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HostEvent::KeyboardKey { .. } => EventKind::Keyboard,
            HostEvent::MouseMotion { .. } | HostEvent::MouseButton { .. } => EventKind::Mouse,
            HostEvent::TimerTick { .. } => EventKind::Timer,
            HostEvent::SerialRx { .. } => EventKind::Serial,
            HostEvent::ConsoleResize { .. } => EventKind::Console,
            HostEvent::PacketRx { .. } => EventKind::Packet,
        }
    }
}

/// Returns `true` if the subscriber handled the event; `false` aborts the
/// rest of the fan-out for this dispatch (§6: "any subscriber returning
/// failure aborts the chain").
pub type EventSubscriber = Box<dyn FnMut(&HostEvent) -> bool + Send>;

/// The VM-wide fan-out table: each `EventKind` has zero or more
/// subscribers, all of which see every event of that kind.
#[derive(Default)]
pub struct EventBus {
    subscribers: std::collections::BTreeMap<EventKind, Vec<EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: std::collections::BTreeMap::new(),
        }
    }

    pub fn subscribe(&mut self, kind: EventKind, subscriber: EventSubscriber) {
        self.subscribers.entry(kind).or_default().push(subscriber);
    }

    /// Deliver `event` to subscribers registered for its kind, in
    /// registration order, stopping as soon as one returns `false`. Returns
    /// `true` if every subscriber (or none) ran to completion.
    pub fn dispatch(&mut self, event: &HostEvent) -> bool {
        if let Some(subs) = self.subscribers.get_mut(&event.kind()) {
            for sub in subs.iter_mut() {
                if !sub(event) {
                    return false;
                }
            }
        }
        true
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn event_kind_matches_its_variant() {
        assert_eq!(
            HostEvent::KeyboardKey {
                scancode: 0x1e,
                pressed: true
            }
            .kind(),
            EventKind::Keyboard
        );
        assert_eq!(
            HostEvent::PacketRx {
                link_id: 0,
                bytes: vec![]
            }
            .kind(),
            EventKind::Packet
        );
    }

    #[test]
    fn only_subscribers_of_the_matching_kind_are_invoked() {
        let mut bus = EventBus::new();
        let keyboard_hits = Arc::new(Mutex::new(0));
        let mouse_hits = Arc::new(Mutex::new(0));
        let kh = keyboard_hits.clone();
        let mh = mouse_hits.clone();
        bus.subscribe(
            EventKind::Keyboard,
            Box::new(move |_| {
                *kh.lock().unwrap() += 1;
                true
            }),
        );
        bus.subscribe(
            EventKind::Mouse,
            Box::new(move |_| {
                *mh.lock().unwrap() += 1;
                true
            }),
        );

        let ok = bus.dispatch(&HostEvent::KeyboardKey {
            scancode: 0x1e,
            pressed: true,
        });

        assert!(ok);
        assert_eq!(*keyboard_hits.lock().unwrap(), 1);
        assert_eq!(*mouse_hits.lock().unwrap(), 0);
    }

    #[test]
    fn multiple_subscribers_all_see_the_event() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let c = count.clone();
            bus.subscribe(
                EventKind::Timer,
                Box::new(move |_| {
                    *c.lock().unwrap() += 1;
                    true
                }),
            );
        }
        assert!(bus.dispatch(&HostEvent::TimerTick { timer_id: 0 }));
        assert_eq!(*count.lock().unwrap(), 3);
        assert_eq!(bus.subscriber_count(EventKind::Timer), 3);
    }

    #[test]
    fn a_failing_subscriber_aborts_the_rest_of_the_chain() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c1 = count.clone();
        bus.subscribe(
            EventKind::Timer,
            Box::new(move |_| {
                *c1.lock().unwrap() += 1;
                false
            }),
        );
        let c2 = count.clone();
        bus.subscribe(
            EventKind::Timer,
            Box::new(move |_| {
                *c2.lock().unwrap() += 1;
                true
            }),
        );
        let ok = bus.dispatch(&HostEvent::TimerTick { timer_id: 0 });
        assert!(!ok);
        assert_eq!(*count.lock().unwrap(), 1, "second subscriber must not run");
    }
}


