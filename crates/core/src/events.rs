use std::{cell::RefCell, collections::HashMap, rc::Rc};

use serde::Serialize;
use serde_json::{json, Value};

/// Direction reported by a swipe gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Left,
    Right,
    Up,
    Down,
}

/// Named in-page events exchanged between modules.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Resize { width: u32, height: u32 },
    Escape,
    Swipe { direction: SwipeDirection },
    ScrollIntersect { target: String, ratio: f64 },
    FormSuccess { form_id: String, payload: Value },
    FormError { form_id: String, message: String },
    PerformanceMetric { name: String, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Resize,
    Escape,
    Swipe,
    ScrollIntersect,
    FormSuccess,
    FormError,
    PerformanceMetric,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resize => "app:resize",
            Self::Escape => "app:escape",
            Self::Swipe => "app:swipe",
            Self::ScrollIntersect => "app:scroll-intersect",
            Self::FormSuccess => "form:success",
            Self::FormError => "form:error",
            Self::PerformanceMetric => "performance:metric",
        }
    }
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Resize { .. } => EventKind::Resize,
            Self::Escape => EventKind::Escape,
            Self::Swipe { .. } => EventKind::Swipe,
            Self::ScrollIntersect { .. } => EventKind::ScrollIntersect,
            Self::FormSuccess { .. } => EventKind::FormSuccess,
            Self::FormError { .. } => EventKind::FormError,
            Self::PerformanceMetric { .. } => EventKind::PerformanceMetric,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Structured payload carried in the event's detail.
    pub fn detail(&self) -> Value {
        match self {
            Self::Resize { width, height } => json!({ "width": width, "height": height }),
            Self::Escape => Value::Null,
            Self::Swipe { direction } => json!({ "direction": direction }),
            Self::ScrollIntersect { target, ratio } => {
                json!({ "target": target, "ratio": ratio })
            }
            Self::FormSuccess { form_id, payload } => {
                json!({ "formId": form_id, "data": payload })
            }
            Self::FormError { form_id, message } => {
                json!({ "formId": form_id, "error": message })
            }
            Self::PerformanceMetric { name, value } => json!({ "name": name, "value": value }),
        }
    }
}

type Handler = Rc<dyn Fn(&AppEvent)>;

/// Same-tick publish/subscribe bus for page events.
///
/// Handlers run synchronously inside [`EventBus::publish`] in subscription
/// order. Cloning the bus shares the subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Rc<RefCell<HashMap<EventKind, Vec<(u64, Handler)>>>>,
    next_id: Rc<RefCell<u64>>,
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&AppEvent) + 'static,
    {
        let id = {
            let mut next = self.next_id.borrow_mut();
            *next += 1;
            *next
        };
        self.handlers
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push((id, Rc::new(handler)));
        Subscription { kind, id }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        if let Some(list) = self.handlers.borrow_mut().get_mut(&subscription.kind) {
            list.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Dispatches to every handler registered for the event's kind and returns
    /// how many were invoked.
    pub fn publish(&self, event: &AppEvent) -> usize {
        // Snapshot so handlers may subscribe or publish re-entrantly.
        let handlers: Vec<Handler> = self
            .handlers
            .borrow()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .borrow()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_to_matching_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = seen.clone();
        bus.subscribe(EventKind::Resize, move |event| {
            first.borrow_mut().push(format!("a:{}", event.name()));
        });
        let second = seen.clone();
        bus.subscribe(EventKind::Resize, move |event| {
            second.borrow_mut().push(format!("b:{}", event.name()));
        });
        let other = seen.clone();
        bus.subscribe(EventKind::Escape, move |_| {
            other.borrow_mut().push("escape".to_string());
        });

        let delivered = bus.publish(&AppEvent::Resize {
            width: 800,
            height: 600,
        });

        assert_eq!(delivered, 2);
        assert_eq!(*seen.borrow(), vec!["a:app:resize", "b:app:resize"]);
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(&AppEvent::Escape), 0);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let counter = count.clone();
        let sub = bus.subscribe(EventKind::Escape, move |_| *counter.borrow_mut() += 1);

        bus.publish(&AppEvent::Escape);
        bus.unsubscribe(sub);
        bus.publish(&AppEvent::Escape);

        assert_eq!(*count.borrow(), 1);
        assert_eq!(bus.subscriber_count(EventKind::Escape), 0);
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let bus = EventBus::new();
        let metrics = Rc::new(RefCell::new(0));

        let inner_bus = bus.clone();
        bus.subscribe(EventKind::Swipe, move |_| {
            inner_bus.publish(&AppEvent::PerformanceMetric {
                name: "swipe".into(),
                value: 1.0,
            });
        });
        let counter = metrics.clone();
        bus.subscribe(EventKind::PerformanceMetric, move |_| {
            *counter.borrow_mut() += 1
        });

        bus.publish(&AppEvent::Swipe {
            direction: SwipeDirection::Left,
        });
        assert_eq!(*metrics.borrow(), 1);
    }

    #[test]
    fn detail_carries_form_identity() {
        let event = AppEvent::FormError {
            form_id: "contact".into(),
            message: "boom".into(),
        };
        assert_eq!(event.name(), "form:error");
        assert_eq!(event.detail()["formId"], "contact");
        assert_eq!(event.detail()["error"], "boom");
    }
}
