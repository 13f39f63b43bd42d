// Lorekeep Runtime — Event Bus
//
// In-process fan-out of domain events. Handlers are invoked synchronously
// on emit, in subscription order. Each event is size-capped: if the
// serialized event exceeds the cap, `data.metadata` is truncated first.
//
// The bus feeds the automation engine (event triggers) and anything else
// that registers a subscriber; emitters never learn who is listening.

use crate::atoms::constants::EVENT_SIZE_CAP_BYTES;
use crate::engine::types::BusEvent;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

type Handler = Box<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers run synchronously on emit in the order
    /// they were subscribed; long work should be spawned by the handler.
    pub fn subscribe(&self, handler: impl Fn(&BusEvent) + Send + Sync + 'static) {
        self.subscribers.lock().push(Box::new(handler));
    }

    /// Emit an event to all subscribers. The size cap is applied here so
    /// every subscriber sees the same (possibly truncated) payload.
    pub fn emit(&self, mut event: BusEvent) {
        enforce_size_cap(&mut event);
        let subscribers = self.subscribers.lock();
        for handler in subscribers.iter() {
            handler(&event);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Truncate `data.metadata` until the serialized event fits the cap.
/// Everything else in the payload is left intact.
fn enforce_size_cap(event: &mut BusEvent) {
    let size = serde_json::to_string(event).map(|s| s.len()).unwrap_or(0);
    if size <= EVENT_SIZE_CAP_BYTES {
        return;
    }
    let overflow = size - EVENT_SIZE_CAP_BYTES;
    if let Some(metadata) = event.data.get_mut("metadata") {
        if let Some(s) = metadata.as_str() {
            let keep = s.len().saturating_sub(overflow);
            let truncated = crate::engine::types::truncate_utf8(s, keep).to_string();
            *metadata = serde_json::Value::String(truncated);
            warn!(
                "[events] Event {} exceeded {}B cap — truncated data.metadata",
                event.kind.as_str(),
                EVENT_SIZE_CAP_BYTES
            );
            return;
        }
        // Non-string metadata is dropped wholesale on overflow.
        *metadata = serde_json::Value::Null;
        warn!(
            "[events] Event {} exceeded {}B cap — dropped non-string data.metadata",
            event.kind.as_str(),
            EVENT_SIZE_CAP_BYTES
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::BusEventKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(move |_| order.lock().push(i));
        }
        bus.emit(BusEvent {
            kind: BusEventKind::IntakeCreated,
            domain_id: None,
            data: json!({}),
        });
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(bus.subscriber_count(), 3);
    }

    #[test]
    fn oversized_metadata_is_truncated() {
        let bus = EventBus::new();
        let seen_size = Arc::new(AtomicUsize::new(0));
        let seen = seen_size.clone();
        bus.subscribe(move |e| {
            seen.store(serde_json::to_string(e).unwrap().len(), Ordering::SeqCst);
        });
        bus.emit(BusEvent {
            kind: BusEventKind::IntakeCreated,
            domain_id: Some("d1".into()),
            data: json!({"metadata": "x".repeat(64 * 1024), "title": "kept"}),
        });
        assert!(seen_size.load(Ordering::SeqCst) <= EVENT_SIZE_CAP_BYTES);
    }

    #[test]
    fn small_events_pass_untouched() {
        let bus = EventBus::new();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        bus.subscribe(move |e| *got2.lock() = Some(e.data.clone()));
        let data = json!({"metadata": "small", "id": 7});
        bus.emit(BusEvent {
            kind: BusEventKind::DeadlineApproaching,
            domain_id: Some("d1".into()),
            data: data.clone(),
        });
        assert_eq!(got.lock().clone().unwrap(), data);
    }
}
