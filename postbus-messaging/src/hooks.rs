//! Bus lifecycle hooks.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::metadata::Metadata;

/// A message confirmed by the broker.
#[derive(Debug, Clone)]
pub struct ProducedMessage {
    pub message_type: String,
    pub message_id: String,
    pub correlation_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub metadata: Metadata,
}

/// A delivery whose handlers all succeeded.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub message_type: String,
    pub message_id: String,
    pub correlation_id: String,
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub metadata: Metadata,
}

pub type ProducedHook = Arc<dyn Fn(&ProducedMessage) + Send + Sync>;
pub type ConsumedHook = Arc<dyn Fn(&ConsumedMessage) + Send + Sync>;

/// Hook registry shared by a bus, its producer and its consumers.
#[derive(Default)]
pub struct Hooks {
    produced: RwLock<Vec<ProducedHook>>,
    consumed: RwLock<Vec<ConsumedHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_produced<F>(&self, hook: F)
    where
        F: Fn(&ProducedMessage) + Send + Sync + 'static,
    {
        self.produced.write().push(Arc::new(hook));
    }

    pub fn on_consumed<F>(&self, hook: F)
    where
        F: Fn(&ConsumedMessage) + Send + Sync + 'static,
    {
        self.consumed.write().push(Arc::new(hook));
    }

    pub(crate) fn fire_produced(&self, message: &ProducedMessage) {
        // Snapshot so a hook may register further hooks.
        let hooks = self.produced.read().clone();
        for hook in hooks {
            hook(message);
        }
    }

    pub(crate) fn fire_consumed(&self, message: &ConsumedMessage) {
        let hooks = self.consumed.read().clone();
        for hook in hooks {
            hook(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_fire_in_registration_order() {
        let hooks = Hooks::new();
        let seen = Arc::new(RwLock::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            hooks.on_produced(move |m| seen.write().push(format!("{}:{}", i, m.message_type)));
        }

        hooks.fire_produced(&ProducedMessage {
            message_type: "Order".into(),
            message_id: "1".into(),
            correlation_id: "c".into(),
            exchange: "order".into(),
            routing_key: "order".into(),
            metadata: Metadata::new(),
        });

        assert_eq!(*seen.read(), vec!["0:Order", "1:Order", "2:Order"]);
    }

    #[test]
    fn test_consumed_hooks_are_separate() {
        let hooks = Hooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        hooks.on_consumed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hooks.fire_consumed(&ConsumedMessage {
            message_type: "Order".into(),
            message_id: "1".into(),
            correlation_id: String::new(),
            queue: "order_queue".into(),
            delivery_tag: 1,
            redelivered: false,
            metadata: Metadata::new(),
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
