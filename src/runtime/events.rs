use tracing::debug;

/// Lifecycle events emitted synchronously by a process instance. `End` fires
/// once when the instance reaches a terminal status, completed or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    Before { task: usize, name: String },
    After { task: usize, name: String },
    End,
}

pub type EventListener = Box<dyn Fn(&InstanceEvent) + Send + Sync>;

/// Per-instance observer set. Delivery is synchronous and in registration
/// order; listeners must not call back into the instance.
pub(crate) struct Listeners {
    subscribers: Vec<EventListener>,
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, listener: EventListener) {
        self.subscribers.push(listener);
    }

    pub fn emit(&self, instance_id: u64, event: &InstanceEvent) {
        debug!(instance_id, ?event, "instance event");
        for subscriber in &self.subscribers {
            subscriber(event);
        }
    }
}
