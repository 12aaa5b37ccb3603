use std::collections::HashMap;

use tracing::warn;

use relay_protocol::{Channel, LogEntry};

/// Token identifying one registered handler; removes exactly that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type Handler = Box<dyn FnMut(&LogEntry) -> anyhow::Result<()> + Send>;

struct Registration {
    id: u64,
    once: bool,
    handler: Handler,
}

/// Process-local demultiplexer: dispatches an ordered event sequence to
/// channel-typed handlers. Holds no session state and performs no I/O;
/// one per consumer is cheap. A failing handler is logged and never
/// blocks delivery to the others or to subsequent events.
pub struct EventRouter {
    handlers: HashMap<Channel, Vec<Registration>>,
    next_id: u64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Register a handler for a channel.
    pub fn on<F>(&mut self, channel: Channel, handler: F) -> HandlerId
    where
        F: FnMut(&LogEntry) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(channel, false, Box::new(handler))
    }

    /// Register a handler that removes itself after its first invocation.
    pub fn once<F>(&mut self, channel: Channel, handler: F) -> HandlerId
    where
        F: FnMut(&LogEntry) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(channel, true, Box::new(handler))
    }

    fn register(&mut self, channel: Channel, once: bool, handler: Handler) -> HandlerId {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers
            .entry(channel)
            .or_default()
            .push(Registration { id, once, handler });
        HandlerId(id)
    }

    /// Remove one handler. Returns false when it was already gone.
    pub fn off(&mut self, channel: Channel, id: HandlerId) -> bool {
        match self.handlers.get_mut(&channel) {
            Some(list) => {
                let before = list.len();
                list.retain(|r| r.id != id.0);
                list.len() != before
            }
            None => false,
        }
    }

    /// Remove every handler for one channel.
    pub fn clear_channel(&mut self, channel: Channel) {
        self.handlers.remove(&channel);
    }

    /// Remove every handler on every channel.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self, channel: Channel) -> usize {
        self.handlers.get(&channel).map_or(0, Vec::len)
    }

    /// Dispatch one entry to every handler registered for its channel.
    /// Handler failures are isolated: logged, then dispatch continues.
    pub fn route(&mut self, entry: &LogEntry) {
        let Some(list) = self.handlers.get_mut(&entry.channel) else {
            return;
        };

        let mut fired_once = Vec::new();
        for registration in list.iter_mut() {
            if let Err(err) = (registration.handler)(entry) {
                warn!(
                    channel = ?entry.channel,
                    offset = entry.offset,
                    error = %err,
                    "event handler failed"
                );
            }
            if registration.once {
                fired_once.push(registration.id);
            }
        }
        if !fired_once.is_empty() {
            list.retain(|r| !fired_once.contains(&r.id));
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
