//! Handlers for commands the engine does not interpret itself.

use crate::peer::PeerId;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for one command. Returns `false` to ask for the peer's disconnection.
pub type MessageHandler = Arc<dyn Fn(PeerId, &Bytes) -> bool + Send + Sync>;

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// The handler rejected the message.
    Rejected,
    /// Nobody registered for the command.
    Unhandled,
}

#[derive(Default)]
pub struct MessageHandlerRegistry {
    handlers: RwLock<HashMap<String, MessageHandler>>,
}

impl MessageHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`, replacing any previous one.
    pub fn register<F>(&self, command: &str, handler: F)
    where
        F: Fn(PeerId, &Bytes) -> bool + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(command.to_string(), Arc::new(handler));
    }

    pub fn unregister(&self, command: &str) -> bool {
        self.handlers.write().remove(command).is_some()
    }

    pub fn dispatch(&self, peer: PeerId, command: &str, payload: &Bytes) -> DispatchOutcome {
        let handler = self.handlers.read().get(command).cloned();
        match handler {
            Some(handler) if handler(peer, payload) => DispatchOutcome::Handled,
            Some(_) => DispatchOutcome::Rejected,
            None => DispatchOutcome::Unhandled,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        let mut out: Vec<_> = self.handlers.read().keys().cloned().collect();
        out.sort();
        out
    }
}
