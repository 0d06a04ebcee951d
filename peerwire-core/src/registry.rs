//! Protocol handler registry: one handler per protocol id, invoked once per
//! inbound message.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::identity::PeerId;
use crate::protocol::ProtocolId;

/// One inbound message, delivered to a handler exactly once.
#[derive(Debug)]
pub struct Inbound {
    pub peer: PeerId,
    pub protocol: ProtocolId,
    pub payload: Vec<u8>,
}

/// Handler invoked from the owning session's read loop, one call per message.
pub type Handler = Arc<dyn Fn(Inbound) + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<ProtocolId, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Duplicate registration fails; the first handler wins.
    pub fn register(&self, id: ProtocolId, handler: Handler) -> Result<(), RegistryError> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateProtocol(id));
        }
        entries.insert(id, handler);
        Ok(())
    }

    /// Convenience wrapper for plain closures.
    pub fn register_fn<F>(&self, id: ProtocolId, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Inbound) + Send + Sync + 'static,
    {
        self.register(id, Arc::new(f))
    }

    pub fn lookup(&self, id: &ProtocolId) -> Option<Handler> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for protocol {0}")]
    DuplicateProtocol(ProtocolId),
}
