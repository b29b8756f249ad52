//! Broker client cache.
//!
//! Broker connections are keyed by credential and reused across runs. The
//! cache is an explicit service handed to whoever needs a connection,
//! create-or-get plus invalidate (for credential rotation), never ambient
//! global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::domain::error::AlphaloopError;
use crate::ports::broker_port::BrokerPort;

/// Builds a broker connection for a credential key.
pub type BrokerFactory =
    Box<dyn Fn(&str) -> Result<Arc<dyn BrokerPort>, AlphaloopError> + Send + Sync>;

pub struct ClientCache {
    factory: BrokerFactory,
    clients: Mutex<HashMap<String, Arc<dyn BrokerPort>>>,
}

impl ClientCache {
    pub fn new(factory: BrokerFactory) -> Self {
        ClientCache {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached client for `key`, building one if absent.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<dyn BrokerPort>, AlphaloopError> {
        let mut clients = self.clients.lock().expect("cache lock");
        if let Some(client) = clients.get(key) {
            return Ok(Arc::clone(client));
        }
        let client = (self.factory)(key)?;
        clients.insert(key.to_string(), Arc::clone(&client));
        info!(key, "broker client created");
        Ok(client)
    }

    /// Drop the cached client for `key`, e.g. after a credential change.
    /// Returns whether a client was cached.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self
            .clients
            .lock()
            .expect("cache lock")
            .remove(key)
            .is_some();
        if removed {
            info!(key, "broker client invalidated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.clients.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
