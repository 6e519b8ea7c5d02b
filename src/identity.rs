//! Identity records
//!
//! An identity is one logical client. Several connections (tabs, devices)
//! that `init` with the same name share a single record, and therefore a
//! single topic membership.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::debug;

use crate::connection::Connection;

/// Server-side state for one logical client
#[derive(Debug)]
pub struct IdentityRecord {
    /// Empty for anonymous, private records
    name: String,
    state: RwLock<IdentityState>,
}

#[derive(Debug)]
struct IdentityState {
    connections: Vec<Arc<dyn Connection>>,
    topics: HashSet<String>,
    initialized: bool,
    /// Set once the last connection is released; never merged into again
    retired: bool,
}

impl IdentityRecord {
    fn new(name: String, connection: Arc<dyn Connection>) -> Self {
        Self {
            name,
            state: RwLock::new(IdentityState {
                connections: vec![connection],
                topics: HashSet::new(),
                initialized: false,
                retired: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    fn mark_initialized(&self) {
        self.state.write().initialized = true;
    }

    pub fn is_retired(&self) -> bool {
        self.state.read().retired
    }

    /// Snapshot of the attached connections
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.state.read().connections.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Attach another connection. Returns false if the record is retired.
    fn attach(&self, connection: Arc<dyn Connection>) -> bool {
        let mut state = self.state.write();
        if state.retired {
            return false;
        }
        if !state.connections.iter().any(|c| c.key() == connection.key()) {
            state.connections.push(connection);
        }
        true
    }

    /// Detach a connection and return how many remain.
    ///
    /// Reaching zero retires the record.
    pub fn release(&self, key: &str) -> usize {
        let mut state = self.state.write();
        state.connections.retain(|c| c.key() != key);
        if state.connections.is_empty() {
            state.retired = true;
        }
        state.connections.len()
    }

    /// Drop connections whose sends failed. Does not retire the record.
    pub fn prune(&self, dead: &[String]) {
        let mut state = self.state.write();
        state
            .connections
            .retain(|c| !dead.iter().any(|key| key == c.key()));
    }

    /// Snapshot of the subscribed topics
    pub fn topics(&self) -> Vec<String> {
        self.state.read().topics.iter().cloned().collect()
    }

    /// Record a topic membership. Refused once the record is retired, so a
    /// subscribe that loses the race with the last disconnect is dropped.
    pub fn join_topic(&self, topic: &str) -> bool {
        let mut state = self.state.write();
        if state.retired {
            return false;
        }
        state.topics.insert(topic.to_string());
        true
    }

    pub fn remove_topic(&self, topic: &str) -> bool {
        self.state.write().topics.remove(topic)
    }
}

/// Connection key → record and identity name → record indexes
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_connection: DashMap<String, Arc<IdentityRecord>>,
    by_name: DashMap<String, Arc<IdentityRecord>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record owning a connection, if it has sent `init`
    pub fn lookup(&self, key: &str) -> Option<Arc<IdentityRecord>> {
        self.by_connection.get(key).map(|entry| entry.value().clone())
    }

    pub fn is_initialized(&self, key: &str) -> bool {
        self.lookup(key).is_some_and(|record| record.is_initialized())
    }

    /// Live record registered under `name`
    pub fn by_name(&self, name: &str) -> Option<Arc<IdentityRecord>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Establish the identity of a connection.
    ///
    /// A second `init` on an initialized connection is a no-op. A non-empty
    /// name joins the live record of that name if one exists; an empty name
    /// gets a private record.
    pub fn init(&self, connection: &Arc<dyn Connection>, name: &str) -> Arc<IdentityRecord> {
        let key = connection.key();

        if let Some(existing) = self.lookup(key)
            && existing.is_initialized()
        {
            debug!(conn = %key, identity = %existing.name(), "connection already initialized");
            return existing;
        }

        let record = if name.is_empty() {
            debug!(conn = %key, "anonymous identity created");
            Arc::new(IdentityRecord::new(String::new(), connection.clone()))
        } else {
            match self.by_name.entry(name.to_string()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().attach(connection.clone()) {
                        debug!(conn = %key, identity = %name, "connection joined identity");
                        entry.get().clone()
                    } else {
                        let fresh = Arc::new(IdentityRecord::new(
                            name.to_string(),
                            connection.clone(),
                        ));
                        entry.insert(fresh.clone());
                        debug!(conn = %key, identity = %name, "replaced retired identity");
                        fresh
                    }
                }
                Entry::Vacant(entry) => {
                    let fresh = Arc::new(IdentityRecord::new(name.to_string(), connection.clone()));
                    entry.insert(fresh.clone());
                    debug!(conn = %key, identity = %name, "identity created");
                    fresh
                }
            }
        };

        record.mark_initialized();
        self.by_connection.insert(key.to_string(), record.clone());
        record
    }

    /// Drop the name index entry, unless it already points at a newer record
    pub fn forget_name(&self, record: &Arc<IdentityRecord>) {
        if record.name().is_empty() {
            return;
        }
        if self
            .by_name
            .remove_if(record.name(), |_, current| Arc::ptr_eq(current, record))
            .is_some()
        {
            debug!(identity = %record.name(), "identity removed");
        }
    }

    pub fn forget_connection(&self, key: &str) {
        self.by_connection.remove(key);
    }

    /// Number of initialized connections
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    /// Number of live named identities
    pub fn identity_count(&self) -> usize {
        self.by_name.len()
    }
}
