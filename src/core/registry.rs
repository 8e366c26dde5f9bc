//! Registered servers and the capability catalog, updated together
//!
//! The registry lives behind one `RwLock` in the manager so a routing call
//! never sees a server without its catalog entries or the other way round.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::catalog::{self, CapabilityEntry, CapabilityKind, Catalog};
use crate::error::HubError;
use crate::lb::metrics::PeerMetrics;
use crate::pool::connection::PeerConnection;
use crate::pool::transport::{PeerCatalog, PeerDescriptor};

/// Runtime record of one registered server
pub struct PeerRecord {
    pub descriptor: Arc<PeerDescriptor>,
    pub connection: Arc<PeerConnection>,
    pub metrics: Arc<PeerMetrics>,
    /// Registration order
    pub seq: u64,
    pub added_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// A resolved capability and the servers that can serve it
pub struct Route {
    pub entry: CapabilityEntry,
    /// Owner first is not guaranteed; ordered by registration
    pub candidates: Vec<Arc<PeerRecord>>,
}

#[derive(Default)]
pub struct Registry {
    peers: HashMap<String, Arc<PeerRecord>>,
    catalog: Catalog,
    /// Names with a connection-limit reservation but not yet committed
    pending: HashSet<String>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a connection slot for `name` before connecting.
    ///
    /// Fails immediately when the name is taken or every slot is in use.
    pub fn reserve(&mut self, name: &str, limit: usize) -> Result<u64, HubError> {
        if self.peers.contains_key(name) || self.pending.contains(name) {
            return Err(HubError::DuplicateServer {
                server: name.to_string(),
            });
        }
        if self.peers.len() + self.pending.len() >= limit {
            return Err(HubError::ConnectionLimitExceeded {
                server: name.to_string(),
                limit,
            });
        }
        self.pending.insert(name.to_string());
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Give back a reservation that will not be committed
    pub fn release(&mut self, name: &str) {
        self.pending.remove(name);
    }

    /// Register a reserved server with its catalog. On conflict nothing is
    /// inserted and the reservation is released.
    pub fn commit(&mut self, record: Arc<PeerRecord>, catalog: &PeerCatalog) -> Result<usize, HubError> {
        let name = record.name().to_string();
        let entries = catalog::entries_for(&name, catalog);

        if let Err(e) = self.catalog.check_conflicts(&entries) {
            self.pending.remove(&name);
            return Err(e);
        }

        let count = entries.len();
        self.catalog.insert_all(entries);
        self.pending.remove(&name);
        self.peers.insert(name, record);
        Ok(count)
    }

    /// Remove a server and its catalog entries
    pub fn remove(&mut self, name: &str) -> Option<Arc<PeerRecord>> {
        let record = self.peers.remove(name)?;
        self.catalog.remove_server(name);
        Some(record)
    }

    /// Replace a server's catalog after it reconnected; returns skipped keys
    pub fn refresh_catalog(&mut self, name: &str, catalog: &PeerCatalog) -> Vec<String> {
        if !self.peers.contains_key(name) {
            return Vec::new();
        }
        let entries = catalog::entries_for(name, catalog);
        self.catalog.replace_server(name, entries)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PeerRecord>> {
        self.peers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// Servers in registration order
    pub fn records(&self) -> Vec<Arc<PeerRecord>> {
        let mut records: Vec<_> = self.peers.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn names(&self) -> Vec<String> {
        self.records().iter().map(|r| r.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Resolve a namespaced key to its owner plus every server in the
    /// owner's replica group that offers the same capability
    pub fn route(&self, kind: CapabilityKind, key: &str) -> Option<Route> {
        let entry = self.catalog.resolve(kind, key)?.clone();
        let owner = self.peers.get(&entry.server)?;

        let mut candidates = vec![Arc::clone(owner)];
        if let Some(group) = &owner.descriptor.replica_group {
            candidates.extend(
                self.peers
                    .values()
                    .filter(|p| p.name() != owner.name())
                    .filter(|p| p.descriptor.replica_group.as_ref() == Some(group))
                    .filter(|p| self.catalog.server_offers(p.name(), kind, &entry.name))
                    .cloned(),
            );
        }
        candidates.sort_by_key(|r| r.seq);

        Some(Route { entry, candidates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::pool::stdio::StdioConnector;
    use crate::pool::transport::ToolDescriptor;

    fn record(registry: &mut Registry, descriptor: PeerDescriptor) -> Arc<PeerRecord> {
        let seq = registry.reserve(&descriptor.name, 10).unwrap();
        let descriptor = Arc::new(descriptor);
        Arc::new(PeerRecord {
            connection: Arc::new(PeerConnection::new(
                descriptor.clone(),
                Arc::new(StdioConnector::default()),
                3,
                EventBus::new(4),
            )),
            descriptor,
            metrics: Arc::new(PeerMetrics::new()),
            seq,
            added_at: Utc::now(),
        })
    }

    fn tools(names: &[&str]) -> PeerCatalog {
        PeerCatalog {
            tools: names.iter().map(|n| ToolDescriptor::new(*n)).collect(),
            resources: Vec::new(),
        }
    }

    #[test]
    fn test_reservation_enforces_limit() {
        let mut registry = Registry::new();
        registry.reserve("a", 2).unwrap();
        registry.reserve("b", 2).unwrap();

        let err = registry.reserve("c", 2).unwrap_err();
        assert!(matches!(err, HubError::ConnectionLimitExceeded { limit: 2, .. }));

        registry.release("b");
        assert!(registry.reserve("c", 2).is_ok());
    }

    #[test]
    fn test_duplicate_name_rejected_while_pending() {
        let mut registry = Registry::new();
        registry.reserve("a", 5).unwrap();
        assert!(matches!(
            registry.reserve("a", 5),
            Err(HubError::DuplicateServer { .. })
        ));
    }

    #[test]
    fn test_commit_and_remove() {
        let mut registry = Registry::new();
        let a = record(&mut registry, PeerDescriptor::new("a", "cmd"));
        assert_eq!(registry.commit(a, &tools(&["x", "y"])).unwrap(), 2);
        assert_eq!(registry.catalog().tools().len(), 2);

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.catalog().is_empty());
    }

    #[test]
    fn test_conflicting_commit_leaves_no_trace() {
        let mut registry = Registry::new();
        let a = record(&mut registry, PeerDescriptor::new("a", "cmd"));
        registry.commit(a, &tools(&["b__c"])).unwrap();

        let ab = record(&mut registry, PeerDescriptor::new("a__b", "cmd"));
        let err = registry.commit(ab, &tools(&["c", "d"])).unwrap_err();
        assert!(matches!(err, HubError::CapabilityConflict { .. }));

        assert!(!registry.contains("a__b"));
        assert!(registry.catalog().keys_for("a__b").is_empty());
        // Reservation was released
        assert!(registry.reserve("a__b", 10).is_ok());
    }

    #[test]
    fn test_route_includes_replicas() {
        let mut registry = Registry::new();
        let a = record(&mut registry, PeerDescriptor::new("a", "cmd").with_replica_group("search"));
        let b = record(&mut registry, PeerDescriptor::new("b", "cmd").with_replica_group("search"));
        let c = record(&mut registry, PeerDescriptor::new("c", "cmd").with_replica_group("search"));
        let d = record(&mut registry, PeerDescriptor::new("d", "cmd"));
        registry.commit(a, &tools(&["query"])).unwrap();
        registry.commit(b, &tools(&["query"])).unwrap();
        registry.commit(c, &tools(&["other"])).unwrap();
        registry.commit(d, &tools(&["query"])).unwrap();

        let route = registry.route(CapabilityKind::Tool, "b__query").unwrap();
        let names: Vec<_> = route.candidates.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(route.entry.server, "b");

        let route = registry.route(CapabilityKind::Tool, "d__query").unwrap();
        assert_eq!(route.candidates.len(), 1);

        assert!(registry.route(CapabilityKind::Tool, "nope").is_none());
    }
}
