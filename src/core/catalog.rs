//! Aggregated capability catalog
//!
//! Every tool and resource a server advertises is exposed under
//! `<server>__<name>`. A key has exactly one owner; registrations that would
//! reuse a key are rejected instead of overwriting it.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use crate::error::HubError;
use crate::pool::transport::PeerCatalog;

/// Separator between the server name and the capability name
pub const NAMESPACE_SEPARATOR: &str = "__";

pub fn namespaced(server: &str, capability: &str) -> String {
    format!("{server}{NAMESPACE_SEPARATOR}{capability}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
}

/// One namespaced catalog entry
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityEntry {
    /// Namespaced key callers use
    pub key: String,
    /// Owning server
    pub server: String,
    /// Name (tool) or URI (resource) as the server knows it
    pub name: String,
    pub kind: CapabilityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool input schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Build the namespaced entries for one server's catalog.
///
/// Names the server lists twice are kept once.
pub fn entries_for(server: &str, catalog: &PeerCatalog) -> Vec<CapabilityEntry> {
    let mut seen: HashSet<(CapabilityKind, String)> = HashSet::new();
    let mut entries = Vec::with_capacity(catalog.tools.len() + catalog.resources.len());

    for tool in &catalog.tools {
        let key = namespaced(server, &tool.name);
        if !seen.insert((CapabilityKind::Tool, key.clone())) {
            warn!(server = %server, tool = %tool.name, "Server lists tool twice, ignoring duplicate");
            continue;
        }
        entries.push(CapabilityEntry {
            key,
            server: server.to_string(),
            name: tool.name.clone(),
            kind: CapabilityKind::Tool,
            description: (!tool.description.is_empty()).then(|| tool.description.clone()),
            schema: (!tool.input_schema.is_null()).then(|| tool.input_schema.clone()),
            mime_type: None,
        });
    }

    for resource in &catalog.resources {
        let key = namespaced(server, &resource.uri);
        if !seen.insert((CapabilityKind::Resource, key.clone())) {
            warn!(server = %server, uri = %resource.uri, "Server lists resource twice, ignoring duplicate");
            continue;
        }
        entries.push(CapabilityEntry {
            key,
            server: server.to_string(),
            name: resource.uri.clone(),
            kind: CapabilityKind::Resource,
            description: resource.description.clone(),
            schema: None,
            mime_type: resource.mime_type.clone(),
        });
    }

    entries
}

/// Namespaced tools and resources of every registered server
#[derive(Debug, Default)]
pub struct Catalog {
    tools: BTreeMap<String, CapabilityEntry>,
    resources: BTreeMap<String, CapabilityEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: CapabilityKind) -> &BTreeMap<String, CapabilityEntry> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
        }
    }

    fn map_mut(&mut self, kind: CapabilityKind) -> &mut BTreeMap<String, CapabilityEntry> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
        }
    }

    /// First entry whose key is already owned by another server
    pub fn check_conflicts(&self, entries: &[CapabilityEntry]) -> Result<(), HubError> {
        for entry in entries {
            if let Some(existing) = self.map(entry.kind).get(&entry.key) {
                if existing.server != entry.server {
                    return Err(HubError::CapabilityConflict {
                        key: entry.key.clone(),
                        server: entry.server.clone(),
                        owner: existing.server.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Insert entries after [`check_conflicts`](Self::check_conflicts) passed
    pub fn insert_all(&mut self, entries: Vec<CapabilityEntry>) {
        for entry in entries {
            self.map_mut(entry.kind).insert(entry.key.clone(), entry);
        }
    }

    /// Replace one server's entries. Entries that collide with another
    /// server are skipped; their keys are returned.
    pub fn replace_server(&mut self, server: &str, entries: Vec<CapabilityEntry>) -> Vec<String> {
        self.remove_server(server);

        let mut skipped = Vec::new();
        for entry in entries {
            let map = self.map_mut(entry.kind);
            match map.get(&entry.key) {
                Some(existing) if existing.server != server => {
                    warn!(
                        server = %server,
                        key = %entry.key,
                        owner = %existing.server,
                        "Capability collides with another server, skipping"
                    );
                    skipped.push(entry.key);
                }
                _ => {
                    map.insert(entry.key.clone(), entry);
                }
            }
        }
        skipped
    }

    /// Remove every entry owned by `server`; returns how many were removed
    pub fn remove_server(&mut self, server: &str) -> usize {
        let before = self.tools.len() + self.resources.len();
        self.tools.retain(|_, e| e.server != server);
        self.resources.retain(|_, e| e.server != server);
        before - (self.tools.len() + self.resources.len())
    }

    pub fn resolve(&self, kind: CapabilityKind, key: &str) -> Option<&CapabilityEntry> {
        self.map(kind).get(key)
    }

    /// Whether `server` advertises `name` (un-namespaced)
    pub fn server_offers(&self, server: &str, kind: CapabilityKind, name: &str) -> bool {
        self.map(kind)
            .get(&namespaced(server, name))
            .map(|e| e.server == server && e.name == name)
            .unwrap_or(false)
    }

    /// Tools sorted by key
    pub fn tools(&self) -> Vec<CapabilityEntry> {
        self.tools.values().cloned().collect()
    }

    /// Resources sorted by key
    pub fn resources(&self) -> Vec<CapabilityEntry> {
        self.resources.values().cloned().collect()
    }

    pub fn keys_for(&self, server: &str) -> Vec<String> {
        self.tools
            .values()
            .chain(self.resources.values())
            .filter(|e| e.server == server)
            .map(|e| e.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
