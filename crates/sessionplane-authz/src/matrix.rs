use serde::Serialize;
use std::collections::BTreeMap;

/// Allowed actions on one resource kind, per domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionMatrix {
    pub resource: String,
    pub domains: BTreeMap<String, BTreeMap<String, bool>>,
}

impl PermissionMatrix {
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            domains: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, domain: &str, action: &str, allowed: bool) {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .insert(action.to_string(), allowed);
    }

    /// Unknown domains and actions are denied.
    pub fn allows(&self, domain: &str, action: &str) -> bool {
        self.domains
            .get(domain)
            .and_then(|actions| actions.get(action))
            .copied()
            .unwrap_or(false)
    }

    /// Domains where at least one action is allowed.
    pub fn accessible_domains(&self) -> Vec<&str> {
        self.domains
            .iter()
            .filter(|(_, actions)| actions.values().any(|allowed| *allowed))
            .map(|(domain, _)| domain.as_str())
            .collect()
    }
}
