//! Capability registry — process-wide mapping from capability name to
//! {active?, degraded?, provider}.
//!
//! Grounded on the original `capability.c`'s array-backed registry:
//! `register` upserts in place (a second registration wins, no
//! multi-provider set), `withdraw` on an unknown name is a no-op, and
//! a withdrawn entry remains in the registry (just inactive) rather
//! than being removed.

use crate::component::ComponentId;
use std::collections::HashMap;

/// Capacity bound mirroring the original's `MAX_CAPABILITIES`. Exceeding
/// it fails registration without being process-fatal.
pub const MAX_CAPABILITIES: usize = 4096;

#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub name: String,
    pub active: bool,
    pub degraded: bool,
    pub provider: Option<ComponentId>,
}

#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, CapabilityEntry>,
    // insertion order, for enumeration
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `name` active and records `provider`. Updates an existing
    /// entry in place; never creates a duplicate. Fails (returning
    /// false, logged by the caller) if the registry is at capacity and
    /// `name` is genuinely new.
    pub fn register(&mut self, name: &str, provider: ComponentId) -> bool {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.active = true;
            entry.provider = Some(provider);
            return true;
        }
        if self.entries.len() >= MAX_CAPABILITIES {
            tracing::error!(capability = name, "capability registry at capacity, registration refused");
            return false;
        }
        self.entries.insert(
            name.to_string(),
            CapabilityEntry {
                name: name.to_string(),
                active: true,
                degraded: false,
                provider: Some(provider),
            },
        );
        self.order.push(name.to_string());
        true
    }

    /// Clears `active` for `name`. The entry itself is retained. A
    /// no-op for unknown names.
    pub fn withdraw(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.active = false;
        }
    }

    /// Sets or clears the degraded flag. Degraded is purely
    /// informational and never inhibits dependents.
    pub fn mark_degraded(&mut self, name: &str, degraded: bool) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.degraded = degraded;
        }
    }

    /// True only for a known, currently-active capability. False for
    /// both unknown and withdrawn names.
    pub fn active(&self, name: &str) -> bool {
        self.entries.get(name).map(|e| e.active).unwrap_or(false)
    }

    pub fn degraded(&self, name: &str) -> bool {
        self.entries.get(name).map(|e| e.degraded).unwrap_or(false)
    }

    pub fn provider(&self, name: &str) -> Option<ComponentId> {
        self.entries.get(name).and_then(|e| e.provider)
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityEntry> {
        self.entries.get(name)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Enumerate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityEntry> {
        self.order.iter().filter_map(move |name| self.entries.get(name))
    }

    /// Names currently active, in insertion order.
    pub fn active_names(&self) -> Vec<String> {
        self.iter().filter(|e| e.active).map(|e| e.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_active_and_provider() {
        let mut reg = CapabilityRegistry::new();
        assert!(reg.register("net.online", ComponentId(1)));
        assert!(reg.active("net.online"));
        assert_eq!(reg.provider("net.online"), Some(ComponentId(1)));
    }

    #[test]
    fn second_register_replaces_provider_without_duplicate() {
        let mut reg = CapabilityRegistry::new();
        reg.register("net.online", ComponentId(1));
        reg.register("net.online", ComponentId(2));
        assert_eq!(reg.count(), 1);
        assert!(reg.active("net.online"));
        assert_eq!(reg.provider("net.online"), Some(ComponentId(2)));
    }

    #[test]
    fn withdraw_clears_active_but_keeps_entry() {
        let mut reg = CapabilityRegistry::new();
        reg.register("net.online", ComponentId(1));
        reg.withdraw("net.online");
        assert!(!reg.active("net.online"));
        assert_eq!(reg.count(), 1);
        // second withdraw is a no-op
        reg.withdraw("net.online");
        assert!(!reg.active("net.online"));
    }

    #[test]
    fn withdraw_unknown_is_noop() {
        let mut reg = CapabilityRegistry::new();
        reg.withdraw("nonexistent");
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn unknown_name_is_inactive() {
        let reg = CapabilityRegistry::new();
        assert!(!reg.active("nope"));
        assert_eq!(reg.provider("nope"), None);
    }

    #[test]
    fn degraded_never_clears_active() {
        let mut reg = CapabilityRegistry::new();
        reg.register("db.ready", ComponentId(3));
        reg.mark_degraded("db.ready", true);
        assert!(reg.active("db.ready"));
        assert!(reg.degraded("db.ready"));
    }

    #[test]
    fn enumeration_is_insertion_order() {
        let mut reg = CapabilityRegistry::new();
        reg.register("c", ComponentId(1));
        reg.register("a", ComponentId(2));
        reg.register("b", ComponentId(3));
        let names: Vec<_> = reg.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
