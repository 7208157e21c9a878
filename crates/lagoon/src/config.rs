//! Cache configuration: per-type keying functions, the interface
//! implementation map, and resource limits. Validation is fatal at setup.

use fxhash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::error::ConfigError;
use crate::record::RecordKey;

/// Keying function for one `__typename`: extract a stable id from a response
/// object, or `None` when the object is unidentifiable.
pub type KeyFn = Box<dyn Fn(&Value) -> Option<String>>;

/// Bounded-resource limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Capacity of each per-plan materialized-result LRU.
    pub materialize_lru: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            materialize_lru: 512,
        }
    }
}

#[derive(Default)]
pub struct CacheConfig {
    keys: FxHashMap<String, KeyFn>,
    interfaces: FxHashMap<String, Vec<String>>,
    /// Interface name to the transitive set of concrete implementations.
    resolved: FxHashMap<String, FxHashSet<String>>,
    limits: Limits,
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("interfaces", &self.interfaces)
            .field("resolved", &self.resolved)
            .field("limits", &self.limits)
            .finish()
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keying function for a type. Types without a registered
    /// function fall back to their `id` field.
    pub fn key(mut self, typename: impl Into<String>, f: impl Fn(&Value) -> Option<String> + 'static) -> Self {
        self.keys.insert(typename.into(), Box::new(f));
        self
    }

    /// Declare the implementations of an interface. Entries may name other
    /// interfaces; the map is flattened transitively during validation.
    pub fn interface<I, S>(mut self, interface: impl Into<String>, implementations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.insert(
            interface.into(),
            implementations.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn materialize_lru(mut self, capacity: usize) -> Self {
        self.limits.materialize_lru = capacity;
        self
    }

    /// Validate and finish the configuration. Cyclic or self-referential
    /// interface maps, keying functions registered for interface names, and
    /// zero capacities are all setup bugs.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.limits.materialize_lru == 0 {
            return Err(ConfigError::ZeroLruCapacity);
        }
        for typename in self.keys.keys() {
            if typename.is_empty() {
                return Err(ConfigError::EmptyTypeName);
            }
            if self.interfaces.contains_key(typename) {
                return Err(ConfigError::KeyedInterface {
                    typename: typename.clone(),
                });
            }
        }

        let mut resolved: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for interface in self.interfaces.keys() {
            let mut out = FxHashSet::default();
            let mut path = Vec::new();
            self.flatten(interface, &mut out, &mut path)?;
            resolved.insert(interface.clone(), out);
        }
        self.resolved = resolved;
        Ok(self)
    }

    fn flatten(
        &self,
        interface: &str,
        out: &mut FxHashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        if path.iter().any(|seen| seen == interface) {
            return Err(ConfigError::CyclicInterface {
                interface: interface.to_string(),
            });
        }
        path.push(interface.to_string());
        for implementation in self.interfaces.get(interface).into_iter().flatten() {
            if self.interfaces.contains_key(implementation) {
                self.flatten(implementation, out, path)?;
            } else {
                out.insert(implementation.clone());
            }
        }
        path.pop();
        Ok(())
    }

    /// Identify a response object: `__typename` plus the configured (or
    /// default `id`) keying function.
    pub fn identify(&self, object: &Value) -> Option<RecordKey> {
        let map = object.as_object()?;
        let typename = map.get("__typename")?.as_str()?;

        let id = match self.keys.get(typename) {
            Some(key_fn) => key_fn(object)?,
            None => match map.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            },
        };
        Some(RecordKey::entity(typename, &id))
    }

    /// Whether a record typename satisfies a type condition, directly or via
    /// the flattened interface map.
    pub fn matches_type(&self, condition: &str, typename: &str) -> bool {
        if condition == typename {
            return true;
        }
        self.resolved
            .get(condition)
            .is_some_and(|impls| impls.contains(typename))
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Type names with registered keying functions, sorted.
    pub fn key_typenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keys.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Interface names with their flattened implementations, sorted.
    pub fn interface_summary(&self) -> Vec<(String, Vec<String>)> {
        let mut out: Vec<(String, Vec<String>)> = self
            .resolved
            .iter()
            .map(|(interface, impls)| {
                let mut impls: Vec<String> = impls.iter().cloned().collect();
                impls.sort_unstable();
                (interface.clone(), impls)
            })
            .collect();
        out.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        out
    }
}
