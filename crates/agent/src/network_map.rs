// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! C10: a keyed map over per-network component instances (§9 design
//! note). Keys are `networkIdentifier` strings (`eip155:<chainId>`);
//! insertion rejects duplicates, and per-key lookups fail loudly rather
//! than silently skipping an unconfigured network.

use std::collections::HashMap;

/// A naive map from protocol network identifier to one component
/// instance. Unlike a plain `HashMap`, inserting over an existing key is
/// an error instead of a silent overwrite.
pub struct NetworkMap<T> {
    inner: HashMap<String, T>,
}

impl<T> NetworkMap<T> {
    pub fn new() -> Self {
        Self { inner: HashMap::new() }
    }

    /// Registers `value` under `network_identifier`. Fails if the key is
    /// already taken, since two components for one network would race
    /// over the same database rows.
    pub fn insert(&mut self, network_identifier: impl Into<String>, value: T) -> anyhow::Result<()> {
        let key = network_identifier.into();
        if self.inner.contains_key(&key) {
            anyhow::bail!("duplicate protocol network identifier `{key}`");
        }
        self.inner.insert(key, value);
        Ok(())
    }

    pub fn get(&self, network_identifier: &str) -> anyhow::Result<&T> {
        self.inner
            .get(network_identifier)
            .ok_or_else(|| anyhow::anyhow!("no component registered for protocol network `{network_identifier}`"))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for NetworkMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_keys() {
        let mut map = NetworkMap::new();
        map.insert("eip155:1", 1).unwrap();
        assert!(map.insert("eip155:1", 2).is_err());
    }

    #[test]
    fn lookup_on_absent_key_fails() {
        let map: NetworkMap<u8> = NetworkMap::new();
        assert!(map.get("eip155:1").is_err());
    }

    #[test]
    fn lookup_on_present_key_succeeds() {
        let mut map = NetworkMap::new();
        map.insert("eip155:42161", "arbitrum").unwrap();
        assert_eq!(*map.get("eip155:42161").unwrap(), "arbitrum");
    }
}
