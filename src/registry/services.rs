// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Catalog of services indexed by `(name, version, node)`.

use std::collections::BTreeMap;

use crate::service::ServiceInfo;

/// Identity of a service instance on one node. Two services are the same
/// service iff `name` and `version` match; the `node_id` distinguishes
/// the hosting instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Service name.
    pub name: String,
    /// Optional service version.
    pub version: Option<String>,
    /// Hosting node.
    pub node_id: String,
}

impl ServiceKey {
    /// Builds the key of `info` as hosted on `node_id`.
    pub fn of(info: &ServiceInfo, node_id: &str) -> Self {
        Self {
            name: info.name.clone(),
            version: info.version.clone(),
            node_id: node_id.to_owned(),
        }
    }

    /// Full service name (`<version>.<name>` when versioned).
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{}.{}", version, self.name),
            None => self.name.clone(),
        }
    }
}

/// One registered service instance.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Identity of the instance.
    pub key: ServiceKey,
    /// Announced descriptor (settings, actions, events).
    pub info: ServiceInfo,
    /// Hosted by the local node?
    pub local: bool,
}

/// Storage of service entries. Mutation sequencing (reconcile, cascades)
/// is orchestrated by the registry; this type only guards the uniqueness
/// invariant: at most one entry per `(name, version, node)`.
#[derive(Debug, Default)]
pub struct ServiceCatalog {
    services: BTreeMap<ServiceKey, ServiceEntry>,
}

impl ServiceCatalog {
    /// Looks up an entry by key.
    pub fn get(&self, key: &ServiceKey) -> Option<&ServiceEntry> {
        self.services.get(key)
    }

    /// Inserts or replaces an entry. Returns the previous descriptor of
    /// the same `(name, version, node)`, if any.
    pub fn upsert(&mut self, entry: ServiceEntry) -> Option<ServiceEntry> {
        self.services.insert(entry.key.clone(), entry)
    }

    /// Removes an entry by key.
    pub fn remove(&mut self, key: &ServiceKey) -> Option<ServiceEntry> {
        self.services.remove(key)
    }

    /// Keys of every service hosted by the given node.
    pub fn keys_of_node(&self, node_id: &str) -> Vec<ServiceKey> {
        self.services
            .keys()
            .filter(|key| key.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.values()
    }

    /// Is at least one instance of the named service registered on an
    /// available node? `name` is the full service name.
    pub fn has_available(
        &self,
        full_name: &str,
        is_node_available: impl Fn(&str) -> bool,
    ) -> bool {
        self.services
            .values()
            .any(|entry| entry.key.full_name() == full_name && is_node_available(&entry.key.node_id))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn info(name: &str, version: Option<&str>) -> ServiceInfo {
        ServiceInfo {
            name: name.to_owned(),
            version: version.map(str::to_owned),
            settings: serde_json::Value::Null,
            actions: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    fn entry(name: &str, version: Option<&str>, node_id: &str) -> ServiceEntry {
        let info = info(name, version);
        ServiceEntry {
            key: ServiceKey::of(&info, node_id),
            info,
            local: false,
        }
    }

    #[test]
    fn one_entry_per_name_version_node() {
        let mut catalog = ServiceCatalog::default();
        assert!(catalog.upsert(entry("math", None, "a")).is_none());
        // Same identity replaces, not duplicates.
        assert!(catalog.upsert(entry("math", None, "a")).is_some());
        // Different version or node is a different entry.
        assert!(catalog.upsert(entry("math", Some("v2"), "a")).is_none());
        assert!(catalog.upsert(entry("math", None, "b")).is_none());
        assert_eq!(catalog.iter().count(), 3);
    }

    #[test]
    fn keys_of_node_filters_by_host() {
        let mut catalog = ServiceCatalog::default();
        catalog.upsert(entry("math", None, "a"));
        catalog.upsert(entry("mail", None, "a"));
        catalog.upsert(entry("math", None, "b"));

        let mut names: Vec<_> = catalog
            .keys_of_node("a")
            .into_iter()
            .map(|key| key.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["mail".to_owned(), "math".to_owned()]);
    }

    #[test]
    fn versioned_full_names() {
        let key = ServiceKey::of(&info("math", Some("v2")), "a");
        assert_eq!(key.full_name(), "v2.math");
        let key = ServiceKey::of(&info("math", None), "a");
        assert_eq!(key.full_name(), "math");
    }
}
