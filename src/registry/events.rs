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

//! Catalog of event subscriptions.
//!
//! Each service subscribing to an event contributes one endpoint per
//! hosting node, tagged with its consumer group (the service name unless
//! overridden). Balanced delivery picks one endpoint per group; broadcast
//! reaches every endpoint.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use crate::{
    registry::services::ServiceKey,
    service::{EventHandler, EventInfo},
    strategy::{Candidate, Strategy, StrategyFactory},
};

/// One subscriber of one event on one node.
pub struct EventEndpoint {
    /// Hosting node.
    pub node_id: String,
    /// Owning service instance.
    pub service: ServiceKey,
    /// Announced subscription descriptor.
    pub event: EventInfo,
    /// Consumer group: `event.group` or the full service name.
    pub group: String,
    /// Hosted by the local node?
    pub local: bool,
    /// Handler reference; `None` for remote endpoints.
    pub handler: Option<EventHandler>,
}

impl fmt::Debug for EventEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EventEndpoint")
            .field("node_id", &self.node_id)
            .field("event", &self.event.name)
            .field("group", &self.group)
            .field("local", &self.local)
            .finish()
    }
}

/// Subscribers of one event within one consumer group, with the strategy
/// that balances deliveries among them.
struct EventGroup {
    endpoints: Vec<Arc<EventEndpoint>>,
    strategy: Box<dyn Strategy>,
}

impl fmt::Debug for EventGroup {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EventGroup")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// All subscribers of one event name, partitioned into consumer groups.
#[derive(Debug, Default)]
pub struct EventEntry {
    groups: BTreeMap<String, EventGroup>,
}

/// Catalog of event subscriptions across the cluster.
#[derive(Debug)]
pub struct EventCatalog {
    entries: BTreeMap<String, EventEntry>,
    strategy_factory: StrategyFactory,
}

impl EventCatalog {
    /// Creates an empty catalog; groups instantiate their strategy from
    /// the factory.
    pub fn new(strategy_factory: StrategyFactory) -> Self {
        Self {
            entries: BTreeMap::new(),
            strategy_factory,
        }
    }

    /// Adds or replaces the subscription of `(event, service, node)`.
    pub fn upsert_endpoint(
        &mut self,
        node_id: &str,
        service: ServiceKey,
        event: EventInfo,
        local: bool,
        handler: Option<EventHandler>,
    ) {
        let group = event
            .group
            .clone()
            .unwrap_or_else(|| service.full_name());
        let endpoint = Arc::new(EventEndpoint {
            node_id: node_id.to_owned(),
            service: service.clone(),
            group: group.clone(),
            local,
            handler,
            event: event.clone(),
        });

        let factory = self.strategy_factory;
        let entry = self.entries.entry(event.name.clone()).or_default();
        let slot = entry.groups.entry(group).or_insert_with(|| EventGroup {
            endpoints: Vec::new(),
            strategy: factory(),
        });
        match slot
            .endpoints
            .iter_mut()
            .find(|existing| existing.service == endpoint.service)
        {
            Some(existing) => *existing = endpoint,
            None => slot.endpoints.push(endpoint),
        }
    }

    /// Removes every subscription owned by the given service instance.
    pub fn remove_service(&mut self, key: &ServiceKey) {
        self.entries.retain(|_, entry| {
            entry.groups.retain(|_, group| {
                group.endpoints.retain(|endpoint| endpoint.service != *key);
                !group.endpoints.is_empty()
            });
            !entry.groups.is_empty()
        });
    }

    /// Removes every subscription hosted by the given node.
    pub fn remove_node(&mut self, node_id: &str) {
        self.entries.retain(|_, entry| {
            entry.groups.retain(|_, group| {
                group.endpoints.retain(|endpoint| endpoint.node_id != node_id);
                !group.endpoints.is_empty()
            });
            !entry.groups.is_empty()
        });
    }

    /// Snapshot for a group-balanced emit: one endpoint per consumer
    /// group, chosen by the group strategy among endpoints on available
    /// nodes.
    pub fn balanced_snapshot(
        &self,
        event_name: &str,
        is_node_available: impl Fn(&str) -> bool,
    ) -> Vec<Arc<EventEndpoint>> {
        let entry = match self.entries.get(event_name) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let mut chosen = Vec::new();
        for group in entry.groups.values() {
            let available: Vec<&Arc<EventEndpoint>> = group
                .endpoints
                .iter()
                .filter(|endpoint| is_node_available(&endpoint.node_id))
                .collect();
            let candidates: Vec<Candidate<'_>> = available
                .iter()
                .map(|endpoint| Candidate {
                    node_id: &endpoint.node_id,
                    local: endpoint.local,
                })
                .collect();
            if let Some(index) = group.strategy.select(&candidates) {
                chosen.push(Arc::clone(available[index]));
            }
        }
        chosen
    }

    /// Snapshot for a broadcast: every subscriber endpoint on an
    /// available node.
    pub fn broadcast_snapshot(
        &self,
        event_name: &str,
        is_node_available: impl Fn(&str) -> bool,
    ) -> Vec<Arc<EventEndpoint>> {
        let entry = match self.entries.get(event_name) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        entry
            .groups
            .values()
            .flat_map(|group| group.endpoints.iter())
            .filter(|endpoint| is_node_available(&endpoint.node_id))
            .cloned()
            .collect()
    }

    /// Snapshot of local subscribers, optionally restricted to the given
    /// consumer groups. Used to deliver incoming EVENT packets and the
    /// `*_local` emit variants.
    pub fn local_snapshot(
        &self,
        event_name: &str,
        groups: Option<&[String]>,
    ) -> Vec<Arc<EventEndpoint>> {
        let entry = match self.entries.get(event_name) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        entry
            .groups
            .iter()
            .filter(|(group_name, _)| {
                groups.map_or(true, |wanted| wanted.iter().any(|g| &g == group_name))
            })
            .flat_map(|(_, group)| group.endpoints.iter())
            .filter(|endpoint| endpoint.local)
            .cloned()
            .collect()
    }

    /// Iterates over `(event name, group, endpoint)` of every
    /// subscription; used by catalog listings.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventEndpoint>> {
        self.entries
            .values()
            .flat_map(|entry| entry.groups.values())
            .flat_map(|group| group.endpoints.iter())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::collections::HashSet;

    use super::*;
    use crate::strategy::RoundRobin;

    fn key(service: &str, node_id: &str) -> ServiceKey {
        ServiceKey {
            name: service.to_owned(),
            version: None,
            node_id: node_id.to_owned(),
        }
    }

    fn subscription(event: &str, group: Option<&str>) -> EventInfo {
        EventInfo {
            name: event.to_owned(),
            group: group.map(str::to_owned),
        }
    }

    fn all_available(_node: &str) -> bool {
        true
    }

    /// `consumer` on nodes a and b, `audit` on node c, all subscribed to
    /// `user.created`.
    fn sample_catalog() -> EventCatalog {
        let mut catalog = EventCatalog::new(RoundRobin::factory);
        for node in &["a", "b"] {
            catalog.upsert_endpoint(
                node,
                key("consumer", node),
                subscription("user.created", None),
                false,
                None,
            );
        }
        catalog.upsert_endpoint(
            "c",
            key("audit", "c"),
            subscription("user.created", None),
            false,
            None,
        );
        catalog
    }

    #[test]
    fn group_defaults_to_the_service_name() {
        let catalog = sample_catalog();
        let groups: HashSet<String> = catalog
            .iter()
            .map(|endpoint| endpoint.group.clone())
            .collect();
        let expected: HashSet<String> = vec!["consumer".to_owned(), "audit".to_owned()]
            .into_iter()
            .collect();
        assert_eq!(groups, expected);
    }

    #[test]
    fn balanced_emit_picks_one_endpoint_per_group() {
        let catalog = sample_catalog();
        let chosen = catalog.balanced_snapshot("user.created", all_available);
        assert_eq!(chosen.len(), 2);

        let audit: Vec<_> = chosen
            .iter()
            .filter(|endpoint| endpoint.group == "audit")
            .collect();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].node_id, "c");

        let consumer: Vec<_> = chosen
            .iter()
            .filter(|endpoint| endpoint.group == "consumer")
            .collect();
        assert_eq!(consumer.len(), 1);
        assert!(consumer[0].node_id == "a" || consumer[0].node_id == "b");
    }

    #[test]
    fn balanced_emit_rotates_within_a_group() {
        let catalog = sample_catalog();
        let mut consumer_nodes = HashSet::new();
        for _ in 0..2 {
            for endpoint in catalog.balanced_snapshot("user.created", all_available) {
                if endpoint.group == "consumer" {
                    consumer_nodes.insert(endpoint.node_id.clone());
                }
            }
        }
        assert_eq!(consumer_nodes.len(), 2, "both instances take turns");
    }

    #[test]
    fn broadcast_reaches_every_subscriber() {
        let catalog = sample_catalog();
        let all = catalog.broadcast_snapshot("user.created", all_available);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn unavailable_nodes_are_skipped() {
        let catalog = sample_catalog();
        let chosen = catalog.balanced_snapshot("user.created", |node| node != "c");
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].group, "consumer");
    }

    #[test]
    fn local_snapshot_filters_by_group() {
        let mut catalog = sample_catalog();
        catalog.upsert_endpoint(
            "local",
            key("consumer", "local"),
            subscription("user.created", None),
            true,
            None,
        );
        catalog.upsert_endpoint(
            "local",
            key("audit", "local"),
            subscription("user.created", None),
            true,
            None,
        );

        let all_local = catalog.local_snapshot("user.created", None);
        assert_eq!(all_local.len(), 2);

        let wanted = vec!["audit".to_owned()];
        let filtered = catalog.local_snapshot("user.created", Some(&wanted));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].service.name, "audit");
    }

    #[test]
    fn removing_a_node_drops_its_subscriptions() {
        let mut catalog = sample_catalog();
        catalog.remove_node("a");
        catalog.remove_node("c");
        let remaining: Vec<_> = catalog
            .iter()
            .map(|endpoint| endpoint.node_id.clone())
            .collect();
        assert_eq!(remaining, vec!["b".to_owned()]);
    }
}
