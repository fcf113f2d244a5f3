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

//! In-memory catalog of nodes, services, actions and events.
//!
//! The registry exclusively owns the four catalogs. All mutations run
//! under a single write lock held by the broker, so every change driven
//! by an INFO / HEARTBEAT / DISCONNECT packet is applied atomically
//! across the catalogs.

pub use self::{
    actions::{ActionCatalog, ActionEndpoint, ActionEntry, SelectError, SelectOptions},
    events::{EventCatalog, EventEndpoint},
    nodes::{InfoOutcome, Node, NodeCatalog},
    services::{ServiceCatalog, ServiceEntry, ServiceKey},
};

pub mod actions;
pub mod events;
pub mod nodes;
pub mod services;

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    breaker::BreakerConfig,
    packets::InfoPayload,
    service::{ServiceDescriptor, ServiceInfo},
    strategy::StrategyFactory,
};

/// Name prefix of internal actions and events.
pub const INTERNAL_PREFIX: &str = "$node.";

/// The broker's view of the cluster.
#[derive(Debug)]
pub struct Registry {
    nodes: NodeCatalog,
    services: ServiceCatalog,
    actions: ActionCatalog,
    events: EventCatalog,
    breaker_config: BreakerConfig,
}

impl Registry {
    /// Creates a registry seeded with the local node entry.
    pub fn new(
        local_node: Node,
        strategy_factory: StrategyFactory,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            nodes: NodeCatalog::new(local_node),
            services: ServiceCatalog::default(),
            actions: ActionCatalog::new(strategy_factory),
            events: EventCatalog::new(strategy_factory),
            breaker_config,
        }
    }

    /// Id of the local node.
    pub fn local_node_id(&self) -> &str {
        self.nodes.local_id()
    }

    /// The node catalog.
    pub fn nodes(&self) -> &NodeCatalog {
        &self.nodes
    }

    /// Circuit breaker tuning shared by all endpoints.
    pub fn breaker_config(&self) -> &BreakerConfig {
        &self.breaker_config
    }

    /// Registers a service hosted by the local node, wiring handler
    /// references into its endpoints.
    pub fn register_local_service(&mut self, descriptor: &ServiceDescriptor) {
        let node_id = self.nodes.local_id().to_owned();
        let info = descriptor.info(false);
        let key = ServiceKey::of(&info, &node_id);

        for action in descriptor.actions.values() {
            self.actions.upsert_endpoint(
                &node_id,
                key.clone(),
                action.info.clone(),
                true,
                Some(Arc::clone(&action.handler)),
            );
        }
        for event in descriptor.events.values() {
            self.events.upsert_endpoint(
                &node_id,
                key.clone(),
                event.info.clone(),
                true,
                Some(Arc::clone(&event.handler)),
            );
        }
        self.services.upsert(ServiceEntry {
            key,
            info,
            local: true,
        });
        debug!("Registered local service `{}`", descriptor.full_name());
    }

    /// Processes an INFO packet: upserts the node entry and reconciles
    /// its announced service list.
    pub fn process_info(&mut self, payload: &InfoPayload) -> InfoOutcome {
        let outcome = self.nodes.process_info(payload);
        if outcome.is_new {
            info!("Node `{}` connected", payload.sender);
        } else if outcome.reconnected {
            info!("Node `{}` reconnected", payload.sender);
        }
        self.register_services(&payload.sender, &payload.services);
        outcome
    }

    /// Idempotent reconcile of a node's services against a full snapshot.
    ///
    /// INFO packets always carry the complete picture, so the stored
    /// state is diffed against the snapshot instead of trusting deltas:
    /// services (and, within an updated service, actions and events)
    /// absent from the snapshot are unregistered.
    pub fn register_services(&mut self, node_id: &str, services: &[ServiceInfo]) {
        let local = node_id == self.nodes.local_id();
        let mut seen = BTreeSet::new();

        for incoming in services {
            let key = ServiceKey::of(incoming, node_id);
            seen.insert(key.clone());

            if let Some(existing) = self.services.get(&key).cloned() {
                // Drop actions and events that the new descriptor lost.
                for (short_name, old_action) in &existing.info.actions {
                    if !incoming.actions.contains_key(short_name) {
                        self.actions.remove_endpoint(&old_action.name, node_id);
                    }
                }
                for event_name in existing.info.events.keys() {
                    if !incoming.events.contains_key(event_name) {
                        self.events.remove_service(&key);
                        break;
                    }
                }
            }

            for action in incoming.actions.values() {
                self.actions
                    .upsert_endpoint(node_id, key.clone(), action.clone(), local, None);
            }
            for event in incoming.events.values() {
                self.events
                    .upsert_endpoint(node_id, key.clone(), event.clone(), local, None);
            }
            self.services.upsert(ServiceEntry {
                key,
                info: incoming.clone(),
                local,
            });
        }

        // Services of this node absent from the snapshot are gone.
        for key in self.services.keys_of_node(node_id) {
            if !seen.contains(&key) {
                self.unregister_service(&key);
            }
        }
    }

    fn unregister_service(&mut self, key: &ServiceKey) {
        if self.services.remove(key).is_some() {
            info!(
                "Unregistered service `{}` of node `{}`",
                key.full_name(),
                key.node_id
            );
        }
        self.actions.remove_service(key);
        self.events.remove_service(key);
    }

    /// Records a heartbeat. Returns `false` when the sender is unknown
    /// and a DISCOVER should be requested.
    pub fn heartbeat(&mut self, node_id: &str, cpu: f64) -> bool {
        self.nodes.heartbeat(node_id, cpu)
    }

    /// Marks a node disconnected and cascades: its services, action
    /// endpoints and event subscriptions are unregistered. The node entry
    /// itself is kept as a tombstone. Returns whether the node had been
    /// available.
    pub fn node_disconnected(&mut self, node_id: &str, unexpected: bool) -> bool {
        let was_available = self.nodes.mark_unavailable(node_id);
        if was_available {
            info!(
                "Node `{}` disconnected{}",
                node_id,
                if unexpected { " unexpectedly" } else { "" }
            );
        }
        for key in self.services.keys_of_node(node_id) {
            self.unregister_service(&key);
        }
        self.actions.remove_node(node_id);
        self.events.remove_node(node_id);
        was_available
    }

    /// Remote nodes whose heartbeat has been silent longer than the
    /// timeout.
    pub fn expired_nodes(&self, heartbeat_timeout_ms: u64) -> Vec<String> {
        self.nodes.expired(heartbeat_timeout_ms)
    }

    /// The action entry of a name, if known.
    pub fn get_action_endpoints(&self, action_name: &str) -> Option<&ActionEntry> {
        self.actions.get(action_name)
    }

    /// A specific endpoint of `(action, node)`.
    pub fn get_endpoint_by_node_id(
        &self,
        action_name: &str,
        node_id: &str,
    ) -> Option<Arc<ActionEndpoint>> {
        self.actions
            .get(action_name)?
            .get_endpoint_by_node_id(node_id)
            .cloned()
    }

    /// Selects an endpoint for a call (see the action catalog for the
    /// algorithm).
    pub fn select_endpoint(
        &self,
        action_name: &str,
        opts: &SelectOptions,
    ) -> Result<Arc<ActionEndpoint>, SelectError> {
        let nodes = &self.nodes;
        self.actions
            .select(action_name, opts, &self.breaker_config, |node_id| {
                nodes.is_available(node_id)
            })
    }

    /// The event catalog.
    pub fn events(&self) -> &EventCatalog {
        &self.events
    }

    /// The service catalog.
    pub fn services(&self) -> &ServiceCatalog {
        &self.services
    }

    /// Are all of the named services present on at least one available
    /// node? Names are full service names.
    pub fn services_available(&self, names: &[String]) -> bool {
        let nodes = &self.nodes;
        names.iter().all(|name| {
            self.services
                .has_available(name, |node_id| nodes.is_available(node_id))
        })
    }

    /// Wire forms of local services for an outgoing INFO packet.
    /// Protected actions never leave the node, so they are stripped here
    /// when the local service list is rebuilt from stored descriptors.
    pub fn local_service_infos(&self) -> Vec<ServiceInfo> {
        self.services
            .iter()
            .filter(|entry| entry.local)
            .map(|entry| {
                let mut info = entry.info.clone();
                info.actions.retain(|_, action| !action.protected);
                info
            })
            .collect()
    }

    /// Catalog projections (`$node.*` internal actions).
    pub fn list_nodes(&self) -> Vec<NodeView> {
        self.nodes
            .iter()
            .map(|node| NodeView {
                id: node.id.clone(),
                available: node.available,
                local: node.local,
                cpu: node.cpu_usage,
                last_heartbeat_at: node.last_heartbeat_at.to_rfc3339(),
                client: serde_json::to_value(&node.client).unwrap_or(Value::Null),
                uptime: node.uptime,
            })
            .collect()
    }

    /// Projection of the service catalog.
    pub fn list_services(&self, opts: &ListOptions) -> Vec<ServiceView> {
        self.services
            .iter()
            .filter(|entry| !opts.only_local || entry.local)
            .filter(|entry| !(opts.skip_internal && entry.key.name.starts_with('$')))
            .map(|entry| ServiceView {
                name: entry.key.name.clone(),
                version: entry.key.version.clone(),
                node_id: entry.key.node_id.clone(),
                available: self.nodes.is_available(&entry.key.node_id),
                actions: entry.info.actions.len(),
                events: entry.info.events.len(),
            })
            .collect()
    }

    /// Projection of the action catalog. Internal (`$node.*`) actions are
    /// skipped on request; protected actions are always hidden.
    pub fn list_actions(&self, opts: &ListOptions) -> Vec<ActionView> {
        self.actions
            .iter()
            .filter(|entry| !(opts.skip_internal && entry.name.starts_with(INTERNAL_PREFIX)))
            .filter_map(|entry| {
                let endpoints: Vec<_> = entry
                    .endpoints()
                    .iter()
                    .filter(|endpoint| !opts.only_local || endpoint.local)
                    .filter(|endpoint| !endpoint.action.protected)
                    .collect();
                if endpoints.is_empty() {
                    return None;
                }
                let available = endpoints
                    .iter()
                    .any(|endpoint| self.nodes.is_available(&endpoint.node_id));
                Some(ActionView {
                    name: entry.name.clone(),
                    available,
                    endpoints: if opts.with_endpoints {
                        Some(
                            endpoints
                                .iter()
                                .map(|endpoint| EndpointView {
                                    node_id: endpoint.node_id.clone(),
                                    state: format!("{:?}", endpoint.circuit_state()),
                                    available: self.nodes.is_available(&endpoint.node_id),
                                })
                                .collect(),
                        )
                    } else {
                        None
                    },
                })
            })
            .collect()
    }

    /// Projection of the event catalog.
    pub fn list_events(&self, opts: &ListOptions) -> Vec<EventView> {
        self.events
            .iter()
            .filter(|endpoint| !opts.only_local || endpoint.local)
            .filter(|endpoint| {
                !(opts.skip_internal && endpoint.event.name.starts_with(INTERNAL_PREFIX))
            })
            .map(|endpoint| EventView {
                name: endpoint.event.name.clone(),
                group: endpoint.group.clone(),
                service: endpoint.service.full_name(),
                node_id: endpoint.node_id.clone(),
            })
            .collect()
    }
}

/// Filter of the catalog projections.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct ListOptions {
    /// Keep only entries of the local node.
    #[serde(default)]
    pub only_local: bool,
    /// Hide internal (`$node.*`) entries.
    #[serde(default)]
    pub skip_internal: bool,
    /// Include per-endpoint details in action listings.
    #[serde(default)]
    pub with_endpoints: bool,
}

/// Projection of one node entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct NodeView {
    pub id: String,
    pub available: bool,
    pub local: bool,
    pub cpu: f64,
    pub last_heartbeat_at: String,
    pub client: Value,
    pub uptime: u64,
}

/// Projection of one service entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ServiceView {
    pub name: String,
    pub version: Option<String>,
    pub node_id: String,
    pub available: bool,
    pub actions: usize,
    pub events: usize,
}

/// Projection of one action entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ActionView {
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<EndpointView>>,
}

/// Projection of one action endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct EndpointView {
    pub node_id: String,
    pub state: String,
    pub available: bool,
}

/// Projection of one event subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct EventView {
    pub name: String,
    pub group: String,
    pub service: String,
    pub node_id: String,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        packets::{ClientInfo, InfoPayload, PROTOCOL_VERSION},
        service::{ActionInfo, EventInfo},
        strategy::RoundRobin,
    };

    fn client() -> ClientInfo {
        ClientInfo {
            client_type: "rust".to_owned(),
            version: "0.1.0".to_owned(),
            lang_version: "1.0".to_owned(),
        }
    }

    fn registry() -> Registry {
        Registry::new(
            Node::local("local", client(), vec![]),
            RoundRobin::factory,
            BreakerConfig::default(),
        )
    }

    fn service_info(name: &str, actions: &[&str], events: &[&str]) -> ServiceInfo {
        let actions: BTreeMap<String, ActionInfo> = actions
            .iter()
            .map(|short_name| {
                (
                    (*short_name).to_owned(),
                    ActionInfo {
                        name: format!("{}.{}", name, short_name),
                        cache: false,
                        params: None,
                        protected: false,
                    },
                )
            })
            .collect();
        let events: BTreeMap<String, EventInfo> = events
            .iter()
            .map(|event_name| {
                (
                    (*event_name).to_owned(),
                    EventInfo {
                        name: (*event_name).to_owned(),
                        group: None,
                    },
                )
            })
            .collect();
        ServiceInfo {
            name: name.to_owned(),
            version: None,
            settings: Value::Null,
            actions,
            events,
        }
    }

    fn info_packet(sender: &str, services: Vec<ServiceInfo>) -> InfoPayload {
        InfoPayload {
            ver: PROTOCOL_VERSION,
            sender: sender.to_owned(),
            services,
            ip_list: vec![],
            client: client(),
            config: Value::Null,
            uptime: 0,
        }
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut registry = registry();
        let services = vec![
            service_info("math", &["add", "sub"], &[]),
            service_info("mail", &["send"], &["user.created"]),
        ];

        registry.process_info(&info_packet("a", services.clone()));
        let first_services = registry.list_services(&ListOptions::default());
        let first_actions = registry.list_actions(&ListOptions {
            with_endpoints: true,
            ..ListOptions::default()
        });

        registry.process_info(&info_packet("a", services));
        let second_services = registry.list_services(&ListOptions::default());
        let second_actions = registry.list_actions(&ListOptions {
            with_endpoints: true,
            ..ListOptions::default()
        });

        assert_eq!(
            serde_json::to_value(&first_services).unwrap(),
            serde_json::to_value(&second_services).unwrap()
        );
        assert_eq!(
            serde_json::to_value(&first_actions).unwrap(),
            serde_json::to_value(&second_actions).unwrap()
        );
    }

    #[test]
    fn reconcile_removes_dropped_services() {
        let mut registry = registry();
        registry.process_info(&info_packet(
            "a",
            vec![
                service_info("s1", &["one"], &[]),
                service_info("s2", &["two"], &["evt"]),
            ],
        ));
        assert!(registry.get_action_endpoints("s2.two").is_some());

        registry.process_info(&info_packet("a", vec![service_info("s1", &["one"], &[])]));
        assert!(registry.get_action_endpoints("s2.two").is_none());
        assert!(registry.get_action_endpoints("s1.one").is_some());
        assert!(registry
            .events()
            .broadcast_snapshot("evt", |_| true)
            .is_empty());
    }

    #[test]
    fn reconcile_removes_dropped_actions_of_updated_service() {
        let mut registry = registry();
        registry.process_info(&info_packet("a", vec![service_info("math", &["add", "sub"], &[])]));
        registry.process_info(&info_packet("a", vec![service_info("math", &["add"], &[])]));

        assert!(registry.get_action_endpoints("math.add").is_some());
        assert!(registry.get_action_endpoints("math.sub").is_none());
    }

    #[test]
    fn disconnect_cascades_to_all_catalogs() {
        let mut registry = registry();
        registry.process_info(&info_packet(
            "a",
            vec![service_info("math", &["add"], &["evt"])],
        ));
        registry.process_info(&info_packet(
            "b",
            vec![service_info("math", &["add"], &[])],
        ));

        assert!(registry.node_disconnected("a", true));

        let entry = registry.get_action_endpoints("math.add").unwrap();
        assert!(entry.get_endpoint_by_node_id("a").is_none());
        assert!(entry.get_endpoint_by_node_id("b").is_some());
        assert!(registry
            .events()
            .broadcast_snapshot("evt", |_| true)
            .is_empty());
        // The node entry survives as a tombstone.
        assert!(registry.nodes().get("a").is_some());
        assert!(!registry.nodes().is_available("a"));
    }

    #[test]
    fn selection_fails_before_info_and_after_disconnect() {
        let mut registry = registry();
        assert_eq!(
            registry
                .select_endpoint("math.add", &SelectOptions::default())
                .unwrap_err(),
            SelectError::NotFound
        );

        registry.process_info(&info_packet("a", vec![service_info("math", &["add"], &[])]));
        assert!(registry
            .select_endpoint("math.add", &SelectOptions::default())
            .is_ok());

        registry.node_disconnected("a", false);
        assert_eq!(
            registry
                .select_endpoint("math.add", &SelectOptions::default())
                .unwrap_err(),
            SelectError::NotFound
        );
    }

    #[test]
    fn list_filters_hide_internal_and_protected() {
        let mut registry = registry();
        let mut internal = service_info("$node", &["list"], &[]);
        internal.actions.get_mut("list").unwrap().name = "$node.list".to_owned();
        let mut math = service_info("math", &["add", "secret"], &[]);
        math.actions.get_mut("secret").unwrap().protected = true;
        registry.process_info(&info_packet("a", vec![internal, math]));

        let all = registry.list_actions(&ListOptions::default());
        let names: Vec<_> = all.iter().map(|view| view.name.clone()).collect();
        assert!(names.contains(&"$node.list".to_owned()));
        assert!(names.contains(&"math.add".to_owned()));
        assert!(
            !names.contains(&"math.secret".to_owned()),
            "protected actions are always hidden"
        );

        let filtered = registry.list_actions(&ListOptions {
            skip_internal: true,
            ..ListOptions::default()
        });
        let names: Vec<_> = filtered.iter().map(|view| view.name.clone()).collect();
        assert_eq!(names, vec!["math.add".to_owned()]);
    }

    #[test]
    fn services_available_requires_a_live_node() {
        let mut registry = registry();
        registry.process_info(&info_packet("a", vec![service_info("math", &["add"], &[])]));
        assert!(registry.services_available(&["math".to_owned()]));
        assert!(!registry.services_available(&["math".to_owned(), "mail".to_owned()]));

        registry.node_disconnected("a", true);
        assert!(!registry.services_available(&["math".to_owned()]));
    }
}
