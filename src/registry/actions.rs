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

//! Catalog of action endpoints and the endpoint selection algorithm.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    breaker::{BreakerConfig, CircuitBreaker, CircuitState},
    registry::services::ServiceKey,
    service::{ActionHandler, ActionInfo},
    strategy::{Candidate, Strategy, StrategyFactory},
};

/// One callable instance of an action: the `(node, service, action)`
/// triple plus its circuit breaker.
///
/// The handler is populated for local endpoints only; a remote endpoint
/// is served by publishing a REQUEST packet to its node.
pub struct ActionEndpoint {
    /// Hosting node.
    pub node_id: String,
    /// Owning service instance.
    pub service: ServiceKey,
    /// Announced action descriptor.
    pub action: ActionInfo,
    /// Hosted by the local node?
    pub local: bool,
    /// Handler reference; `None` for remote endpoints.
    pub handler: Option<ActionHandler>,
    /// Failure state machine. Interior mutability: breaker transitions
    /// happen during selection and after call outcomes, both of which run
    /// without the registry write lock.
    pub breaker: Mutex<CircuitBreaker>,
}

impl fmt::Debug for ActionEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ActionEndpoint")
            .field("node_id", &self.node_id)
            .field("action", &self.action.name)
            .field("local", &self.local)
            .field("state", &self.circuit_state())
            .finish()
    }
}

impl ActionEndpoint {
    /// Current circuit state of this endpoint.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().expect("breaker lock poisoned").state()
    }

    /// Records a call outcome against the circuit breaker.
    pub fn record_outcome(&self, success: bool, config: &BreakerConfig) {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        if success {
            breaker.on_success();
        } else {
            breaker.on_failure(config);
        }
    }
}

/// All endpoints of one action name, plus the strategy instance choosing
/// among them.
pub struct ActionEntry {
    /// Full action name.
    pub name: String,
    endpoints: Vec<Arc<ActionEndpoint>>,
    strategy: Box<dyn Strategy>,
}

impl fmt::Debug for ActionEntry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ActionEntry")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl ActionEntry {
    /// All endpoints of the action, one per hosting node.
    pub fn endpoints(&self) -> &[Arc<ActionEndpoint>] {
        &self.endpoints
    }

    /// Endpoint hosted by the given node, if any.
    pub fn get_endpoint_by_node_id(&self, node_id: &str) -> Option<&Arc<ActionEndpoint>> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.node_id == node_id)
    }

    fn upsert_endpoint(&mut self, endpoint: Arc<ActionEndpoint>) {
        match self
            .endpoints
            .iter_mut()
            .find(|existing| existing.node_id == endpoint.node_id)
        {
            Some(slot) => *slot = endpoint,
            None => self.endpoints.push(endpoint),
        }
    }

    fn remove_node(&mut self, node_id: &str) {
        self.endpoints.retain(|endpoint| endpoint.node_id != node_id);
    }

    fn remove_service(&mut self, key: &ServiceKey) {
        self.endpoints.retain(|endpoint| endpoint.service != *key);
    }
}

/// Options of one endpoint selection.
#[derive(Debug, Default, Clone)]
pub struct SelectOptions {
    /// Pin the call to this node; selection fails if its endpoint is
    /// missing or unavailable.
    pub node_id: Option<String>,
    /// Prefer a local endpoint when one is available.
    pub prefer_local: bool,
    /// Skip this node (the endpoint that just failed, on retries).
    pub exclude_node: Option<String>,
}

/// Why selection produced no endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// No entry with the requested action name exists.
    NotFound,
    /// The entry exists, but the availability filter left nothing.
    NoAvailableEndpoint,
}

/// Secondary index over services: endpoints grouped by action name.
#[derive(Debug)]
pub struct ActionCatalog {
    entries: BTreeMap<String, ActionEntry>,
    strategy_factory: StrategyFactory,
}

impl ActionCatalog {
    /// Creates an empty catalog; entries instantiate their strategy from
    /// the factory.
    pub fn new(strategy_factory: StrategyFactory) -> Self {
        Self {
            entries: BTreeMap::new(),
            strategy_factory,
        }
    }

    /// The entry of an action name.
    pub fn get(&self, action_name: &str) -> Option<&ActionEntry> {
        self.entries.get(action_name)
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &ActionEntry> {
        self.entries.values()
    }

    /// Adds or replaces the endpoint of `(action, node)`. At most one
    /// endpoint per node exists under each action name.
    pub fn upsert_endpoint(
        &mut self,
        node_id: &str,
        service: ServiceKey,
        action: ActionInfo,
        local: bool,
        handler: Option<ActionHandler>,
    ) {
        let name = action.name.clone();
        let endpoint = Arc::new(ActionEndpoint {
            node_id: node_id.to_owned(),
            service,
            action,
            local,
            handler,
            breaker: Mutex::new(CircuitBreaker::default()),
        });
        let factory = self.strategy_factory;
        self.entries
            .entry(name.clone())
            .or_insert_with(|| ActionEntry {
                name,
                endpoints: Vec::new(),
                strategy: factory(),
            })
            .upsert_endpoint(endpoint);
    }

    /// Removes the endpoint of `(action, node)`.
    pub fn remove_endpoint(&mut self, action_name: &str, node_id: &str) {
        if let Some(entry) = self.entries.get_mut(action_name) {
            entry.remove_node(node_id);
            if entry.endpoints.is_empty() {
                self.entries.remove(action_name);
            }
        }
    }

    /// Removes every endpoint owned by the given service instance.
    pub fn remove_service(&mut self, key: &ServiceKey) {
        self.entries.retain(|_, entry| {
            entry.remove_service(key);
            !entry.endpoints.is_empty()
        });
    }

    /// Removes every endpoint hosted by the given node.
    pub fn remove_node(&mut self, node_id: &str) {
        self.entries.retain(|_, entry| {
            entry.remove_node(node_id);
            !entry.endpoints.is_empty()
        });
    }

    /// Selects one endpoint for a call.
    ///
    /// The availability filter admits endpoints whose node is available
    /// and whose circuit would admit a call; the chosen endpoint then
    /// acquires its breaker slot, so a half-open endpoint is probed by
    /// exactly one caller.
    pub fn select(
        &self,
        action_name: &str,
        opts: &SelectOptions,
        breaker_config: &BreakerConfig,
        is_node_available: impl Fn(&str) -> bool,
    ) -> Result<Arc<ActionEndpoint>, SelectError> {
        let entry = self.entries.get(action_name).ok_or(SelectError::NotFound)?;

        // A pinned call bypasses filtering and balancing entirely.
        if let Some(node_id) = &opts.node_id {
            let endpoint = entry
                .get_endpoint_by_node_id(node_id)
                .ok_or(SelectError::NoAvailableEndpoint)?;
            let admitted = is_node_available(node_id)
                && endpoint
                    .breaker
                    .lock()
                    .expect("breaker lock poisoned")
                    .try_acquire(breaker_config);
            return if admitted {
                Ok(Arc::clone(endpoint))
            } else {
                Err(SelectError::NoAvailableEndpoint)
            };
        }

        let mut available: Vec<&Arc<ActionEndpoint>> = entry
            .endpoints
            .iter()
            .filter(|endpoint| {
                opts.exclude_node.as_deref() != Some(endpoint.node_id.as_str())
                    && is_node_available(&endpoint.node_id)
                    && endpoint
                        .breaker
                        .lock()
                        .expect("breaker lock poisoned")
                        .would_admit(breaker_config)
            })
            .collect();

        // An excluded endpoint is still better than failing the call
        // outright when it is the only one left.
        if available.is_empty() && opts.exclude_node.is_some() {
            available = entry
                .endpoints
                .iter()
                .filter(|endpoint| {
                    is_node_available(&endpoint.node_id)
                        && endpoint
                            .breaker
                            .lock()
                            .expect("breaker lock poisoned")
                            .would_admit(breaker_config)
                })
                .collect();
        }

        while !available.is_empty() {
            let chosen = if opts.prefer_local {
                available.iter().position(|endpoint| endpoint.local)
            } else {
                None
            };
            let chosen = match chosen {
                Some(index) => index,
                None => {
                    let candidates: Vec<Candidate<'_>> = available
                        .iter()
                        .map(|endpoint| Candidate {
                            node_id: &endpoint.node_id,
                            local: endpoint.local,
                        })
                        .collect();
                    match entry.strategy.select(&candidates) {
                        Some(index) => index,
                        None => break,
                    }
                }
            };

            let endpoint = available.remove(chosen);
            // The acquire can lose a race for a half-open probe slot;
            // fall through to the remaining candidates when it does.
            if endpoint
                .breaker
                .lock()
                .expect("breaker lock poisoned")
                .try_acquire(breaker_config)
            {
                return Ok(Arc::clone(endpoint));
            }
        }
        Err(SelectError::NoAvailableEndpoint)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::collections::HashSet;

    use super::*;
    use crate::strategy::RoundRobin;

    fn key(node_id: &str) -> ServiceKey {
        ServiceKey {
            name: "math".to_owned(),
            version: None,
            node_id: node_id.to_owned(),
        }
    }

    fn action() -> ActionInfo {
        ActionInfo {
            name: "math.add".to_owned(),
            cache: false,
            params: None,
            protected: false,
        }
    }

    fn catalog_with(nodes: &[&str]) -> ActionCatalog {
        let mut catalog = ActionCatalog::new(RoundRobin::factory);
        for node in nodes {
            catalog.upsert_endpoint(node, key(node), action(), *node == "local", None);
        }
        catalog
    }

    fn all_available(_node: &str) -> bool {
        true
    }

    #[test]
    fn one_endpoint_per_node_per_action() {
        let mut catalog = catalog_with(&["a"]);
        catalog.upsert_endpoint("a", key("a"), action(), false, None);
        assert_eq!(catalog.get("math.add").unwrap().endpoints().len(), 1);
    }

    #[test]
    fn unknown_action_is_not_found() {
        let catalog = catalog_with(&["a"]);
        let err = catalog
            .select(
                "math.sub",
                &SelectOptions::default(),
                &BreakerConfig::default(),
                all_available,
            )
            .unwrap_err();
        assert_eq!(err, SelectError::NotFound);
    }

    #[test]
    fn filter_excludes_unavailable_nodes() {
        let catalog = catalog_with(&["a", "b"]);
        let result = catalog.select(
            "math.add",
            &SelectOptions::default(),
            &BreakerConfig::default(),
            |node| node == "b",
        );
        assert_eq!(result.unwrap().node_id, "b");

        let err = catalog
            .select(
                "math.add",
                &SelectOptions::default(),
                &BreakerConfig::default(),
                |_| false,
            )
            .unwrap_err();
        assert_eq!(err, SelectError::NoAvailableEndpoint);
    }

    #[test]
    fn pinned_node_must_be_present_and_available() {
        let catalog = catalog_with(&["a", "b"]);
        let opts = SelectOptions {
            node_id: Some("b".to_owned()),
            ..SelectOptions::default()
        };
        assert_eq!(
            catalog
                .select("math.add", &opts, &BreakerConfig::default(), all_available)
                .unwrap()
                .node_id,
            "b"
        );

        let opts = SelectOptions {
            node_id: Some("c".to_owned()),
            ..SelectOptions::default()
        };
        let err = catalog
            .select("math.add", &opts, &BreakerConfig::default(), all_available)
            .unwrap_err();
        assert_eq!(err, SelectError::NoAvailableEndpoint);
    }

    #[test]
    fn local_endpoint_wins_when_preferred() {
        let catalog = catalog_with(&["a", "local", "b"]);
        let opts = SelectOptions {
            prefer_local: true,
            ..SelectOptions::default()
        };
        for _ in 0..5 {
            let endpoint = catalog
                .select("math.add", &opts, &BreakerConfig::default(), all_available)
                .unwrap();
            assert_eq!(endpoint.node_id, "local");
        }
    }

    #[test]
    fn round_robin_rotates_across_nodes() {
        let catalog = catalog_with(&["a", "b", "c"]);
        let picked: HashSet<String> = (0..3)
            .map(|_| {
                catalog
                    .select(
                        "math.add",
                        &SelectOptions::default(),
                        &BreakerConfig::default(),
                        all_available,
                    )
                    .unwrap()
                    .node_id
                    .clone()
            })
            .collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn excluded_node_is_skipped_unless_it_is_the_only_one() {
        let catalog = catalog_with(&["a", "b"]);
        let opts = SelectOptions {
            exclude_node: Some("a".to_owned()),
            ..SelectOptions::default()
        };
        for _ in 0..3 {
            let endpoint = catalog
                .select("math.add", &opts, &BreakerConfig::default(), all_available)
                .unwrap();
            assert_eq!(endpoint.node_id, "b");
        }

        let sole = catalog_with(&["a"]);
        let endpoint = sole
            .select("math.add", &opts, &BreakerConfig::default(), all_available)
            .unwrap();
        assert_eq!(endpoint.node_id, "a");
    }

    #[test]
    fn open_circuit_removes_endpoint_from_selection() {
        let catalog = catalog_with(&["a"]);
        let config = BreakerConfig {
            max_failures: 1,
            ..BreakerConfig::default()
        };
        let endpoint = catalog
            .select(
                "math.add",
                &SelectOptions::default(),
                &config,
                all_available,
            )
            .unwrap();
        endpoint.record_outcome(false, &config);
        assert_eq!(endpoint.circuit_state(), CircuitState::Open);

        let err = catalog
            .select(
                "math.add",
                &SelectOptions::default(),
                &config,
                all_available,
            )
            .unwrap_err();
        assert_eq!(err, SelectError::NoAvailableEndpoint);
    }

    #[test]
    fn removing_a_service_drops_only_its_endpoints() {
        let mut catalog = catalog_with(&["a", "b"]);
        catalog.remove_service(&key("a"));
        let entry = catalog.get("math.add").unwrap();
        assert_eq!(entry.endpoints().len(), 1);
        assert_eq!(entry.endpoints()[0].node_id, "b");

        catalog.remove_service(&key("b"));
        assert!(catalog.get("math.add").is_none());
    }
}
