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

//! Catalog of known cluster nodes and their liveness.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use std::collections::BTreeMap;

use crate::packets::{ClientInfo, InfoPayload};

/// One known node of the cluster: the local one, or a peer learned about
/// through its INFO packet.
#[derive(Debug, Clone)]
pub struct Node {
    /// Cluster-unique node id.
    pub id: String,
    /// Is the node currently believed alive?
    pub available: bool,
    /// Is this the entry of the local node?
    pub local: bool,
    /// When the last heartbeat from this node arrived.
    pub last_heartbeat_at: DateTime<Utc>,
    /// CPU usage reported by the last heartbeat, percent.
    pub cpu_usage: f64,
    /// IP addresses announced by the node.
    pub ip_list: Vec<String>,
    /// Client software of the node.
    pub client: ClientInfo,
    /// Seconds the node had been running when it last announced itself.
    pub uptime: u64,
    /// Configuration snapshot announced by the node.
    pub config: Value,
    /// Set when the node went unavailable; cleared on reconnect.
    pub offline_since: Option<DateTime<Utc>>,
}

impl Node {
    /// Creates the entry of the local node.
    pub fn local(id: impl Into<String>, client: ClientInfo, ip_list: Vec<String>) -> Self {
        Self {
            id: id.into(),
            available: true,
            local: true,
            last_heartbeat_at: Utc::now(),
            cpu_usage: 0.0,
            ip_list,
            client,
            uptime: 0,
            config: Value::Null,
            offline_since: None,
        }
    }

    fn from_info(payload: &InfoPayload) -> Self {
        Self {
            id: payload.sender.clone(),
            available: true,
            local: false,
            last_heartbeat_at: Utc::now(),
            cpu_usage: 0.0,
            ip_list: payload.ip_list.clone(),
            client: payload.client.clone(),
            uptime: payload.uptime,
            config: payload.config.clone(),
            offline_since: None,
        }
    }
}

/// Outcome of processing an INFO packet against the node catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoOutcome {
    /// The sender was not known before.
    pub is_new: bool,
    /// The sender was known but unavailable, and is available again.
    pub reconnected: bool,
}

/// Maps node ids to node entries.
///
/// Entries of departed nodes are kept with `available = false` as
/// tombstones: a late packet from a gone node must not recreate it as a
/// fresh entry with empty state.
#[derive(Debug)]
pub struct NodeCatalog {
    nodes: BTreeMap<String, Node>,
    local_id: String,
}

impl NodeCatalog {
    /// Creates the catalog seeded with the local node entry.
    pub fn new(local_node: Node) -> Self {
        let local_id = local_node.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(local_id.clone(), local_node);
        Self { nodes, local_id }
    }

    /// Id of the local node.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The local node entry.
    pub fn local(&self) -> &Node {
        &self.nodes[&self.local_id]
    }

    /// Mutable access to the local node entry.
    pub fn local_mut(&mut self) -> &mut Node {
        self.nodes
            .get_mut(&self.local_id)
            .expect("local node entry always exists")
    }

    /// Looks up a node by id.
    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Is the node known and currently available?
    pub fn is_available(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).map_or(false, |node| node.available)
    }

    /// Iterates over all known nodes.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Upserts a peer entry from its INFO packet.
    pub fn process_info(&mut self, payload: &InfoPayload) -> InfoOutcome {
        match self.nodes.get_mut(&payload.sender) {
            None => {
                self.nodes
                    .insert(payload.sender.clone(), Node::from_info(payload));
                InfoOutcome {
                    is_new: true,
                    reconnected: false,
                }
            }
            Some(node) => {
                let reconnected = !node.available;
                node.available = true;
                node.last_heartbeat_at = Utc::now();
                node.ip_list = payload.ip_list.clone();
                node.client = payload.client.clone();
                node.uptime = payload.uptime;
                node.config = payload.config.clone();
                node.offline_since = None;
                InfoOutcome {
                    is_new: false,
                    reconnected,
                }
            }
        }
    }

    /// Records a heartbeat. Returns `false` for an unknown sender, in
    /// which case the caller should request a DISCOVER.
    pub fn heartbeat(&mut self, node_id: &str, cpu: f64) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.available = true;
                node.offline_since = None;
                node.cpu_usage = cpu;
                node.last_heartbeat_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Marks a node unavailable, keeping the entry as a tombstone.
    /// Returns whether the node had been available.
    pub fn mark_unavailable(&mut self, node_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                let was_available = node.available;
                node.available = false;
                if was_available {
                    node.offline_since = Some(Utc::now());
                }
                was_available
            }
            None => false,
        }
    }

    /// Removes a node entry entirely. Only explicit unregistration uses
    /// this; disconnects go through [`Self::mark_unavailable`].
    pub fn remove(&mut self, node_id: &str) -> Option<Node> {
        if node_id == self.local_id {
            return None;
        }
        self.nodes.remove(node_id)
    }

    /// Ids of remote nodes whose last heartbeat is older than the given
    /// timeout.
    pub fn expired(&self, heartbeat_timeout_ms: u64) -> Vec<String> {
        let deadline = Utc::now() - Duration::milliseconds(heartbeat_timeout_ms as i64);
        self.nodes
            .values()
            .filter(|node| !node.local && node.available && node.last_heartbeat_at < deadline)
            .map(|node| node.id.clone())
            .collect()
    }
}
