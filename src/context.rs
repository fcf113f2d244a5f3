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

//! Per-call record propagated along the call graph.
//!
//! A context is created for every call and every event delivery, local or
//! remote. All fields are fixed at construction except `meta`, which is a
//! shared mutable map: children receive the same map by reference, so meta
//! written anywhere in the call graph is visible everywhere in it.

use rand::Rng;
use serde_json::{Map, Value};

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{errors::BrokerError, packets::RequestPayload, Broker, CallOptions};

/// Shared meta map of a call graph.
pub type Meta = Arc<Mutex<Map<String, Value>>>;

/// Generates a random 128-bit hex id for contexts and requests.
pub(crate) fn random_id() -> String {
    let id: u128 = rand::thread_rng().gen();
    format!("{:032x}", id)
}

/// Per-call record. Cheap to clone; the broker handle and the meta map are
/// shared references.
#[derive(Clone)]
pub struct Context {
    broker: Broker,
    /// Unique id of this context.
    pub id: String,
    /// Name of the called action, or of the delivered event.
    pub action: String,
    /// Call parameters or event payload.
    pub params: Value,
    /// Shared meta map, propagated through the whole call graph.
    pub meta: Meta,
    /// Id of the root request; equal for every context in one call graph.
    pub request_id: String,
    /// Id of the spawning context, `None` for roots.
    pub parent_id: Option<String>,
    /// Depth in the call graph: 1 for roots.
    pub level: u32,
    /// Timeout budget for this call, in milliseconds.
    pub timeout: u64,
    /// How many times this call has been retried so far.
    pub retry_count: u32,
    /// Id of the node chosen to execute the call, once selection ran.
    pub node_id: Option<String>,
    /// Are metrics collected for this call graph?
    pub metrics: bool,
    /// Was the result served from the cacher?
    pub cached_result: bool,
}

impl fmt::Debug for Context {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Context")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("request_id", &self.request_id)
            .field("parent_id", &self.parent_id)
            .field("level", &self.level)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Context {
    /// Creates a root context for a user-initiated call.
    pub(crate) fn new_root(
        broker: Broker,
        action: impl Into<String>,
        params: Value,
        opts: &CallOptions,
    ) -> Self {
        let id = random_id();
        let meta = opts
            .meta
            .clone()
            .map(|map| Arc::new(Mutex::new(map)))
            .unwrap_or_default();
        Self {
            request_id: id.clone(),
            id,
            action: action.into(),
            params,
            meta,
            parent_id: None,
            level: 1,
            timeout: opts.timeout.unwrap_or_else(|| broker.request_timeout()),
            retry_count: 0,
            node_id: opts.node_id.clone(),
            metrics: broker.metrics_enabled(),
            cached_result: false,
            broker,
        }
    }

    /// Creates a child context spawned by `parent`.
    pub(crate) fn child_of(
        parent: &Self,
        action: impl Into<String>,
        params: Value,
        opts: &CallOptions,
    ) -> Self {
        Self {
            broker: parent.broker.clone(),
            id: random_id(),
            action: action.into(),
            params,
            meta: Arc::clone(&parent.meta),
            request_id: parent.request_id.clone(),
            parent_id: Some(parent.id.clone()),
            level: parent.level + 1,
            timeout: opts.timeout.unwrap_or(parent.timeout),
            retry_count: 0,
            node_id: opts.node_id.clone(),
            metrics: parent.metrics,
            cached_result: false,
        }
    }

    /// Materializes the context of an incoming remote request. The context
    /// keeps the id assigned by the caller, so the RESPONSE can echo it;
    /// the executor is the local node.
    pub(crate) fn for_remote_request(broker: Broker, payload: &RequestPayload) -> Self {
        let meta = match &payload.meta {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let executor = broker.node_id().to_owned();
        Self {
            broker,
            id: payload.id.clone(),
            action: payload.action.clone(),
            params: payload.params.clone(),
            meta: Arc::new(Mutex::new(meta)),
            request_id: payload.request_id.clone(),
            parent_id: payload.parent_id.clone(),
            level: payload.level,
            timeout: payload.timeout,
            retry_count: 0,
            node_id: Some(executor),
            metrics: payload.metrics,
            cached_result: false,
        }
    }

    /// Creates a context for an event delivery.
    pub(crate) fn for_event(broker: Broker, event: impl Into<String>, data: Value) -> Self {
        let id = random_id();
        let timeout = broker.request_timeout();
        let metrics = broker.metrics_enabled();
        Self {
            broker,
            request_id: id.clone(),
            id,
            action: event.into(),
            params: data,
            meta: Meta::default(),
            parent_id: None,
            level: 1,
            timeout,
            retry_count: 0,
            node_id: None,
            metrics,
            cached_result: false,
        }
    }

    /// The broker this context belongs to.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Calls an action as a child of this context.
    pub async fn call(&self, action: &str, params: Value) -> Result<Value, BrokerError> {
        self.call_with(action, params, CallOptions::default()).await
    }

    /// Calls an action as a child of this context with explicit options.
    pub async fn call_with(
        &self,
        action: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Value, BrokerError> {
        let child = Self::child_of(self, action, params, &opts);
        self.broker.dispatch_call(child, opts).await
    }

    /// Emits a group-balanced event from within this call graph.
    pub async fn emit(&self, event: &str, data: Value) -> Result<(), BrokerError> {
        self.broker.emit(event, data).await
    }

    /// Broadcasts an event to every subscriber endpoint.
    pub async fn broadcast(&self, event: &str, data: Value) -> Result<(), BrokerError> {
        self.broker.broadcast(event, data).await
    }

    /// Reads one key from the shared meta map.
    pub fn meta_get(&self, key: &str) -> Option<Value> {
        self.meta.lock().expect("meta lock poisoned").get(key).cloned()
    }

    /// Writes one key into the shared meta map. Visible to every context
    /// of the call graph, including ancestors.
    pub fn meta_set(&self, key: impl Into<String>, value: Value) {
        self.meta
            .lock()
            .expect("meta lock poisoned")
            .insert(key.into(), value);
    }

    /// Snapshot of the meta map as a JSON value, for the wire.
    pub(crate) fn meta_snapshot(&self) -> Value {
        Value::Object(self.meta.lock().expect("meta lock poisoned").clone())
    }
}
