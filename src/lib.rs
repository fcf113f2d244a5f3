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

//! Process-embedded broker that hosts named services, exposes their
//! actions as callable remote procedures and transparently routes calls
//! and events across a cluster of peer brokers.
//!
//! # Overview
//!
//! - [`Broker`] is the runtime: it owns the registry of nodes, services,
//!   actions and events, the transit (packet plumbing over a pluggable
//!   [`Transport`]) and the middleware chain
//! - [`ServiceDescriptor`] describes a service contributed by user code:
//!   named actions, event subscriptions and lifecycle hooks
//! - [`Context`] is the per-call record propagated along the call graph
//! - Pluggables (transport, serializer, cacher, validator, strategy) are
//!   swapped through [`BrokerBuilder`]
//!
//! Brokers discover each other by broadcasting INFO packets describing
//! their hosted services, keep liveness with heartbeats, and call each
//! other's actions with per-call endpoint selection, circuit breaking and
//! retries.
//!
//! [`Transport`]: crate::transport::Transport

#![warn(
    missing_debug_implementations,
    missing_docs,
    unsafe_code,
    bare_trait_objects
)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub use crate::{
    breaker::BreakerConfig,
    context::Context,
    errors::BrokerError,
    service::{ServiceBuilder, ServiceDescriptor},
    transit::PingReport,
};

pub mod breaker;
pub mod cacher;
pub mod context;
pub mod errors;
pub mod middleware;
pub mod packets;
pub mod registry;
pub mod serializer;
pub mod service;
pub mod strategy;
pub mod transit;
pub mod transport;
pub mod validator;

mod internal;

use anyhow::ensure;
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::{Duration, Instant},
};

use crate::{
    cacher::{cache_key, Cacher},
    middleware::{compose, CallHandler, CallResult, Middleware},
    packets::{
        ClientInfo, DisconnectPayload, DiscoverPayload, HeartbeatPayload, InfoPayload, Packet,
        PacketKind, RequestPayload, PROTOCOL_VERSION,
    },
    registry::{ListOptions, Node, Registry, SelectError, SelectOptions},
    serializer::{JsonSerializer, Serializer},
    strategy::{RoundRobin, StrategyFactory},
    transit::Transit,
    transport::{Topic, Transport},
    validator::{check_params, Checker, SchemaValidator, Validator},
};

/// Configuration of a [`Broker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Cluster-unique id of this node. A random one is generated when
    /// not set.
    pub node_id: Option<String>,
    /// Default call timeout in milliseconds; `0` disables the timeout.
    pub request_timeout: u64,
    /// Default number of retries of retryable call failures.
    pub request_retry: u32,
    /// Interval between outgoing HEARTBEAT packets, milliseconds.
    pub heartbeat_interval: u64,
    /// A remote node silent for longer than this is considered
    /// disconnected, milliseconds.
    pub heartbeat_timeout: u64,
    /// Prefer a local endpoint during selection when one is available.
    pub prefer_local: bool,
    /// Collect metrics along the call graph. Propagated in contexts and
    /// REQUEST packets; the broker core itself only carries the flag.
    pub metrics: bool,
    /// Circuit breaker tuning shared by all endpoints.
    pub breaker: BreakerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            request_timeout: 5_000,
            request_retry: 0,
            heartbeat_interval: 5_000,
            heartbeat_timeout: 15_000,
            prefer_local: true,
            metrics: false,
            breaker: BreakerConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Checks the internal consistency of the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.heartbeat_interval > 0,
            "heartbeat_interval({}) must be strictly larger than 0",
            self.heartbeat_interval
        );
        ensure!(
            self.heartbeat_timeout > self.heartbeat_interval,
            "heartbeat_timeout({}) must be larger than heartbeat_interval({})",
            self.heartbeat_timeout,
            self.heartbeat_interval
        );
        ensure!(
            !self.breaker.enabled || self.breaker.max_failures > 0,
            "breaker.max_failures({}) must be strictly larger than 0",
            self.breaker.max_failures
        );
        Ok(())
    }
}

/// Options of a single call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Timeout of this call, milliseconds; `0` disables the timeout.
    pub timeout: Option<u64>,
    /// Retry budget of this call, overriding the config.
    pub retries: Option<u32>,
    /// Pin the call to this node.
    pub node_id: Option<String>,
    /// Initial meta map of the root context.
    pub meta: Option<Map<String, Value>>,
}

impl CallOptions {
    /// Options pinning the call to one node.
    pub fn on_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    /// Options with a custom timeout in milliseconds.
    pub fn with_timeout(timeout: u64) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

pub(crate) struct BrokerInner {
    config: BrokerConfig,
    node_id: String,
    registry: RwLock<Registry>,
    transit: Option<Arc<Transit>>,
    cacher: Option<Box<dyn Cacher>>,
    validator: Box<dyn Validator>,
    /// Compiled parameter checkers of local actions.
    checkers: Mutex<HashMap<String, Checker>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    /// Middleware chain around the dispatch handler, composed once.
    chain: Mutex<Option<CallHandler>>,
    /// Local service instances, in registration order.
    services: Mutex<Vec<ServiceDescriptor>>,
    started: AtomicBool,
    stopping: AtomicBool,
    started_at: Instant,
}

impl fmt::Debug for BrokerInner {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Broker")
            .field("node_id", &self.node_id)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// The broker runtime. Cheap to clone; clones share one node.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Assembles a [`Broker`] from configuration and pluggables.
///
/// Leaves are built first; cyclic references (broker ↔ transit) are
/// resolved by post-construction wiring inside [`Self::finish`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    transport: Option<Box<dyn Transport>>,
    serializer: Option<Box<dyn Serializer>>,
    cacher: Option<Box<dyn Cacher>>,
    validator: Box<dyn Validator>,
    strategy_factory: StrategyFactory,
    middlewares: Vec<Arc<dyn Middleware>>,
    services: Vec<ServiceDescriptor>,
}

impl fmt::Debug for BrokerBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BrokerBuilder")
            .field("config", &self.config)
            .field("transport", &self.transport.is_some())
            .field("services", &self.services.len())
            .finish()
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: BrokerConfig::default(),
            transport: None,
            serializer: None,
            cacher: None,
            validator: Box::new(SchemaValidator),
            strategy_factory: RoundRobin::factory,
            middlewares: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl BrokerBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broker configuration.
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the node id.
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.config.node_id = Some(node_id.into());
        self
    }

    /// Installs the transport adapter. Without one, the broker serves
    /// local calls only.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the serializer (JSON by default).
    pub fn serializer(mut self, serializer: Box<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Installs a cacher; without one, cacheable actions are not cached.
    pub fn cacher(mut self, cacher: Box<dyn Cacher>) -> Self {
        self.cacher = Some(cacher);
        self
    }

    /// Replaces the parameter validator.
    pub fn validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replaces the endpoint selection strategy.
    pub fn strategy(mut self, factory: StrategyFactory) -> Self {
        self.strategy_factory = factory;
        self
    }

    /// Appends a middleware. The first registered one is the outermost.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Adds a service registered during `start`.
    pub fn service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push(descriptor);
        self
    }

    /// Builds the broker and wires its parts together.
    pub fn finish(self) -> Broker {
        let node_id = self.config.node_id.clone().unwrap_or_else(|| {
            let suffix: u32 = rand::thread_rng().gen();
            format!("node-{:08x}", suffix)
        });
        let client = ClientInfo {
            client_type: "rust".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            lang_version: env!("CARGO_PKG_RUST_VERSION").to_owned(),
        };
        let registry = Registry::new(
            Node::local(node_id.clone(), client, Vec::new()),
            self.strategy_factory,
            self.config.breaker,
        );

        let transport = self.transport;
        let serializer = self.serializer;
        let transit = transport.map(|transport| {
            let serializer = serializer.unwrap_or_else(|| Box::new(JsonSerializer));
            Arc::new(Transit::new(node_id.clone(), transport, serializer))
        });

        let broker = Broker {
            inner: Arc::new(BrokerInner {
                config: self.config,
                node_id,
                registry: RwLock::new(registry),
                transit,
                cacher: self.cacher,
                validator: self.validator,
                checkers: Mutex::new(HashMap::new()),
                middlewares: self.middlewares,
                chain: Mutex::new(None),
                services: Mutex::new(self.services),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                started_at: Instant::now(),
            }),
        };
        if let Some(transit) = &broker.inner.transit {
            transit.bind(&broker);
        }
        broker
    }
}

impl Broker {
    /// Starts building a broker.
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<BrokerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<BrokerInner> {
        Arc::downgrade(&self.inner)
    }

    /// Id of the local node.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// The broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub(crate) fn request_timeout(&self) -> u64 {
        self.inner.config.request_timeout
    }

    pub(crate) fn metrics_enabled(&self) -> bool {
        self.inner.config.metrics
    }

    fn registry(&self) -> &RwLock<Registry> {
        &self.inner.registry
    }

    /// Starts the broker: registers queued services and the internal
    /// `$node` service, composes the middleware chain, connects the
    /// transit, announces the local node and begins the heartbeat loop.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.inner
            .config
            .validate()
            .map_err(|err| BrokerError::custom("ConfigError", err.to_string(), 500))?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Starting broker node `{}`", self.node_id());

        self.compose_chain();

        let mut queued = {
            let mut services = self.inner.services.lock().expect("broker lock poisoned");
            std::mem::take(&mut *services)
        };
        queued.insert(0, internal::node_service());
        for descriptor in queued {
            self.register_service(descriptor).await;
        }

        if let Some(transit) = &self.inner.transit {
            transit.connect().await?;
            // Learn the cluster quickly and introduce ourselves.
            self.publish_discover().await;
            self.publish_info(None).await;
            self.spawn_heartbeat_loop();
        }

        let services = self
            .inner
            .services
            .lock()
            .expect("broker lock poisoned")
            .clone();
        for descriptor in &services {
            if let Some(hook) = &descriptor.lifecycle.started {
                hook(self.lifecycle_context(&descriptor.full_name(), "started")).await;
            }
        }
        info!("Broker node `{}` started", self.node_id());
        Ok(())
    }

    /// Stops the broker: announces the departure, rejects pending calls
    /// with BROKER_STOPPING and runs `stopped` hooks in reverse
    /// registration order.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping broker node `{}`", self.node_id());

        if let Some(transit) = &self.inner.transit {
            let packet = Packet::Disconnect(DisconnectPayload {
                ver: PROTOCOL_VERSION,
                sender: self.node_id().to_owned(),
            });
            if let Err(err) = transit
                .publish(&packet, &Topic::broadcast(PacketKind::Disconnect))
                .await
            {
                warn!("Cannot publish DISCONNECT: {}", err);
            }
            transit.stop().await;
        }

        let services = self
            .inner
            .services
            .lock()
            .expect("broker lock poisoned")
            .clone();
        for descriptor in services.iter().rev() {
            if let Some(hook) = &descriptor.lifecycle.stopped {
                hook(self.lifecycle_context(&descriptor.full_name(), "stopped")).await;
            }
        }
        self.inner.started.store(false, Ordering::Release);
        info!("Broker node `{}` stopped", self.node_id());
    }

    /// Registers a service. On a running broker the updated service list
    /// is announced to the cluster immediately.
    pub async fn create_service(&self, descriptor: ServiceDescriptor) {
        if !self.inner.started.load(Ordering::Acquire) {
            self.inner
                .services
                .lock()
                .expect("broker lock poisoned")
                .push(descriptor);
            return;
        }
        let full_name = descriptor.full_name();
        self.register_service(descriptor.clone()).await;
        if let Some(hook) = &descriptor.lifecycle.started {
            hook(self.lifecycle_context(&full_name, "started")).await;
        }
        if self.transit_connected() {
            self.publish_info(None).await;
        }
    }

    async fn register_service(&self, descriptor: ServiceDescriptor) {
        // Compile parameter checkers once, at registration.
        {
            let mut checkers = self.inner.checkers.lock().expect("broker lock poisoned");
            for action in descriptor.actions.values() {
                if let Some(schema) = &action.info.params {
                    checkers.insert(
                        action.info.name.clone(),
                        self.inner.validator.compile(schema),
                    );
                }
            }
        }
        self.registry()
            .write()
            .expect("registry lock poisoned")
            .register_local_service(&descriptor);

        if let Some(hook) = &descriptor.lifecycle.created {
            hook(self.lifecycle_context(&descriptor.full_name(), "created")).await;
        }
        self.inner
            .services
            .lock()
            .expect("broker lock poisoned")
            .push(descriptor);
    }

    fn lifecycle_context(&self, service: &str, phase: &str) -> Context {
        Context::for_event(self.clone(), format!("{}.{}", service, phase), Value::Null)
    }

    fn transit_connected(&self) -> bool {
        self.inner
            .transit
            .as_ref()
            .map_or(false, |transit| transit.is_connected())
    }

    fn compose_chain(&self) {
        let weak = self.downgrade();
        let base: CallHandler = Arc::new(move |ctx: Context| {
            let weak = weak.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or(BrokerError::BrokerStopping)?;
                Broker::from_inner(inner).execute_endpoint(ctx).await
            })
        });
        let chain = compose(&self.inner.middlewares, base);
        *self.inner.chain.lock().expect("broker lock poisoned") = Some(chain);
    }

    fn chain(&self) -> CallHandler {
        let mut chain = self.inner.chain.lock().expect("broker lock poisoned");
        match &*chain {
            Some(handler) => Arc::clone(handler),
            None => {
                drop(chain);
                self.compose_chain();
                chain = self.inner.chain.lock().expect("broker lock poisoned");
                Arc::clone(chain.as_ref().expect("chain composed above"))
            }
        }
    }

    /// Calls an action by its full name.
    pub async fn call(&self, action: &str, params: Value) -> CallResult {
        self.call_with(action, params, CallOptions::default()).await
    }

    /// Calls an action with explicit options.
    pub async fn call_with(&self, action: &str, params: Value, opts: CallOptions) -> CallResult {
        let ctx = Context::new_root(self.clone(), action, params, &opts);
        self.dispatch_call(ctx, opts).await
    }

    /// The call orchestration: cache probe, endpoint selection, the
    /// middleware chain around the dispatch, retries on retryable
    /// failures (excluding the endpoint that just failed) and the cache
    /// store.
    pub(crate) async fn dispatch_call(&self, mut ctx: Context, opts: CallOptions) -> CallResult {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(BrokerError::BrokerStopping);
        }
        let action = ctx.action.clone();
        let retries = opts.retries.unwrap_or(self.inner.config.request_retry);

        // Cache probe before any dispatch work.
        let cache_key = match self.cache_slot(&action, &ctx.params).await {
            Some((_, Some(cached))) => {
                debug!("Serving `{}` from cache", action);
                ctx.cached_result = true;
                return Ok(cached);
            }
            Some((key, None)) => Some(key),
            None => None,
        };

        let mut exclude_node: Option<String> = None;
        loop {
            let endpoint = {
                let registry = self.registry().read().expect("registry lock poisoned");
                let select = SelectOptions {
                    node_id: opts.node_id.clone(),
                    prefer_local: self.inner.config.prefer_local,
                    exclude_node: exclude_node.clone(),
                };
                registry.select_endpoint(&action, &select)
            };
            let endpoint = match endpoint {
                Ok(endpoint) => endpoint,
                Err(SelectError::NotFound) => {
                    return Err(BrokerError::ServiceNotFound { action });
                }
                Err(SelectError::NoAvailableEndpoint) => {
                    return Err(BrokerError::ServiceNotAvailable {
                        action,
                        node_id: opts.node_id.clone(),
                    });
                }
            };

            ctx.node_id = Some(endpoint.node_id.clone());
            debug!(
                "Calling `{}` on node `{}` (attempt {})",
                action,
                endpoint.node_id,
                ctx.retry_count + 1
            );

            let result = self.chain()(ctx.clone()).await;
            match result {
                Ok(value) => {
                    endpoint.record_outcome(true, &self.inner.config.breaker);
                    if let Some(key) = &cache_key {
                        if let Some(cacher) = &self.inner.cacher {
                            cacher.set(key, value.clone(), None).await;
                        }
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if err.trips_breaker() {
                        endpoint.record_outcome(false, &self.inner.config.breaker);
                    }
                    if err.is_retryable() && ctx.retry_count < retries {
                        ctx.retry_count += 1;
                        exclude_node = Some(endpoint.node_id.clone());
                        warn!(
                            "Retrying `{}` after {}: attempt {}/{}",
                            action,
                            err.kind(),
                            ctx.retry_count,
                            retries
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Returns `(cache key, cached value)` when the action is cacheable
    /// and the cacher is configured.
    async fn cache_slot(&self, action: &str, params: &Value) -> Option<(String, Option<Value>)> {
        let cacher = self.inner.cacher.as_ref()?;
        let cacheable = {
            let registry = self.registry().read().expect("registry lock poisoned");
            registry
                .get_action_endpoints(action)?
                .endpoints()
                .first()
                .map_or(false, |endpoint| endpoint.action.cache)
        };
        if !cacheable {
            return None;
        }
        let key = cache_key(action, params);
        let cached = cacher.get(&key).await;
        Some((key, cached))
    }

    /// The innermost handler of the middleware chain: runs the local
    /// action (with parameter validation) or forwards the request to the
    /// chosen remote node.
    async fn execute_endpoint(&self, ctx: Context) -> CallResult {
        let target = ctx
            .node_id
            .clone()
            .unwrap_or_else(|| self.node_id().to_owned());

        if target == self.node_id() {
            let handler = {
                let registry = self.registry().read().expect("registry lock poisoned");
                registry
                    .get_endpoint_by_node_id(&ctx.action, &target)
                    .and_then(|endpoint| endpoint.handler.clone())
            };
            let handler = handler.ok_or_else(|| BrokerError::ServiceNotAvailable {
                action: ctx.action.clone(),
                node_id: Some(target),
            })?;

            let checker = {
                let checkers = self.inner.checkers.lock().expect("broker lock poisoned");
                checkers.get(&ctx.action).cloned()
            };
            if let Some(checker) = checker {
                check_params(&checker, &ctx.action, &ctx.params)?;
            }
            handler(ctx).await
        } else {
            let transit = self
                .inner
                .transit
                .as_ref()
                .ok_or_else(|| BrokerError::ServiceNotAvailable {
                    action: ctx.action.clone(),
                    node_id: Some(target.clone()),
                })?;
            transit.send_request(&ctx, &target).await
        }
    }

    /// Emits a group-balanced event: one delivery per consumer group,
    /// local handlers awaited, remote nodes receiving one EVENT packet
    /// each (fire-and-forget).
    pub async fn emit(&self, event: &str, data: Value) -> Result<(), BrokerError> {
        // Snapshot the subscriber set before any suspension.
        let chosen = {
            let registry = self.registry().read().expect("registry lock poisoned");
            let nodes = registry.nodes();
            registry
                .events()
                .balanced_snapshot(event, |node_id| nodes.is_available(node_id))
        };

        let mut local_futures = Vec::new();
        let mut remote_groups: HashMap<String, Vec<String>> = HashMap::new();
        for endpoint in chosen {
            if endpoint.local {
                if let Some(handler) = &endpoint.handler {
                    let ctx = Context::for_event(self.clone(), event, data.clone());
                    local_futures.push(handler(ctx));
                }
            } else {
                remote_groups
                    .entry(endpoint.node_id.clone())
                    .or_default()
                    .push(endpoint.group.clone());
            }
        }

        for (node_id, groups) in remote_groups {
            self.publish_event(&node_id, event, data.clone(), Some(groups))
                .await;
        }
        join_all(local_futures).await;
        Ok(())
    }

    /// Broadcasts an event to every subscriber endpoint on every node.
    pub async fn broadcast(&self, event: &str, data: Value) -> Result<(), BrokerError> {
        let all = {
            let registry = self.registry().read().expect("registry lock poisoned");
            let nodes = registry.nodes();
            registry
                .events()
                .broadcast_snapshot(event, |node_id| nodes.is_available(node_id))
        };

        let mut local_futures = Vec::new();
        let mut remote_nodes: Vec<String> = Vec::new();
        for endpoint in all {
            if endpoint.local {
                if let Some(handler) = &endpoint.handler {
                    let ctx = Context::for_event(self.clone(), event, data.clone());
                    local_futures.push(handler(ctx));
                }
            } else if !remote_nodes.contains(&endpoint.node_id) {
                remote_nodes.push(endpoint.node_id.clone());
            }
        }

        for node_id in remote_nodes {
            self.publish_event(&node_id, event, data.clone(), None).await;
        }
        join_all(local_futures).await;
        Ok(())
    }

    /// Delivers an event to local subscribers only, awaiting them.
    pub async fn emit_local(&self, event: &str, data: Value) {
        let endpoints = {
            let registry = self.registry().read().expect("registry lock poisoned");
            registry.events().local_snapshot(event, None)
        };
        let futures: Vec<_> = endpoints
            .iter()
            .filter_map(|endpoint| {
                endpoint.handler.as_ref().map(|handler| {
                    handler(Context::for_event(self.clone(), event, data.clone()))
                })
            })
            .collect();
        join_all(futures).await;
    }

    /// Alias of [`Self::emit_local`] for broadcast semantics: every local
    /// subscriber receives the event.
    pub async fn broadcast_local(&self, event: &str, data: Value) {
        self.emit_local(event, data).await;
    }

    async fn publish_event(
        &self,
        node_id: &str,
        event: &str,
        data: Value,
        groups: Option<Vec<String>>,
    ) {
        let transit = match &self.inner.transit {
            Some(transit) => transit,
            None => return,
        };
        let packet = Packet::Event(packets::EventPayload {
            ver: PROTOCOL_VERSION,
            sender: self.node_id().to_owned(),
            event: event.to_owned(),
            data,
            groups,
        });
        let topic = Topic::unicast(PacketKind::Event, node_id);
        if let Err(err) = transit.publish(&packet, &topic).await {
            warn!("Cannot publish EVENT `{}` to `{}`: {}", event, node_id, err);
        }
    }

    /// Measures the round trip to a peer node.
    pub async fn ping(&self, node_id: &str) -> Result<PingReport, BrokerError> {
        let transit = self
            .inner
            .transit
            .as_ref()
            .ok_or(BrokerError::Transport {
                message: "broker has no transport".to_owned(),
            })?;
        let timeout = Duration::from_millis(self.inner.config.request_timeout.max(1));
        transit.ping(node_id, timeout).await
    }

    /// Waits until every named service has an available endpoint.
    pub async fn wait_for_services(
        &self,
        names: &[&str],
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let names: Vec<String> = names.iter().map(|name| (*name).to_owned()).collect();
        let deadline = Instant::now() + timeout;
        loop {
            let ready = {
                let registry = self.registry().read().expect("registry lock poisoned");
                registry.services_available(&names)
            };
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::ServiceNotAvailable {
                    action: names.join(", "),
                    node_id: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Catalog projection: known nodes.
    pub fn list_nodes(&self) -> Vec<registry::NodeView> {
        self.registry()
            .read()
            .expect("registry lock poisoned")
            .list_nodes()
    }

    /// Catalog projection: services.
    pub fn list_services(&self, opts: &ListOptions) -> Vec<registry::ServiceView> {
        self.registry()
            .read()
            .expect("registry lock poisoned")
            .list_services(opts)
    }

    /// Catalog projection: actions.
    pub fn list_actions(&self, opts: &ListOptions) -> Vec<registry::ActionView> {
        self.registry()
            .read()
            .expect("registry lock poisoned")
            .list_actions(opts)
    }

    /// Catalog projection: event subscriptions.
    pub fn list_events(&self, opts: &ListOptions) -> Vec<registry::EventView> {
        self.registry()
            .read()
            .expect("registry lock poisoned")
            .list_events(opts)
    }

    /// Health of the local node.
    pub fn health(&self) -> Value {
        let registry = self.registry().read().expect("registry lock poisoned");
        let local = registry.nodes().local();
        json!({
            "node_id": local.id,
            "available": local.available,
            "client": serde_json::to_value(&local.client).unwrap_or(Value::Null),
            "uptime": self.inner.started_at.elapsed().as_secs(),
            "cpu": local.cpu_usage,
        })
    }

    // Packet handling ----------------------------------------------------

    /// Dispatches a packet received by the transit. RESPONSE and PONG
    /// never arrive here; the transit resolves them in place.
    pub(crate) async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Info(payload) => self.handle_info(payload).await,
            Packet::Heartbeat(payload) => self.handle_heartbeat(payload).await,
            Packet::Discover(payload) => self.publish_info(Some(&payload.sender)).await,
            Packet::Request(payload) => self.handle_request(payload),
            Packet::Event(payload) => self.handle_event(payload),
            Packet::Disconnect(payload) => self.handle_node_down(&payload.sender, false).await,
            Packet::Ping(payload) => {
                if let Some(transit) = &self.inner.transit {
                    transit.send_pong(&payload).await;
                }
            }
            Packet::Response(_) | Packet::Pong(_) => {
                error!("Correlated packet escaped the transit");
            }
        }
    }

    /// Handles an INFO packet: reconciles the registry and emits
    /// `$node.connected` on new and reconnected nodes.
    async fn handle_info(&self, payload: InfoPayload) {
        let outcome = {
            let mut registry = self.registry().write().expect("registry lock poisoned");
            registry.process_info(&payload)
        };
        if outcome.is_new || outcome.reconnected {
            self.broadcast_local(
                "$node.connected",
                json!({ "node": payload.sender, "reconnected": outcome.reconnected }),
            )
            .await;
        }
    }

    /// Handles a HEARTBEAT: refreshes liveness, or requests a DISCOVER
    /// from an unknown sender.
    async fn handle_heartbeat(&self, payload: HeartbeatPayload) {
        let known = {
            let mut registry = self.registry().write().expect("registry lock poisoned");
            registry.heartbeat(&payload.sender, payload.cpu)
        };
        if !known {
            debug!(
                "Heartbeat from unknown node `{}`; requesting its INFO",
                payload.sender
            );
            self.publish_discover_to(&payload.sender).await;
        }
    }

    /// Executes an incoming remote request on a spawned task and sends
    /// the RESPONSE back. A stopping broker refuses without execution,
    /// so the caller can retry on another endpoint.
    fn handle_request(&self, payload: RequestPayload) {
        let broker = self.clone();
        tokio::spawn(async move {
            let caller = payload.sender.clone();
            let id = payload.id.clone();
            let result = if broker.inner.stopping.load(Ordering::Acquire) {
                Err(BrokerError::RequestRejected {
                    action: payload.action.clone(),
                    node_id: broker.node_id().to_owned(),
                })
            } else {
                let ctx = Context::for_remote_request(broker.clone(), &payload);
                broker.chain()(ctx).await
            };
            if let Some(transit) = &broker.inner.transit {
                transit.send_response(&caller, &id, result).await;
            }
        });
    }

    /// Delivers an incoming EVENT packet to local subscribers, honoring
    /// the balanced groups chosen by the sender.
    fn handle_event(&self, payload: packets::EventPayload) {
        let endpoints = {
            let registry = self.registry().read().expect("registry lock poisoned");
            registry
                .events()
                .local_snapshot(&payload.event, payload.groups.as_deref())
        };
        for endpoint in endpoints {
            if let Some(handler) = &endpoint.handler {
                let ctx = Context::for_event(self.clone(), &payload.event, payload.data.clone());
                tokio::spawn(handler(ctx));
            }
        }
    }

    /// Marks a node down, cascades the unregistration, rejects pending
    /// calls on it and emits `$node.disconnected`.
    pub(crate) async fn handle_node_down(&self, node_id: &str, unexpected: bool) {
        let was_available = {
            let mut registry = self.registry().write().expect("registry lock poisoned");
            registry.node_disconnected(node_id, unexpected)
        };
        if let Some(transit) = &self.inner.transit {
            transit.reject_pending_for_node(node_id);
        }
        if was_available {
            self.broadcast_local(
                "$node.disconnected",
                json!({ "node": node_id, "unexpected": unexpected }),
            )
            .await;
        }
    }

    /// Publishes the local INFO, broadcast or targeted at one node.
    async fn publish_info(&self, target: Option<&str>) {
        let transit = match &self.inner.transit {
            Some(transit) => transit,
            None => return,
        };
        let payload = {
            let registry = self.registry().read().expect("registry lock poisoned");
            let local = registry.nodes().local();
            InfoPayload {
                ver: PROTOCOL_VERSION,
                sender: self.node_id().to_owned(),
                services: registry.local_service_infos(),
                ip_list: local.ip_list.clone(),
                client: local.client.clone(),
                config: json!({
                    "request_timeout": self.inner.config.request_timeout,
                    "request_retry": self.inner.config.request_retry,
                }),
                uptime: self.inner.started_at.elapsed().as_secs(),
            }
        };
        let topic = match target {
            Some(node_id) => Topic::unicast(PacketKind::Info, node_id),
            None => Topic::broadcast(PacketKind::Info),
        };
        if let Err(err) = transit.publish(&Packet::Info(payload), &topic).await {
            warn!("Cannot publish INFO: {}", err);
        }
    }

    async fn publish_discover(&self) {
        if let Some(transit) = &self.inner.transit {
            let packet = Packet::Discover(DiscoverPayload {
                ver: PROTOCOL_VERSION,
                sender: self.node_id().to_owned(),
            });
            if let Err(err) = transit
                .publish(&packet, &Topic::broadcast(PacketKind::Discover))
                .await
            {
                warn!("Cannot publish DISCOVER: {}", err);
            }
        }
    }

    async fn publish_discover_to(&self, node_id: &str) {
        if let Some(transit) = &self.inner.transit {
            let packet = Packet::Discover(DiscoverPayload {
                ver: PROTOCOL_VERSION,
                sender: self.node_id().to_owned(),
            });
            let topic = Topic::unicast(PacketKind::Discover, node_id);
            if let Err(err) = transit.publish(&packet, &topic).await {
                warn!("Cannot publish DISCOVER to `{}`: {}", node_id, err);
            }
        }
    }

    /// Spawns the heartbeat loop: periodic HEARTBEAT broadcasts and the
    /// liveness check expiring silent peers.
    fn spawn_heartbeat_loop(&self) {
        let weak = self.downgrade();
        let interval = Duration::from_millis(self.inner.config.heartbeat_interval);
        let timeout = self.inner.config.heartbeat_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, INFO was just
            // broadcast.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                if inner.stopping.load(Ordering::Acquire) {
                    break;
                }
                let broker = Broker::from_inner(inner);
                broker.broadcast_heartbeat().await;
                let expired = {
                    let registry = broker.registry().read().expect("registry lock poisoned");
                    registry.expired_nodes(timeout)
                };
                for node_id in expired {
                    warn!("Heartbeat of node `{}` expired", node_id);
                    broker.handle_node_down(&node_id, true).await;
                }
            }
        });
    }

    async fn broadcast_heartbeat(&self) {
        let transit = match &self.inner.transit {
            Some(transit) => transit,
            None => return,
        };
        let cpu = {
            let registry = self.registry().read().expect("registry lock poisoned");
            registry.nodes().local().cpu_usage
        };
        let packet = Packet::Heartbeat(HeartbeatPayload {
            ver: PROTOCOL_VERSION,
            sender: self.node_id().to_owned(),
            cpu,
        });
        if let Err(err) = transit
            .publish(&packet, &Topic::broadcast(PacketKind::Heartbeat))
            .await
        {
            warn!("Cannot publish HEARTBEAT: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use std::sync::atomic::AtomicU32;

    use super::*;

    fn math_service() -> ServiceDescriptor {
        ServiceDescriptor::build("math")
            .action("add", |ctx| async move {
                let a = ctx.params["a"].as_i64().unwrap_or(0);
                let b = ctx.params["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
            .finish()
    }

    #[tokio::test]
    async fn local_call_resolves_without_transport() {
        let broker = Broker::builder()
            .node_id("solo")
            .service(math_service())
            .finish();
        broker.start().await.unwrap();

        let result = broker.call("math.add", json!({ "a": 2, "b": 3 })).await;
        assert_eq!(result.unwrap(), json!(5));
        broker.stop().await;
    }

    #[tokio::test]
    async fn unknown_action_is_service_not_found() {
        let broker = Broker::builder().node_id("solo").finish();
        broker.start().await.unwrap();

        let err = broker.call("nope.nothing", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "SERVICE_NOT_FOUND");
        broker.stop().await;
    }

    #[tokio::test]
    async fn child_contexts_inherit_the_call_graph() {
        let broker = Broker::builder().node_id("solo").finish();
        let root = Context::new_root(
            broker.clone(),
            "a.one",
            json!({}),
            &CallOptions::default(),
        );
        let child = Context::child_of(&root, "a.two", json!({}), &CallOptions::default());
        let grandchild = Context::child_of(&child, "a.three", json!({}), &CallOptions::default());

        assert_eq!(root.level, 1);
        assert_eq!(child.level, 2);
        assert_eq!(grandchild.level, 3);
        assert_eq!(child.request_id, root.request_id);
        assert_eq!(grandchild.request_id, root.request_id);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(grandchild.parent_id.as_deref(), Some(child.id.as_str()));

        // Meta is shared by reference through the whole graph.
        grandchild.meta_set("tenant", json!("acme"));
        assert_eq!(root.meta_get("tenant"), Some(json!("acme")));
    }

    #[tokio::test]
    async fn nested_calls_propagate_the_context() {
        let service = ServiceDescriptor::build("greeter")
            .action("hello", |ctx| async move {
                let who = ctx.call("greeter.who", json!({})).await?;
                Ok(json!(format!("hello {}", who.as_str().unwrap_or("?"))))
            })
            .action("who", |ctx| async move {
                assert_eq!(ctx.level, 2, "child context of the outer call");
                Ok(json!("world"))
            })
            .finish();

        let broker = Broker::builder()
            .node_id("solo")
            .service(service)
            .finish();
        broker.start().await.unwrap();
        let result = broker.call("greeter.hello", json!({})).await.unwrap();
        assert_eq!(result, json!("hello world"));
        broker.stop().await;
    }

    #[tokio::test]
    async fn cacheable_actions_are_served_from_the_cacher() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_handler = Arc::clone(&hits);
        let service = ServiceDescriptor::build("math")
            .cached_action("fib", move |_ctx| {
                let hits = Arc::clone(&hits_in_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(21))
                }
            })
            .finish();

        let broker = Broker::builder()
            .node_id("solo")
            .cacher(Box::new(cacher::MemoryCacher::default()))
            .service(service)
            .finish();
        broker.start().await.unwrap();

        assert_eq!(
            broker.call("math.fib", json!({ "n": 8 })).await.unwrap(),
            json!(21)
        );
        assert_eq!(
            broker.call("math.fib", json!({ "n": 8 })).await.unwrap(),
            json!(21)
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1, "second call was cached");

        // Different parameters miss the cache.
        broker.call("math.fib", json!({ "n": 9 })).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        broker.stop().await;
    }

    #[tokio::test]
    async fn invalid_params_fail_before_the_handler() {
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in_handler = Arc::clone(&runs);
        let service = ServiceDescriptor::build("math")
            .validated_action(
                "add",
                json!({ "a": "number", "b": "number" }),
                move |_ctx| {
                    let runs = Arc::clone(&runs_in_handler);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(0))
                    }
                },
            )
            .finish();
        let broker = Broker::builder()
            .node_id("solo")
            .service(service)
            .finish();
        broker.start().await.unwrap();

        let err = broker
            .call("math.add", json!({ "a": "two", "b": 3 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
        assert_eq!(runs.load(Ordering::SeqCst), 0, "handler did not run");

        broker
            .call("math.add", json!({ "a": 2, "b": 3 }))
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        broker.stop().await;
    }

    #[tokio::test]
    async fn internal_node_actions_answer_locally() {
        let broker = Broker::builder()
            .node_id("solo")
            .service(math_service())
            .finish();
        broker.start().await.unwrap();

        let nodes = broker.call("$node.list", json!({})).await.unwrap();
        assert_eq!(nodes.as_array().unwrap().len(), 1);

        let services = broker
            .call("$node.services", json!({ "skip_internal": true }))
            .await
            .unwrap();
        let names: Vec<_> = services
            .as_array()
            .unwrap()
            .iter()
            .map(|service| service["name"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["math".to_owned()]);

        let health = broker.call("$node.health", json!({})).await.unwrap();
        assert_eq!(health["node_id"], json!("solo"));
        broker.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_new_calls() {
        let broker = Broker::builder()
            .node_id("solo")
            .service(math_service())
            .finish();
        broker.start().await.unwrap();
        broker.stop().await;

        let err = broker
            .call("math.add", json!({ "a": 1, "b": 1 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BROKER_STOPPING");
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let recording = |log: &Arc<Mutex<Vec<String>>>, entry: &'static str| {
            let log = Arc::clone(log);
            move |_ctx: Context| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(entry.to_owned());
                }
            }
        };

        let first = ServiceDescriptor::build("first")
            .action("noop", |_ctx| async move { Ok(Value::Null) })
            .on_created(recording(&log, "first.created"))
            .on_started(recording(&log, "first.started"))
            .on_stopped(recording(&log, "first.stopped"))
            .finish();
        let second = ServiceDescriptor::build("second")
            .action("noop", |_ctx| async move { Ok(Value::Null) })
            .on_stopped(recording(&log, "second.stopped"))
            .finish();

        let broker = Broker::builder()
            .node_id("solo")
            .service(first)
            .service(second)
            .finish();
        broker.start().await.unwrap();
        broker.stop().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first.created".to_owned(),
                "first.started".to_owned(),
                // Stop hooks run in reverse registration order.
                "second.stopped".to_owned(),
                "first.stopped".to_owned(),
            ]
        );
    }

    #[test]
    fn config_validation_catches_nonsense() {
        let mut config = BrokerConfig::default();
        config.heartbeat_interval = 0;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.heartbeat_timeout = config.heartbeat_interval;
        assert!(config.validate().is_err());

        assert!(BrokerConfig::default().validate().is_ok());
    }
}
