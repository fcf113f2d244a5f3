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

//! Service definitions: named actions, event subscriptions and lifecycle
//! hooks contributed by user code, plus the handler-free wire form that is
//! announced to peer nodes in INFO packets.

use futures::future::BoxFuture;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use crate::{context::Context, errors::BrokerError};

/// Handler of an action call. Receives the per-call context and resolves
/// with the action result or a broker error.
pub type ActionHandler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Value, BrokerError>> + Send + Sync>;

/// Handler of an event delivery. Event handlers cannot fail the emitter;
/// errors are logged on the receiving side.
pub type EventHandler = Arc<dyn Fn(Context) -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle hook of a service, run by the hosting broker.
pub type LifecycleHook = Arc<dyn Fn(Context) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wire form of a service, as announced in INFO packets. Two services are
/// considered the same iff their `name` and `version` match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Optional service version; versioned actions are exposed with a
    /// `<version>.` name prefix.
    #[serde(default)]
    pub version: Option<String>,
    /// Opaque service settings.
    #[serde(default)]
    pub settings: Value,
    /// Actions by short (unprefixed) name.
    #[serde(default)]
    pub actions: BTreeMap<String, ActionInfo>,
    /// Event subscriptions by event name.
    #[serde(default)]
    pub events: BTreeMap<String, EventInfo>,
}

impl ServiceInfo {
    /// Full name of the service: `name`, or `<version>.<name>` for
    /// versioned services.
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{}.{}", version, self.name),
            None => self.name.clone(),
        }
    }

    /// Full name of an action of this service.
    pub fn action_name(&self, short_name: &str) -> String {
        format!("{}.{}", self.full_name(), short_name)
    }
}

/// Wire form of a single action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    /// Full action name, e.g. `math.add` or `v2.math.add`.
    pub name: String,
    /// Should results of this action be cached?
    #[serde(default)]
    pub cache: bool,
    /// Parameter schema, opaque to the broker core; compiled by the
    /// validator pluggable at registration.
    #[serde(default)]
    pub params: Option<Value>,
    /// Protected actions are callable only on the hosting node and are
    /// hidden from catalog listings.
    #[serde(default)]
    pub protected: bool,
}

/// Wire form of a single event subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    /// Subscribed event name.
    pub name: String,
    /// Consumer group for balanced delivery. Defaults to the service name.
    #[serde(default)]
    pub group: Option<String>,
}

/// A complete local service definition: the wire form plus handler and
/// lifecycle references, consumed by [`Broker::create_service`].
///
/// [`Broker::create_service`]: crate::Broker::create_service
#[derive(Clone)]
pub struct ServiceDescriptor {
    /// Service name.
    pub name: String,
    /// Optional service version.
    pub version: Option<String>,
    /// Opaque service settings.
    pub settings: Value,
    /// Actions by short name.
    pub actions: BTreeMap<String, LocalAction>,
    /// Event subscriptions by event name.
    pub events: BTreeMap<String, LocalEvent>,
    /// Lifecycle hooks.
    pub lifecycle: Lifecycle,
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A local action: its wire form plus the handler executing it.
#[derive(Clone)]
pub struct LocalAction {
    /// Wire form of the action.
    pub info: ActionInfo,
    /// Handler invoked for local calls.
    pub handler: ActionHandler,
}

impl fmt::Debug for LocalAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LocalAction")
            .field("info", &self.info)
            .finish()
    }
}

/// A local event subscription: its wire form plus the handler.
#[derive(Clone)]
pub struct LocalEvent {
    /// Wire form of the subscription.
    pub info: EventInfo,
    /// Handler invoked on delivery.
    pub handler: EventHandler,
}

impl fmt::Debug for LocalEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LocalEvent")
            .field("info", &self.info)
            .finish()
    }
}

/// Lifecycle hooks of a service. `created` runs at registration,
/// `started` after the broker has started (or immediately when the service
/// is added to a running broker), `stopped` during broker shutdown in
/// reverse registration order.
#[derive(Clone, Default)]
pub struct Lifecycle {
    /// Runs when the service is registered.
    pub created: Option<LifecycleHook>,
    /// Runs when the hosting broker has started.
    pub started: Option<LifecycleHook>,
    /// Runs during broker shutdown.
    pub stopped: Option<LifecycleHook>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Lifecycle")
            .field("created", &self.created.is_some())
            .field("started", &self.started.is_some())
            .field("stopped", &self.stopped.is_some())
            .finish()
    }
}

impl ServiceDescriptor {
    /// Starts building a service with the given name.
    pub fn build(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            service: Self {
                name: name.into(),
                version: None,
                settings: Value::Null,
                actions: BTreeMap::new(),
                events: BTreeMap::new(),
                lifecycle: Lifecycle::default(),
            },
        }
    }

    /// Full name of the service (`<version>.<name>` when versioned).
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{}.{}", version, self.name),
            None => self.name.clone(),
        }
    }

    /// Wire form of this service. Protected actions are omitted when
    /// `for_remote` is set, so they are never announced to peers.
    pub fn info(&self, for_remote: bool) -> ServiceInfo {
        let actions = self
            .actions
            .iter()
            .filter(|(_, action)| !(for_remote && action.info.protected))
            .map(|(short_name, action)| (short_name.clone(), action.info.clone()))
            .collect();
        let events = self
            .events
            .iter()
            .map(|(name, event)| (name.clone(), event.info.clone()))
            .collect();
        ServiceInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            settings: self.settings.clone(),
            actions,
            events,
        }
    }
}

/// Builder of a [`ServiceDescriptor`].
#[derive(Debug)]
pub struct ServiceBuilder {
    service: ServiceDescriptor,
}

impl ServiceBuilder {
    /// Sets the service version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.service.version = Some(version.into());
        self
    }

    /// Sets opaque service settings.
    pub fn settings(mut self, settings: Value) -> Self {
        self.service.settings = settings;
        self
    }

    /// Adds an action with the given short name.
    pub fn action<F, Fut>(self, short_name: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BrokerError>> + Send + 'static,
    {
        self.action_raw(short_name, None, false, false, handler)
    }

    /// Adds an action whose results are cached by the cacher pluggable.
    pub fn cached_action<F, Fut>(self, short_name: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BrokerError>> + Send + 'static,
    {
        self.action_raw(short_name, None, true, false, handler)
    }

    /// Adds an action with a parameter schema checked before the handler
    /// runs.
    pub fn validated_action<F, Fut>(self, short_name: &str, schema: Value, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BrokerError>> + Send + 'static,
    {
        self.action_raw(short_name, Some(schema), false, false, handler)
    }

    /// Adds an action callable only on the hosting node and hidden from
    /// catalog listings.
    pub fn protected_action<F, Fut>(self, short_name: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BrokerError>> + Send + 'static,
    {
        self.action_raw(short_name, None, false, true, handler)
    }

    fn action_raw<F, Fut>(
        mut self,
        short_name: &str,
        params: Option<Value>,
        cache: bool,
        protected: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BrokerError>> + Send + 'static,
    {
        let info = ActionInfo {
            name: format!("{}.{}", self.service.full_name(), short_name),
            cache,
            params,
            protected,
        };
        let handler: ActionHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.service
            .actions
            .insert(short_name.to_owned(), LocalAction { info, handler });
        self
    }

    /// Subscribes to an event in the default group (the service name).
    pub fn event<F, Fut>(self, event_name: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_in_group(event_name, None, handler)
    }

    /// Subscribes to an event in an explicit consumer group.
    pub fn event_in_group<F, Fut>(
        mut self,
        event_name: &str,
        group: Option<&str>,
        handler: F,
    ) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let info = EventInfo {
            name: event_name.to_owned(),
            group: group.map(str::to_owned),
        };
        let handler: EventHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.service
            .events
            .insert(event_name.to_owned(), LocalEvent { info, handler });
        self
    }

    /// Sets the `created` lifecycle hook.
    pub fn on_created<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.service.lifecycle.created = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Sets the `started` lifecycle hook.
    pub fn on_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.service.lifecycle.started = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Sets the `stopped` lifecycle hook.
    pub fn on_stopped<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.service.lifecycle.stopped = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Finishes the build. Action names are (re)derived here so that the
    /// order of `version` and `action` calls does not matter.
    pub fn finish(mut self) -> ServiceDescriptor {
        let full_name = self.service.full_name();
        for (short_name, action) in &mut self.service.actions {
            action.info.name = format!("{}.{}", full_name, short_name);
        }
        self.service
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample_service() -> ServiceDescriptor {
        ServiceDescriptor::build("math")
            .action("add", |ctx| async move {
                let a = ctx.params["a"].as_i64().unwrap_or(0);
                let b = ctx.params["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
            .protected_action("reset", |_ctx| async move { Ok(Value::Null) })
            .event("math.used", |_ctx| async move {})
            .finish()
    }

    #[test]
    fn versioned_names_carry_the_version_prefix() {
        let service = ServiceDescriptor::build("math")
            .version("v2")
            .action("add", |_ctx| async move { Ok(Value::Null) })
            .finish();
        assert_eq!(service.full_name(), "v2.math");
        assert_eq!(service.actions["add"].info.name, "v2.math.add");
    }

    #[test]
    fn remote_info_omits_protected_actions() {
        let service = sample_service();

        let local = service.info(false);
        assert!(local.actions.contains_key("reset"));

        let remote = service.info(true);
        assert!(!remote.actions.contains_key("reset"));
        assert!(remote.actions.contains_key("add"));
        assert_eq!(remote.events["math.used"].name, "math.used");
    }

    #[test]
    fn info_round_trips_through_serde() {
        let info = sample_service().info(true);
        let encoded = serde_json::to_string(&info).unwrap();
        let decoded: ServiceInfo = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, info);
    }
}
