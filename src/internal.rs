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

//! The internal `$node` service, registered on every broker at start.
//!
//! Its actions expose catalog projections and local health; they are
//! internal by the `$node.` name prefix and accept the standard list
//! filter options as parameters.

use serde::Serialize;
use serde_json::Value;

use crate::{
    context::Context,
    errors::BrokerError,
    registry::ListOptions,
    service::ServiceDescriptor,
};

fn list_options(ctx: &Context) -> ListOptions {
    serde_json::from_value(ctx.params.clone()).unwrap_or_default()
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, BrokerError> {
    serde_json::to_value(value)
        .map_err(|err| BrokerError::custom("SerializationError", err.to_string(), 500))
}

/// Builds the `$node` service descriptor.
pub(crate) fn node_service() -> ServiceDescriptor {
    ServiceDescriptor::build("$node")
        .action("list", |ctx| async move {
            to_value(&ctx.broker().list_nodes())
        })
        .action("services", |ctx| async move {
            let opts = list_options(&ctx);
            to_value(&ctx.broker().list_services(&opts))
        })
        .action("actions", |ctx| async move {
            let opts = list_options(&ctx);
            to_value(&ctx.broker().list_actions(&opts))
        })
        .action("events", |ctx| async move {
            let opts = list_options(&ctx);
            to_value(&ctx.broker().list_events(&opts))
        })
        .action("health", |ctx| async move { Ok(ctx.broker().health()) })
        .finish()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::Broker;

    #[tokio::test]
    async fn actions_listing_honors_filters() {
        let service = ServiceDescriptor::build("math")
            .action("add", |_ctx| async move { Ok(Value::Null) })
            .finish();
        let broker = Broker::builder()
            .node_id("solo")
            .service(service)
            .finish();
        broker.start().await.unwrap();

        let all = broker.call("$node.actions", json!({})).await.unwrap();
        let names: Vec<&str> = all
            .as_array()
            .unwrap()
            .iter()
            .map(|action| action["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"math.add"));
        assert!(names.contains(&"$node.list"));

        let filtered = broker
            .call(
                "$node.actions",
                json!({ "skip_internal": true, "with_endpoints": true }),
            )
            .await
            .unwrap();
        let filtered = filtered.as_array().unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["name"], json!("math.add"));
        let endpoints = filtered[0]["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0]["node_id"], json!("solo"));
        broker.stop().await;
    }
}
