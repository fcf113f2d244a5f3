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

//! Action result caching.
//!
//! When an action is declared cacheable, the broker computes a cache key
//! from the action name and the call parameters, probes the cacher before
//! dispatching and stores successful results afterwards. The broker never
//! inspects cached values.

use async_trait::async_trait;
use serde_json::Value;

use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Cache of action results.
#[async_trait]
pub trait Cacher: Send + Sync + fmt::Debug {
    /// Looks up a cached value.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Stores a value, optionally with a time-to-live.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Removes one key.
    async fn del(&self, key: &str);

    /// Removes every key matching the pattern. A trailing `*` matches any
    /// suffix; a pattern without `*` matches exactly.
    async fn clean(&self, pattern: &str);
}

/// Builds the cache key of a call: the action name plus the canonical
/// JSON encoding of its parameters.
pub fn cache_key(action: &str, params: &Value) -> String {
    format!("{}:{}", action, params)
}

/// In-process cacher with per-entry TTL.
#[derive(Debug, Default)]
pub struct MemoryCacher {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Cacher for MemoryCacher {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cacher lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .lock()
            .expect("cacher lock poisoned")
            .insert(key.to_owned(), entry);
    }

    async fn del(&self, key: &str) {
        self.entries
            .lock()
            .expect("cacher lock poisoned")
            .remove(key);
    }

    async fn clean(&self, pattern: &str) {
        self.entries
            .lock()
            .expect("cacher lock poisoned")
            .retain(|key, _| !pattern_matches(pattern, key));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn set_get_del() {
        let cacher = MemoryCacher::default();
        cacher.set("math.add:{}", json!(5), None).await;
        assert_eq!(cacher.get("math.add:{}").await, Some(json!(5)));

        cacher.del("math.add:{}").await;
        assert_eq!(cacher.get("math.add:{}").await, None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cacher = MemoryCacher::default();
        cacher
            .set("key", json!(1), Some(Duration::from_millis(10)))
            .await;
        assert!(cacher.get("key").await.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cacher.get("key").await, None);
    }

    #[tokio::test]
    async fn clean_matches_prefixes() {
        let cacher = MemoryCacher::default();
        cacher.set("math.add:1", json!(1), None).await;
        cacher.set("math.sub:2", json!(2), None).await;
        cacher.set("mail.send:3", json!(3), None).await;

        cacher.clean("math.*").await;
        assert_eq!(cacher.get("math.add:1").await, None);
        assert_eq!(cacher.get("math.sub:2").await, None);
        assert_eq!(cacher.get("mail.send:3").await, Some(json!(3)));
    }

    #[test]
    fn key_depends_on_action_and_params() {
        let a = cache_key("math.add", &json!({ "a": 1 }));
        let b = cache_key("math.add", &json!({ "a": 2 }));
        let c = cache_key("math.sub", &json!({ "a": 1 }));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
