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

//! In-process transport.
//!
//! A [`MemoryHub`] is a process-local message bus: every transport
//! created from the same hub sees the publications of the others. This is
//! the reference binding of the transport contract and the substrate of
//! the end-to-end test suite; brokers wired to one hub form a cluster
//! inside a single process.

use async_trait::async_trait;
use futures::channel::mpsc;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    errors::TransportError,
    transport::{Incoming, Topic, Transport},
};

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Incoming>)>>;

/// Process-local hub connecting [`MemoryTransport`] instances.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            incoming: Mutex::new(None),
            topics: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
        }
    }

    fn add_subscriber(&self, topic: String, id: u64, tx: mpsc::UnboundedSender<Incoming>) {
        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        let entry = subscribers.entry(topic).or_default();
        if !entry.iter().any(|(existing, _)| *existing == id) {
            entry.push((id, tx));
        }
    }

    fn remove_transport(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
        subscribers.retain(|_, entry| {
            entry.retain(|(existing, _)| *existing != id);
            !entry.is_empty()
        });
    }

    fn deliver(&self, topic: &str, frame: &[u8]) {
        let mut gone = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("hub lock poisoned");
            if let Some(entry) = subscribers.get(topic) {
                for (id, tx) in entry {
                    let incoming = Incoming {
                        topic: topic.to_owned(),
                        frame: frame.to_vec(),
                    };
                    if tx.unbounded_send(incoming).is_err() {
                        gone.push(*id);
                    }
                }
            }
        }
        // Drop subscribers whose receive loop has terminated.
        for id in gone {
            self.remove_transport(id);
        }
    }
}

/// Transport bound to a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
    incoming: Mutex<Option<mpsc::UnboundedSender<Incoming>>>,
    topics: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        incoming_tx: mpsc::UnboundedSender<Incoming>,
    ) -> Result<(), TransportError> {
        *self.incoming.lock().expect("transport lock poisoned") = Some(incoming_tx);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Release);
        self.hub.remove_transport(self.id);
        // Dropping the sender closes the incoming stream of the transit.
        self.incoming.lock().expect("transport lock poisoned").take();
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let tx = self
            .incoming
            .lock()
            .expect("transport lock poisoned")
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let name = topic.name();
        self.topics
            .lock()
            .expect("transport lock poisoned")
            .insert(name.clone());
        self.hub.add_subscriber(name, self.id, tx);
        Ok(())
    }

    async fn publish(&self, topic: &Topic, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.hub.deliver(&topic.name(), &frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::packets::PacketKind;

    #[tokio::test]
    async fn frames_reach_every_subscriber_of_a_topic() {
        let hub = MemoryHub::new();
        let sender = hub.transport();
        let receiver_a = hub.transport();
        let receiver_b = hub.transport();

        let (tx_unused, _rx_keep) = mpsc::unbounded();
        sender.connect(tx_unused).await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded();
        receiver_a.connect(tx_a).await.unwrap();
        receiver_a
            .subscribe(Topic::broadcast(PacketKind::Info))
            .await
            .unwrap();

        let (tx_b, mut rx_b) = mpsc::unbounded();
        receiver_b.connect(tx_b).await.unwrap();
        receiver_b
            .subscribe(Topic::broadcast(PacketKind::Info))
            .await
            .unwrap();

        sender
            .publish(&Topic::broadcast(PacketKind::Info), vec![1, 2, 3])
            .await
            .unwrap();

        assert_eq!(rx_a.next().await.unwrap().frame, vec![1, 2, 3]);
        assert_eq!(rx_b.next().await.unwrap().frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unicast_topics_are_isolated() {
        let hub = MemoryHub::new();
        let sender = hub.transport();
        let receiver = hub.transport();
        let bystander = hub.transport();

        let (tx, _rx_keep) = mpsc::unbounded();
        sender.connect(tx).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded();
        receiver.connect(tx).await.unwrap();
        receiver
            .subscribe(Topic::unicast(PacketKind::Request, "n1"))
            .await
            .unwrap();

        let (tx, mut other_rx) = mpsc::unbounded();
        bystander.connect(tx).await.unwrap();
        bystander
            .subscribe(Topic::unicast(PacketKind::Request, "n2"))
            .await
            .unwrap();

        sender
            .publish(&Topic::unicast(PacketKind::Request, "n1"), vec![9])
            .await
            .unwrap();

        assert_eq!(rx.next().await.unwrap().topic, "REQ.n1");
        assert!(other_rx.try_next().is_err(), "no frame for n2");
    }

    #[tokio::test]
    async fn disconnect_closes_the_incoming_stream() {
        let hub = MemoryHub::new();
        let transport = hub.transport();

        let (tx, mut rx) = mpsc::unbounded();
        transport.connect(tx).await.unwrap();
        transport
            .subscribe(Topic::broadcast(PacketKind::Heartbeat))
            .await
            .unwrap();
        transport.disconnect().await.unwrap();

        assert!(rx.next().await.is_none(), "stream ends after disconnect");
        let err = transport
            .publish(&Topic::broadcast(PacketKind::Heartbeat), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn subscribing_before_connect_is_an_error() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        let err = transport
            .subscribe(Topic::broadcast(PacketKind::Info))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
