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

//! Transport contract and the topic address space.
//!
//! A transport moves opaque frames between brokers; everything it carries
//! is already framed by [`codec`] and encoded by the serializer. Incoming
//! frames are pushed into the channel handed over at `connect`, so the
//! transit drains a single stream regardless of the substrate.

pub use self::memory::{MemoryHub, MemoryTransport};

pub mod codec;
pub mod memory;

use async_trait::async_trait;
use futures::channel::mpsc;

use std::fmt;

use crate::{errors::TransportError, packets::PacketKind};

/// Address of a publication: a packet kind, either broadcast or targeted
/// at one node. Renders as `INFO`, `REQ.node-1`, `DISCOVER` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    /// Packet kind carried on this topic.
    pub kind: PacketKind,
    /// Target node for unicast topics; `None` for the shared ones.
    pub node_id: Option<String>,
}

impl Topic {
    /// Shared topic of a kind, received by every subscribed node.
    pub fn broadcast(kind: PacketKind) -> Self {
        Self {
            kind,
            node_id: None,
        }
    }

    /// Topic of a kind targeted at a single node.
    pub fn unicast(kind: PacketKind, node_id: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(node_id.into()),
        }
    }

    /// The topic name on the wire.
    pub fn name(&self) -> String {
        match &self.node_id {
            Some(node_id) => format!("{}.{}", self.kind.as_str(), node_id),
            None => self.kind.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.name())
    }
}

/// A frame received from the transport, tagged with the topic it arrived
/// on.
#[derive(Debug)]
pub struct Incoming {
    /// Name of the topic the frame arrived on.
    pub topic: String,
    /// Raw frame bytes (length prefix, kind byte, encoded payload).
    pub frame: Vec<u8>,
}

/// Bidirectional framed messaging over some substrate.
///
/// Implementations deliver frames of the subscribed topics into the
/// channel received at `connect` until `disconnect` is called or the
/// substrate fails.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Connects to the substrate. Received frames of subscribed topics
    /// are pushed into `incoming_tx`.
    async fn connect(
        &self,
        incoming_tx: mpsc::UnboundedSender<Incoming>,
    ) -> Result<(), TransportError>;

    /// Disconnects; the incoming channel is closed.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Starts receiving frames published on the topic.
    async fn subscribe(&self, topic: Topic) -> Result<(), TransportError>;

    /// Publishes one frame on the topic.
    async fn publish(&self, topic: &Topic, frame: Vec<u8>) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn topic_names_follow_the_protocol() {
        assert_eq!(Topic::broadcast(PacketKind::Info).name(), "INFO");
        assert_eq!(Topic::unicast(PacketKind::Info, "n1").name(), "INFO.n1");
        assert_eq!(Topic::unicast(PacketKind::Request, "n1").name(), "REQ.n1");
        assert_eq!(Topic::unicast(PacketKind::Response, "n2").name(), "RES.n2");
        assert_eq!(Topic::broadcast(PacketKind::Heartbeat).name(), "HEARTBEAT");
        assert_eq!(Topic::unicast(PacketKind::Pong, "n3").name(), "PONG.n3");
    }
}
