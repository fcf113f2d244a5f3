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

//! Packets exchanged between peer brokers.
//!
//! Every packet carries a common envelope: the protocol version and the
//! id of the sending node. Payload encoding is delegated to the serializer
//! pluggable; the frame layout around an encoded payload is defined in
//! [`crate::transport::codec`].

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use std::convert::TryFrom;

use crate::{errors::ErrorPayload, service::ServiceInfo};

/// Version of the messaging protocol spoken by this crate. Packets with a
/// different `ver` are dropped on receive.
pub const PROTOCOL_VERSION: u8 = 1;

/// Announcement of a node and the full list of its services.
///
/// ### Processing
///
/// The receiver upserts the node entry and reconciles its service list
/// against the announced one: services absent from the packet are
/// unregistered together with their actions and events.
///
/// ### Generation
///
/// Broadcast once on start and whenever the local service list changes;
/// sent directly to a single peer as the response to DISCOVER.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// Full list of services hosted by the sender.
    pub services: Vec<ServiceInfo>,
    /// IP addresses of the sender.
    #[serde(default, rename = "ipList")]
    pub ip_list: Vec<String>,
    /// Client software of the sender.
    pub client: ClientInfo,
    /// Relevant part of the sender configuration.
    #[serde(default)]
    pub config: Value,
    /// Seconds since the sender started.
    #[serde(default)]
    pub uptime: u64,
}

/// Client software description, included in INFO packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client implementation type.
    #[serde(rename = "type")]
    pub client_type: String,
    /// Client implementation version.
    pub version: String,
    /// Language / toolchain version string.
    pub lang_version: String,
}

/// Periodic liveness beacon.
///
/// ### Processing
///
/// Updates `last_heartbeat_at` and the CPU usage of the sender's node
/// entry. A heartbeat from an unknown node triggers a targeted DISCOVER,
/// since the receiver has missed the sender's INFO.
///
/// ### Generation
///
/// Broadcast on a fixed interval while the broker is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// CPU usage of the sender, percent.
    #[serde(default)]
    pub cpu: f64,
}

/// Request for an INFO packet.
///
/// ### Processing
///
/// The receiver publishes its INFO on the sender's targeted INFO topic.
///
/// ### Generation
///
/// Broadcast on start; sent to a single node when a heartbeat arrives
/// from a node the registry does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
}

/// Remote invocation of an action.
///
/// ### Processing
///
/// The receiver materializes a context from the carried fields, invokes
/// the local action through its middleware chain and publishes a RESPONSE
/// with the same `id` on the sender's response topic.
///
/// ### Generation
///
/// Produced by `Broker::call` whenever endpoint selection picks a remote
/// endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// Id of the calling context; the RESPONSE echoes it.
    pub id: String,
    /// Full action name.
    pub action: String,
    /// Call parameters.
    #[serde(default)]
    pub params: Value,
    /// Propagated meta map.
    #[serde(default)]
    pub meta: Value,
    /// Remaining timeout budget, in milliseconds.
    pub timeout: u64,
    /// Depth of the calling context in its call graph.
    pub level: u32,
    /// Metrics flag of the calling context.
    #[serde(default)]
    pub metrics: bool,
    /// Id of the parent context, if any.
    #[serde(rename = "parentID")]
    pub parent_id: Option<String>,
    /// Id of the root request of the call graph.
    #[serde(rename = "requestID")]
    pub request_id: String,
}

/// Outcome of a remote invocation.
///
/// ### Validation
///
/// The packet is dropped if no pending request slot matches its `id`
/// (the request has already timed out or the caller is gone).
///
/// ### Processing
///
/// Resolves the pending slot: with `data` on success, with a rehydrated
/// error of the carried kind otherwise.
///
/// ### Generation
///
/// Published by the executing node on the caller's response topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// Id of the request context this responds to.
    pub id: String,
    /// Did the action handler succeed?
    pub success: bool,
    /// Action result; present iff `success`.
    #[serde(default)]
    pub data: Option<Value>,
    /// Failure description; present iff `!success`.
    #[serde(default)]
    pub error: Option<ErrorPayload>,
}

/// Event delivery to a single node.
///
/// ### Processing
///
/// The receiver invokes its local subscribers of `event`: all of them if
/// `groups` is empty (broadcast), otherwise one subscriber per listed
/// group (the sender has already balanced groups across nodes).
///
/// ### Generation
///
/// Produced by `Broker::emit` / `Broker::broadcast`, one packet per
/// target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Consumer groups to deliver to; `None` means every local subscriber.
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

/// Graceful departure notice.
///
/// ### Processing
///
/// The sender's node entry is marked unavailable and its services are
/// unregistered. The entry itself is retained so that late packets from
/// the departed node do not recreate it as a fresh, stale node.
///
/// ### Generation
///
/// Broadcast once during `Broker::stop`, before the transport disconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
}

/// Round-trip probe.
///
/// ### Processing
///
/// The receiver replies with a PONG echoing `time` and adding its own
/// arrival time.
///
/// ### Generation
///
/// Sent by `Broker::ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// Send time at the probing node.
    pub time: DateTime<Utc>,
}

/// Reply to a PING.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Protocol version.
    pub ver: u8,
    /// Id of the sending node.
    pub sender: String,
    /// Send time echoed from the PING.
    pub time: DateTime<Utc>,
    /// Arrival time at the replying node.
    pub arrived: DateTime<Utc>,
}

/// All packet kinds of the messaging protocol. The discriminant doubles
/// as the kind byte of the frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum PacketKind {
    Info = 0,
    Heartbeat = 1,
    Discover = 2,
    Request = 3,
    Response = 4,
    Event = 5,
    Disconnect = 6,
    Ping = 7,
    Pong = 8,
}

impl PacketKind {
    /// Symbolic name of the kind, used in topic names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Heartbeat => "HEARTBEAT",
            Self::Discover => "DISCOVER",
            Self::Request => "REQ",
            Self::Response => "RES",
            Self::Event => "EVENT",
            Self::Disconnect => "DISCONNECT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Info,
            1 => Self::Heartbeat,
            2 => Self::Discover,
            3 => Self::Request,
            4 => Self::Response,
            5 => Self::Event,
            6 => Self::Disconnect,
            7 => Self::Ping,
            8 => Self::Pong,
            other => anyhow::bail!("unknown packet kind byte: {}", other),
        })
    }
}

/// A parsed packet: the tagged union over all payload types.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant, missing_docs)]
pub enum Packet {
    Info(InfoPayload),
    Heartbeat(HeartbeatPayload),
    Discover(DiscoverPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Event(EventPayload),
    Disconnect(DisconnectPayload),
    Ping(PingPayload),
    Pong(PongPayload),
}

impl Packet {
    /// Kind of this packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Info(_) => PacketKind::Info,
            Self::Heartbeat(_) => PacketKind::Heartbeat,
            Self::Discover(_) => PacketKind::Discover,
            Self::Request(_) => PacketKind::Request,
            Self::Response(_) => PacketKind::Response,
            Self::Event(_) => PacketKind::Event,
            Self::Disconnect(_) => PacketKind::Disconnect,
            Self::Ping(_) => PacketKind::Ping,
            Self::Pong(_) => PacketKind::Pong,
        }
    }

    /// Id of the sending node.
    pub fn sender(&self) -> &str {
        match self {
            Self::Info(p) => &p.sender,
            Self::Heartbeat(p) => &p.sender,
            Self::Discover(p) => &p.sender,
            Self::Request(p) => &p.sender,
            Self::Response(p) => &p.sender,
            Self::Event(p) => &p.sender,
            Self::Disconnect(p) => &p.sender,
            Self::Ping(p) => &p.sender,
            Self::Pong(p) => &p.sender,
        }
    }

    /// Protocol version in the envelope.
    pub fn ver(&self) -> u8 {
        match self {
            Self::Info(p) => p.ver,
            Self::Heartbeat(p) => p.ver,
            Self::Discover(p) => p.ver,
            Self::Request(p) => p.ver,
            Self::Response(p) => p.ver,
            Self::Event(p) => p.ver,
            Self::Disconnect(p) => p.ver,
            Self::Ping(p) => p.ver,
            Self::Pong(p) => p.ver,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn kind_byte_mapping_is_stable() {
        let kinds = [
            PacketKind::Info,
            PacketKind::Heartbeat,
            PacketKind::Discover,
            PacketKind::Request,
            PacketKind::Response,
            PacketKind::Event,
            PacketKind::Disconnect,
            PacketKind::Ping,
            PacketKind::Pong,
        ];
        for kind in kinds.iter().copied() {
            assert_eq!(PacketKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(PacketKind::try_from(9).is_err());
    }

    #[test]
    fn request_payload_uses_wire_field_names() {
        let payload = RequestPayload {
            ver: PROTOCOL_VERSION,
            sender: "node-1".to_owned(),
            id: "ctx-1".to_owned(),
            action: "math.add".to_owned(),
            params: serde_json::json!({ "a": 2 }),
            meta: Value::Null,
            timeout: 5000,
            level: 1,
            metrics: false,
            parent_id: None,
            request_id: "req-1".to_owned(),
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert!(encoded.get("requestID").is_some());
        assert!(encoded.get("parentID").is_some());
        assert!(encoded.get("request_id").is_none());
    }
}
