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

//! Packet payload serialization.
//!
//! The broker core never touches encoded bytes beyond handing them to the
//! transport; both sides of a cluster must be configured with the same
//! serializer. The packet kind travels outside the payload (in the frame
//! header), which is why `deserialize` receives it explicitly.

use std::fmt;

use crate::{
    errors::BrokerError,
    packets::{Packet, PacketKind},
};

/// Encodes packets to bytes and back. Symmetric and total over
/// well-formed packets.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Encodes a packet payload.
    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, BrokerError>;

    /// Decodes a packet payload of the given kind.
    fn deserialize(&self, kind: PacketKind, bytes: &[u8]) -> Result<Packet, BrokerError>;
}

/// JSON serializer, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    fn encode_error(err: serde_json::Error) -> BrokerError {
        BrokerError::Transport {
            message: format!("cannot encode packet: {}", err),
        }
    }

    fn decode_error(kind: PacketKind, err: serde_json::Error) -> BrokerError {
        BrokerError::Transport {
            message: format!("cannot decode {} packet: {}", kind.as_str(), err),
        }
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, BrokerError> {
        let result = match packet {
            Packet::Info(payload) => serde_json::to_vec(payload),
            Packet::Heartbeat(payload) => serde_json::to_vec(payload),
            Packet::Discover(payload) => serde_json::to_vec(payload),
            Packet::Request(payload) => serde_json::to_vec(payload),
            Packet::Response(payload) => serde_json::to_vec(payload),
            Packet::Event(payload) => serde_json::to_vec(payload),
            Packet::Disconnect(payload) => serde_json::to_vec(payload),
            Packet::Ping(payload) => serde_json::to_vec(payload),
            Packet::Pong(payload) => serde_json::to_vec(payload),
        };
        result.map_err(Self::encode_error)
    }

    fn deserialize(&self, kind: PacketKind, bytes: &[u8]) -> Result<Packet, BrokerError> {
        let packet = match kind {
            PacketKind::Info => Packet::Info(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Heartbeat => Packet::Heartbeat(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Discover => Packet::Discover(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Request => Packet::Request(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Response => Packet::Response(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Event => Packet::Event(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Disconnect => Packet::Disconnect(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Ping => Packet::Ping(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
            PacketKind::Pong => Packet::Pong(
                serde_json::from_slice(bytes).map_err(|e| Self::decode_error(kind, e))?,
            ),
        };
        Ok(packet)
    }
}
