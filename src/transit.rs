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

//! Transit: the layer between broker operations and transport frames.
//!
//! The transit owns the topic subscriptions, the packet codec path
//! (serializer + frame layout) and the pending-response table correlating
//! REQUEST and RESPONSE packets. Registry-flavored packets (INFO,
//! HEARTBEAT, DISCOVER, DISCONNECT, EVENT, REQUEST, PING) are forwarded
//! to the broker; RESPONSE and PONG resolve pending slots in place.

use chrono::Utc;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use log::{debug, trace, warn};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use crate::{
    context::Context,
    errors::BrokerError,
    middleware::CallResult,
    packets::{
        Packet, PacketKind, PingPayload, PongPayload, RequestPayload, ResponsePayload,
        PROTOCOL_VERSION,
    },
    serializer::Serializer,
    transport::{codec, Incoming, Topic, Transport},
    Broker, BrokerInner,
};

/// Result of a PING round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct PingReport {
    /// The probed node.
    pub node_id: String,
    /// Round-trip time, milliseconds.
    pub elapsed_ms: i64,
    /// Estimated clock offset against the probed node, milliseconds.
    pub time_diff_ms: i64,
}

/// One parked caller awaiting a RESPONSE.
struct PendingSlot {
    tx: oneshot::Sender<CallResult>,
    node_id: String,
    action: String,
}

/// Packet plumbing of one broker.
pub struct Transit {
    node_id: String,
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer>,
    /// Pending request slots by context id. Removal from the map is the
    /// single-shot gate: whoever removes the slot resolves it.
    pending: Mutex<HashMap<String, PendingSlot>>,
    /// Pending ping probes by target node id.
    pending_pings: Mutex<HashMap<String, oneshot::Sender<PingReport>>>,
    broker: Mutex<Option<Weak<BrokerInner>>>,
    connected: AtomicBool,
    stopping: AtomicBool,
}

impl std::fmt::Debug for Transit {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Transit")
            .field("node_id", &self.node_id)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transit {
    /// Creates a transit over the given transport and serializer.
    pub fn new(
        node_id: impl Into<String>,
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            serializer,
            pending: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            broker: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Post-construction wiring: installs the weak back-reference to the
    /// broker that owns this transit.
    pub(crate) fn bind(&self, broker: &Broker) {
        *self.broker.lock().expect("transit lock poisoned") = Some(broker.downgrade());
    }

    fn broker(&self) -> Option<Broker> {
        self.broker
            .lock()
            .expect("transit lock poisoned")
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(Broker::from_inner)
    }

    /// Is the transport connected?
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connects the transport, subscribes the local topic set and spawns
    /// the receive loop.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        let (tx, rx) = mpsc::unbounded();
        self.transport.connect(tx).await?;
        self.connected.store(true, Ordering::Release);

        let node_id = self.node_id.clone();
        let subscriptions = [
            Topic::broadcast(PacketKind::Info),
            Topic::unicast(PacketKind::Info, &node_id),
            Topic::broadcast(PacketKind::Heartbeat),
            Topic::broadcast(PacketKind::Discover),
            Topic::unicast(PacketKind::Discover, &node_id),
            Topic::broadcast(PacketKind::Disconnect),
            Topic::unicast(PacketKind::Request, &node_id),
            Topic::unicast(PacketKind::Response, &node_id),
            Topic::unicast(PacketKind::Event, &node_id),
            Topic::broadcast(PacketKind::Ping),
            Topic::unicast(PacketKind::Ping, &node_id),
            Topic::unicast(PacketKind::Pong, &node_id),
        ];
        for topic in subscriptions.iter() {
            self.transport.subscribe(topic.clone()).await?;
        }

        let transit = Arc::clone(self);
        tokio::spawn(transit.receive_loop(rx));
        debug!("Transit of `{}` connected", self.node_id);
        Ok(())
    }

    /// Stops the transit: rejects every pending slot with
    /// BROKER_STOPPING and disconnects the transport.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.reject_all(BrokerError::BrokerStopping);
        self.connected.store(false, Ordering::Release);
        if let Err(err) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", err);
        }
    }

    /// Serializes and publishes a packet on the topic.
    pub async fn publish(&self, packet: &Packet, topic: &Topic) -> Result<(), BrokerError> {
        let payload = self.serializer.serialize(packet)?;
        let frame = codec::encode_frame(packet.kind(), payload).map_err(|err| {
            BrokerError::Transport {
                message: err.to_string(),
            }
        })?;
        trace!("Publishing {} packet on `{}`", packet.kind().as_str(), topic);
        self.transport.publish(topic, frame).await?;
        Ok(())
    }

    /// Sends a REQUEST for the context to the target node and parks the
    /// caller until the RESPONSE, the timeout or a disconnect resolves
    /// the slot; exactly one of them does.
    pub async fn send_request(&self, ctx: &Context, target_node: &str) -> CallResult {
        let payload = RequestPayload {
            ver: PROTOCOL_VERSION,
            sender: self.node_id.clone(),
            id: ctx.id.clone(),
            action: ctx.action.clone(),
            params: ctx.params.clone(),
            meta: ctx.meta_snapshot(),
            timeout: ctx.timeout,
            level: ctx.level,
            metrics: ctx.metrics,
            parent_id: ctx.parent_id.clone(),
            request_id: ctx.request_id.clone(),
        };

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("transit lock poisoned");
            pending.insert(
                ctx.id.clone(),
                PendingSlot {
                    tx,
                    node_id: target_node.to_owned(),
                    action: ctx.action.clone(),
                },
            );
        }

        let topic = Topic::unicast(PacketKind::Request, target_node);
        if let Err(err) = self.publish(&Packet::Request(payload), &topic).await {
            self.take_slot(&ctx.id);
            return Err(err);
        }

        let outcome = if ctx.timeout > 0 {
            match tokio::time::timeout(Duration::from_millis(ctx.timeout), &mut rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    // Losing the race against a just-arrived RESPONSE is
                    // fine: the slot is gone and the result is used.
                    if self.take_slot(&ctx.id).is_some() {
                        return Err(BrokerError::RequestTimeout {
                            action: ctx.action.clone(),
                            node_id: Some(target_node.to_owned()),
                            timeout: ctx.timeout,
                        });
                    }
                    rx.await
                }
            }
        } else {
            rx.await
        };

        outcome.unwrap_or_else(|_cancelled| {
            Err(BrokerError::Transport {
                message: "pending request slot dropped".to_owned(),
            })
        })
    }

    fn take_slot(&self, id: &str) -> Option<PendingSlot> {
        self.pending.lock().expect("transit lock poisoned").remove(id)
    }

    /// Rejects every pending slot with clones of the given error.
    pub fn reject_all(&self, error: BrokerError) {
        let slots: Vec<PendingSlot> = {
            let mut pending = self.pending.lock().expect("transit lock poisoned");
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.tx.send(Err(error.clone()));
        }
        self.pending_pings
            .lock()
            .expect("transit lock poisoned")
            .clear();
    }

    /// Rejects pending slots awaiting the given node with
    /// NODE_DISCONNECTED.
    pub fn reject_pending_for_node(&self, node_id: &str) {
        let slots: Vec<PendingSlot> = {
            let mut pending = self.pending.lock().expect("transit lock poisoned");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, slot)| slot.node_id == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for slot in slots {
            debug!(
                "Rejecting pending call of `{}`: node `{}` disconnected",
                slot.action, node_id
            );
            let _ = slot.tx.send(Err(BrokerError::NodeDisconnected {
                node_id: node_id.to_owned(),
            }));
        }
    }

    /// Sends a PING and awaits the PONG.
    pub async fn ping(&self, node_id: &str, timeout: Duration) -> Result<PingReport, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.pending_pings
            .lock()
            .expect("transit lock poisoned")
            .insert(node_id.to_owned(), tx);

        let packet = Packet::Ping(PingPayload {
            ver: PROTOCOL_VERSION,
            sender: self.node_id.clone(),
            time: Utc::now(),
        });
        self.publish(&packet, &Topic::unicast(PacketKind::Ping, node_id))
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_cancelled)) => Err(BrokerError::Transport {
                message: "pending ping dropped".to_owned(),
            }),
            Err(_elapsed) => {
                self.pending_pings
                    .lock()
                    .expect("transit lock poisoned")
                    .remove(node_id);
                Err(BrokerError::RequestTimeout {
                    action: format!("ping `{}`", node_id),
                    node_id: Some(node_id.to_owned()),
                    timeout: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Incoming>) {
        while let Some(incoming) = rx.next().await {
            self.receive(incoming).await;
        }
        if !self.stopping.load(Ordering::Acquire) {
            warn!("Transport stream of `{}` closed unexpectedly", self.node_id);
            self.connected.store(false, Ordering::Release);
            self.reject_all(BrokerError::Transport {
                message: "transport disconnected".to_owned(),
            });
        }
    }

    /// Decodes one frame and dispatches the packet.
    async fn receive(&self, incoming: Incoming) {
        let (kind, payload) = match codec::decode_frame(&incoming.frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Dropping malformed frame on `{}`: {}", incoming.topic, err);
                return;
            }
        };
        let packet = match self.serializer.deserialize(kind, &payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Dropping undecodable {} packet: {}", kind.as_str(), err);
                return;
            }
        };

        // Own broadcasts loop back on shared topics.
        if packet.sender() == self.node_id {
            return;
        }
        if packet.ver() != PROTOCOL_VERSION {
            warn!(
                "Dropping {} packet of protocol version {} from `{}`",
                kind.as_str(),
                packet.ver(),
                packet.sender()
            );
            return;
        }
        trace!(
            "Received {} packet from `{}`",
            kind.as_str(),
            packet.sender()
        );

        match packet {
            Packet::Response(payload) => self.resolve_response(payload),
            Packet::Pong(payload) => self.resolve_pong(&payload),
            other => {
                if let Some(broker) = self.broker() {
                    broker.handle_packet(other).await;
                }
            }
        }
    }

    /// Resolves the pending slot of a RESPONSE.
    fn resolve_response(&self, payload: ResponsePayload) {
        let slot = match self.take_slot(&payload.id) {
            Some(slot) => slot,
            None => {
                debug!(
                    "Dropping RESPONSE for unknown request `{}` from `{}`",
                    payload.id, payload.sender
                );
                return;
            }
        };
        let result = if payload.success {
            Ok(payload.data.unwrap_or(serde_json::Value::Null))
        } else {
            let error = payload.error.map_or_else(
                || BrokerError::Transport {
                    message: "RESPONSE carried neither data nor error".to_owned(),
                },
                |error| BrokerError::from_payload(error, &slot.action),
            );
            Err(error)
        };
        let _ = slot.tx.send(result);
    }

    /// Resolves a pending ping from a PONG.
    fn resolve_pong(&self, payload: &PongPayload) {
        let slot = self
            .pending_pings
            .lock()
            .expect("transit lock poisoned")
            .remove(&payload.sender);
        if let Some(tx) = slot {
            let now = Utc::now();
            let elapsed_ms = (now - payload.time).num_milliseconds();
            let remote_mid = payload.arrived;
            let local_mid = payload.time + chrono::Duration::milliseconds(elapsed_ms / 2);
            let report = PingReport {
                node_id: payload.sender.clone(),
                elapsed_ms,
                time_diff_ms: (remote_mid - local_mid).num_milliseconds(),
            };
            let _ = tx.send(report);
        }
    }

    /// Publishes the RESPONSE of an executed remote request.
    pub async fn send_response(&self, caller_node: &str, id: &str, result: CallResult) {
        let payload = match result {
            Ok(data) => ResponsePayload {
                ver: PROTOCOL_VERSION,
                sender: self.node_id.clone(),
                id: id.to_owned(),
                success: true,
                data: Some(data),
                error: None,
            },
            Err(error) => ResponsePayload {
                ver: PROTOCOL_VERSION,
                sender: self.node_id.clone(),
                id: id.to_owned(),
                success: false,
                data: None,
                error: Some(error.to_payload(&self.node_id)),
            },
        };
        let topic = Topic::unicast(PacketKind::Response, caller_node);
        if let Err(err) = self.publish(&Packet::Response(payload), &topic).await {
            warn!("Cannot send RESPONSE to `{}`: {}", caller_node, err);
        }
    }

    /// Publishes the PONG replying to a PING.
    pub async fn send_pong(&self, ping: &PingPayload) {
        let payload = PongPayload {
            ver: PROTOCOL_VERSION,
            sender: self.node_id.clone(),
            time: ping.time,
            arrived: Utc::now(),
        };
        let topic = Topic::unicast(PacketKind::Pong, &ping.sender);
        if let Err(err) = self.publish(&Packet::Pong(payload), &topic).await {
            warn!("Cannot send PONG to `{}`: {}", ping.sender, err);
        }
    }
}
