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

//! Errors that can occur while routing and executing calls.
//!
//! Every error kind carries enough data to cross the wire: the receiving
//! broker converts a failure into the `error` object of a RESPONSE packet,
//! and the calling broker rehydrates an error of the same kind, preserving
//! the id of the node where the failure originated.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced by the broker while resolving, dispatching or executing
/// an action call or event.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// No action entry with the requested name is known to the registry.
    #[error("Service `{action}` is not found")]
    ServiceNotFound {
        /// Requested action name.
        action: String,
    },

    /// The action is known, but no endpoint is available to serve it.
    #[error("Service `{action}` is not available")]
    ServiceNotAvailable {
        /// Requested action name.
        action: String,
        /// Node the call was pinned to, if any.
        node_id: Option<String>,
    },

    /// A remote call was not answered within the context timeout.
    #[error("Request to `{action}` timed out after {timeout} ms")]
    RequestTimeout {
        /// Requested action name.
        action: String,
        /// Node the request was sent to.
        node_id: Option<String>,
        /// Timeout that elapsed, in milliseconds.
        timeout: u64,
    },

    /// The call was refused without execution, e.g. by an open circuit.
    #[error("Request to `{action}` was rejected by node `{node_id}`")]
    RequestRejected {
        /// Requested action name.
        action: String,
        /// Node that refused the request.
        node_id: String,
    },

    /// Call parameters did not pass the compiled parameter checker.
    #[error("Parameters of `{action}` are invalid")]
    Validation {
        /// Requested action name.
        action: String,
        /// Checker output: a list of field errors.
        data: Value,
    },

    /// The transport failed to deliver a packet, or was disconnected while
    /// a request was pending.
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable failure description.
        message: String,
    },

    /// The target node disconnected while a request was pending on it.
    #[error("Node `{node_id}` is disconnected")]
    NodeDisconnected {
        /// Id of the disconnected node.
        node_id: String,
    },

    /// The local broker is shutting down; all pending work is rejected.
    #[error("Broker is stopping")]
    BrokerStopping,

    /// An error raised by an action handler. Carried across the wire
    /// verbatim, including its original name and code.
    #[error("{message}")]
    Custom {
        /// Error name chosen by the handler.
        name: String,
        /// Human-readable message.
        message: String,
        /// Numeric code, HTTP-like.
        code: u16,
        /// Structured error details.
        data: Value,
        /// Node where the error was thrown.
        node_id: Option<String>,
    },
}

impl BrokerError {
    /// Returns the symbolic kind of this error, as transmitted in the
    /// `type` field of a RESPONSE error object.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            Self::ServiceNotAvailable { .. } => "SERVICE_NOT_AVAILABLE",
            Self::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            Self::RequestRejected { .. } => "REQUEST_REJECTED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::NodeDisconnected { .. } => "NODE_DISCONNECTED",
            Self::BrokerStopping => "BROKER_STOPPING",
            Self::Custom { .. } => "CUSTOM",
        }
    }

    /// Returns the numeric code of this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::ServiceNotFound { .. } | Self::ServiceNotAvailable { .. } => 404,
            Self::RequestTimeout { .. } => 504,
            Self::RequestRejected { .. } => 503,
            Self::Validation { .. } => 422,
            Self::Transport { .. } => 500,
            Self::NodeDisconnected { .. } => 502,
            Self::BrokerStopping => 500,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Is retrying this call on another (or the same) endpoint allowed to
    /// succeed? Failures of the infrastructure are retryable; failures of
    /// the request itself are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::RequestRejected { .. }
                | Self::Transport { .. }
                | Self::NodeDisconnected { .. }
        )
    }

    /// Does this failure count against the circuit breaker of the endpoint
    /// that produced it? User errors and invalid parameters do not.
    pub fn trips_breaker(&self) -> bool {
        self.is_retryable()
    }

    /// Id of the node where the error originated, if known.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::ServiceNotAvailable { node_id, .. }
            | Self::RequestTimeout { node_id, .. }
            | Self::Custom { node_id, .. } => node_id.as_deref(),
            Self::RequestRejected { node_id, .. } | Self::NodeDisconnected { node_id } => {
                Some(node_id)
            }
            _ => None,
        }
    }

    /// Converts the error into its wire form for a RESPONSE packet.
    pub fn to_payload(&self, sender: &str) -> ErrorPayload {
        let name = match self {
            Self::Custom { name, .. } => name.clone(),
            _ => self.kind().to_owned(),
        };
        let data = match self {
            Self::Validation { data, .. } | Self::Custom { data, .. } => data.clone(),
            _ => Value::Null,
        };
        ErrorPayload {
            name,
            message: self.to_string(),
            code: self.code(),
            kind: self.kind().to_owned(),
            data,
            stack: None,
            node_id: self
                .node_id()
                .map(str::to_owned)
                .or_else(|| Some(sender.to_owned())),
        }
    }

    /// Rehydrates an error from its wire form. The kind and the id of the
    /// original thrower survive the round trip; unknown kinds come back as
    /// `Custom`.
    pub fn from_payload(payload: ErrorPayload, action: &str) -> Self {
        let node_id = payload.node_id.clone();
        match payload.kind.as_str() {
            "SERVICE_NOT_FOUND" => Self::ServiceNotFound {
                action: action.to_owned(),
            },
            "SERVICE_NOT_AVAILABLE" => Self::ServiceNotAvailable {
                action: action.to_owned(),
                node_id,
            },
            "REQUEST_TIMEOUT" => Self::RequestTimeout {
                action: action.to_owned(),
                node_id,
                timeout: 0,
            },
            "REQUEST_REJECTED" => Self::RequestRejected {
                action: action.to_owned(),
                node_id: node_id.unwrap_or_default(),
            },
            "VALIDATION_ERROR" => Self::Validation {
                action: action.to_owned(),
                data: payload.data,
            },
            "TRANSPORT_ERROR" => Self::Transport {
                message: payload.message,
            },
            "NODE_DISCONNECTED" => Self::NodeDisconnected {
                node_id: node_id.unwrap_or_default(),
            },
            "BROKER_STOPPING" => Self::BrokerStopping,
            _ => Self::Custom {
                name: payload.name,
                message: payload.message,
                code: payload.code,
                data: payload.data,
                node_id,
            },
        }
    }

    /// Shorthand for a user-thrown error with the given name and message.
    pub fn custom(name: impl Into<String>, message: impl Into<String>, code: u16) -> Self {
        Self::Custom {
            name: name.into(),
            message: message.into(),
            code,
            data: Value::Null,
            node_id: None,
        }
    }
}

/// Wire form of a broker error, carried in the `error` field of a RESPONSE
/// packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error name; equals the kind for built-in errors.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Numeric code.
    pub code: u16,
    /// Symbolic error kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Structured error details.
    #[serde(default)]
    pub data: Value,
    /// Stack trace of the original failure, if the thrower recorded one.
    #[serde(default)]
    pub stack: Option<String>,
    /// Id of the node where the error was thrown.
    #[serde(rename = "nodeID")]
    pub node_id: Option<String>,
}

/// Errors reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not connected.
    #[error("transport is not connected")]
    NotConnected,
    /// Sending or subscribing failed on the underlying substrate.
    #[error("transport failure: {0}")]
    Failed(String),
}

impl From<TransportError> for BrokerError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_survives_wire_round_trip() {
        let err = BrokerError::RequestRejected {
            action: "math.add".to_owned(),
            node_id: "node-2".to_owned(),
        };
        let payload = err.to_payload("node-2");
        let back = BrokerError::from_payload(payload, "math.add");
        assert_eq!(back.kind(), "REQUEST_REJECTED");
        assert_eq!(back.node_id(), Some("node-2"));
    }

    #[test]
    fn custom_error_keeps_name_code_and_data() {
        let err = BrokerError::Custom {
            name: "InsufficientFunds".to_owned(),
            message: "balance too low".to_owned(),
            code: 409,
            data: json!({ "balance": 3 }),
            node_id: None,
        };
        let payload = err.to_payload("node-1");
        assert_eq!(payload.name, "InsufficientFunds");
        // The thrower node is filled in by the responding side.
        assert_eq!(payload.node_id.as_deref(), Some("node-1"));

        let back = BrokerError::from_payload(payload, "wallet.withdraw");
        match back {
            BrokerError::Custom {
                name,
                code,
                data,
                node_id,
                ..
            } => {
                assert_eq!(name, "InsufficientFunds");
                assert_eq!(code, 409);
                assert_eq!(data, json!({ "balance": 3 }));
                assert_eq!(node_id.as_deref(), Some("node-1"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn retryable_split_matches_error_kinds() {
        let retryable = [
            BrokerError::RequestTimeout {
                action: "a".to_owned(),
                node_id: None,
                timeout: 100,
            },
            BrokerError::RequestRejected {
                action: "a".to_owned(),
                node_id: "n".to_owned(),
            },
            BrokerError::Transport {
                message: "gone".to_owned(),
            },
            BrokerError::NodeDisconnected {
                node_id: "n".to_owned(),
            },
        ];
        for err in &retryable {
            assert!(err.is_retryable(), "{} must be retryable", err.kind());
        }

        let terminal = [
            BrokerError::ServiceNotFound {
                action: "a".to_owned(),
            },
            BrokerError::Validation {
                action: "a".to_owned(),
                data: Value::Null,
            },
            BrokerError::custom("Boom", "boom", 500),
        ];
        for err in &terminal {
            assert!(!err.is_retryable(), "{} must not be retryable", err.kind());
        }
    }

    #[test]
    fn unknown_wire_kind_degrades_to_custom() {
        let payload = ErrorPayload {
            name: "WeirdError".to_owned(),
            message: "???".to_owned(),
            code: 500,
            kind: "SOMETHING_NEW".to_owned(),
            data: Value::Null,
            stack: None,
            node_id: Some("node-9".to_owned()),
        };
        let err = BrokerError::from_payload(payload, "a.b");
        assert_eq!(err.kind(), "CUSTOM");
        assert_eq!(err.node_id(), Some("node-9"));
    }
}
