use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::ServiceDescriptor;

/// Errors produced by envelope encoding/decoding.
///
/// A `Decode` or `Malformed` error invalidates the single envelope it was
/// raised for; the transport connection itself stays usable.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope encode failed: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("envelope decode failed: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
}

/// Control messages between node and relay.
///
/// Internally tagged on `type`; an unrecognized tag fails deserialization of
/// that envelope only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Node with no persisted token asks where a user can authorize it
    ReqAuthorizationUrl { node_id: String },
    /// Relay's reply: dashboard URL the user must visit
    ResAuthorizationUrl { auth_url: String },
    /// Pushed by the relay once a user completes authorization
    AuthToken { token: String },
    /// Node presents its token to attach the connection to its identity
    Register {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    RegisterError {
        code: RegisterErrorCode,
        message: String,
    },
    /// Registration accepted; the node should announce its services
    ConnectionReady {
        node_id: String,
        dashboard_url: String,
    },
    Announce { services: Vec<ServiceDescriptor> },
    /// Relay asks the node to dial a local service and bind it to a bridge
    OpenBridge {
        bridge_id: String,
        service: ServiceDescriptor,
    },
    CloseBridge { bridge_id: String },
    Ack { ack_msg_id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterErrorCode {
    InvalidToken,
    Unauthorized,
    MissingToken,
    NotRegistered,
}

/// Opaque bytes addressed to one bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRecord {
    pub bridge_id: String,
    pub payload: Bytes,
}

/// The single wire envelope: one per transport frame, CBOR-encoded,
/// carrying exactly one of `control` or `data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub msg_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub control: Option<ControlMessage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<DataRecord>,
}

impl Envelope {
    /// Wrap a control message with a fresh message id.
    pub fn control(msg: ControlMessage) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            control: Some(msg),
            data: None,
        }
    }

    /// Wrap a data payload with a fresh message id.
    pub fn data(bridge_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            control: None,
            data: Some(DataRecord {
                bridge_id: bridge_id.into(),
                payload,
            }),
        }
    }

    /// An ACK for the given message id.
    pub fn ack(ack_msg_id: &str) -> Self {
        Self::control(ControlMessage::Ack {
            ack_msg_id: ack_msg_id.to_string(),
        })
    }

    /// Encode to CBOR bytes for one transport frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.check()?;
        let mut buf = Vec::with_capacity(64);
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode one transport frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = ciborium::from_reader(bytes)?;
        envelope.check()?;
        Ok(envelope)
    }

    /// An envelope must carry exactly one of control or data.
    fn check(&self) -> Result<(), CodecError> {
        match (&self.control, &self.data) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(CodecError::Malformed("both control and data present")),
            (None, None) => Err(CodecError::Malformed("neither control nor data present")),
        }
    }
}
