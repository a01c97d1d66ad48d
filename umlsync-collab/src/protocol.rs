//! Binary envelope for diagram synchronization over WebSocket.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┬──────────────┐
//! │ msg_type │ view_id   │ diagram_id │ sequence │ payload      │
//! │ 1 byte   │ 16 bytes  │ 16 bytes   │ varint   │ JSON, varied │
//! └──────────┴───────────┴────────────┴──────────┴──────────────┘
//! ```
//!
//! `sequence` carries the client sequence number on submissions, the log
//! sequence number on confirmations and the diagram version on state
//! messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use umlsync_core::{DiagramState, PatchOperation};
use uuid::Uuid;

use crate::broadcast::{ViewEvent, ViewInfo};
use crate::controller::Confirmation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client registers a view on a diagram.
    Join = 1,
    SubmitOperation = 2,
    OperationConfirmed = 3,
    /// Domain rejection, sent to the submitter only.
    OperationRejected = 4,
    /// Internal fault while processing a submission.
    OperationFailed = 5,
    StateReplaced = 6,
    PeerJoined = 7,
    PeerLeft = 8,
    Ping = 9,
    Pong = 10,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("expected {expected:?} message, got {found:?}")]
    UnexpectedType {
        expected: MessageType,
        found: MessageType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: String,
    pub display_name: String,
}

/// Payload of `OperationRejected` and `OperationFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub client_sequence_number: u64,
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub view_id: Uuid,
    pub diagram_id: Uuid,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn empty(msg_type: MessageType, view_id: Uuid, diagram_id: Uuid) -> Self {
        Self {
            msg_type,
            view_id,
            diagram_id,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    fn with_json<T: Serialize>(
        msg_type: MessageType,
        view_id: Uuid,
        diagram_id: Uuid,
        sequence: u64,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type,
            view_id,
            diagram_id,
            sequence,
            payload: serde_json::to_vec(payload)?,
        })
    }

    pub fn join(view_id: Uuid, diagram_id: Uuid, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Join, view_id, diagram_id, 0, request)
    }

    pub fn submit(view_id: Uuid, diagram_id: Uuid, operation: &PatchOperation) -> Result<Self, ProtocolError> {
        Self::with_json(
            MessageType::SubmitOperation,
            view_id,
            diagram_id,
            operation.client_sequence_number,
            operation,
        )
    }

    pub fn confirmed(view_id: Uuid, diagram_id: Uuid, confirmation: &Confirmation) -> Result<Self, ProtocolError> {
        Self::with_json(
            MessageType::OperationConfirmed,
            view_id,
            diagram_id,
            confirmation.sequence,
            confirmation,
        )
    }

    pub fn rejected(view_id: Uuid, diagram_id: Uuid, rejection: &Rejection) -> Result<Self, ProtocolError> {
        Self::with_json(
            MessageType::OperationRejected,
            view_id,
            diagram_id,
            rejection.client_sequence_number,
            rejection,
        )
    }

    pub fn failed(view_id: Uuid, diagram_id: Uuid, rejection: &Rejection) -> Result<Self, ProtocolError> {
        Self::with_json(
            MessageType::OperationFailed,
            view_id,
            diagram_id,
            rejection.client_sequence_number,
            rejection,
        )
    }

    pub fn state_replaced(view_id: Uuid, diagram_id: Uuid, state: &DiagramState) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::StateReplaced, view_id, diagram_id, state.version, state)
    }

    pub fn peer_joined(view_id: Uuid, diagram_id: Uuid, peer: &ViewInfo) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::PeerJoined, view_id, diagram_id, 0, peer)
    }

    pub fn peer_left(view_id: Uuid, diagram_id: Uuid, peer: &ViewInfo) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::PeerLeft, view_id, diagram_id, 0, peer)
    }

    /// Outbound message for a fan-out event addressed to `view_id`.
    pub fn from_event(view_id: Uuid, diagram_id: Uuid, event: &ViewEvent) -> Result<Self, ProtocolError> {
        match event {
            ViewEvent::StateReplaced(state) => Self::state_replaced(view_id, diagram_id, state),
            ViewEvent::PeerJoined(peer) => Self::peer_joined(view_id, diagram_id, peer),
            ViewEvent::PeerLeft(peer) => Self::peer_left(view_id, diagram_id, peer),
        }
    }

    pub fn ping(view_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, view_id, Uuid::nil())
    }

    pub fn pong(view_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, view_id, Uuid::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: &[MessageType]) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::UnexpectedType {
                expected: expected[0],
                found: self.msg_type,
            });
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.payload_as(&[MessageType::Join])
    }

    pub fn operation(&self) -> Result<PatchOperation, ProtocolError> {
        self.payload_as(&[MessageType::SubmitOperation])
    }

    pub fn confirmation(&self) -> Result<Confirmation, ProtocolError> {
        self.payload_as(&[MessageType::OperationConfirmed])
    }

    pub fn rejection(&self) -> Result<Rejection, ProtocolError> {
        self.payload_as(&[MessageType::OperationRejected, MessageType::OperationFailed])
    }

    pub fn state(&self) -> Result<DiagramState, ProtocolError> {
        self.payload_as(&[MessageType::StateReplaced])
    }

    pub fn peer(&self) -> Result<ViewInfo, ProtocolError> {
        self.payload_as(&[MessageType::PeerJoined, MessageType::PeerLeft])
    }
}
