//! Wire frames.
//!
//! Every frame is JSON sent as a binary WebSocket message. A connection
//! starts with one `Handshake` in each direction; after that either side may
//! send `Request`s and answers each with exactly one `Response`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest frame accepted from a peer (4MB). Bigger frames are dropped.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Handshake(Handshake),
    Request {
        id: u64,
        procedure: String,
        body: Value,
    },
    Response {
        id: u64,
        #[serde(flatten)]
        outcome: Outcome,
    },
}

/// Identity one side presents when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Service name; both ends must agree
    pub service: String,
    /// Address the sender accepts connections on, used as its identifier
    pub address: String,
}

/// Result carried by a `Response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Body(Value),
    Error(String),
}

impl From<Result<Value, String>> for Outcome {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(body) => Outcome::Body(body),
            Err(message) => Outcome::Error(message),
        }
    }
}

impl From<Outcome> for Result<Value, String> {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Body(body) => Ok(body),
            Outcome::Error(message) => Err(message),
        }
    }
}

impl Frame {
    pub fn to_binary(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_binary(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "handshake",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
        }
    }
}
