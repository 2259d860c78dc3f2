//! JSON wire protocol shared by the node and the editor client.
//!
//! WebSocket text frames:
//! ```text
//! {"type":"init",   "data":"<doc>", "clientId":"<id>"}   server → client, first frame
//! {"type":"update", "data":"<doc>"}                      both directions
//! {"type":"cursor", "clientId":"<id>", "position":12}    clientId optional client → server
//! ```
//!
//! HTTP bodies for the discovery endpoints live here too so that the server
//! and its callers (peers, editor clients) agree on one definition.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::election::Role;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(serde_json::Error),
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
}

/// A WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Snapshot and identity for a newly connected client
    Init {
        data: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// Full document text
    Update { data: String },
    /// Cursor offset of one client
    Cursor {
        #[serde(
            rename = "clientId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        client_id: Option<String>,
        position: i64,
    },
}

impl Frame {
    pub fn init(document: impl Into<String>, client_id: impl Into<String>) -> Self {
        Frame::Init {
            data: document.into(),
            client_id: client_id.into(),
        }
    }

    pub fn update(document: impl Into<String>) -> Self {
        Frame::Update {
            data: document.into(),
        }
    }

    /// Server-side cursor broadcast; always carries the owner's id.
    pub fn cursor(client_id: impl Into<String>, position: u64) -> Self {
        Frame::Cursor {
            client_id: Some(client_id.into()),
            position: i64::try_from(position).unwrap_or(i64::MAX),
        }
    }

    /// Client-side cursor report; identity is implied by the connection.
    pub fn local_cursor(position: i64) -> Self {
        Frame::Cursor {
            client_id: None,
            position,
        }
    }

    /// Frame type tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Init { .. } => "init",
            Frame::Update { .. } => "update",
            Frame::Cursor { .. } => "cursor",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }
}

/// `GET /uptime`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeReport {
    pub id: String,
    /// Seconds since process start
    pub uptime: f64,
}

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub role: Role,
    /// Id of the node currently believed to be Main
    pub main: Option<String>,
}

/// `GET /election`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionReport {
    pub role: Role,
    pub main: Option<String>,
}
