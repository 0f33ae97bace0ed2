//! Command and response vocabulary exchanged with the call controller.
//!
//! Session descriptions and candidate lists travel as text produced by
//! [`crate::codec::encode`]; the controller decodes them itself so a malformed
//! peer payload can be reported instead of failing deserialization of the
//! whole command.

use serde::{Deserialize, Serialize};

use super::call::{CallCapabilities, CallMediaType, ConnectionInfo, ConnectionState, IceServer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    Capabilities,
    Start {
        media: CallMediaType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aes_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServer>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay: Option<bool>,
    },
    Offer {
        offer: String,
        ice_candidates: String,
        media: CallMediaType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aes_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServer>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay: Option<bool>,
    },
    Answer {
        answer: String,
        ice_candidates: String,
    },
    Ice {
        ice_candidates: String,
    },
    Media {
        media: CallMediaType,
        enable: bool,
    },
    End,
}

impl Command {
    /// Short name used in logs and error prefixes.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Capabilities => "capabilities",
            Self::Start { .. } => "start",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
            Self::Media { .. } => "media",
            Self::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Response {
    Capabilities {
        capabilities: CallCapabilities,
    },
    Offer {
        offer: String,
        ice_candidates: String,
        capabilities: CallCapabilities,
    },
    Answer {
        answer: String,
        ice_candidates: String,
    },
    /// Local candidates gathered after the offer or answer went out.
    Ice {
        ice_candidates: String,
    },
    Connection {
        state: ConnectionState,
    },
    Connected {
        connection_info: ConnectionInfo,
    },
    /// The call was torn down without an `end` command.
    Ended,
    Ok,
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Envelope carried on the outbound channel.
///
/// `command` is the command the response answers; it is `None` for events
/// raised by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<i64>,
    pub resp: Response,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
}

impl CallMessage {
    pub fn event(resp: Response) -> Self {
        Self {
            corr_id: None,
            resp,
            command: None,
        }
    }

    pub fn reply(corr_id: Option<i64>, command: Command, resp: Response) -> Self {
        Self {
            corr_id,
            resp,
            command: Some(command),
        }
    }
}

/// Inbound envelope: a command plus an optional correlation id echoed back
/// in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<i64>,
    pub command: Command,
}
