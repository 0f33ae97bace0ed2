//! Call-related error types.
//!
//! [`CallError`] displays as the message carried by an `error` response, so
//! each variant is prefixed with the command it belongs to.

use callcore::codec::CodecError;
use callcore::frame_crypto::FrameCryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("{0}: call not started")]
    NotStarted(&'static str),

    #[error("accept: call already started")]
    AlreadyStarted,

    #[error("accept: encryption is not supported")]
    EncryptionUnsupported,

    #[error("answer: local description is not set")]
    LocalDescriptionNotSet,

    #[error("answer: remote description already set")]
    RemoteDescriptionAlreadySet,

    #[error("{0}: no video")]
    NoVideo(&'static str),

    #[error("{command}: invalid {payload}: {source}")]
    Decode {
        command: &'static str,
        payload: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("{command}: invalid encryption key: {source}")]
    InvalidKey {
        command: &'static str,
        #[source]
        source: FrameCryptoError,
    },

    #[error("{command}: {source}")]
    Session {
        command: &'static str,
        #[source]
        source: SessionError,
    },

    #[error("failed to encode signaling payload: {0}")]
    Encode(#[from] CodecError),

    #[error("start: ICE gathering timed out")]
    GatheringTimeout,
}

impl CallError {
    pub(crate) fn decode(command: &'static str, payload: &'static str, source: CodecError) -> Self {
        Self::Decode {
            command,
            payload,
            source,
        }
    }

    pub(crate) fn session(command: &'static str, source: impl Into<SessionError>) -> Self {
        Self::Session {
            command,
            source: source.into(),
        }
    }
}

/// Failure of one offer/answer step on a [`super::SignalingSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create session description: {0}")]
    CreateDescription(#[source] TransportError),

    #[error("local description is not set: {0}")]
    LocalDescription(#[source] TransportError),

    #[error("remote description is not set: {0}")]
    RemoteDescription(#[source] TransportError),

    #[error("local description already set")]
    LocalAlreadySet,

    #[error("remote description already set")]
    RemoteAlreadySet,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session closed")]
    Closed,
}

/// Errors reported by a [`super::PeerConnection`] backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create peer connection: {0}")]
    Create(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("transport closed")]
    Closed,
}
