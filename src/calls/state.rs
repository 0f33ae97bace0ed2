//! Call state machine implementation.

use callcore::types::{CallMediaType, CameraFacing};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which side of the offer/answer exchange we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We sent the offer.
    Outgoing,
    /// We answered a remote offer.
    Incoming,
}

/// Why a call left the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// `end` command.
    Local,
    /// A new `start` replaced the call.
    Replaced,
    /// Transport reported failed or disconnected.
    TransportFailed,
    /// No local candidate appeared within the gathering timeout.
    GatheringTimeout,
    /// Creating or applying a session description failed.
    NegotiationFailed,
}

/// Current state of a call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CallState {
    /// Local offer created, waiting for the remote answer.
    Offering { started_at: DateTime<Utc> },
    /// Remote offer applied, local answer being produced.
    Answering { received_at: DateTime<Utc> },
    /// Both descriptions applied, waiting for connectivity.
    Connecting { negotiated_at: DateTime<Utc> },
    /// Media path established.
    Active { connected_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            Self::Offering { .. } | Self::Answering { .. } | Self::Connecting { .. }
        )
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Remote answer applied on the offering side.
    AnswerApplied,
    /// Local answer set on the answering side.
    AnswerSent,
    MediaConnected,
    Terminated { reason: EndReason },
}

/// Snapshot of the call occupying the controller's slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    /// Increases with every call the controller creates.
    pub generation: u64,
    pub direction: CallDirection,
    pub media_type: CallMediaType,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub camera: CameraFacing,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub encrypted: bool,
    /// Fingerprint of the frame key, never the key itself.
    pub key_fingerprint: Option<String>,
    pub local_candidates: usize,
}

impl CallInfo {
    pub fn new_outgoing(generation: u64, media_type: CallMediaType) -> Self {
        Self::new(
            generation,
            CallDirection::Outgoing,
            media_type,
            CallState::Offering {
                started_at: Utc::now(),
            },
        )
    }

    pub fn new_incoming(generation: u64, media_type: CallMediaType) -> Self {
        Self::new(
            generation,
            CallDirection::Incoming,
            media_type,
            CallState::Answering {
                received_at: Utc::now(),
            },
        )
    }

    fn new(
        generation: u64,
        direction: CallDirection,
        media_type: CallMediaType,
        state: CallState,
    ) -> Self {
        Self {
            generation,
            direction,
            media_type,
            state,
            created_at: Utc::now(),
            camera: CameraFacing::default(),
            audio_enabled: true,
            video_enabled: media_type.has_video(),
            encrypted: false,
            key_fingerprint: None,
            local_candidates: 0,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Offering { .. }, CallTransition::AnswerApplied)
            | (CallState::Answering { .. }, CallTransition::AnswerSent) => CallState::Connecting {
                negotiated_at: Utc::now(),
            },
            (CallState::Connecting { .. }, CallTransition::MediaConnected) => CallState::Active {
                connected_at: Utc::now(),
            },
            (CallState::Active { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Terminated { reason }) if !current.is_ended() => {
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
