//! Transport state taxonomy.
//!
//! Each transport state machine is an exhaustive enum with an explicit
//! `Unrecognized` case holding the raw value. Only recognized values map to a
//! reported string; [`connection_event`] drops a snapshot that contains any
//! unrecognized value.

use crate::types::ConnectionState;

macro_rules! transport_state {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            /// A value outside the reported taxonomy.
            Unrecognized(String),
        }

        impl $name {
            pub const RECOGNIZED: &'static [$name] = &[$($name::$variant),+];

            /// Reported name, or `None` for [`Self::Unrecognized`].
            pub fn as_str(&self) -> Option<&'static str> {
                match self {
                    $(Self::$variant => Some($text),)+
                    Self::Unrecognized(_) => None,
                }
            }

            pub fn from_raw(raw: &str) -> Self {
                match raw {
                    $($text => Self::$variant,)+
                    other => Self::Unrecognized(other.to_string()),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    Self::Unrecognized(raw) => write!(f, "unrecognized({raw})"),
                    other => f.write_str(other.as_str().unwrap_or_default()),
                }
            }
        }
    };
}

transport_state! {
    /// Aggregate peer connection state.
    PeerConnectionState {
        New => "new",
        Connecting => "connecting",
        Connected => "connected",
        Disconnected => "disconnected",
        Failed => "failed",
        Closed => "closed",
    }
}

transport_state! {
    IceConnectionState {
        New => "new",
        Checking => "checking",
        Connected => "connected",
        Completed => "completed",
        Failed => "failed",
        Disconnected => "disconnected",
        Closed => "closed",
    }
}

transport_state! {
    IceGatheringState {
        New => "new",
        Gathering => "gathering",
        Complete => "complete",
    }
}

transport_state! {
    SignalingState {
        Stable => "stable",
        HaveLocalOffer => "have-local-offer",
        HaveLocalPrAnswer => "have-local-pranswer",
        HaveRemoteOffer => "have-remote-offer",
        HaveRemotePrAnswer => "have-remote-pranswer",
        Closed => "closed",
    }
}

transport_state! {
    /// State of one local/remote candidate pair in transport stats.
    CandidatePairState {
        Frozen => "frozen",
        Waiting => "waiting",
        InProgress => "in-progress",
        Failed => "failed",
        Succeeded => "succeeded",
    }
}

impl PeerConnectionState {
    /// States after which the call cannot recover and is torn down.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

impl IceConnectionState {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// All four transport states at the moment one of them changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStates {
    pub connection: PeerConnectionState,
    pub ice_connection: IceConnectionState,
    pub ice_gathering: IceGatheringState,
    pub signaling: SignalingState,
}

impl Default for TransportStates {
    fn default() -> Self {
        Self {
            connection: PeerConnectionState::New,
            ice_connection: IceConnectionState::New,
            ice_gathering: IceGatheringState::New,
            signaling: SignalingState::Stable,
        }
    }
}

/// Maps a state snapshot to the reported event, or `None` if any of the four
/// values is unrecognized.
pub fn connection_event(states: &TransportStates) -> Option<ConnectionState> {
    Some(ConnectionState {
        connection_state: states.connection.as_str()?.to_string(),
        ice_connection_state: states.ice_connection.as_str()?.to_string(),
        ice_gathering_state: states.ice_gathering.as_str()?.to_string(),
        signaling_state: states.signaling.as_str()?.to_string(),
    })
}
