//! ICE server selection and transport policy.

use once_cell::sync::Lazy;

use crate::types::IceServer;

const DEFAULT_TURN_USERNAME: &str = "private";
const DEFAULT_TURN_CREDENTIAL: &str = "yleob6AVkiNI87hpR94Z";

/// Built-in servers used when neither the command nor the configuration
/// supplies any.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServer>> = Lazy::new(|| {
    vec![
        IceServer::new("stun:stun.simplex.im:443"),
        IceServer::new("turn:turn.simplex.im:443?transport=udp")
            .with_credentials(DEFAULT_TURN_USERNAME, DEFAULT_TURN_CREDENTIAL),
        IceServer::new("turn:turn.simplex.im:443?transport=tcp")
            .with_credentials(DEFAULT_TURN_USERNAME, DEFAULT_TURN_CREDENTIAL),
    ]
});

/// Picks the servers for a new session: explicit list first, then the
/// configured list, then [`DEFAULT_ICE_SERVERS`].
pub fn resolve_ice_servers(
    explicit: Option<&[IceServer]>,
    configured: Option<&[IceServer]>,
) -> Vec<IceServer> {
    explicit
        .or(configured)
        .map(<[IceServer]>::to_vec)
        .unwrap_or_else(|| DEFAULT_ICE_SERVERS.clone())
}

/// Which candidate types the transport may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    /// Only TURN-relayed candidates.
    Relay,
}

impl IceTransportPolicy {
    pub fn from_relay_flag(relay: Option<bool>) -> Self {
        if relay == Some(true) {
            Self::Relay
        } else {
            Self::All
        }
    }
}
