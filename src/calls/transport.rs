//! Peer connection seam.
//!
//! The controller never talks to a media stack directly. A
//! [`PeerConnectionFactory`] builds one [`PeerConnection`] per call and hands
//! it a sender for [`TransportEvent`]s; the controller drains those events on
//! a task owned by the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callcore::candidate::TransportStats;
use callcore::frame_crypto::FrameCryptor;
use callcore::ice::IceTransportPolicy;
use callcore::states::TransportStates;
use callcore::types::{CallMediaType, CameraFacing, IceCandidate, IceServer, SessionDescription};
use tokio::sync::mpsc;

use super::error::TransportError;

/// Parameters for one peer connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub media: CallMediaType,
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    /// How long ICE may go without traffic before reporting disconnected.
    pub inactivity_timeout: Duration,
    /// Keep gathering after the first round so network changes are picked up.
    pub continual_gathering: bool,
}

/// Notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One of the four state machines changed. Carries all four.
    StatesChanged(TransportStates),
    /// A local candidate was gathered.
    CandidateGenerated(IceCandidate),
    /// The media path settled on a new candidate pair.
    SelectedPairChanged {
        local: IceCandidate,
        remote: IceCandidate,
    },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One peer-to-peer media session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: &SessionDescription)
    -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    fn set_track_enabled(&self, media: CallMediaType, enabled: bool);

    fn set_camera(&self, facing: CameraFacing);

    /// Installs or removes the cryptor applied to every outgoing and
    /// incoming media frame. After `None` returns, no frame callback may
    /// reach the previous cryptor.
    fn set_frame_cryptor(&self, cryptor: Option<Arc<FrameCryptor>>);

    /// Stops media and releases the connection. Idempotent.
    async fn close(&self);
}

/// Builds peer connections for new calls.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
