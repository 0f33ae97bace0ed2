//! In-process peer connection.
//!
//! Produces synthetic session descriptions, gathers a configurable list of
//! local candidates on a timer once the local description is set, and keeps
//! everything the controller asked of it for inspection. Tests and the demo
//! binary use it in place of a real media stack; [`MemoryPeerConnection::emit`]
//! injects transport events by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use callcore::candidate::TransportStats;
use callcore::frame_crypto::{FrameCryptoError, FrameCryptor};
use callcore::ice::IceTransportPolicy;
use callcore::states::{IceGatheringState, SignalingState, TransportStates};
use callcore::types::{CallMediaType, CameraFacing, IceCandidate, SdpType, SessionDescription};
use log::{debug, trace};
use tokio::task::JoinHandle;

use super::error::TransportError;
use super::transport::{
    PeerConnection, PeerConnectionFactory, SessionConfig, TransportEvent, TransportEventSender,
};

const DEFAULT_LOCAL_CANDIDATES: [&str; 3] = [
    "candidate:1 1 udp 2122260223 192.168.1.20 54400 typ host",
    "candidate:2 1 udp 1686052607 198.51.100.7 54400 typ srflx raddr 192.168.1.20 rport 54400",
    "candidate:3 1 udp 41885439 203.0.113.20 3478 typ relay raddr 198.51.100.7 rport 54400",
];

fn local_candidate(attribute: &str) -> IceCandidate {
    IceCandidate::new(attribute)
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
}

/// Behaviour of connections built by a [`MemoryPeerConnectionFactory`].
#[derive(Debug, Clone)]
pub struct MemoryTransportOptions {
    /// Candidates gathered after the local description is set, in order.
    pub local_candidates: Vec<IceCandidate>,
    /// Delay before each gathered candidate.
    pub candidate_delay: Duration,
    /// Time `close` takes before the connection reports itself closed.
    pub close_delay: Duration,
    pub fail_create: bool,
    pub fail_remote_description: bool,
}

impl Default for MemoryTransportOptions {
    fn default() -> Self {
        Self {
            local_candidates: Vec::from(DEFAULT_LOCAL_CANDIDATES.map(local_candidate)),
            candidate_delay: Duration::from_millis(100),
            close_delay: Duration::ZERO,
            fail_create: false,
            fail_remote_description: false,
        }
    }
}

impl MemoryTransportOptions {
    /// Never gathers a candidate.
    pub fn silent() -> Self {
        Self {
            local_candidates: Vec::new(),
            ..Default::default()
        }
    }
}

pub struct MemoryPeerConnectionFactory {
    options: Mutex<MemoryTransportOptions>,
    connections: Mutex<Vec<Arc<MemoryPeerConnection>>>,
    next_id: AtomicU64,
}

impl MemoryPeerConnectionFactory {
    pub fn new(options: MemoryTransportOptions) -> Arc<Self> {
        Arc::new(Self {
            options: Mutex::new(options),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Options used for connections created from now on.
    pub fn set_options(&self, options: MemoryTransportOptions) {
        *lock(&self.options) = options;
    }

    /// Every connection built so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MemoryPeerConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last(&self) -> Option<Arc<MemoryPeerConnection>> {
        lock(&self.connections).last().cloned()
    }
}

impl PeerConnectionFactory for MemoryPeerConnectionFactory {
    fn create(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let options = lock(&self.options).clone();
        if options.fail_create {
            return Err(TransportError::Create("configured to fail".into()));
        }
        let connection = Arc::new(MemoryPeerConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            config: config.clone(),
            options,
            events,
            inner: Mutex::new(MemoryInner::default()),
        });
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct MemoryInner {
    states: TransportStates,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    tracks: HashMap<CallMediaType, bool>,
    camera: CameraFacing,
    cryptor: Option<Arc<FrameCryptor>>,
    stats: TransportStats,
    gathering: Option<JoinHandle<()>>,
    closed: bool,
}

pub struct MemoryPeerConnection {
    id: u64,
    config: SessionConfig,
    options: MemoryTransportOptions,
    events: TransportEventSender,
    inner: Mutex<MemoryInner>,
}

impl MemoryPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sends `event` to the controller as if the transport raised it.
    /// Returns false once the controller stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Sets the given states and reports them.
    pub fn emit_states(&self, states: TransportStates) -> bool {
        lock(&self.inner).states = states.clone();
        self.emit(TransportEvent::StatesChanged(states))
    }

    pub fn set_stats(&self, stats: TransportStats) {
        lock(&self.inner).stats = stats;
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    /// Remote candidates applied to the connection, in order.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).remote_candidates.clone()
    }

    pub fn track_enabled(&self, media: CallMediaType) -> Option<bool> {
        lock(&self.inner).tracks.get(&media).copied()
    }

    pub fn camera(&self) -> CameraFacing {
        lock(&self.inner).camera
    }

    pub fn frame_cryptor(&self) -> Option<Arc<FrameCryptor>> {
        lock(&self.inner).cryptor.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Runs an outgoing media frame through the installed cryptor, or passes
    /// it through unchanged when none is installed.
    pub fn transform_outgoing(&self, frame: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
        let Some(cryptor) = self.frame_cryptor() else {
            return Ok(frame.to_vec());
        };
        let mut out = Vec::new();
        cryptor.encrypt(frame, &mut out)?;
        Ok(out)
    }

    /// Incoming counterpart of [`Self::transform_outgoing`].
    pub fn transform_incoming(&self, frame: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
        let Some(cryptor) = self.frame_cryptor() else {
            return Ok(frame.to_vec());
        };
        let mut out = Vec::new();
        cryptor.decrypt(frame, &mut out)?;
        Ok(out)
    }

    fn synthetic_sdp(&self, sdp_type: SdpType) -> String {
        let video = self.config.media.has_video();
        let mut sdp = format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\n", self.id);
        sdp.push_str("s=-\r\nt=0 0\r\n");
        let bundle = if video { "0 1" } else { "0" };
        sdp.push_str(&format!("a=group:BUNDLE {bundle}\r\n"));
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n");
        sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\n");
            sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
        }
        sdp.push_str(match sdp_type {
            SdpType::Offer => "a=setup:actpass\r\n",
            _ => "a=setup:active\r\n",
        });
        sdp
    }

    fn update_states(&self, update: impl FnOnce(&mut TransportStates)) {
        let states = {
            let mut inner = lock(&self.inner);
            update(&mut inner.states);
            inner.states.clone()
        };
        self.emit(TransportEvent::StatesChanged(states));
    }

    /// Candidates this connection gathers under its transport policy.
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.options
            .local_candidates
            .iter()
            .filter(|c| {
                self.config.ice_transport_policy == IceTransportPolicy::All
                    || c.candidate.contains(" typ relay")
            })
            .cloned()
            .collect()
    }

    fn start_gathering(&self) {
        let candidates = self.local_candidates();
        let delay = self.options.candidate_delay;
        let events = self.events.clone();
        let mut states = lock(&self.inner).states.clone();
        let id = self.id;

        let task = tokio::spawn(async move {
            states.ice_gathering = IceGatheringState::Gathering;
            let _ = events.send(TransportEvent::StatesChanged(states.clone()));
            for candidate in candidates {
                tokio::time::sleep(delay).await;
                trace!("memory#{id}: gathered {}", candidate.candidate);
                let event = TransportEvent::CandidateGenerated(candidate);
                if events.send(event).is_err() {
                    return;
                }
            }
        });

        let mut inner = lock(&self.inner);
        if let Some(previous) = inner.gathering.replace(task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sdp = self.synthetic_sdp(SdpType::Offer);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let has_remote_offer = {
            let inner = lock(&self.inner);
            if inner.closed {
                return Err(TransportError::Closed);
            }
            matches!(&inner.remote, Some(d) if d.sdp_type == SdpType::Offer)
        };
        if !has_remote_offer {
            return Err(TransportError::Negotiation("no remote offer".into()));
        }
        let sdp = self.synthetic_sdp(SdpType::Answer);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.local = Some(desc.clone());
        }
        self.update_states(|s| {
            s.signaling = match desc.sdp_type {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                _ => SignalingState::Stable,
            }
        });
        self.start_gathering();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        if self.options.fail_remote_description {
            return Err(TransportError::Negotiation("rejected".into()));
        }
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.remote = Some(desc.clone());
        }
        self.update_states(|s| {
            s.signaling = match desc.sdp_type {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                _ => SignalingState::Stable,
            }
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if inner.remote.is_none() {
            return Err(TransportError::Candidate("no remote description".into()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Candidate(candidate.candidate.clone()));
        }
        inner.remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        Ok(lock(&self.inner).stats.clone())
    }

    fn set_track_enabled(&self, media: CallMediaType, enabled: bool) {
        lock(&self.inner).tracks.insert(media, enabled);
    }

    fn set_camera(&self, facing: CameraFacing) {
        lock(&self.inner).camera = facing;
    }

    fn set_frame_cryptor(&self, cryptor: Option<Arc<FrameCryptor>>) {
        lock(&self.inner).cryptor = cryptor;
    }

    async fn close(&self) {
        if !self.options.close_delay.is_zero() {
            tokio::time::sleep(self.options.close_delay).await;
        }
        let mut inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.cryptor = None;
        if let Some(task) = inner.gathering.take() {
            task.abort();
        }
        debug!("memory#{}: closed", self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
