//! Call controller.
//!
//! Holds at most one call. Commands arrive through [`CallController::handle`]
//! and are answered on the response channel returned by
//! [`CallController::new`]; transport events of the current call are turned
//! into `connection`, `connected`, `ice` and `ended` messages on the same
//! channel.
//!
//! Every call gets a generation number. Events and late results carrying a
//! generation other than the one in the slot are discarded.

use std::sync::{Arc, Weak};

use callcore::candidate::correlate_selected_pair;
use callcore::codec;
use callcore::frame_crypto::{FrameCryptor, FrameKey};
use callcore::ice::{IceTransportPolicy, resolve_ice_servers};
use callcore::states::{TransportStates, connection_event};
use callcore::types::{
    CallCapabilities, CallMediaType, CallMessage, CallRequest, CameraFacing, Command, IceCandidate,
    IceServer, Response, SessionDescription,
};
use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::session::SignalingSession;
use super::state::{CallDirection, CallInfo, CallState, CallTransition, EndReason};
use super::transport::{PeerConnectionFactory, SessionConfig, TransportEvent};
use super::wait::wait_with_timeout;
use crate::config::CallControllerConfig;

struct ActiveCall {
    info: CallInfo,
    session: SignalingSession,
    local_candidates: Vec<IceCandidate>,
    /// How many local candidates the peer has seen. `None` until the offer or
    /// answer went out.
    announced: Option<usize>,
    cryptor: Option<Arc<FrameCryptor>>,
    events_task: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn transition(&mut self, transition: CallTransition) {
        if let Err(e) = self.info.apply_transition(transition) {
            debug!("Call {}: {e}", self.info.generation);
        }
    }
}

#[derive(Default)]
struct CallSlot {
    call: Option<ActiveCall>,
    last_generation: u64,
}

impl CallSlot {
    fn current(&mut self, generation: u64) -> Option<&mut ActiveCall> {
        self.call
            .as_mut()
            .filter(|call| call.info.generation == generation)
    }

    fn active(&mut self, command: &'static str) -> Result<&mut ActiveCall, CallError> {
        self.call.as_mut().ok_or(CallError::NotStarted(command))
    }
}

/// Parameters shared by `start` and `offer` for opening a call.
struct CallSetup<'a> {
    command: &'static str,
    direction: CallDirection,
    media: CallMediaType,
    ice_servers: Option<&'a [IceServer]>,
    relay: Option<bool>,
    cryptor: Option<Arc<FrameCryptor>>,
}

/// Drives a single peer-to-peer call from signaling commands.
pub struct CallController {
    config: CallControllerConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    slot: Mutex<CallSlot>,
    responses: mpsc::UnboundedSender<CallMessage>,
    me: Weak<CallController>,
}

impl CallController {
    /// Creates a controller and the receiving end of its response channel.
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        config: CallControllerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallMessage>) {
        let (responses, rx) = mpsc::unbounded_channel();
        let controller = Arc::new_cyclic(|me| Self {
            config,
            factory,
            slot: Mutex::new(CallSlot::default()),
            responses,
            me: me.clone(),
        });
        (controller, rx)
    }

    pub fn config(&self) -> &CallControllerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> CallCapabilities {
        CallCapabilities {
            encryption: self.config.encryption_supported,
        }
    }

    /// Snapshot of the current call, if any.
    pub async fn active_call(&self) -> Option<CallInfo> {
        let slot = self.slot.lock().await;
        slot.call.as_ref().map(|call| call.info.clone())
    }

    /// The cryptor installed on the current call's media path.
    pub async fn frame_cryptor(&self) -> Option<Arc<FrameCryptor>> {
        let slot = self.slot.lock().await;
        slot.call.as_ref().and_then(|call| call.cryptor.clone())
    }

    pub async fn send_command(&self, command: Command) {
        self.handle(CallRequest {
            corr_id: None,
            command,
        })
        .await;
    }

    /// Executes one command and emits its response, echoing `corr_id`.
    ///
    /// A `start` that is superseded by another command while it waits for
    /// candidates emits nothing. `end` is acknowledged before the call is
    /// torn down.
    pub async fn handle(&self, request: CallRequest) {
        let CallRequest { corr_id, command } = request;
        let name = command.name();
        debug!("Handling {name} command");

        let resp = match self.execute(corr_id, &command).await {
            Ok(Some(resp)) => resp,
            Ok(None) => return,
            Err(e) => {
                warn!("Command {name} failed: {e}");
                Response::error(e.to_string())
            }
        };
        self.emit(CallMessage::reply(corr_id, command, resp));
    }

    /// Switches between front and back camera on a video call.
    pub async fn flip_camera(&self) -> Result<CameraFacing, CallError> {
        let mut slot = self.slot.lock().await;
        let call = slot.active("camera")?;
        if !call.info.media_type.has_video() {
            return Err(CallError::NoVideo("camera"));
        }
        let facing = call.info.camera.flipped();
        call.session.connection().set_camera(facing);
        call.info.camera = facing;
        debug!("Camera switched to {facing:?}");
        Ok(facing)
    }

    /// `Ok(None)` means the response was already emitted or the command was
    /// superseded.
    async fn execute(
        &self,
        corr_id: Option<i64>,
        command: &Command,
    ) -> Result<Option<Response>, CallError> {
        match command {
            Command::Capabilities => Ok(Some(Response::Capabilities {
                capabilities: self.capabilities(),
            })),
            Command::Start {
                media,
                aes_key,
                ice_servers,
                relay,
            } => {
                self.start(*media, aes_key.as_deref(), ice_servers.as_deref(), *relay)
                    .await
            }
            Command::Offer {
                offer,
                ice_candidates,
                media,
                aes_key,
                ice_servers,
                relay,
            } => self
                .accept(
                    offer,
                    ice_candidates,
                    *media,
                    aes_key.as_deref(),
                    ice_servers.as_deref(),
                    *relay,
                )
                .await
                .map(Some),
            Command::Answer {
                answer,
                ice_candidates,
            } => {
                self.apply_answer(answer, ice_candidates).await?;
                Ok(Some(Response::Ok))
            }
            Command::Ice { ice_candidates } => {
                self.add_remote_candidates(ice_candidates).await?;
                Ok(Some(Response::Ok))
            }
            Command::Media { media, enable } => {
                self.set_media(*media, *enable).await?;
                Ok(Some(Response::Ok))
            }
            Command::End => {
                let ack = CallMessage::reply(corr_id, command.clone(), Response::Ok);
                self.end_call(ack).await;
                Ok(None)
            }
        }
    }

    async fn start(
        &self,
        media: CallMediaType,
        aes_key: Option<&str>,
        ice_servers: Option<&[IceServer]>,
        relay: Option<bool>,
    ) -> Result<Option<Response>, CallError> {
        // Without encryption support a supplied key is ignored.
        let cryptor = self.build_cryptor("start", aes_key)?;

        let (generation, offer) = {
            let mut slot = self.slot.lock().await;
            if slot.call.is_some() {
                info!("Replacing the active call with a new outgoing call");
                self.teardown(&mut slot, EndReason::Replaced).await;
            }
            let call = self.open_call(
                &mut slot,
                CallSetup {
                    command: "start",
                    direction: CallDirection::Outgoing,
                    media,
                    ice_servers,
                    relay,
                    cryptor,
                },
            )?;
            let generation = call.info.generation;
            let offered = call.session.create_local_offer().await;
            match offered {
                Ok(offer) => (generation, offer),
                Err(e) => {
                    self.teardown(&mut slot, EndReason::NegotiationFailed).await;
                    return Err(CallError::session("start", e));
                }
            }
        };

        // The slot lock is released here so the event task can record
        // candidates and other commands (notably `end`) can run.
        let gathered = wait_with_timeout(
            self.config.ice_gathering_timeout,
            self.config.ice_gathering_step,
            || self.gathering_settled(generation),
        )
        .await;

        let mut slot = self.slot.lock().await;
        let Some(call) = slot.current(generation) else {
            debug!("Call {generation} went away while gathering candidates");
            return Ok(None);
        };
        if !gathered {
            warn!(
                "No local ICE candidate within {:?}, ending call {generation}",
                self.config.ice_gathering_timeout
            );
            self.teardown(&mut slot, EndReason::GatheringTimeout).await;
            return Err(CallError::GatheringTimeout);
        }

        let ice_candidates = codec::encode(&call.local_candidates)?;
        call.announced = Some(call.local_candidates.len());
        info!(
            "Sending {} offer for call {generation} with {} candidates",
            media,
            call.local_candidates.len()
        );
        Ok(Some(Response::Offer {
            offer: codec::encode(&offer)?,
            ice_candidates,
            capabilities: self.capabilities(),
        }))
    }

    async fn accept(
        &self,
        offer: &str,
        ice_candidates: &str,
        media: CallMediaType,
        aes_key: Option<&str>,
        ice_servers: Option<&[IceServer]>,
        relay: Option<bool>,
    ) -> Result<Response, CallError> {
        let mut slot = self.slot.lock().await;
        if slot.call.is_some() {
            return Err(CallError::AlreadyStarted);
        }
        if aes_key.is_some() && !self.config.encryption_supported {
            return Err(CallError::EncryptionUnsupported);
        }
        let offer: SessionDescription =
            codec::decode(offer).map_err(|e| CallError::decode("accept", "offer", e))?;
        let remote_candidates: Vec<IceCandidate> = codec::decode(ice_candidates)
            .map_err(|e| CallError::decode("accept", "ICE candidates", e))?;
        let cryptor = self.build_cryptor("accept", aes_key)?;

        let call = self.open_call(
            &mut slot,
            CallSetup {
                command: "accept",
                direction: CallDirection::Incoming,
                media,
                ice_servers,
                relay,
                cryptor,
            },
        )?;
        let generation = call.info.generation;
        let answered = match call.session.add_remote_candidates(remote_candidates).await {
            Ok(_) => call.session.accept_remote_offer(offer).await,
            Err(e) => Err(e),
        };
        let answer = match answered {
            Ok(answer) => answer,
            Err(e) => {
                self.teardown(&mut slot, EndReason::NegotiationFailed).await;
                return Err(CallError::session("accept", e));
            }
        };
        call.transition(CallTransition::AnswerSent);
        call.announced = Some(call.local_candidates.len());
        info!("Answering {media} call {generation}");

        Ok(Response::Answer {
            answer: codec::encode(&answer)?,
            ice_candidates: codec::encode(&call.local_candidates)?,
        })
    }

    async fn apply_answer(&self, answer: &str, ice_candidates: &str) -> Result<(), CallError> {
        let mut slot = self.slot.lock().await;
        let call = slot.active("answer")?;
        if !call.session.has_local_description() {
            return Err(CallError::LocalDescriptionNotSet);
        }
        if call.session.has_remote_description() {
            return Err(CallError::RemoteDescriptionAlreadySet);
        }
        let answer: SessionDescription =
            codec::decode(answer).map_err(|e| CallError::decode("answer", "answer", e))?;
        let remote_candidates: Vec<IceCandidate> = codec::decode(ice_candidates)
            .map_err(|e| CallError::decode("answer", "ICE candidates", e))?;

        call.session
            .apply_remote_answer(answer)
            .await
            .map_err(|e| CallError::session("answer", e))?;
        call.transition(CallTransition::AnswerApplied);
        let added = call
            .session
            .add_remote_candidates(remote_candidates)
            .await
            .map_err(|e| CallError::session("answer", e))?;
        debug!("Applied answer with {added} remote candidates");
        Ok(())
    }

    async fn add_remote_candidates(&self, ice_candidates: &str) -> Result<(), CallError> {
        let mut slot = self.slot.lock().await;
        let call = slot.active("ice")?;
        let remote_candidates: Vec<IceCandidate> = codec::decode(ice_candidates)
            .map_err(|e| CallError::decode("ice", "ICE candidates", e))?;
        let count = remote_candidates.len();
        let added = call
            .session
            .add_remote_candidates(remote_candidates)
            .await
            .map_err(|e| CallError::session("ice", e))?;
        trace!("Received {count} remote candidates, {added} applied");
        Ok(())
    }

    async fn set_media(&self, media: CallMediaType, enable: bool) -> Result<(), CallError> {
        let mut slot = self.slot.lock().await;
        let call = slot.active("media")?;
        if media.has_video() && enable && !call.info.media_type.has_video() {
            return Err(CallError::NoVideo("media"));
        }
        call.session.connection().set_track_enabled(media, enable);
        match media {
            CallMediaType::Audio => call.info.audio_enabled = enable,
            CallMediaType::Video => call.info.video_enabled = enable,
        }
        Ok(())
    }

    /// Emits `ack`, then releases the call. The slot stays locked in between
    /// so no other command sees the acknowledged call.
    async fn end_call(&self, ack: CallMessage) {
        let mut slot = self.slot.lock().await;
        self.emit(ack);
        if slot.call.is_none() {
            debug!("End requested without an active call");
            return;
        }
        self.teardown(&mut slot, EndReason::Local).await;
    }

    fn build_cryptor(
        &self,
        command: &'static str,
        aes_key: Option<&str>,
    ) -> Result<Option<Arc<FrameCryptor>>, CallError> {
        let Some(encoded) = aes_key.filter(|_| self.config.encryption_supported) else {
            return Ok(None);
        };
        let key = FrameKey::from_encoded(encoded)
            .map_err(|source| CallError::InvalidKey { command, source })?;
        Ok(Some(Arc::new(FrameCryptor::new(key))))
    }

    fn open_call<'s>(
        &self,
        slot: &'s mut CallSlot,
        setup: CallSetup<'_>,
    ) -> Result<&'s mut ActiveCall, CallError> {
        let session_config = SessionConfig {
            media: setup.media,
            ice_servers: resolve_ice_servers(setup.ice_servers, self.config.ice_servers.as_deref()),
            ice_transport_policy: IceTransportPolicy::from_relay_flag(setup.relay),
            inactivity_timeout: self.config.inactivity_timeout,
            continual_gathering: true,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = SignalingSession::open(self.factory.as_ref(), session_config, events_tx)
            .map_err(|e| CallError::session(setup.command, e))?;

        slot.last_generation += 1;
        let generation = slot.last_generation;
        let mut info = match setup.direction {
            CallDirection::Outgoing => CallInfo::new_outgoing(generation, setup.media),
            CallDirection::Incoming => CallInfo::new_incoming(generation, setup.media),
        };
        if let Some(cryptor) = &setup.cryptor {
            session
                .connection()
                .set_frame_cryptor(Some(cryptor.clone()));
            info.encrypted = true;
            info.key_fingerprint = Some(cryptor.key().fingerprint().to_string());
            debug!(
                "Frame encryption enabled for call {generation} (key {})",
                cryptor.key().fingerprint()
            );
        }

        let events_task = tokio::spawn(run_transport_events(
            self.me.clone(),
            generation,
            events_rx,
        ));
        Ok(slot.call.insert(ActiveCall {
            info,
            session,
            local_candidates: Vec::new(),
            announced: None,
            cryptor: setup.cryptor,
            events_task: Some(events_task),
        }))
    }

    /// Releases the call in the slot.
    ///
    /// The cryptor is detached before anything awaits, so no media frame is
    /// processed with it once teardown has begun.
    async fn teardown(&self, slot: &mut CallSlot, reason: EndReason) {
        let Some(mut call) = slot.call.take() else {
            return;
        };
        if let Some(cryptor) = &call.cryptor {
            cryptor.detach();
        }
        call.session.connection().set_frame_cryptor(None);
        if let Some(task) = call.events_task.take() {
            task.abort();
        }
        call.session.close().await;
        call.transition(CallTransition::Terminated { reason });
        info!("Call {} ended ({reason:?})", call.info.generation);
    }

    /// True once the call has a local candidate, or is no longer the call
    /// being waited for.
    async fn gathering_settled(&self, generation: u64) -> bool {
        let slot = self.slot.lock().await;
        slot.call.as_ref().is_none_or(|call| {
            call.info.generation != generation || !call.local_candidates.is_empty()
        })
    }

    async fn on_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::StatesChanged(states) => {
                self.on_states_changed(generation, states).await
            }
            TransportEvent::CandidateGenerated(candidate) => {
                self.on_local_candidate(generation, candidate).await
            }
            TransportEvent::SelectedPairChanged { local, remote } => {
                self.on_selected_pair(generation, local, remote).await
            }
        }
    }

    async fn on_states_changed(&self, generation: u64, states: TransportStates) -> bool {
        let mut slot = self.slot.lock().await;
        let Some(call) = slot.current(generation) else {
            return false;
        };

        match connection_event(&states) {
            Some(state) => self.emit(CallMessage::event(Response::Connection { state })),
            None => debug!(
                "Dropping transport states with unrecognized values: {states:?}"
            ),
        }

        if states.ice_connection.is_connected()
            && matches!(call.info.state, CallState::Connecting { .. })
        {
            call.transition(CallTransition::MediaConnected);
        }

        if states.connection.is_terminal_failure() || states.ice_connection.is_terminal_failure() {
            warn!(
                "Transport lost (connection {}, ICE {}), ending call {generation}",
                states.connection, states.ice_connection
            );
            // This runs on the event task itself; detach the handle instead
            // of aborting it mid-teardown.
            call.events_task.take();
            self.teardown(&mut slot, EndReason::TransportFailed).await;
            self.emit(CallMessage::event(Response::Ended));
            return false;
        }
        true
    }

    async fn on_local_candidate(&self, generation: u64, candidate: IceCandidate) -> bool {
        let mut slot = self.slot.lock().await;
        let Some(call) = slot.current(generation) else {
            return false;
        };
        trace!("Local candidate: {}", candidate.candidate);
        call.local_candidates.push(candidate.clone());
        call.info.local_candidates = call.local_candidates.len();

        if self.config.trickle_ice && call.announced.is_some() {
            match codec::encode(&[candidate]) {
                Ok(ice_candidates) => {
                    self.emit(CallMessage::event(Response::Ice { ice_candidates }));
                    call.announced = Some(call.local_candidates.len());
                }
                Err(e) => warn!("Failed to encode local candidate: {e}"),
            }
        }
        true
    }

    async fn on_selected_pair(
        &self,
        generation: u64,
        local: IceCandidate,
        remote: IceCandidate,
    ) -> bool {
        let connection = {
            let mut slot = self.slot.lock().await;
            match slot.current(generation) {
                Some(call) => call.session.connection().clone(),
                None => return false,
            }
        };
        let stats = match connection.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to read transport stats: {e}");
                return true;
            }
        };
        let Some(connection_info) = correlate_selected_pair(&stats, &local, &remote) else {
            debug!("Selected candidate pair has no succeeded match in stats");
            return true;
        };

        let mut slot = self.slot.lock().await;
        if slot.current(generation).is_none() {
            return false;
        }
        info!(
            "Call {generation} connected via {} -> {}",
            connection_info
                .local_candidate
                .candidate_type
                .map_or("unknown", |t| t.as_str()),
            connection_info
                .remote_candidate
                .candidate_type
                .map_or("unknown", |t| t.as_str()),
        );
        self.emit(CallMessage::event(Response::Connected { connection_info }));
        true
    }

    fn emit(&self, message: CallMessage) {
        if self.responses.send(message).is_err() {
            debug!("Response receiver dropped, discarding message");
        }
    }
}

async fn run_transport_events(
    controller: Weak<CallController>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        if !controller.on_transport_event(generation, event).await {
            break;
        }
    }
    trace!("Transport event loop for call {generation} finished");
}
