//! End-to-end tests for the call controller over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use peercall::callcore::candidate::{CandidatePairStats, CandidateStats, TransportStats};
use peercall::callcore::ice::{DEFAULT_ICE_SERVERS, IceTransportPolicy};
use peercall::callcore::states::{
    CandidatePairState, IceConnectionState, PeerConnectionState, TransportStates,
};
use peercall::calls::memory::{
    MemoryPeerConnection, MemoryPeerConnectionFactory, MemoryTransportOptions,
};
use peercall::calls::{CallController, CallDirection, CallError, CallState, TransportEvent};
use peercall::codec;
use peercall::config::CallControllerConfig;
use peercall::frame_crypto::FrameKey;
use peercall::types::{
    CallMediaType, CallMessage, CallRequest, CameraFacing, CandidateType, Command, IceCandidate,
    IceServer, Response, SdpType, SessionDescription,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, timeout};

const PATIENCE: Duration = Duration::from_secs(120);

struct Peer {
    controller: Arc<CallController>,
    rx: UnboundedReceiver<CallMessage>,
    factory: Arc<MemoryPeerConnectionFactory>,
}

impl Peer {
    fn new(options: MemoryTransportOptions, config: CallControllerConfig) -> Self {
        let factory = MemoryPeerConnectionFactory::new(options);
        let (controller, rx) = CallController::new(factory.clone(), config);
        Self {
            controller,
            rx,
            factory,
        }
    }

    fn with_defaults() -> Self {
        Self::new(
            MemoryTransportOptions::default(),
            CallControllerConfig::default(),
        )
    }

    fn connection(&self) -> Arc<MemoryPeerConnection> {
        self.factory.last().expect("a connection was created")
    }

    async fn command(&mut self, command: Command) -> Response {
        self.controller.send_command(command).await;
        self.reply().await.resp
    }

    /// Next message answering a command, skipping transport events.
    async fn reply(&mut self) -> CallMessage {
        loop {
            let msg = self.recv().await;
            if msg.command.is_some() {
                return msg;
            }
        }
    }

    /// Next transport event matching `pred`.
    async fn event(&mut self, pred: impl Fn(&Response) -> bool) -> Response {
        loop {
            let msg = self.recv().await;
            if msg.command.is_none() && pred(&msg.resp) {
                return msg.resp;
            }
        }
    }

    async fn recv(&mut self) -> CallMessage {
        timeout(PATIENCE, self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("response channel closed")
    }

    fn drain(&mut self) -> Vec<CallMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn start(&mut self, media: CallMediaType, aes_key: Option<String>) -> (String, String) {
        let resp = self
            .command(Command::Start {
                media,
                aes_key,
                ice_servers: None,
                relay: None,
            })
            .await;
        match resp {
            Response::Offer {
                offer,
                ice_candidates,
                capabilities,
            } => {
                assert!(capabilities.encryption);
                (offer, ice_candidates)
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }
}

fn error_message(resp: &Response) -> &str {
    match resp {
        Response::Error { message } => message,
        other => panic!("expected error, got {other:?}"),
    }
}

fn states(connection: PeerConnectionState, ice: IceConnectionState) -> TransportStates {
    TransportStates {
        connection,
        ice_connection: ice,
        ..Default::default()
    }
}

/// Runs start → offer → answer between two peers sharing `key`.
async fn connect(caller: &mut Peer, callee: &mut Peer, media: CallMediaType, key: Option<String>) {
    let (offer, ice_candidates) = caller.start(media, key.clone()).await;
    let answer = callee
        .command(Command::Offer {
            offer,
            ice_candidates,
            media,
            aes_key: key,
            ice_servers: None,
            relay: None,
        })
        .await;
    let Response::Answer {
        answer,
        ice_candidates,
    } = answer
    else {
        panic!("expected answer, got {answer:?}");
    };
    assert_eq!(
        caller
            .command(Command::Answer {
                answer,
                ice_candidates,
            })
            .await,
        Response::Ok
    );
}

#[tokio::test]
async fn test_capabilities_echo_corr_id() {
    let mut peer = Peer::with_defaults();
    peer.controller
        .handle(CallRequest {
            corr_id: Some(42),
            command: Command::Capabilities,
        })
        .await;
    let msg = peer.reply().await;
    assert_eq!(msg.corr_id, Some(42));
    assert_eq!(msg.command, Some(Command::Capabilities));
    match msg.resp {
        Response::Capabilities { capabilities } => assert!(capabilities.encryption),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_produces_offer_with_candidates() {
    let mut peer = Peer::with_defaults();
    let key = FrameKey::generate_encoded();
    let (offer, ice_candidates) = peer.start(CallMediaType::Video, Some(key)).await;

    let offer: SessionDescription = codec::decode(&offer).unwrap();
    assert_eq!(offer.sdp_type, SdpType::Offer);
    assert!(offer.sdp.contains("m=video"));

    let candidates: Vec<IceCandidate> = codec::decode(&ice_candidates).unwrap();
    assert!(!candidates.is_empty());
    assert!(candidates[0].candidate.contains("typ host"));

    let info = peer.controller.active_call().await.expect("call is active");
    assert_eq!(info.direction, CallDirection::Outgoing);
    assert!(matches!(info.state, CallState::Offering { .. }));
    assert!(info.encrypted);
    assert!(info.key_fingerprint.is_some());
    assert_eq!(info.local_candidates, candidates.len());

    let cryptor = peer.controller.frame_cryptor().await.unwrap();
    assert!(cryptor.is_attached());
    assert!(peer.connection().frame_cryptor().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_start_without_key_has_no_cryptor() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;
    assert!(peer.controller.frame_cryptor().await.is_none());
    assert!(peer.connection().frame_cryptor().is_none());
    assert!(!peer.controller.active_call().await.unwrap().encrypted);
}

#[tokio::test(start_paused = true)]
async fn test_start_ignores_key_without_encryption_support() {
    let mut peer = Peer::new(
        MemoryTransportOptions::default(),
        CallControllerConfig {
            encryption_supported: false,
            ..Default::default()
        },
    );
    let resp = peer
        .command(Command::Start {
            media: CallMediaType::Audio,
            aes_key: Some(FrameKey::generate_encoded()),
            ice_servers: None,
            relay: None,
        })
        .await;
    match resp {
        Response::Offer { capabilities, .. } => assert!(!capabilities.encryption),
        other => panic!("expected offer, got {other:?}"),
    }
    assert!(peer.controller.frame_cryptor().await.is_none());
}

#[tokio::test]
async fn test_start_rejects_malformed_key() {
    let mut peer = Peer::with_defaults();
    let resp = peer
        .command(Command::Start {
            media: CallMediaType::Audio,
            aes_key: Some("dG9vIHNob3J0".into()),
            ice_servers: None,
            relay: None,
        })
        .await;
    assert!(
        error_message(&resp).starts_with("start: invalid encryption key")
    );
    assert!(peer.controller.active_call().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_offer_answer_exchange() {
    let mut caller = Peer::with_defaults();
    let mut callee = Peer::with_defaults();
    let (offer, ice_candidates) = caller.start(CallMediaType::Audio, None).await;
    let offered: Vec<IceCandidate> = codec::decode(&ice_candidates).unwrap();

    let resp = callee
        .command(Command::Offer {
            offer,
            ice_candidates,
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: None,
        })
        .await;
    let Response::Answer {
        answer,
        ice_candidates,
    } = resp
    else {
        panic!("expected answer, got {resp:?}");
    };

    // Candidates that came with the offer are applied once the remote
    // description is set.
    assert_eq!(callee.connection().remote_candidates(), offered);
    let callee_info = callee.controller.active_call().await.unwrap();
    assert_eq!(callee_info.direction, CallDirection::Incoming);
    assert!(matches!(callee_info.state, CallState::Connecting { .. }));

    assert_eq!(
        caller
            .command(Command::Answer {
                answer,
                ice_candidates,
            })
            .await,
        Response::Ok
    );
    let remote = caller.connection().remote_description().unwrap();
    assert_eq!(remote.sdp_type, SdpType::Answer);
    assert!(matches!(
        caller.controller.active_call().await.unwrap().state,
        CallState::Connecting { .. }
    ));

    // The callee gathers after answering; those candidates trickle out.
    let trickled = callee.event(|r| matches!(r, Response::Ice { .. })).await;
    let Response::Ice { ice_candidates } = trickled else {
        unreachable!()
    };
    let batch: Vec<IceCandidate> = codec::decode(&ice_candidates).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(
        caller.command(Command::Ice { ice_candidates }).await,
        Response::Ok
    );
    assert_eq!(caller.connection().remote_candidates(), batch);
}

#[tokio::test(start_paused = true)]
async fn test_trickle_can_be_disabled() {
    let mut callee = Peer::new(
        MemoryTransportOptions::default(),
        CallControllerConfig {
            trickle_ice: false,
            ..Default::default()
        },
    );
    let mut caller = Peer::with_defaults();
    connect(&mut caller, &mut callee, CallMediaType::Audio, None).await;

    sleep(Duration::from_secs(5)).await;
    assert!(
        callee
            .drain()
            .iter()
            .all(|m| !matches!(m.resp, Response::Ice { .. }))
    );
    let call = callee.controller.active_call().await.unwrap();
    assert_eq!(call.local_candidates, 3);
}

#[tokio::test]
async fn test_offer_with_key_when_encryption_unsupported() {
    let mut peer = Peer::new(
        MemoryTransportOptions::default(),
        CallControllerConfig {
            encryption_supported: false,
            ..Default::default()
        },
    );
    let resp = peer
        .command(Command::Offer {
            offer: codec::encode(&SessionDescription::offer("v=0")).unwrap(),
            ice_candidates: codec::encode(&Vec::<IceCandidate>::new()).unwrap(),
            media: CallMediaType::Audio,
            aes_key: Some(FrameKey::generate_encoded()),
            ice_servers: None,
            relay: None,
        })
        .await;
    assert_eq!(error_message(&resp), "accept: encryption is not supported");
    assert!(peer.controller.active_call().await.is_none());
    assert!(peer.factory.last().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_offer_while_call_active() {
    let mut peer = Peer::with_defaults();
    let (offer, ice_candidates) = peer.start(CallMediaType::Audio, None).await;
    let resp = peer
        .command(Command::Offer {
            offer,
            ice_candidates,
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: None,
        })
        .await;
    assert_eq!(error_message(&resp), "accept: call already started");
    assert!(matches!(
        peer.controller.active_call().await.unwrap().state,
        CallState::Offering { .. }
    ));
}

#[tokio::test]
async fn test_malformed_offer_payload() {
    let mut peer = Peer::with_defaults();
    let resp = peer
        .command(Command::Offer {
            offer: "not a payload".into(),
            ice_candidates: "also not".into(),
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: None,
        })
        .await;
    assert!(error_message(&resp).starts_with("accept: invalid offer:"));
    assert!(peer.controller.active_call().await.is_none());
}

#[tokio::test]
async fn test_remote_description_failure_releases_call() {
    let mut peer = Peer::new(
        MemoryTransportOptions {
            fail_remote_description: true,
            ..MemoryTransportOptions::silent()
        },
        CallControllerConfig::default(),
    );
    let resp = peer
        .command(Command::Offer {
            offer: codec::encode(&SessionDescription::offer("v=0")).unwrap(),
            ice_candidates: codec::encode(&Vec::<IceCandidate>::new()).unwrap(),
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: None,
        })
        .await;
    assert!(
        error_message(&resp).starts_with("accept: remote description is not set")
    );
    assert!(peer.controller.active_call().await.is_none());
    assert!(peer.connection().is_closed());
}

#[tokio::test]
async fn test_commands_without_call() {
    let mut peer = Peer::with_defaults();
    let payload = codec::encode(&Vec::<IceCandidate>::new()).unwrap();

    let resp = peer
        .command(Command::Answer {
            answer: payload.clone(),
            ice_candidates: payload.clone(),
        })
        .await;
    assert_eq!(error_message(&resp), "answer: call not started");

    let resp = peer
        .command(Command::Ice {
            ice_candidates: payload,
        })
        .await;
    assert_eq!(error_message(&resp), "ice: call not started");

    let resp = peer
        .command(Command::Media {
            media: CallMediaType::Audio,
            enable: false,
        })
        .await;
    assert_eq!(error_message(&resp), "media: call not started");

    let err = peer.controller.flip_camera().await.unwrap_err();
    assert!(matches!(err, CallError::NotStarted("camera")));
    assert_eq!(err.to_string(), "camera: call not started");

    // Ending with nothing to end still succeeds.
    assert_eq!(peer.command(Command::End).await, Response::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_answer_on_answering_side() {
    let mut caller = Peer::with_defaults();
    let mut callee = Peer::with_defaults();
    connect(&mut caller, &mut callee, CallMediaType::Audio, None).await;

    let payload = codec::encode(&SessionDescription::answer("v=0")).unwrap();
    let candidates = codec::encode(&Vec::<IceCandidate>::new()).unwrap();
    let resp = callee
        .command(Command::Answer {
            answer: payload.clone(),
            ice_candidates: candidates.clone(),
        })
        .await;
    assert_eq!(
        error_message(&resp),
        "answer: remote description already set"
    );

    let resp = caller
        .command(Command::Answer {
            answer: payload,
            ice_candidates: candidates,
        })
        .await;
    assert_eq!(
        error_message(&resp),
        "answer: remote description already set"
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_answer_keeps_call() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;
    let resp = peer
        .command(Command::Answer {
            answer: "%%%".into(),
            ice_candidates: "%%%".into(),
        })
        .await;
    assert!(error_message(&resp).starts_with("answer: invalid answer:"));
    assert!(peer.controller.active_call().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_media_toggles() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;

    let resp = peer
        .command(Command::Media {
            media: CallMediaType::Video,
            enable: true,
        })
        .await;
    assert_eq!(error_message(&resp), "media: no video");

    // Disabling video that does not exist is harmless.
    let resp = peer
        .command(Command::Media {
            media: CallMediaType::Video,
            enable: false,
        })
        .await;
    assert_eq!(resp, Response::Ok);

    let resp = peer
        .command(Command::Media {
            media: CallMediaType::Audio,
            enable: false,
        })
        .await;
    assert_eq!(resp, Response::Ok);
    assert_eq!(
        peer.connection().track_enabled(CallMediaType::Audio),
        Some(false)
    );
    assert!(!peer.controller.active_call().await.unwrap().audio_enabled);

    let err = peer.controller.flip_camera().await.unwrap_err();
    assert_eq!(err.to_string(), "camera: no video");
}

#[tokio::test(start_paused = true)]
async fn test_flip_camera() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Video, None).await;

    assert_eq!(
        peer.controller.flip_camera().await.unwrap(),
        CameraFacing::Back
    );
    assert_eq!(peer.connection().camera(), CameraFacing::Back);
    assert_eq!(
        peer.controller.flip_camera().await.unwrap(),
        CameraFacing::Front
    );
    assert_eq!(
        peer.controller.active_call().await.unwrap().camera,
        CameraFacing::Front
    );
}

#[tokio::test(start_paused = true)]
async fn test_end_releases_call_and_detaches_cryptor() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, Some(FrameKey::generate_encoded()))
        .await;
    let cryptor = peer.controller.frame_cryptor().await.unwrap();
    let connection = peer.connection();

    let frame = [0x01u8; 40];
    assert_eq!(connection.transform_outgoing(&frame).unwrap().len(), 68);
    assert_eq!(cryptor.frame_counts(), (1, 0));

    assert_eq!(peer.command(Command::End).await, Response::Ok);
    assert!(peer.controller.active_call().await.is_none());
    assert!(peer.controller.frame_cryptor().await.is_none());
    assert!(!cryptor.is_attached());
    assert!(connection.is_closed());
    assert!(connection.frame_cryptor().is_none());

    // No frame reaches the old cryptor after teardown.
    assert_eq!(
        connection.transform_outgoing(&frame).unwrap(),
        frame.to_vec()
    );
    assert_eq!(cryptor.frame_counts(), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_end_acknowledged_before_teardown() {
    let mut peer = Peer::new(
        MemoryTransportOptions {
            close_delay: Duration::from_secs(1),
            ..Default::default()
        },
        CallControllerConfig::default(),
    );
    peer.start(CallMediaType::Audio, None).await;
    let connection = peer.connection();

    let controller = peer.controller.clone();
    let end = tokio::spawn(async move {
        controller.send_command(Command::End).await;
    });
    let ack = peer.reply().await;
    assert_eq!(ack.command, Some(Command::End));
    assert_eq!(ack.resp, Response::Ok);
    // The transport is still closing.
    assert!(!connection.is_closed());

    // Nothing observes the call between the ack and the end of teardown.
    assert!(peer.controller.active_call().await.is_none());
    assert!(connection.is_closed());
    end.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_leave_one_call() {
    let mut peer = Peer::new(
        MemoryTransportOptions {
            candidate_delay: Duration::from_millis(200),
            ..Default::default()
        },
        CallControllerConfig {
            ice_gathering_step: Duration::from_millis(20),
            ..Default::default()
        },
    );

    let starts: Vec<_> = (0..8)
        .map(|_| {
            let controller = peer.controller.clone();
            tokio::spawn(async move {
                controller
                    .send_command(Command::Start {
                        media: CallMediaType::Audio,
                        aes_key: None,
                        ice_servers: None,
                        relay: None,
                    })
                    .await;
            })
        })
        .collect();
    for start in starts {
        start.await.unwrap();
    }

    let replies: Vec<_> = peer
        .drain()
        .into_iter()
        .filter(|msg| msg.command.is_some())
        .collect();
    assert_eq!(replies.len(), 1, "only the last start answers");
    assert!(matches!(replies[0].resp, Response::Offer { .. }));

    let connections = peer.factory.connections();
    assert_eq!(connections.len(), 8);
    assert_eq!(connections.iter().filter(|c| !c.is_closed()).count(), 1);
    let call = peer.controller.active_call().await.unwrap();
    assert_eq!(call.generation, 8);
}

#[tokio::test(start_paused = true)]
async fn test_start_replaces_existing_call() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;
    let first = peer.connection();

    peer.start(CallMediaType::Video, None).await;
    let second = peer.connection();

    assert!(first.is_closed());
    assert!(!second.is_closed());
    let info = peer.controller.active_call().await.unwrap();
    assert_eq!(info.generation, 2);
    assert_eq!(info.media_type, CallMediaType::Video);
}

#[tokio::test(start_paused = true)]
async fn test_gathering_timeout() {
    let mut peer = Peer::new(
        MemoryTransportOptions::silent(),
        CallControllerConfig::default(),
    );
    let started = Instant::now();
    let resp = peer
        .command(Command::Start {
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: None,
        })
        .await;
    assert_eq!(error_message(&resp), "start: ICE gathering timed out");
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(peer.controller.active_call().await.is_none());
    assert!(peer.connection().is_closed());
}

fn single_candidate_after(delay: Duration) -> MemoryTransportOptions {
    let defaults = MemoryTransportOptions::default();
    MemoryTransportOptions {
        local_candidates: defaults.local_candidates[..1].to_vec(),
        candidate_delay: delay,
        ..defaults
    }
}

#[tokio::test(start_paused = true)]
async fn test_candidate_just_before_timeout() {
    let mut peer = Peer::new(
        single_candidate_after(Duration::from_millis(9_500)),
        CallControllerConfig::default(),
    );
    let started = Instant::now();
    let (_, ice_candidates) = peer.start(CallMediaType::Audio, None).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(9_500));
    assert!(elapsed <= Duration::from_millis(10_500));
    let candidates: Vec<IceCandidate> = codec::decode(&ice_candidates).unwrap();
    assert_eq!(candidates.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_candidate_just_after_timeout() {
    let mut peer = Peer::new(
        single_candidate_after(Duration::from_millis(10_500)),
        CallControllerConfig::default(),
    );
    let resp = peer
        .command(Command::Start {
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: None,
        })
        .await;
    assert_eq!(error_message(&resp), "start: ICE gathering timed out");
}

#[tokio::test(start_paused = true)]
async fn test_end_during_gathering_cancels_start() {
    let mut peer = Peer::new(
        MemoryTransportOptions::silent(),
        CallControllerConfig::default(),
    );
    let controller = peer.controller.clone();
    let start = tokio::spawn(async move {
        controller
            .send_command(Command::Start {
                media: CallMediaType::Audio,
                aes_key: None,
                ice_servers: None,
                relay: None,
            })
            .await;
    });

    sleep(Duration::from_secs(2)).await;
    assert!(peer.controller.active_call().await.is_some());
    assert_eq!(peer.command(Command::End).await, Response::Ok);
    start.await.unwrap();

    assert!(peer.controller.active_call().await.is_none());
    assert!(peer.connection().is_closed());
    for msg in peer.drain() {
        assert!(
            !matches!(msg.resp, Response::Offer { .. } | Response::Error { .. }),
            "unexpected {msg:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_unrecognized_state_emits_no_event() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;
    peer.drain();
    let connection = peer.connection();

    connection.emit_states(TransportStates {
        connection: PeerConnectionState::from_raw("reconnecting"),
        ..Default::default()
    });
    connection.emit_states(states(
        PeerConnectionState::Connecting,
        IceConnectionState::Checking,
    ));

    let resp = peer
        .event(|r| matches!(r, Response::Connection { .. }))
        .await;
    let Response::Connection { state } = resp else {
        unreachable!()
    };
    assert_eq!(state.connection_state, "connecting");
    assert_eq!(state.ice_connection_state, "checking");
    assert_eq!(state.ice_gathering_state, "new");
    assert_eq!(state.signaling_state, "stable");
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_tears_down() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, Some(FrameKey::generate_encoded()))
        .await;
    let cryptor = peer.controller.frame_cryptor().await.unwrap();
    let connection = peer.connection();

    connection.emit_states(states(
        PeerConnectionState::Failed,
        IceConnectionState::Failed,
    ));

    let resp = peer
        .event(|r| matches!(r, Response::Connection { .. }))
        .await;
    let Response::Connection { state } = resp else {
        unreachable!()
    };
    assert_eq!(state.connection_state, "failed");
    peer.event(|r| matches!(r, Response::Ended)).await;

    assert!(peer.controller.active_call().await.is_none());
    assert!(!cryptor.is_attached());
    assert!(connection.is_closed());

    // Events for the released call are ignored.
    connection.emit_states(states(
        PeerConnectionState::Connected,
        IceConnectionState::Connected,
    ));
    sleep(Duration::from_millis(10)).await;
    assert!(peer.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ice_disconnect_tears_down() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;
    peer.connection().emit_states(states(
        PeerConnectionState::Connected,
        IceConnectionState::Disconnected,
    ));
    peer.event(|r| matches!(r, Response::Ended)).await;
    assert!(peer.controller.active_call().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_ice_connected_activates_call() {
    let mut caller = Peer::with_defaults();
    let mut callee = Peer::with_defaults();
    connect(&mut caller, &mut callee, CallMediaType::Audio, None).await;

    caller.connection().emit_states(states(
        PeerConnectionState::Connected,
        IceConnectionState::Connected,
    ));
    caller.event(|r| connection_state_is(r, "connected")).await;
    let call = caller.controller.active_call().await.unwrap();
    assert!(call.state.is_active());
}

fn connection_state_is(resp: &Response, expected: &str) -> bool {
    matches!(resp, Response::Connection { state } if state.connection_state == expected)
}

fn pair_stats(local_port: u16) -> TransportStats {
    let mut stats = TransportStats::default();
    stats.add_candidate(CandidateStats {
        id: "local".into(),
        address: Some("198.51.100.7".into()),
        port: Some(local_port),
        candidate_type: Some(CandidateType::Srflx),
        protocol: Some("udp".into()),
        relay_protocol: None,
    });
    stats.add_candidate(CandidateStats {
        id: "remote".into(),
        address: Some("203.0.113.20".into()),
        port: Some(3478),
        candidate_type: Some(CandidateType::Relay),
        protocol: Some("udp".into()),
        relay_protocol: Some("udp".into()),
    });
    stats.candidate_pairs.push(CandidatePairStats {
        id: "pair".into(),
        local_candidate_id: "local".into(),
        remote_candidate_id: "remote".into(),
        state: CandidatePairState::Succeeded,
        nominated: true,
    });
    stats
}

#[tokio::test(start_paused = true)]
async fn test_selected_pair_reports_connected() {
    let mut peer = Peer::with_defaults();
    peer.start(CallMediaType::Audio, None).await;
    let connection = peer.connection();
    let local = IceCandidate::new(
        "candidate:2 1 udp 1686052607 198.51.100.7 54400 typ srflx raddr 192.168.1.20 rport 54400",
    );
    let remote = IceCandidate::new("candidate:9 1 udp 41885439 203.0.113.20 3478 typ relay");

    // No succeeded pair matches: nothing is reported.
    connection.set_stats(pair_stats(1));
    connection.emit(TransportEvent::SelectedPairChanged {
        local: local.clone(),
        remote: remote.clone(),
    });
    sleep(Duration::from_millis(10)).await;
    assert!(
        peer.drain()
            .iter()
            .all(|m| !matches!(m.resp, Response::Connected { .. }))
    );

    connection.set_stats(pair_stats(54400));
    connection.emit(TransportEvent::SelectedPairChanged { local, remote });
    let resp = peer
        .event(|r| matches!(r, Response::Connected { .. }))
        .await;
    let Response::Connected { connection_info } = resp else {
        unreachable!()
    };
    assert_eq!(
        connection_info.local_candidate.candidate_type,
        Some(CandidateType::Srflx)
    );
    assert_eq!(
        connection_info.remote_candidate.candidate_type,
        Some(CandidateType::Relay)
    );
    assert_eq!(
        connection_info.remote_candidate.relay_protocol.as_deref(),
        Some("udp")
    );
}

#[tokio::test(start_paused = true)]
async fn test_relay_only_start() {
    let mut peer = Peer::with_defaults();
    let resp = peer
        .command(Command::Start {
            media: CallMediaType::Audio,
            aes_key: None,
            ice_servers: None,
            relay: Some(true),
        })
        .await;
    let Response::Offer { ice_candidates, .. } = resp else {
        panic!("expected offer, got {resp:?}");
    };
    let candidates: Vec<IceCandidate> = codec::decode(&ice_candidates).unwrap();
    assert!(!candidates.is_empty());
    assert!(candidates.iter().all(|c| c.candidate.contains("typ relay")));
    assert_eq!(
        peer.connection().config().ice_transport_policy,
        IceTransportPolicy::Relay
    );
}

#[tokio::test(start_paused = true)]
async fn test_ice_server_selection() {
    let configured = vec![IceServer::new("stun:configured.example.org:3478")];
    let explicit = vec![IceServer::new("stun:explicit.example.org:3478")];

    let mut plain = Peer::with_defaults();
    plain.start(CallMediaType::Audio, None).await;
    assert_eq!(
        plain.connection().config().ice_servers,
        *DEFAULT_ICE_SERVERS
    );
    assert_eq!(
        plain.connection().config().inactivity_timeout,
        Duration::from_secs(30)
    );

    let mut peer = Peer::new(
        MemoryTransportOptions::default(),
        CallControllerConfig {
            ice_servers: Some(configured.clone()),
            ..Default::default()
        },
    );
    peer.start(CallMediaType::Audio, None).await;
    assert_eq!(peer.connection().config().ice_servers, configured);

    peer.command(Command::Start {
        media: CallMediaType::Audio,
        aes_key: None,
        ice_servers: Some(explicit.clone()),
        relay: None,
    })
    .await;
    assert_eq!(peer.connection().config().ice_servers, explicit);
}

#[tokio::test(start_paused = true)]
async fn test_encrypted_frames_between_peers() {
    let mut caller = Peer::with_defaults();
    let mut callee = Peer::with_defaults();
    let key = FrameKey::generate_encoded();
    connect(&mut caller, &mut callee, CallMediaType::Video, Some(key)).await;

    let sender = caller.connection();
    let receiver = callee.connection();
    let key_frame: Vec<u8> = (0..64u8).map(|b| b | 1).collect();
    let delta_frame: Vec<u8> = (0..32u8).map(|b| b & !1).collect();

    for frame in [key_frame, delta_frame] {
        let sealed = sender.transform_outgoing(&frame).unwrap();
        assert_eq!(sealed.len(), frame.len() + 28);
        let header = if frame[0] & 1 == 1 { 10 } else { 3 };
        assert_eq!(sealed[..header], frame[..header]);
        assert_eq!(receiver.transform_incoming(&sealed).unwrap(), frame);
    }
}

#[tokio::test(start_paused = true)]
async fn test_mismatched_keys_fail_authentication() {
    let mut caller = Peer::with_defaults();
    let mut callee = Peer::with_defaults();
    let (offer, ice_candidates) = caller
        .start(CallMediaType::Audio, Some(FrameKey::generate_encoded()))
        .await;
    let resp = callee
        .command(Command::Offer {
            offer,
            ice_candidates,
            media: CallMediaType::Audio,
            aes_key: Some(FrameKey::generate_encoded()),
            ice_servers: None,
            relay: None,
        })
        .await;
    assert!(matches!(resp, Response::Answer { .. }));

    let sealed = caller.connection().transform_outgoing(&[0u8; 16]).unwrap();
    assert!(callee.connection().transform_incoming(&sealed).is_err());
}
