use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Local;
use clap::Parser;
use log::info;
use peercall::callcore::candidate::{
    CandidateAttribute, CandidatePairStats, CandidateStats, TransportStats,
};
use peercall::callcore::planar::{PlanarImage, PlaneLayout};
use peercall::callcore::states::{
    CandidatePairState, IceConnectionState, IceGatheringState, PeerConnectionState, SignalingState,
    TransportStates,
};
use peercall::calls::memory::{
    MemoryPeerConnection, MemoryPeerConnectionFactory, MemoryTransportOptions,
};
use peercall::calls::{CallController, TransportEvent};
use peercall::config::{CallControllerConfig, load_ice_servers};
use peercall::frame_crypto::FrameKey;
use peercall::types::{CallMediaType, CallMessage, Command, IceCandidate, Response};
use tokio::sync::mpsc::UnboundedReceiver;

// Loopback call between two controllers over the in-memory transport.
//
// Usage:
//   cargo run                                  # audio call, no encryption
//   cargo run -- --video --encrypt             # video call with frame encryption
//   cargo run -- --relay --ice-servers ice.json

#[derive(Parser)]
#[command(name = "peercall-demo")]
#[command(about = "Runs a loopback call between two in-process controllers")]
struct Cli {
    #[arg(long)]
    video: bool,

    /// Encrypt media frames with a freshly generated key.
    #[arg(long)]
    encrypt: bool,

    /// Only use relayed candidates.
    #[arg(long)]
    relay: bool,

    /// JSON file with an array of ICE servers.
    #[arg(long, value_name = "FILE")]
    ice_servers: Option<PathBuf>,

    #[arg(long, default_value_t = 6)]
    frames: usize,
}

struct Peer {
    name: &'static str,
    controller: Arc<CallController>,
    rx: UnboundedReceiver<CallMessage>,
    factory: Arc<MemoryPeerConnectionFactory>,
    pending_ice: Vec<String>,
}

impl Peer {
    fn new(name: &'static str, config: CallControllerConfig) -> Self {
        let factory = MemoryPeerConnectionFactory::new(MemoryTransportOptions::default());
        let (controller, rx) = CallController::new(factory.clone(), config);
        Self {
            name,
            controller,
            rx,
            factory,
            pending_ice: Vec::new(),
        }
    }

    async fn command(&mut self, command: Command) -> anyhow::Result<Response> {
        self.controller.send_command(command).await;
        loop {
            let msg = self.rx.recv().await.context("response channel closed")?;
            if msg.command.is_some() {
                return Ok(msg.resp);
            }
            self.on_event(msg.resp);
        }
    }

    fn on_event(&mut self, resp: Response) {
        match resp {
            Response::Ice { ice_candidates } => self.pending_ice.push(ice_candidates),
            other => info!(
                "[{}] event: {}",
                self.name,
                serde_json::to_string(&other).unwrap_or_default()
            ),
        }
    }

    fn drain_events(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.on_event(msg.resp);
        }
    }

    fn connection(&self) -> anyhow::Result<Arc<MemoryPeerConnection>> {
        self.factory.last().context("no peer connection")
    }
}

fn expect_ok(peer: &str, resp: Response) -> anyhow::Result<()> {
    match resp {
        Response::Ok => Ok(()),
        Response::Error { message } => bail!("{peer}: {message}"),
        other => bail!("{peer}: unexpected response {other:?}"),
    }
}

/// Forwards candidates one peer trickled to the other.
async fn relay_candidates(from: &mut Peer, to: &mut Peer) -> anyhow::Result<()> {
    from.drain_events();
    for ice_candidates in std::mem::take(&mut from.pending_ice) {
        let resp = to.command(Command::Ice { ice_candidates }).await?;
        expect_ok(to.name, resp)?;
    }
    Ok(())
}

fn pair_stats(local: &IceCandidate, remote: &IceCandidate) -> anyhow::Result<TransportStats> {
    let mut stats = TransportStats::default();
    for (id, candidate) in [("local", local), ("remote", remote)] {
        let attr: CandidateAttribute = candidate.candidate.parse()?;
        stats.add_candidate(CandidateStats {
            id: id.into(),
            address: Some(attr.address),
            port: Some(attr.port),
            candidate_type: Some(attr.candidate_type),
            protocol: Some(attr.transport),
            relay_protocol: None,
        });
    }
    stats.candidate_pairs.push(CandidatePairStats {
        id: "pair".into(),
        local_candidate_id: "local".into(),
        remote_candidate_id: "remote".into(),
        state: CandidatePairState::Succeeded,
        nominated: true,
    });
    Ok(stats)
}

/// Plays the part of the media stack finishing connectivity checks.
fn simulate_connectivity(peer: &Peer) -> anyhow::Result<()> {
    let connection = peer.connection()?;
    let local = connection
        .local_candidates()
        .into_iter()
        .next()
        .context("no local candidate")?;
    let remote = connection
        .remote_candidates()
        .into_iter()
        .next()
        .context("no remote candidate")?;

    connection.emit_states(TransportStates {
        connection: PeerConnectionState::Connected,
        ice_connection: IceConnectionState::Connected,
        ice_gathering: IceGatheringState::Complete,
        signaling: SignalingState::Stable,
    });
    connection.set_stats(pair_stats(&local, &remote)?);
    connection.emit(TransportEvent::SelectedPairChanged { local, remote });
    Ok(())
}

fn exchange_frames(sender: &Peer, receiver: &Peer, count: usize) -> anyhow::Result<()> {
    let outgoing = sender.connection()?;
    let incoming = receiver.connection()?;
    for i in 0..count {
        // Every third frame is a key frame.
        let mut frame = vec![(i % 251) as u8; 160];
        frame[0] = u8::from(i % 3 == 0);
        let sealed = outgoing.transform_outgoing(&frame)?;
        let opened = incoming.transform_incoming(&sealed)?;
        if opened != frame {
            bail!("frame {i} changed in transit");
        }
        info!(
            "Frame {i}: {} bytes sent as {} bytes",
            frame.len(),
            sealed.len()
        );
    }
    Ok(())
}

/// Repacks a stride-padded I420 capture into tightly packed planes.
fn repack_capture() -> anyhow::Result<()> {
    let captured = PlanarImage::allocate(vec![
        PlaneLayout::new(640, 480, 704),
        PlaneLayout::new(320, 240, 384),
        PlaneLayout::new(320, 240, 384),
    ])?;
    let packed = captured.copy_with_layout(vec![
        PlaneLayout::packed(640, 480),
        PlaneLayout::packed(320, 240),
        PlaneLayout::packed(320, 240),
    ])?;
    info!(
        "Repacked captured frame from {} to {} bytes",
        captured.data().len(),
        packed.data().len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();
    let mut config = CallControllerConfig::default();
    if let Some(path) = &cli.ice_servers {
        let servers = load_ice_servers(path).await?;
        info!(
            "Loaded {} ICE servers from {}",
            servers.len(),
            path.display()
        );
        config.ice_servers = Some(servers);
    }

    let media = if cli.video {
        CallMediaType::Video
    } else {
        CallMediaType::Audio
    };
    let aes_key = cli.encrypt.then(FrameKey::generate_encoded);
    let mut caller = Peer::new("caller", config.clone());
    let mut callee = Peer::new("callee", config);

    if let Response::Capabilities { capabilities } =
        callee.command(Command::Capabilities).await?
    {
        info!("Callee supports encryption: {}", capabilities.encryption);
    }

    let (offer, ice_candidates) = match caller
        .command(Command::Start {
            media,
            aes_key: aes_key.clone(),
            ice_servers: None,
            relay: Some(cli.relay),
        })
        .await?
    {
        Response::Offer {
            offer,
            ice_candidates,
            ..
        } => (offer, ice_candidates),
        other => bail!("caller: unexpected response to start: {other:?}"),
    };
    info!("Offer payload is {} characters", offer.len());

    let (answer, ice_candidates) = match callee
        .command(Command::Offer {
            offer,
            ice_candidates,
            media,
            aes_key,
            ice_servers: None,
            relay: Some(cli.relay),
        })
        .await?
    {
        Response::Answer {
            answer,
            ice_candidates,
        } => (answer, ice_candidates),
        other => bail!("callee: unexpected response to offer: {other:?}"),
    };
    let resp = caller
        .command(Command::Answer {
            answer,
            ice_candidates,
        })
        .await?;
    expect_ok(caller.name, resp)?;

    // Let the callee finish gathering, then trickle candidates both ways.
    tokio::time::sleep(Duration::from_millis(500)).await;
    relay_candidates(&mut callee, &mut caller).await?;
    relay_candidates(&mut caller, &mut callee).await?;

    simulate_connectivity(&caller)?;
    simulate_connectivity(&callee)?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    caller.drain_events();
    callee.drain_events();

    exchange_frames(&caller, &callee, cli.frames)?;
    exchange_frames(&callee, &caller, cli.frames)?;

    if media.has_video() {
        let facing = caller.controller.flip_camera().await?;
        info!("Caller camera now {facing:?}");
        repack_capture()?;
    }

    let resp = caller.command(Command::End).await?;
    expect_ok(caller.name, resp)?;
    let resp = callee.command(Command::End).await?;
    expect_ok(callee.name, resp)?;
    info!("Call finished");
    Ok(())
}
