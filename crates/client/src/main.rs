use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use glam::Vec3;
use tether::net::DEFAULT_PORT;
use tether::{
    EntityHandle, LinkConditioner, LinkConditions, NetworkConfig, NetworkEvent, NetworkManager,
    Reliability, ReplicationEvent, RpcTarget, SampleKind, Transform, UdpTransport,
};

type Client = NetworkManager<LinkConditioner<UdpTransport>>;

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Headless tether receiver")]
struct Args {
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    server: SocketAddr,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(short, long, default_value_t = 100.0, help = "Interpolation delay in ms")]
    delay: f32,

    #[arg(long, default_value_t = 5, help = "Seconds between summaries")]
    report_every: u64,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

/// Local copies of the remote entities, written by the core every tick.
#[derive(Default)]
struct Mirror {
    views: HashMap<EntityHandle, Rc<RefCell<Transform>>>,
}

impl Mirror {
    fn apply(&mut self, network: &mut Client, event: &ReplicationEvent) {
        match *event {
            ReplicationEvent::Started { handle } => {
                let view = Rc::new(RefCell::new(Transform::default()));
                match network.bind_remote(handle, Rc::clone(&view)) {
                    Ok(()) => {
                        self.views.insert(handle, view);
                    }
                    Err(err) => log::warn!("could not bind {}: {}", handle, err),
                }
            }
            ReplicationEvent::Stopped { handle } => {
                self.views.remove(&handle);
            }
            ReplicationEvent::OwnershipChanged { handle, owner } => {
                if owner == Some(network.local_id()) {
                    log::info!("we now own {}", handle);
                }
            }
        }
    }

    fn summary(&self, network: &Client) {
        let mut interpolated = 0;
        let mut extrapolated = 0;
        let mut held = 0;
        let mut centroid = Vec3::ZERO;

        for (&handle, view) in &self.views {
            match network.sample(handle).map(|sample| sample.kind) {
                Some(SampleKind::Interpolated) => interpolated += 1,
                Some(SampleKind::Extrapolated) => extrapolated += 1,
                Some(SampleKind::Held) | None => held += 1,
            }
            centroid += view.borrow().position;
        }
        if !self.views.is_empty() {
            centroid /= self.views.len() as f32;
        }

        let stats = network.stats();
        let rtt = stats.worst_peer().map_or(0.0, |peer| peer.rtt_ms);
        log::info!(
            "{} entities ({} interpolated, {} extrapolated, {} held), centroid {:.1?}",
            self.views.len(),
            interpolated,
            extrapolated,
            held,
            centroid
        );
        log::info!(
            "rtt {:.1}ms, loss {:.1}%, {:.0} B/s in, {} snapshots applied, {} rejected",
            rtt,
            stats.packet_loss * 100.0,
            stats.bytes_received_per_sec,
            stats.snapshots_received,
            stats.snapshots_rejected
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = NetworkConfig::client();
    config.interpolation.delay_ms = args.delay;

    let conditions = LinkConditions {
        loss_percent: args.loss_percent,
        min_latency_ms: args.min_latency,
        max_latency_ms: args.max_latency.max(args.min_latency),
        jitter_ms: args.jitter,
    };
    if !conditions.is_clean() {
        log::info!("link conditioner active: {:?}", conditions);
    }

    let transport = UdpTransport::bind(args.bind.as_str())?;
    let mut network: Client = NetworkManager::new(config, LinkConditioner::new(transport, conditions))?;
    network.register_rpc_handler("welcome", |rpc| {
        log::info!("server says: {}", String::from_utf8_lossy(&rpc.payload));
    });
    network.connect(args.server)?;

    let interval = Duration::from_secs_f32(network.config().tick_interval());
    let report_every = Duration::from_secs(args.report_every.max(1));
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut mirror = Mirror::default();
    let mut connected = false;

    loop {
        let frame_start = Instant::now();
        network.tick(network.config().tick_interval());

        let events: Vec<NetworkEvent> = network.drain_events().collect();
        for event in events {
            match event {
                NetworkEvent::PeerConnected { .. } => {
                    connected = true;
                    log::info!("connected as {}", network.local_id());
                }
                NetworkEvent::ConnectionFailed { reason } => bail!("connection failed: {}", reason),
                NetworkEvent::PeerDisconnected { reason, .. } => {
                    log::info!("link closed: {}", reason);
                    return Ok(());
                }
                NetworkEvent::Replication(event) => mirror.apply(&mut network, &event),
                _ => {}
            }
        }

        if connected && last_report.elapsed() >= report_every {
            last_report = Instant::now();
            mirror.summary(&network);
            if let Err(err) = network.send_rpc("ping", &[], RpcTarget::Server, Reliability::Unreliable) {
                log::debug!("ping failed: {}", err);
            }
        }

        if args.duration.is_some_and(|secs| started.elapsed() >= Duration::from_secs(secs)) {
            log::info!("leaving after {}s", started.elapsed().as_secs());
            network.disconnect();
            for _ in 0..15 {
                network.tick(network.config().tick_interval());
            }
            return Ok(());
        }

        if let Some(rest) = interval.checked_sub(frame_start.elapsed()) {
            thread::sleep(rest);
        }
    }
}
