mod tui;
mod world;

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tether::net::{DEFAULT_PORT, DEFAULT_TICK_RATE};
use tether::{
    ConnectionState, LinkConditioner, LinkConditions, NetworkConfig, NetworkEvent, NetworkManager,
    PeerId, Reliability, RpcTarget, UdpTransport,
};

use tui::{ServerView, TuiState};
use world::DemoWorld;

type Server = NetworkManager<LinkConditioner<UdpTransport>>;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Authoritative tether demo host")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 20)]
    send_rate: u32,

    #[arg(short, long, default_value_t = 16)]
    max_peers: usize,

    #[arg(long, default_value_t = 4096, help = "Snapshot bytes per flush")]
    bandwidth: usize,

    #[arg(short, long, default_value_t = 200)]
    entities: usize,

    #[arg(long)]
    headless: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

struct Host {
    network: Server,
    world: DemoWorld,
    tick: u64,
    started: Instant,
}

impl Host {
    fn new(args: &Args) -> Result<Self> {
        let config = NetworkConfig {
            port: args.port,
            tick_rate: args.tick_rate,
            send_rate: args.send_rate,
            max_peers: args.max_peers,
            bandwidth_budget: args.bandwidth,
            ..NetworkConfig::server()
        };

        let conditions = LinkConditions {
            loss_percent: args.loss_percent,
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency.max(args.min_latency),
            jitter_ms: args.jitter,
        };
        if !conditions.is_clean() {
            log::info!("link conditioner active: {:?}", conditions);
        }

        let transport = UdpTransport::bind(format!("{}:{}", args.bind, args.port))?;
        let mut network = NetworkManager::new(config, LinkConditioner::new(transport, conditions))?;
        let world = DemoWorld::populate(&mut network, args.entities)?;

        network.register_rpc_handler("ping", |rpc| {
            log::info!("ping from {} ({} bytes)", rpc.sender, rpc.payload.len());
        });
        network.listen()?;

        Ok(Self {
            network,
            world,
            tick: 0,
            started: Instant::now(),
        })
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(self.network.config().tick_interval())
    }

    /// One fixed step. Returns what happened on the link for the caller to report.
    fn step(&mut self) -> Vec<NetworkEvent> {
        let dt = self.network.config().tick_interval();
        self.world.step(dt);
        self.network.tick(dt);
        self.tick += 1;

        let events: Vec<NetworkEvent> = self.network.drain_events().collect();
        for event in &events {
            if let NetworkEvent::PeerConnected { peer, .. } = event {
                self.welcome(*peer);
            }
        }
        events
    }

    fn welcome(&mut self, peer: PeerId) {
        let Some(avatar) = self.world.avatar(peer.index().saturating_sub(1)) else {
            return;
        };
        if let Err(err) = self.network.set_owner(avatar, Some(peer)) {
            log::warn!("could not hand {} to {}: {}", avatar, peer, err);
        }
        let greeting = format!("welcome {}", peer);
        if let Err(err) = self.network.send_rpc(
            "welcome",
            greeting.as_bytes(),
            RpcTarget::Owner(avatar),
            Reliability::Reliable,
        ) {
            log::warn!("welcome to {} failed: {}", peer, err);
        }
    }

    /// Tells every peer we are going and lets the notices drain.
    fn shutdown(&mut self) {
        self.network.shutdown();
        let dt = self.network.config().tick_interval();
        while self.network.state() != ConnectionState::Disconnected {
            self.network.tick(dt);
            thread::sleep(Duration::from_secs_f32(dt));
        }
    }

    fn view(&self) -> ServerView<'_> {
        ServerView {
            uptime_secs: self.started.elapsed().as_secs(),
            tick: self.tick,
            entity_count: self.world.len(),
            max_peers: self.network.config().max_peers,
            stats: self.network.stats(),
            health: &self.network.config().health,
        }
    }
}

fn describe(event: &NetworkEvent) -> Option<(bool, String)> {
    match event {
        NetworkEvent::PeerConnected { peer, addr } => {
            Some((false, format!("{} connected from {}", peer, addr)))
        }
        NetworkEvent::PeerDisconnected { peer, reason } => {
            Some((false, format!("{} {}", peer, reason)))
        }
        NetworkEvent::ConnectionDenied { addr, reason } => {
            Some((true, format!("denied {}: {}", addr, reason)))
        }
        NetworkEvent::ConnectionFailed { reason } => Some((true, reason.clone())),
        _ => None,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut host = Host::new(&args)?;

    if args.headless {
        log::info!("server started on {}", host.network.local_addr());
        run_headless(&mut host);
    } else {
        run_with_tui(&mut host)?;
    }

    Ok(())
}

fn run_headless(host: &mut Host) {
    let interval = host.tick_interval();
    let mut report = Instant::now();

    loop {
        let frame_start = Instant::now();
        host.step();

        if report.elapsed() >= Duration::from_secs(5) {
            report = Instant::now();
            let stats = host.network.stats();
            log::info!(
                "{} peers, {} entities, {:.0} B/s out, worst loss {:.1}%",
                stats.connected_peers,
                host.world.len(),
                stats.bytes_sent_per_sec,
                stats.packet_loss * 100.0
            );
        }

        if let Some(rest) = interval.checked_sub(frame_start.elapsed()) {
            thread::sleep(rest);
        }
    }
}

fn run_with_tui(host: &mut Host) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let interval = host.tick_interval();
    let mut tui_state = TuiState::new();
    tui_state.log_info(format!("Server started on {}", host.network.local_addr()));

    let mut running = true;
    while running {
        let frame_start = Instant::now();

        for event in host.step() {
            match describe(&event) {
                Some((true, message)) => tui_state.log_warn(message),
                Some((false, message)) => tui_state.log_info(message),
                None => {}
            }
        }

        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &host.view());
        })?;

        let wait = interval.saturating_sub(frame_start.elapsed());
        if event::poll(wait)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press
                    && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                {
                    running = false;
                }
            }
        }
    }

    host.shutdown();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
