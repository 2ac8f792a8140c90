use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Row, Table};
use tether::NetworkStats;
use tether::config::HealthThresholds;

const MAX_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

/// What the dashboard shows besides the link stats.
pub struct ServerView<'a> {
    pub uptime_secs: u64,
    pub tick: u64,
    pub entity_count: usize,
    pub max_peers: usize,
    pub stats: &'a NetworkStats,
    pub health: &'a HealthThresholds,
}

#[derive(Default)]
pub struct TuiState {
    log: VecDeque<(LogLevel, String)>,
}

impl TuiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    fn push(&mut self, level: LogLevel, message: String) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((level, message));
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, view: &ServerView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Min(6),
            Constraint::Length(8),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], view);
    render_capacity(frame, chunks[1], view);
    render_network(frame, chunks[2], view);
    render_peers(frame, chunks[3], view);
    render_log(frame, chunks[4], state);
    render_help(frame, chunks[5]);
}

fn render_header(frame: &mut Frame, area: Rect, view: &ServerView) {
    let title = format!(" Tether Server - Uptime: {} ", format_duration(view.uptime_secs));

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Tick: {}  |  Peers: {}  |  Entities: {}  |  Send rate: {:.0} Hz",
        view.tick, view.stats.connected_peers, view.entity_count, view.stats.effective_send_rate
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_capacity(frame: &mut Frame, area: Rect, view: &ServerView) {
    let block = Block::default()
        .title(" Capacity ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let ratio = view.stats.connected_peers as f64 / view.max_peers.max(1) as f64;
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{} peers", view.stats.connected_peers, view.max_peers));

    frame.render_widget(gauge, area);
}

fn stat_line(label: &str, value: String, alert: bool) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{}: ", label), Style::default().fg(Color::Gray)),
        Span::styled(
            value,
            Style::default().fg(if alert { Color::Red } else { Color::White }),
        ),
    ])
}

fn render_network(frame: &mut Frame, area: Rect, view: &ServerView) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let net = view.stats;
    let lines = vec![
        stat_line(
            "Packets",
            format!("{} sent / {} recv", net.packets_sent, net.packets_received),
            false,
        ),
        stat_line(
            "Throughput",
            format!(
                "{}/s out / {}/s in",
                format_bytes(net.bytes_sent_per_sec as u64),
                format_bytes(net.bytes_received_per_sec as u64)
            ),
            false,
        ),
        stat_line(
            "Snapshots",
            format!("{} sent / {} rejected", net.snapshots_sent, net.snapshots_rejected),
            false,
        ),
        stat_line(
            "Worst loss / jitter",
            format!("{:.1}% / {:.1}ms", net.packet_loss * 100.0, net.jitter_ms),
            net.packet_loss > 0.05,
        ),
        stat_line(
            "Arena",
            format!(
                "high water {} / overflows {}",
                format_bytes(net.arena_high_water as u64),
                net.arena_overflows
            ),
            net.arena_overflows > 0,
        ),
        stat_line(
            "Rejected datagrams",
            net.validator_rejections.to_string(),
            false,
        ),
    ];

    let paragraph = Paragraph::new(lines).block(block);
    frame.render_widget(paragraph, area);
}

fn render_peers(frame: &mut Frame, area: Rect, view: &ServerView) {
    let block = Block::default()
        .title(" Peers ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let header = Row::new(["Peer", "RTT", "Jitter", "Loss", "Queue", "Sent", "Recv"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let rows = view.stats.peers.iter().map(|peer| {
        let stressed = peer.rtt_ms > view.health.max_rtt_ms * 0.75
            || peer.queue_depth > view.health.max_queue_depth * 3 / 4;
        Row::new([
            peer.peer.map_or_else(|| "-".to_owned(), |id| id.to_string()),
            format!("{:.1}ms", peer.rtt_ms),
            format!("{:.1}ms", peer.jitter_ms),
            format!("{:.1}%", peer.loss * 100.0),
            peer.queue_depth.to_string(),
            format_bytes(peer.bytes_sent),
            format_bytes(peer.bytes_received),
        ])
        .style(Style::default().fg(if stressed { Color::Red } else { Color::White }))
    });

    let widths = [
        Constraint::Length(8),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Length(10),
        Constraint::Length(10),
    ];
    let table = Table::new(rows, widths).header(header).block(block);
    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Events ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .log
        .iter()
        .skip(state.log.len().saturating_sub(visible))
        .map(|(level, message)| {
            let color = match level {
                LogLevel::Info => Color::White,
                LogLevel::Warn => Color::Yellow,
            };
            Line::from(Span::styled(message.as_str(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("Press 'q' or ESC to quit")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
