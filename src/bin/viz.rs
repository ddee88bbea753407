/// simtomp live visualizer: attach to a running launch at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz
///
/// Polls /tmp/simtomp_live.json every 200ms and renders a live TUI dashboard:
///
///     ┌ header: kernel / arch / mode / status ─────────────────────┐
///     │ lane map of the last region, per warp │ Stats: team, blocks │
///     │ q/esc: quit  …footer…                                      │
///
/// Press q or Esc to quit. The launch keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use simtomp::metrics::{read_metrics, LiveMetrics, METRICS_PATH};
use std::{io, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics();
        terminal.draw(|f| render(f, metrics.as_ref()))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // lane map + stats
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_lanes(f, cols[0], metrics);
    render_stats(f, cols[1], metrics);
    render_footer(f, rows[2]);
}

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " ⚡ simtomp live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (name, arch, mode, status) = metrics
        .map(|m| (m.kernel_name.as_str(), m.arch.as_str(), m.mode.as_str(), m.status.as_str()))
        .unwrap_or(("—", "—", "—", "idle"));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  kernel: ", Style::default().fg(Color::DarkGray)),
        Span::styled(name, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   arch: ", Style::default().fg(Color::DarkGray)),
        Span::styled(arch, Style::default().fg(Color::Cyan)),
        Span::styled("   mode: ", Style::default().fg(Color::DarkGray)),
        Span::styled(mode, Style::default().fg(Color::Cyan)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

/// One row per warp, one cell per lane of the last region.
fn render_lanes(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Lanes (last region) ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };
    let width = m.simd_width.max(1) as usize;

    let legend = Line::from(vec![
        Span::styled("█", Style::default().fg(Color::Green)),
        Span::raw(" active  "),
        Span::styled("░", Style::default().fg(Color::DarkGray)),
        Span::raw(" idle  "),
        Span::styled("▒", Style::default().fg(Color::Magenta)),
        Span::raw(" master warp"),
    ]);
    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    for (warp, lanes) in m.lane_active.chunks(width).enumerate() {
        let first_lane = (warp * width) as u32;
        let mut spans = vec![Span::styled(
            format!("  w{:<3} ", warp),
            Style::default().fg(Color::DarkGray),
        )];
        spans.extend(lanes.iter().enumerate().map(|(i, &active)| {
            let lane = first_lane + i as u32;
            let (symbol, color) = if active {
                ("█", Color::Green)
            } else if m.mode == "generic" && lane >= m.available_lanes {
                ("▒", Color::Magenta)
            } else {
                ("░", Color::DarkGray)
            };
            Span::styled(symbol, Style::default().fg(color))
        }));
        lines.push(Line::from(spans));
    }

    let active = m.lane_active.iter().filter(|&&a| a).count();
    lines.push(Line::raw(""));
    lines.push(Line::from(Span::styled(
        format!("  {}/{} lanes in team", active, m.lane_active.len()),
        Style::default().fg(Color::DarkGray),
    )));

    f.render_widget(Paragraph::new(lines), inner);
}

fn render_stats(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Stats ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // team gauge
            Constraint::Length(1), // spacer
            Constraint::Length(2), // blocks gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // text stats
        ])
        .split(inner);

    let Some(m) = metrics else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No launch running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start simtomp to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    let team_pct = if m.available_lanes > 0 {
        ((m.last_team_size as f32 / m.available_lanes as f32) * 100.0).clamp(0.0, 100.0) as u16
    } else {
        0
    };
    let team_gauge = Gauge::default()
        .block(Block::default().title("Team / available lanes"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(team_pct)
        .label(format!("{} / {}", m.last_team_size, m.available_lanes));
    f.render_widget(team_gauge, rows[0]);

    let blk_pct = if m.blocks_total > 0 {
        ((m.blocks_executed as f32 / m.blocks_total as f32) * 100.0) as u16
    } else {
        0
    };
    let blk_gauge = Gauge::default()
        .block(Block::default().title("Blocks"))
        .gauge_style(Style::default().fg(Color::Blue))
        .percent(blk_pct)
        .label(format!("{} / {}", m.blocks_executed, m.blocks_total));
    f.render_widget(blk_gauge, rows[2]);

    let phases = m.barrier_arrivals.iter().copied().max().unwrap_or(0);
    let text = vec![
        stat_line("Regions:    ", m.regions.to_string()),
        stat_line("Activated:  ", m.activations.to_string()),
        stat_line("Serialized: ", m.serialized_regions.to_string()),
        stat_line("Convergent: ", m.convergent_teams.to_string()),
        stat_line("Barriers:   ", phases.to_string()),
        Line::from(vec![
            Span::styled("Limiter:    ", Style::default().fg(Color::DarkGray)),
            Span::styled(m.last_limiter.clone(), Style::default().fg(Color::Yellow)),
        ]),
        Line::raw(""),
        stat_line("Grid:   ", format!("({},{},{})", m.grid[0], m.grid[1], m.grid[2])),
        stat_line("Block:  ", format!("({},{},{})", m.block[0], m.block[1], m.block[2])),
    ];
    f.render_widget(Paragraph::new(text), rows[4]);
}

fn stat_line(label: &'static str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(label, Style::default().fg(Color::DarkGray)),
        Span::raw(value),
    ])
}

fn render_footer(f: &mut Frame, area: Rect) {
    let text = Paragraph::new(Span::styled(
        format!("  q / esc: quit    auto-refreshes every 200ms    reads {}", METRICS_PATH),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
