use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{Local, TimeZone};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::error;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{Axis, Block, BorderType, Borders, Cell, Chart as LineChart, Dataset, GraphType, Paragraph, Row, Table},
    Frame, Terminal,
};

use crate::app::App;
use crate::backend::RowSource;
use crate::charts::{Chart, ChartData, ChartKind, Link, Measure, Slice};
use crate::constants::{TICK_RATE_MS, Y_LABEL_WIDTH};
use crate::pipeline::ChartHandle;
use crate::rate::RatePoint;
use crate::store::Store;
use crate::util::{format_bps, format_bytes_total, format_count, percent};

pub fn run<R, S>(mut app: App<R, S>, shutdown: Arc<AtomicBool>) -> io::Result<()>
where
    R: RowSource,
    S: Store + Send + 'static,
{
    // Initialize terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app_loop(&mut terminal, &mut app, &shutdown);

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    if let Err(err) = &res {
        error!("UI loop failed: {err:?}");
    }
    res
}

fn run_app_loop<B, R, S>(terminal: &mut Terminal<B>, app: &mut App<R, S>, shutdown: &AtomicBool) -> io::Result<()>
where
    B: ratatui::backend::Backend,
    R: RowSource,
    S: Store + Send + 'static,
{
    let tick_rate = Duration::from_millis(TICK_RATE_MS);
    app.refresh_all();

    loop {
        terminal.draw(|f| draw(f, app))?;

        // Handle input
        let timeout = tick_rate
            .checked_sub(app.last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => app.handle_key(key.code, key.modifiers),
                Event::Mouse(mouse) => app.on_mouse(mouse.kind, mouse.column, mouse.row),
                _ => {}
            }
        }
        if app.should_quit || shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if app.last_tick.elapsed() >= tick_rate {
            app.on_tick();
            app.last_tick = Instant::now();
        }
    }
}

fn draw<R, S>(f: &mut Frame, app: &mut App<R, S>)
where
    R: RowSource,
    S: Store + Send + 'static,
{
    // ============= whole screen layout ============
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Percentage(45), // Traffic chart
                Constraint::Min(8),         // Pies
                Constraint::Length(12),     // Conversations
                Constraint::Length(1),      // Status bar
            ]
            .as_ref(),
        )
        .split(f.size());

    if let Some(handle) = app.traffic {
        draw_traffic(f, app, handle, main_chunks[0]);
    }

    let pie_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(vec![Constraint::Ratio(1, app.pies.len().max(1) as u32); app.pies.len().max(1)])
        .split(main_chunks[1]);
    for (handle, area) in app.pies.iter().zip(pie_chunks.iter()) {
        draw_pie(f, app.chart(*handle), *area);
    }

    if let Some(handle) = app.sankey {
        draw_conversations(f, app.chart(handle), main_chunks[2]);
    }

    draw_status_bar(f, app, main_chunks[3]);
}

fn chart_block(chart: &Chart, color: Color) -> Block<'static> {
    let mut title = vec![Span::styled(chart.title.clone(), Style::default().fg(color))];
    if chart.from_cache {
        title.push(Span::styled("[cached] ", Style::default().fg(Color::DarkGray)));
    }
    if let Some(err) = &chart.error {
        title.push(Span::styled(format!("[{err}] "), Style::default().fg(Color::Red)));
    }
    Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .title(Line::from(title))
}

fn time_label(ms: f64) -> String {
    Local
        .timestamp_millis_opt(ms as i64)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_default()
}

/// Where the pieces of the traffic panel go inside its border.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrafficLayout {
    pub y_labels: Rect,
    pub plot: Rect,
    pub x_labels: Rect,
}

// Axis labels are drawn by hand so the plotted columns are exactly `plot`,
// which is also the area the selection maps onto the time range.
pub(crate) fn traffic_layout(inner: Rect) -> TrafficLayout {
    let gutter = Y_LABEL_WIDTH.min(inner.width);
    let plot_height = inner.height.saturating_sub(1);
    let plot = Rect::new(inner.x + gutter, inner.y, inner.width - gutter, plot_height);
    TrafficLayout {
        y_labels: Rect::new(inner.x, inner.y, gutter, plot_height),
        plot,
        x_labels: Rect::new(plot.x, inner.y + plot_height, plot.width, inner.height.min(1)),
    }
}

fn draw_label(f: &mut Frame, text: String, area: Rect, alignment: Alignment) {
    if area.width > 0 && area.height > 0 {
        f.render_widget(
            Paragraph::new(text)
                .style(Style::default().fg(Color::DarkGray))
                .alignment(alignment),
            area,
        );
    }
}

fn draw_traffic<R, S>(f: &mut Frame, app: &mut App<R, S>, handle: ChartHandle, area: Rect)
where
    R: RowSource,
    S: Store + Send + 'static,
{
    let chart = app.chart(handle);
    let block = chart_block(chart, Color::Cyan);
    let layout = traffic_layout(block.inner(area));

    let (rx, tx, peak) = match &chart.data {
        Some(ChartData::Rates(series)) => {
            let points = |pts: &[RatePoint]| -> Vec<(f64, f64)> {
                pts.iter()
                    .map(|p| (p.timestamp_ms as f64, p.bits_per_sec as f64))
                    .collect()
            };
            (points(&series.inbound), points(&series.outbound), series.peak() as f64)
        }
        _ => (Vec::new(), Vec::new(), 0.0),
    };

    let x0 = app.params().start.timestamp_millis() as f64;
    let x1 = app.params().end.timestamp_millis() as f64;
    let y_max = (peak * 1.1).max(100.0);

    let datasets = vec![
        Dataset::default()
            .name("bits/s in")
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Red))
            .data(&rx),
        Dataset::default()
            .name("bits/s out")
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Blue))
            .data(&tx),
    ];

    // Without axis labels the chart plots over its whole area.
    let line_chart = LineChart::new(datasets)
        .x_axis(Axis::default().bounds([x0, x1]))
        .y_axis(Axis::default().bounds([0.0, y_max]));
    f.render_widget(block, area);
    f.render_widget(line_chart, layout.plot);

    let gutter = layout.y_labels;
    let label_width = gutter.width.saturating_sub(1);
    if gutter.height > 0 {
        let row = |y: u16| Rect::new(gutter.x, y, label_width, 1);
        draw_label(f, format_bps(y_max), row(gutter.y), Alignment::Right);
        draw_label(f, format_bps(y_max / 2.0), row(gutter.y + gutter.height / 2), Alignment::Right);
        draw_label(f, "0".to_string(), row(gutter.y + gutter.height - 1), Alignment::Right);
    }
    draw_label(f, time_label(x0), layout.x_labels, Alignment::Left);
    draw_label(f, time_label((x0 + x1) / 2.0), layout.x_labels, Alignment::Center);
    draw_label(f, time_label(x1), layout.x_labels, Alignment::Right);

    app.set_overlay(layout.plot);
    draw_selection_overlay(f, app, layout.plot);
}

// Shaded band between the handles plus a guide line on each handle.
fn draw_selection_overlay<R, S>(f: &mut Frame, app: &App<R, S>, area: Rect)
where
    R: RowSource,
    S: Store + Send + 'static,
{
    let Some((a, b)) = app.selection.span() else {
        return;
    };
    if area.width == 0 || area.height == 0 {
        return;
    }
    let last = area.width - 1;
    let column = |px: f64| area.x + (px.round() as u16).min(last);

    let buf = f.buffer_mut();
    for x in column(a)..=column(b) {
        for y in area.y..area.y + area.height {
            buf.get_mut(x, y).set_bg(Color::Rgb(20, 50, 80));
        }
    }
    for handle in [app.selection.start(), app.selection.end()].into_iter().flatten() {
        let x = column(handle);
        for y in area.y..area.y + area.height {
            buf.get_mut(x, y).set_symbol("│").set_fg(Color::LightBlue);
        }
    }
}

fn draw_pie(f: &mut Frame, chart: &Chart, area: Rect) {
    let block = chart_block(chart, Color::Yellow);
    let slices: &[Slice] = match &chart.data {
        Some(ChartData::Slices(slices)) => slices.as_slice(),
        _ => &[],
    };
    let total: f64 = slices.iter().map(|s| s.value).sum();
    let measure = match chart.kind {
        ChartKind::Pie { measure, .. } => measure,
        _ => Measure::Bytes,
    };

    let rows = slices.iter().map(|slice| {
        let value = match measure {
            Measure::Bytes => format_bytes_total(slice.value as u64),
            Measure::Packets => format_count(slice.value as u64),
        };
        Row::new(vec![
            Cell::from(slice.name.clone()),
            Cell::from(value).style(Style::default().fg(Color::Green)),
            Cell::from(format!("{:.1}%", percent(slice.value, total))).style(Style::default().fg(Color::DarkGray)),
        ])
    });

    let header = Row::new(["Address", "Volume", "%"].iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    }))
    .style(Style::default().bg(Color::Rgb(40, 40, 40)));

    let table = Table::new(
        rows,
        [Constraint::Percentage(50), Constraint::Percentage(30), Constraint::Percentage(20)],
    )
    .header(header)
    .block(block);
    f.render_widget(table, area);
}

fn draw_conversations(f: &mut Frame, chart: &Chart, area: Rect) {
    let block = chart_block(chart, Color::Magenta);
    let links: &[Link] = match &chart.data {
        Some(ChartData::Links(links)) => links.as_slice(),
        _ => &[],
    };
    let total: f64 = links.iter().map(|l| l.weight).sum();

    let header = Row::new(["Source", "", "Destination", "Bytes", "Share"].iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    }))
    .style(Style::default().bg(Color::Rgb(40, 40, 40)));

    let rows = links.iter().map(|link| {
        let share = percent(link.weight, total);
        let color = if share > 25.0 {
            Color::Red
        } else if share > 5.0 {
            Color::LightYellow
        } else {
            Color::Green
        };
        Row::new(vec![
            Cell::from(link.from.clone()),
            Cell::from("→").style(Style::default().fg(Color::DarkGray)),
            Cell::from(link.to.clone()),
            Cell::from(format_bytes_total(link.weight as u64)).style(Style::default().fg(color)),
            Cell::from(format!("{share:.1}%")),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(30),
            Constraint::Length(2),
            Constraint::Percentage(30),
            Constraint::Percentage(20),
            Constraint::Percentage(15),
        ],
    )
    .header(header)
    .block(block);
    f.render_widget(table, area);
}

fn draw_status_bar<R, S>(f: &mut Frame, app: &App<R, S>, area: Rect)
where
    R: RowSource,
    S: Store + Send + 'static,
{
    let status_content = Line::from(vec![
        Span::styled(
            " SELECTION ",
            Style::default().bg(Color::White).fg(Color::Black).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(" {} ", app.selection.describe())),
        Span::raw(" | "),
        Span::styled("CACHE: ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(format!(
            "{} entries ({}) ",
            app.cache_stats.entries,
            format_bytes_total(app.cache_stats.size_bytes as u64)
        )),
        Span::raw(" | r refresh  c clear selection  x flush cache  q quit"),
    ]);

    let status_bar = Paragraph::new(status_content).style(Style::default().bg(Color::Rgb(20, 20, 20)));
    f.render_widget(status_bar, area);
}
