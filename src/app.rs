use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    time::{Duration, Instant},
};

use crossterm::event::{KeyCode, KeyModifiers, MouseButton, MouseEventKind};
use log::{debug, info};
use ratatui::layout::Rect;

use crate::backend::RowSource;
use crate::cache::{CacheStats, SharedCache, SystemClock};
use crate::charts::{AddrSide, Chart, ChartKind, FlowDirection, Measure, QueryParams};
use crate::constants::CACHE_CLEANUP_SECS;
use crate::pipeline::{spawn_request, ChartHandle, ChartUpdate, RequestContext};
use crate::selection::{Selection, TimeDomain};
use crate::store::Store;
use crate::worker::Worker;

// Main application state
pub struct App<R, S> {
    charts: Vec<Chart>,
    pub traffic: Option<ChartHandle>,
    pub pies: Vec<ChartHandle>,
    pub sankey: Option<ChartHandle>,

    pub selection: Selection,
    // Where the selection overlay sits on screen, set on every draw.
    overlay: Option<Rect>,

    pub cache_stats: CacheStats,
    pub last_tick: Instant,
    last_cleanup: Instant,
    pub should_quit: bool,

    params: QueryParams,
    ttl: Duration,
    ctx: RequestContext<R, S, SystemClock>,
    updates: Receiver<ChartUpdate>,
}

impl<R, S> App<R, S>
where
    R: RowSource,
    S: Store + Send + 'static,
{
    pub fn new(
        params: QueryParams,
        ttl: Duration,
        selection_tolerance: f64,
        source: Arc<R>,
        cache: SharedCache<S>,
        worker: Worker,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let selection = Selection::new(1.0)
            .with_tolerance(selection_tolerance)
            .with_domain(TimeDomain::new(params.start, params.end));
        let cache_stats = cache.lock().stats();
        App {
            charts: Vec::new(),
            traffic: None,
            pies: Vec::new(),
            sankey: None,
            selection,
            overlay: None,
            cache_stats,
            last_tick: Instant::now(),
            last_cleanup: Instant::now(),
            should_quit: false,
            params,
            ttl,
            ctx: RequestContext {
                source,
                cache,
                worker,
                updates: tx,
            },
            updates: rx,
        }
    }

    /// Registers a chart and returns the handle used for all later calls.
    pub fn init_chart(&mut self, kind: ChartKind) -> ChartHandle {
        let title = kind.title(&self.params);
        self.charts.push(Chart::new(kind, title));
        ChartHandle(self.charts.len() - 1)
    }

    /// Traffic rate, the four address pies and the conversation table.
    pub fn init_default_charts(&mut self, use_api: bool) {
        let traffic = if use_api {
            ChartKind::TimeseriesApi
        } else {
            ChartKind::Timeseries
        };
        self.traffic = Some(self.init_chart(traffic));

        for direction in [FlowDirection::Input, FlowDirection::Output] {
            for addr in [AddrSide::Src, AddrSide::Dst] {
                let handle = self.init_chart(ChartKind::Pie {
                    addr,
                    direction,
                    measure: Measure::Bytes,
                });
                self.pies.push(handle);
            }
        }

        self.sankey = Some(self.init_chart(ChartKind::Sankey {
            direction: FlowDirection::Input,
        }));
    }

    pub fn chart(&self, handle: ChartHandle) -> &Chart {
        &self.charts[handle.0]
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Issues a fresh request; replies to earlier ones will be ignored.
    pub fn request(&mut self, handle: ChartHandle) {
        let chart = &mut self.charts[handle.0];
        let generation = chart.next_generation();
        let kind = chart.kind.clone();
        let query = kind.query(&self.params);
        debug!("Requesting chart {} generation {generation}: {}", handle.0, query.url);
        spawn_request(&self.ctx, handle, generation, kind, query, self.ttl);
    }

    pub fn refresh_all(&mut self) {
        for i in 0..self.charts.len() {
            self.request(ChartHandle(i));
        }
    }

    pub fn apply_update(&mut self, update: ChartUpdate) -> bool {
        let Some(chart) = self.charts.get_mut(update.chart.0) else {
            return false;
        };
        let applied = chart.apply(update.generation, update.result);
        if !applied {
            debug!(
                "Dropping stale reply for chart {} (generation {} < {})",
                update.chart.0,
                update.generation,
                chart.generation()
            );
        }
        applied
    }

    /// Applies every reply that has arrived, in arrival order.
    pub fn poll_updates(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates.try_recv() {
            if self.apply_update(update) {
                applied += 1;
            }
        }
        applied
    }

    pub fn on_tick(&mut self) {
        self.poll_updates();

        if self.last_cleanup.elapsed() >= Duration::from_secs(CACHE_CLEANUP_SECS) {
            self.ctx.cache.lock().cleanup();
            self.last_cleanup = Instant::now();
        }
        self.cache_stats = self.ctx.cache.lock().stats();
    }

    pub fn set_overlay(&mut self, area: Rect) {
        if self.overlay.map(|a| a.width) != Some(area.width) {
            self.selection.resize(area.width as f64);
        }
        self.overlay = Some(area);
    }

    pub fn on_mouse(&mut self, kind: MouseEventKind, column: u16, row: u16) {
        let Some(area) = self.overlay else {
            return;
        };
        let x = column as f64 - area.x as f64;
        match kind {
            MouseEventKind::Down(MouseButton::Left) => {
                let inside = column >= area.x
                    && column < area.x + area.width
                    && row >= area.y
                    && row < area.y + area.height;
                if inside {
                    self.selection.pointer_down(x);
                }
            }
            // Drags keep tracking outside the chart, clamped to its edges.
            MouseEventKind::Drag(MouseButton::Left) => self.selection.pointer_move(x),
            MouseEventKind::Up(MouseButton::Left) => {
                self.selection.pointer_up();
                info!("{}", self.selection.describe());
            }
            _ => {}
        }
    }

    pub fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => self.should_quit = true,
            KeyCode::Char('c') => self.selection.clear(),
            KeyCode::Char('r') => self.refresh_all(),
            KeyCode::Char('x') => {
                self.ctx.cache.lock().clear();
                self.cache_stats = self.ctx.cache.lock().stats();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, Cached};
    use crate::charts::{ChartData, Link};
    use crate::error::FetchError;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    struct NoRows;

    impl RowSource for NoRows {
        fn fetch_rows(&self, _: &str, _: &[(String, String)]) -> Result<Vec<Value>, FetchError> {
            Ok(vec![json!({"srcaddr": "a", "dstaddr": "b", "sum": 1})])
        }
    }

    fn app() -> App<NoRows, MemoryStore> {
        let params = QueryParams {
            postgrest_url: "http://rest/".into(),
            api_url: "http://api".into(),
            exporter: "1".into(),
            interface: "2".into(),
            start: Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 9, 1, 1, 0, 0).unwrap(),
            filters: vec![],
        };
        let cache = SharedCache::new(CacheManager::new(
            MemoryStore::new(),
            "netflow_",
            Duration::from_secs(60),
        ));
        App::new(params, Duration::from_secs(60), 1.0, Arc::new(NoRows), cache, Worker::inline())
    }

    fn links(weight: f64) -> Result<Cached<ChartData>, String> {
        Ok(Cached {
            data: ChartData::Links(vec![Link { from: "a".into(), to: "b".into(), weight }]),
            from_cache: false,
        })
    }

    #[test]
    fn test_default_charts() {
        let mut app = app();
        app.init_default_charts(true);
        assert_eq!(app.pies.len(), 4);
        assert_eq!(app.chart(app.traffic.unwrap()).kind, ChartKind::TimeseriesApi);
        assert_eq!(
            app.chart(app.sankey.unwrap()).kind,
            ChartKind::Sankey { direction: FlowDirection::Input }
        );
    }

    #[test]
    fn test_late_reply_does_not_overwrite_newer() {
        let mut app = app();
        let handle = app.init_chart(ChartKind::Sankey { direction: FlowDirection::Input });
        let first = app.charts[handle.0].next_generation();
        let second = app.charts[handle.0].next_generation();

        assert!(app.apply_update(ChartUpdate { chart: handle, generation: second, result: links(2.0) }));
        assert!(!app.apply_update(ChartUpdate { chart: handle, generation: first, result: links(1.0) }));
        assert_eq!(app.chart(handle).data, links(2.0).ok().map(|c| c.data));
    }

    #[test]
    fn test_request_round_trip() {
        let mut app = app();
        let handle = app.init_chart(ChartKind::Sankey { direction: FlowDirection::Input });
        app.request(handle);

        let deadline = Instant::now() + Duration::from_secs(5);
        while app.chart(handle).data.is_none() && Instant::now() < deadline {
            app.poll_updates();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(app.chart(handle).data, links(1.0).ok().map(|c| c.data));
        assert!(!app.chart(handle).from_cache);
    }

    #[test]
    fn test_plot_edges_map_to_query_range() {
        let mut app = app();
        let plot = crate::ui::traffic_layout(Rect::new(1, 1, 100, 20)).plot;
        assert_eq!(plot, Rect::new(14, 1, 87, 19));
        app.set_overlay(plot);

        app.on_mouse(MouseEventKind::Down(MouseButton::Left), plot.x, plot.y);
        app.on_mouse(MouseEventKind::Drag(MouseButton::Left), plot.x + plot.width, plot.y);
        app.on_mouse(MouseEventKind::Up(MouseButton::Left), plot.x + plot.width, plot.y);

        let out = app.selection.output().unwrap();
        assert_eq!(out.pixels, (0.0, 87.0));
        assert_eq!(out.time, Some((app.params().start, app.params().end)));
    }

    #[test]
    fn test_mouse_drives_selection() {
        let mut app = app();
        app.set_overlay(Rect::new(10, 2, 100, 20));

        // Presses outside the chart are ignored.
        app.on_mouse(MouseEventKind::Down(MouseButton::Left), 30, 40);
        assert_eq!(app.selection.start(), None);

        app.on_mouse(MouseEventKind::Down(MouseButton::Left), 30, 5);
        app.on_mouse(MouseEventKind::Drag(MouseButton::Left), 60, 5);
        app.on_mouse(MouseEventKind::Drag(MouseButton::Left), 200, 5);
        app.on_mouse(MouseEventKind::Up(MouseButton::Left), 200, 5);
        assert_eq!(app.selection.span(), Some((20.0, 100.0)));
        assert!(app.selection.describe().contains("Time: [2025-09-01T00:12:00.000Z"));

        app.handle_key(KeyCode::Char('c'), KeyModifiers::NONE);
        assert_eq!(app.selection.describe(), "No selection");
        assert!(!app.should_quit);

        app.handle_key(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert!(app.should_quit);
    }
}
