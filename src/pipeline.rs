use std::{
    sync::{mpsc::Sender, Arc},
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::backend::RowSource;
use crate::cache::{Cached, Clock, SharedCache};
use crate::charts::{ChartData, ChartKind, Query};
use crate::error::FetchError;
use crate::store::Store;
use crate::worker::{Job, Worker};

/// Index of a chart registered with the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChartHandle(pub(crate) usize);

impl ChartHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A finished request, tagged with the generation it was issued under.
#[derive(Debug)]
pub struct ChartUpdate {
    pub chart: ChartHandle,
    pub generation: u64,
    pub result: Result<Cached<ChartData>, String>,
}

/// Fetch (through the cache) then transform (on the worker).
pub fn run_request<R, S, C>(
    source: &R,
    cache: &SharedCache<S, C>,
    worker: &Worker,
    kind: &ChartKind,
    query: &Query,
    ttl: Duration,
) -> Result<Cached<ChartData>, FetchError>
where
    R: RowSource,
    S: Store,
    C: Clock,
{
    let rows = cache.fetch_with_cache(&query.url, &query.params, ttl, |url, params| {
        source.fetch_rows(url, params)
    })?;
    debug!(
        "{} rows for {:?} (cached: {})",
        rows.data.len(),
        kind,
        rows.from_cache
    );
    let data = worker.run(Job::new(kind.clone(), rows.data));
    Ok(Cached {
        data,
        from_cache: rows.from_cache,
    })
}

pub struct RequestContext<R, S, C> {
    pub source: Arc<R>,
    pub cache: SharedCache<S, C>,
    pub worker: Worker,
    pub updates: Sender<ChartUpdate>,
}

impl<R, S, C> Clone for RequestContext<R, S, C> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            cache: self.cache.clone(),
            worker: self.worker.clone(),
            updates: self.updates.clone(),
        }
    }
}

/// Runs [`run_request`] on its own thread and posts the outcome as a
/// [`ChartUpdate`]. Failures are logged and delivered, never retried.
pub fn spawn_request<R, S, C>(
    ctx: &RequestContext<R, S, C>,
    chart: ChartHandle,
    generation: u64,
    kind: ChartKind,
    query: Query,
    ttl: Duration,
) where
    R: RowSource,
    S: Store + Send + 'static,
    C: Clock + 'static,
{
    let ctx = ctx.clone();
    let spawned = thread::Builder::new()
        .name(format!("fetch-{}", chart.index()))
        .spawn(move || {
            let result = run_request(&*ctx.source, &ctx.cache, &ctx.worker, &kind, &query, ttl)
                .map_err(|e| {
                    warn!("Fetch for {kind:?} failed: {e}");
                    e.to_string()
                });
            // The UI may already be gone.
            let _ = ctx.updates.send(ChartUpdate {
                chart,
                generation,
                result,
            });
        });
    if let Err(e) = spawned {
        warn!("Could not start fetch thread for chart {}: {e}", chart.index());
    }
}
