use std::{
    sync::mpsc::{self, Receiver, Sender},
    thread,
};

use log::{debug, warn};
use serde_json::Value;

use crate::charts::{ChartData, ChartKind};

/// Rows to transform for one chart. Owned, so it crosses threads by move.
#[derive(Debug, Clone)]
pub struct Job {
    pub kind: ChartKind,
    pub rows: Vec<Value>,
}

impl Job {
    pub fn new(kind: ChartKind, rows: Vec<Value>) -> Self {
        Self { kind, rows }
    }

    pub fn run(self) -> ChartData {
        self.kind.transform(self.rows)
    }
}

struct Request {
    job: Job,
    reply: Sender<ChartData>,
}

/// Background thread that runs chart transforms off the UI thread.
///
/// Cloning shares the same thread. If the thread could not be started or has
/// gone away, [`Worker::run`] does the work on the calling thread instead.
#[derive(Clone)]
pub struct Worker {
    tx: Option<Sender<Request>>,
}

impl Worker {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        match thread::Builder::new()
            .name("transform-worker".into())
            .spawn(move || worker_loop(rx))
        {
            Ok(_) => Self { tx: Some(tx) },
            Err(e) => {
                warn!("Could not start transform worker, transforming inline: {e}");
                Self::inline()
            }
        }
    }

    pub fn inline() -> Self {
        Self { tx: None }
    }

    pub fn run(&self, job: Job) -> ChartData {
        let Some(tx) = &self.tx else {
            return job.run();
        };

        // The worker gets its own copy; ours backs the inline fallback.
        let fallback = job.clone();
        let (reply_tx, reply_rx) = mpsc::channel();
        if tx.send(Request { job, reply: reply_tx }).is_err() {
            warn!("Transform worker is gone, transforming inline");
            return fallback.run();
        }
        match reply_rx.recv() {
            Ok(data) => data,
            Err(_) => {
                warn!("Transform worker failed, transforming inline");
                fallback.run()
            }
        }
    }
}

fn worker_loop(rx: Receiver<Request>) {
    for Request { job, reply } in rx {
        debug!("Transforming {} rows for {:?}", job.rows.len(), job.kind);
        // The requester may have stopped waiting.
        let _ = reply.send(job.run());
    }
    debug!("Transform worker exiting");
}
