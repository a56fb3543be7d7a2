#![forbid(unsafe_code)]

//! Multi-source ingestion.
//!
//! Every capture source runs as its own task and pushes into one bounded queue. A single
//! engine task drains the queue into the [`Reassembler`] and runs the periodic idle sweep.
//! A full queue suspends the producing source.

use serde::Serialize;
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use reasm_core::{PipelineConfig, ReasmResult};
use reasm_stream::{Reassembler, Segment, SourceId, StatsSnapshot, StreamConsumer};

use crate::source::CaptureSource;

/// How a source task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// The source reported end of input.
    Exhausted,
    /// Stopped by a shutdown request.
    Cancelled,
    /// The source failed; the message is its error.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: SourceId,
    pub name: String,
    pub segments: u64,
    pub outcome: SourceOutcome,
}

/// Summary returned once the pipeline has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub sources: Vec<SourceReport>,
    pub segments_queued: u64,
    pub flows_flushed_at_shutdown: usize,
    pub stats: StatsSnapshot,
}

impl PipelineReport {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Failed(_)))
    }
}

struct SourceTask {
    id: SourceId,
    name: String,
    handle: JoinHandle<SourceReport>,
}

/// Sources registered but the engine task not yet running.
pub struct Pipeline<C: StreamConsumer> {
    engine: Arc<Reassembler<C>>,
    config: PipelineConfig,
    tx: mpsc::Sender<Segment>,
    rx: mpsc::Receiver<Segment>,
    shutdown_tx: watch::Sender<bool>,
    sources: Vec<SourceTask>,
}

impl<C: StreamConsumer> Pipeline<C> {
    pub fn new(engine: Arc<Reassembler<C>>, config: PipelineConfig) -> ReasmResult<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            engine,
            config,
            tx,
            rx,
            shutdown_tx,
            sources: Vec::new(),
        })
    }

    pub fn engine(&self) -> &Arc<Reassembler<C>> {
        &self.engine
    }

    /// Spawn a task pulling from `source`. Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(source = %source.id()))]
    pub fn add_source<S: CaptureSource>(&mut self, source: S) {
        let id = source.id();
        let name = source.describe();
        if self.sources.iter().any(|s| s.id == id) {
            warn!(%id, "source id already in use; reports will be ambiguous");
        }
        let handle = tokio::spawn(run_source(source, self.tx.clone(), self.shutdown_tx.subscribe()));
        info!(%name, "capture source started");
        self.sources.push(SourceTask { id, name, handle });
    }

    /// Start the engine task.
    pub fn start(self) -> PipelineHandle<C> {
        let Pipeline {
            engine,
            config,
            tx,
            rx,
            shutdown_tx,
            sources,
        } = self;
        // The queue closes once every source task has dropped its sender.
        drop(tx);
        let engine_task = tokio::spawn(run_engine(Arc::clone(&engine), rx, config.flush_interval()));
        PipelineHandle {
            engine,
            shutdown_tx: Arc::new(shutdown_tx),
            sources,
            engine_task,
        }
    }
}

/// A running pipeline.
pub struct PipelineHandle<C: StreamConsumer> {
    engine: Arc<Reassembler<C>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    sources: Vec<SourceTask>,
    engine_task: JoinHandle<u64>,
}

impl<C: StreamConsumer> PipelineHandle<C> {
    pub fn engine(&self) -> &Arc<Reassembler<C>> {
        &self.engine
    }

    /// A receiver that flips to true when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every source, drain the queue and force-complete open flows.
    #[instrument(skip_all)]
    pub async fn shutdown(self) -> PipelineReport {
        info!("shutdown requested");
        self.shutdown_tx.send_replace(true);
        self.finish().await
    }

    /// Wait for every source to run out on its own, then drain and force-complete.
    pub async fn join(self) -> PipelineReport {
        self.finish().await
    }

    /// Like [`join`](Self::join), but request shutdown as soon as `stop` resolves.
    pub async fn join_until<F>(self, stop: F) -> PipelineReport
    where
        F: Future + Send + 'static,
    {
        let trigger = Arc::clone(&self.shutdown_tx);
        let watcher = tokio::spawn(async move {
            stop.await;
            info!("stop condition reached; shutting down");
            trigger.send_replace(true);
        });
        let report = self.finish().await;
        watcher.abort();
        report
    }

    async fn finish(self) -> PipelineReport {
        let mut sources = Vec::with_capacity(self.sources.len());
        for task in self.sources {
            let report = match task.handle.await {
                Ok(report) => report,
                Err(err) => {
                    error!(source = %task.id, %err, "source task aborted");
                    SourceReport {
                        source: task.id,
                        name: task.name,
                        segments: 0,
                        outcome: SourceOutcome::Failed(err.to_string()),
                    }
                }
            };
            sources.push(report);
        }

        let segments_queued = match self.engine_task.await {
            Ok(n) => n,
            Err(err) => {
                error!(%err, "engine task aborted");
                0
            }
        };

        let flows_flushed_at_shutdown = self.engine.shutdown();
        let stats = self.engine.stats();
        info!(
            segments = segments_queued,
            flows = flows_flushed_at_shutdown,
            delivered = stats.bytes_delivered,
            "pipeline stopped"
        );
        PipelineReport {
            sources,
            segments_queued,
            flows_flushed_at_shutdown,
            stats,
        }
    }
}

async fn run_source<S: CaptureSource>(
    mut source: S,
    tx: mpsc::Sender<Segment>,
    mut shutdown: watch::Receiver<bool>,
) -> SourceReport {
    let id = source.id();
    let name = source.describe();
    let mut segments = 0u64;

    let outcome = loop {
        if *shutdown.borrow() {
            break SourceOutcome::Cancelled;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break SourceOutcome::Cancelled,
            next = source.next_segment() => next,
        };
        match next {
            Ok(Some(segment)) => {
                let segment = segment.with_source(id);
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break SourceOutcome::Cancelled,
                    sent = tx.send(segment) => {
                        if sent.is_err() {
                            break SourceOutcome::Cancelled;
                        }
                    }
                }
                segments += 1;
            }
            Ok(None) => break SourceOutcome::Exhausted,
            Err(err) => {
                error!(%id, %name, %err, "capture source failed");
                break SourceOutcome::Failed(err.to_string());
            }
        }
    };

    debug!(%id, segments, ?outcome, "source task finished");
    SourceReport {
        source: id,
        name,
        segments,
        outcome,
    }
}

async fn run_engine<C: StreamConsumer>(
    engine: Arc<Reassembler<C>>,
    mut rx: mpsc::Receiver<Segment>,
    flush_every: Option<Duration>,
) -> u64 {
    let mut ticker = flush_every.map(|period| {
        let mut t = interval(period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });
    let mut ingested = 0u64;
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(segment) => {
                    engine.ingest(segment);
                    ingested += 1;
                }
                None => break,
            },
            _ = tick(&mut ticker) => {
                let flushed = engine.flush_idle();
                if flushed > 0 {
                    debug!(flushed, "idle flows completed");
                }
            }
        }
    }
    ingested
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => future::pending().await,
    }
}
