//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where workers toil endlessly..."
//! 🎬 "One supervisor dared to manage them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor module — part middle manager, part helicopter parent,
//! part that one project manager who schedules a meeting to plan the next meeting.
//!
//! It wires one source worker, `sink_parallelism` sink workers and one
//! committer together with bounded channels, starts them, and waits for the
//! dust to settle. A slow cluster fills the batch queue, and a full batch queue
//! parks the source worker, so memory stays at a few batches no matter what.
//!
//! ⚠️ DO NOT MAKE THE WORKERS PUB EVER
//! 💀 WORKERS ARE SUPERVISORS PRIVATE LITTLE MINIONS WHOM THE WORLD FORGOT ABOUT

mod workers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app_config::RuntimeConfig;
use crate::backends::{SinkBackend, SourceBackend};
use crate::checkpoint::{Checkpoint, CheckpointBackend};
use crate::common::Rejection;
use crate::composers::NdjsonComposer;
use crate::errors::MigrationError;
use crate::progress::ProgressMetrics;
use workers::{Committer, SinkWorker, SourceWorker, Worker};

/// 🛑 Cooperative stop button. Clone it, hand it to Ctrl-C, press it whenever.
///
/// The source worker checks it between pages and stops cutting new batches;
/// batches already cut are still delivered and committed before the run ends.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 📋 How one pass of the pipeline went.
#[derive(Debug, Clone, Default)]
pub(crate) struct PipelineReport {
    /// 🔖 The checkpoint as last committed.
    pub checkpoint: Checkpoint,
    pub rejections: Vec<Rejection>,
    /// 🛑 Stopped before the source ran dry. The checkpoint is resumable.
    pub interrupted: bool,
}

/// 📦 The Supervisor: because even async tasks need someone hovering over them
/// asking "is it done yet?" every 5 milliseconds.
#[derive(Debug)]
pub(crate) struct Supervisor {
    runtime: RuntimeConfig,
}

/// 🧵 Await a worker; a panic is reported as the run being aborted at `start`.
async fn joined<T>(handle: JoinHandle<Result<T, MigrationError>>, who: &str, start: &Checkpoint) -> Result<T, MigrationError> {
    match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(MigrationError::LoadAborted {
            reason: format!("{who} crashed: {join_err}"),
            batches_committed: start.batches_committed,
            resume_after: start.last_film_id.clone(),
        }),
    }
}

impl Supervisor {
    /// 🚀 Birth of a Supervisor. It's like a baby, but less crying.
    pub(crate) fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }

    /// 🧵 Unleash the workers, starting after `start.last_film_id`.
    ///
    /// 💀 Source errors and batch-level delivery failures end the run with an
    /// error. Whatever was committed before that stays committed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run(
        &self,
        source: SourceBackend,
        sink: SinkBackend,
        composer: NdjsonComposer,
        store: CheckpointBackend,
        start: Checkpoint,
        stop: StopSignal,
        progress: Option<ProgressMetrics>,
    ) -> Result<PipelineReport, MigrationError> {
        let runtime = &self.runtime;
        let halt = StopSignal::new();
        let (batch_tx, batch_rx) = async_channel::bounded(runtime.queue_capacity.max(1));
        let (outcome_tx, outcome_rx) = async_channel::bounded(runtime.sink_parallelism.max(1) * 2);

        info!(
            "🚀 starting pipeline after {:?}: batch_size={}, queue_capacity={}, sink_parallelism={}",
            start.last_film_id, runtime.batch_size, runtime.queue_capacity, runtime.sink_parallelism
        );

        let committer = Committer::new(outcome_rx, store, start.clone(), halt.clone(), progress).start();
        let sink_workers: Vec<_> = (0..runtime.sink_parallelism.max(1))
            .map(|id| {
                SinkWorker::new(
                    id,
                    batch_rx.clone(),
                    outcome_tx.clone(),
                    sink.clone(),
                    composer.clone(),
                    runtime.retry.clone(),
                    halt.clone(),
                )
                .start()
            })
            .collect();
        let source_worker = SourceWorker::new(
            source,
            batch_tx,
            start.last_film_id.clone(),
            runtime.page_size,
            runtime.batch_size,
            runtime.retry.clone(),
            stop,
            halt.clone(),
        )
        .start();
        // 🔌 the workers own the channel ends now; ours would keep them open forever
        drop(batch_rx);
        drop(outcome_tx);

        let extracted = joined(source_worker, "source worker", &start).await;
        if extracted.is_err() {
            // 💀 no more batches are coming; what is already queued still gets delivered
            warn!("⚠️ extraction failed; draining what is already queued");
        }
        for result in join_all(sink_workers).await {
            if let Err(join_err) = result {
                warn!("⚠️ a sink worker crashed: {join_err}");
            }
        }
        let committed = joined(committer, "committer", &start).await?;
        let extracted = extracted?;

        if let Some(reason) = committed.failure {
            return Err(MigrationError::LoadAborted {
                reason,
                batches_committed: committed.checkpoint.batches_committed,
                resume_after: committed.checkpoint.last_film_id,
            });
        }

        Ok(PipelineReport {
            checkpoint: committed.checkpoint,
            rejections: committed.rejections,
            interrupted: extracted.interrupted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemorySink, InMemorySource};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::common::{FilmRow, RoleKind};
    use crate::retry::RetryPolicy;
    use anyhow::Result;

    fn catalogue(films: usize) -> Vec<FilmRow> {
        (0..films)
            .map(|n| {
                FilmRow::film(format!("f{n:03}"), format!("Film {n}"))
                    .with_rating("6.5")
                    .with_genre("Drama")
                    .with_person("p1", "Jane", RoleKind::Actor)
            })
            .collect()
    }

    fn runtime(batch_size: usize, sink_parallelism: usize) -> RuntimeConfig {
        RuntimeConfig {
            batch_size,
            page_size: 7,
            queue_capacity: 2,
            sink_parallelism,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            show_progress: false,
        }
    }

    async fn run(
        films: usize,
        rt: RuntimeConfig,
        sink: &InMemorySink,
        store: &InMemoryCheckpointStore,
        start: Checkpoint,
    ) -> Result<PipelineReport, MigrationError> {
        Supervisor::new(rt)
            .run(
                SourceBackend::InMemory(InMemorySource::new(catalogue(films))),
                SinkBackend::InMemory(sink.clone()),
                NdjsonComposer::new("movies", false),
                CheckpointBackend::InMemory(store.clone()),
                start,
                StopSignal::new(),
                None,
            )
            .await
    }

    #[tokio::test]
    async fn the_one_where_everything_just_works() -> Result<()> {
        let sink = InMemorySink::new();
        let store = InMemoryCheckpointStore::new();
        let report = run(95, runtime(10, 3), &sink, &store, Checkpoint::fresh()).await?;

        assert!(!report.interrupted);
        assert_eq!(report.checkpoint.batches_committed, 10);
        assert_eq!(report.checkpoint.documents_loaded, 95);
        assert_eq!(report.checkpoint.last_film_id.as_deref(), Some("f094"));
        assert_eq!(sink.documents().await.len(), 95);

        // 🔖 three sink workers, one strictly increasing bookmark
        let marks: Vec<String> = store
            .history()
            .await
            .into_iter()
            .filter_map(|c| c.last_film_id)
            .collect();
        let mut sorted = marks.clone();
        sorted.sort();
        assert_eq!(marks, sorted);
        assert_eq!(marks.len(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_in_a_hundred_bounces() -> Result<()> {
        let sink = InMemorySink::new();
        sink.reject_ids(["f042"]).await;
        let store = InMemoryCheckpointStore::new();
        let report = run(100, runtime(100, 1), &sink, &store, Checkpoint::fresh()).await?;

        assert_eq!(report.checkpoint.documents_loaded, 99);
        assert_eq!(report.checkpoint.documents_rejected, 1);
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.rejections[0].film_id, "f042");
        assert_eq!(report.checkpoint.last_film_id.as_deref(), Some("f099"));
        assert_eq!(sink.documents().await.len(), 99);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_cluster_vanishes_after_three_batches_and_we_resume() -> Result<()> {
        let sink = InMemorySink::new();
        sink.go_dark_after(3).await;
        let store = InMemoryCheckpointStore::new();

        let err = run(50, runtime(10, 1), &sink, &store, Checkpoint::fresh())
            .await
            .expect_err("💀 the cluster is gone");
        match &err {
            MigrationError::LoadAborted {
                batches_committed,
                resume_after,
                ..
            } => {
                assert_eq!(*batches_committed, 3);
                assert_eq!(resume_after.as_deref(), Some("f029"));
            }
            other => panic!("expected LoadAborted, got {other:?}"),
        }
        assert_eq!(err.exit_code(), 3);

        // 💡 the cluster comes back; pick up from the saved checkpoint
        sink.heal().await;
        let saved = store.history().await.last().cloned().unwrap_or_default();
        let report = run(50, runtime(10, 1), &sink, &store, saved).await?;

        assert_eq!(report.checkpoint.batches_committed, 5);
        assert_eq!(report.checkpoint.documents_loaded, 50);
        let requests = sink.requests().await;
        assert_eq!(requests[3].first().map(String::as_str), Some("f030"));

        // 🎯 same final state as a run that never stumbled
        let clean = InMemorySink::new();
        run(50, runtime(10, 1), &clean, &InMemoryCheckpointStore::new(), Checkpoint::fresh()).await?;
        assert_eq!(sink.documents().await, clean.documents().await);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_running_twice_changes_nothing() -> Result<()> {
        let sink = InMemorySink::new();
        run(30, runtime(8, 2), &sink, &InMemoryCheckpointStore::new(), Checkpoint::fresh()).await?;
        let first = sink.documents().await;
        run(30, runtime(8, 2), &sink, &InMemoryCheckpointStore::new(), Checkpoint::fresh()).await?;
        assert_eq!(sink.documents().await, first);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_bad_request_aborts_without_retrying() -> Result<()> {
        let sink = InMemorySink::new();
        sink.break_permanently().await;
        let store = InMemoryCheckpointStore::new();
        let err = run(5, runtime(10, 1), &sink, &store, Checkpoint::fresh())
            .await
            .expect_err("💀 400 all day");
        assert!(matches!(err, MigrationError::LoadAborted { batches_committed: 0, .. }));
        assert_eq!(sink.send_attempts().await, 1);
        assert!(store.history().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_operator_pulls_the_plug_early() -> Result<()> {
        let sink = InMemorySink::new();
        let store = InMemoryCheckpointStore::new();
        let stop = StopSignal::new();
        stop.stop();
        let report = Supervisor::new(runtime(10, 2))
            .run(
                SourceBackend::InMemory(InMemorySource::new(catalogue(20))),
                SinkBackend::InMemory(sink.clone()),
                NdjsonComposer::new("movies", false),
                CheckpointBackend::InMemory(store.clone()),
                Checkpoint::fresh(),
                stop,
                None,
            )
            .await?;
        assert!(report.interrupted);
        assert_eq!(report.checkpoint.batches_committed, 0);
        assert!(sink.documents().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_source_breaks_and_nothing_is_committed() -> Result<()> {
        let source = InMemorySource::new(catalogue(20));
        source.break_queries().await;
        let store = InMemoryCheckpointStore::new();
        let err = Supervisor::new(runtime(10, 2))
            .run(
                SourceBackend::InMemory(source),
                SinkBackend::InMemory(InMemorySink::new()),
                NdjsonComposer::new("movies", false),
                CheckpointBackend::InMemory(store.clone()),
                Checkpoint::fresh(),
                StopSignal::new(),
                None,
            )
            .await
            .expect_err("💀 broken query");
        assert_eq!(err.exit_code(), 2);
        assert!(store.history().await.is_empty());
        Ok(())
    }
}
