//! 🔖 Committer — the only worker allowed to touch the checkpoint.
//!
//! 🎬 *[batches come back from the sink workers in whatever order they please.]*
//! *[the committer lines them up by number, like a very strict deli counter.]*
//!
//! Outcomes are parked in a reorder buffer until every earlier batch has been
//! seen, then applied one by one: counters bumped, rejections logged, checkpoint
//! saved. The first failed batch, in order, halts the pipeline. Everything
//! before it is already on disk, which is exactly where a resumed run should
//! start.

use std::collections::BTreeMap;

use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{BatchOutcome, Worker};
use crate::checkpoint::{Checkpoint, CheckpointBackend, CheckpointStore};
use crate::common::Rejection;
use crate::errors::MigrationError;
use crate::progress::ProgressMetrics;
use crate::supervisors::StopSignal;

/// 📋 What the committer leaves behind.
#[derive(Debug, Clone, Default)]
pub(in crate::supervisors) struct CommitReport {
    /// 🔖 The checkpoint as last saved.
    pub checkpoint: Checkpoint,
    /// 🚫 Every per-document refusal this run, in commit order.
    pub rejections: Vec<Rejection>,
    /// 💀 Why the first failed batch failed, if one did.
    pub failure: Option<String>,
}

#[derive(Debug)]
pub(in crate::supervisors) struct Committer {
    rx: Receiver<BatchOutcome>,
    store: CheckpointBackend,
    checkpoint: Checkpoint,
    halt: StopSignal,
    progress: Option<ProgressMetrics>,
}

impl Committer {
    pub(in crate::supervisors) fn new(
        rx: Receiver<BatchOutcome>,
        store: CheckpointBackend,
        checkpoint: Checkpoint,
        halt: StopSignal,
        progress: Option<ProgressMetrics>,
    ) -> Self {
        Self {
            rx,
            store,
            checkpoint,
            halt,
            progress,
        }
    }

    async fn run(mut self) -> Result<CommitReport, MigrationError> {
        let mut next_seq = 0u64;
        let mut parked: BTreeMap<u64, BatchOutcome> = BTreeMap::new();
        let mut rejections = Vec::new();
        let mut failure = None;

        'outcomes: while let Ok(outcome) = self.rx.recv().await {
            if outcome.seq != next_seq {
                debug!("🅿️ batch #{} finished early; parking until #{} shows up", outcome.seq, next_seq);
            }
            parked.insert(outcome.seq, outcome);

            while let Some(outcome) = parked.remove(&next_seq) {
                match outcome.result {
                    Ok(report) => {
                        for rejection in &report.rejections {
                            warn!("🚫 target refused '{}': {}", rejection.film_id, rejection.reason);
                        }
                        let refused = report.rejections.len() as u64;
                        self.checkpoint.last_film_id = Some(outcome.last_film_id);
                        self.checkpoint.batches_committed += 1;
                        self.checkpoint.documents_loaded += report.accepted;
                        self.checkpoint.documents_rejected += refused;
                        self.checkpoint.documents_skipped += outcome.skipped;
                        rejections.extend(report.rejections);

                        if let Err(err) = self.store.save(&self.checkpoint).await {
                            self.halt.stop();
                            return Err(err);
                        }
                        debug!(
                            "🔖 committed batch #{} → checkpoint after '{}'",
                            next_seq,
                            self.checkpoint.last_film_id.as_deref().unwrap_or_default()
                        );
                        if let Some(progress) = self.progress.as_mut() {
                            progress.update(outcome.bytes, report.accepted + refused + outcome.skipped);
                        }
                        next_seq += 1;
                    }
                    Err(reason) => {
                        error!("💀 batch #{} could not be delivered: {reason}", outcome.seq);
                        failure = Some(reason);
                        self.halt.stop();
                        break 'outcomes;
                    }
                }
            }
        }

        if !parked.is_empty() && failure.is_none() {
            // 🕳️ a gap means a sink worker died holding a batch; it is not committed
            warn!(
                "⚠️ {} finished batch(es) never got their turn; the checkpoint stops at #{}",
                parked.len(),
                next_seq
            );
        }
        if let Some(progress) = self.progress.as_ref() {
            progress.finish();
        }

        Ok(CommitReport {
            checkpoint: self.checkpoint,
            rejections,
            failure,
        })
    }
}

impl Worker for Committer {
    type Output = CommitReport;

    fn start(self) -> JoinHandle<Result<CommitReport, MigrationError>> {
        tokio::spawn(async move {
            debug!("🔖 Committer started at {:?}", self.checkpoint.last_film_id);
            self.run().await
        })
    }
}
