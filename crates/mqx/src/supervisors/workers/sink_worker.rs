//! 🎬 *[a channel fills with batches. somewhere, a sink waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗑️ The SinkWorker module — patient, tireless, and deeply unbothered by the chaos
//! happening upstream. It receives batches. It composes bulk requests. It retries
//! the ones the cluster coughs on. It reports back. It asks no questions.
//!
//! Whole-batch failures go through the retry state machine: transient ones
//! sleep and try again, permanent ones (or a spent budget) become a failed
//! outcome for the committer to deal with. Per-document rejections are not
//! failures at all; they ride along in the bulk report.

use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BatchOutcome, Worker};
use crate::backends::{BulkReport, Sink, SinkBackend};
use crate::common::Batch;
use crate::composers::NdjsonComposer;
use crate::errors::MigrationError;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::supervisors::StopSignal;

#[derive(Debug)]
pub(in crate::supervisors) struct SinkWorker {
    id: usize,
    rx: Receiver<Batch>,
    tx: Sender<BatchOutcome>,
    sink: SinkBackend,
    composer: NdjsonComposer,
    retry: RetryPolicy,
    halt: StopSignal,
}

impl SinkWorker {
    /// 🏗️ You hand it a receiver (the data firehose), a sink (the drain), and a
    /// sender to report back on. It does not judge. It does not negotiate.
    pub(in crate::supervisors) fn new(
        id: usize,
        rx: Receiver<Batch>,
        tx: Sender<BatchOutcome>,
        sink: SinkBackend,
        composer: NdjsonComposer,
        retry: RetryPolicy,
        halt: StopSignal,
    ) -> Self {
        Self {
            id,
            rx,
            tx,
            sink,
            composer,
            retry,
            halt,
        }
    }

    /// 📡 Deliver one batch, retrying whole-request failures per the policy.
    async fn deliver(&self, batch: &Batch) -> (u64, Result<BulkReport, String>) {
        if batch.documents.is_empty() {
            // 🫥 a batch of nothing but skipped films: nothing to send, still something to commit
            return (0, Ok(BulkReport::default()));
        }

        let payload = match self.composer.compose(&batch.documents) {
            Ok(payload) => payload,
            Err(err) => return (0, Err(err.to_string())),
        };
        let bytes = payload.raw_len as u64;
        debug!(
            "📡 sink worker {} sending batch #{}: {} documents, {} bytes{}",
            self.id,
            batch.seq,
            payload.documents,
            payload.body.len(),
            if payload.gzip { " (gzip)" } else { "" }
        );

        let mut backoff = self.retry.backoff();
        loop {
            match self.sink.send(&payload).await {
                Ok(report) => return (bytes, Ok(report)),
                Err(err) => match backoff.on_failure(err.is_transient()) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            "🔄 sink worker {} batch #{}: {err}; attempt {} coming up in {:?}",
                            self.id,
                            batch.seq,
                            backoff.attempt(),
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        return (
                            bytes,
                            Err(format!(
                                "batch #{} gave up after {} attempt(s): {err}",
                                batch.seq,
                                backoff.attempt()
                            )),
                        );
                    }
                },
            }
        }
    }
}

impl Worker for SinkWorker {
    type Output = ();

    fn start(self) -> JoinHandle<Result<(), MigrationError>> {
        tokio::spawn(async move {
            debug!("📥 SinkWorker {} started draining channel...", self.id);
            loop {
                if self.halt.is_stopped() {
                    debug!("🛑 SinkWorker {}: pipeline halted. Putting the mop down.", self.id);
                    return Ok(());
                }
                let Ok(batch) = self.rx.recv().await else {
                    debug!("🏁 SinkWorker {}: channel closed. Shutting down.", self.id);
                    return Ok(());
                };
                debug!(
                    "🪣 SinkWorker {} received batch #{} of {} documents",
                    self.id,
                    batch.seq,
                    batch.documents.len()
                );
                let (bytes, result) = self.deliver(&batch).await;
                let outcome = BatchOutcome {
                    seq: batch.seq,
                    last_film_id: batch.last_film_id,
                    skipped: batch.skipped,
                    bytes,
                    result,
                };
                if self.tx.send(outcome).await.is_err() {
                    // 🚪 the committer left the building; nobody to report to
                    return Ok(());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemorySink;
    use crate::common::Document;
    use anyhow::Result;

    fn batch(seq: u64, ids: &[&str]) -> Batch {
        Batch {
            seq,
            documents: ids
                .iter()
                .map(|id| Document {
                    id: id.to_string(),
                    title: format!("Film {id}"),
                    ..Default::default()
                })
                .collect(),
            last_film_id: ids.last().map(|id| id.to_string()).unwrap_or_default(),
            skipped: 0,
        }
    }

    fn quick_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    async fn run_one(sink: InMemorySink, retry: RetryPolicy, batch: Batch) -> Result<BatchOutcome> {
        let (batch_tx, batch_rx) = async_channel::bounded(1);
        let (outcome_tx, outcome_rx) = async_channel::bounded(1);
        let worker = SinkWorker::new(
            0,
            batch_rx,
            outcome_tx,
            SinkBackend::InMemory(sink),
            NdjsonComposer::new("movies", false),
            retry,
            StopSignal::new(),
        );
        let handle = worker.start();
        batch_tx.send(batch).await?;
        drop(batch_tx);
        let outcome = outcome_rx.recv().await?;
        handle.await??;
        Ok(outcome)
    }

    #[tokio::test]
    async fn the_one_where_a_batch_lands_first_try() -> Result<()> {
        let sink = InMemorySink::new();
        let outcome = run_one(sink.clone(), quick_retries(3), batch(7, &["f1", "f2"])).await?;
        assert_eq!(outcome.seq, 7);
        assert_eq!(outcome.last_film_id, "f2");
        assert!(outcome.bytes > 0);
        assert_eq!(outcome.result.map_err(anyhow::Error::msg)?.accepted, 2);
        assert_eq!(sink.send_attempts().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_two_503s_are_shrugged_off() -> Result<()> {
        let sink = InMemorySink::new();
        sink.stumble(2).await;
        let outcome = run_one(sink.clone(), quick_retries(3), batch(0, &["f1"])).await?;
        assert!(outcome.result.is_ok());
        assert_eq!(sink.send_attempts().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_retry_budget_runs_out() -> Result<()> {
        let sink = InMemorySink::new();
        sink.stumble(10).await;
        let outcome = run_one(sink.clone(), quick_retries(3), batch(0, &["f1"])).await?;
        let reason = outcome.result.expect_err("💀 three strikes");
        assert!(reason.contains("3 attempt"), "{reason}");
        assert_eq!(sink.send_attempts().await, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_400_is_not_worth_a_second_look() -> Result<()> {
        let sink = InMemorySink::new();
        sink.break_permanently().await;
        let outcome = run_one(sink.clone(), quick_retries(5), batch(0, &["f1"])).await?;
        assert!(outcome.result.is_err());
        assert_eq!(sink.send_attempts().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_all_skipped_batch_never_bothers_the_cluster() -> Result<()> {
        let sink = InMemorySink::new();
        let mut empty = batch(3, &[]);
        empty.last_film_id = "f9".into();
        empty.skipped = 2;
        let outcome = run_one(sink.clone(), quick_retries(3), empty).await?;
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.result, Ok(BulkReport::default()));
        assert_eq!(sink.send_attempts().await, 0);
        Ok(())
    }
}
