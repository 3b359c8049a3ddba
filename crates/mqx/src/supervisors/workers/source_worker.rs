//! 🚰 SourceWorker — pulls film-aligned pages, folds them into documents, cuts batches.
//!
//! 🎬 *[the source worker wakes. it asks the database for five hundred films.]*
//! *[the database sighs, and hands over four thousand rows.]*
//!
//! The worker is the only thing that talks to the source during a load, and the
//! only thing that numbers batches. Pages are film-aligned, so the assembler is
//! flushed at every page boundary and never carries a film across pages.

use async_channel::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Worker;
use crate::assembler::{Assembled, Assembler};
use crate::backends::{Source, SourceBackend};
use crate::common::{Batch, Document};
use crate::errors::MigrationError;
use crate::retry::{RetryPolicy, with_retries};
use crate::supervisors::StopSignal;

/// 📊 How the extraction side ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(in crate::supervisors) struct ExtractReport {
    /// 🔢 Batches handed to the sink workers.
    pub batches: u64,
    /// 🛑 The operator (or a failing downstream) stopped us before the source ran dry.
    pub interrupted: bool,
}

#[derive(Debug)]
pub(in crate::supervisors) struct SourceWorker {
    source: SourceBackend,
    tx: Sender<Batch>,
    resume_after: Option<String>,
    page_size: usize,
    batch_size: usize,
    retry: RetryPolicy,
    stop: StopSignal,
    halt: StopSignal,
}

impl SourceWorker {
    #[allow(clippy::too_many_arguments)]
    pub(in crate::supervisors) fn new(
        source: SourceBackend,
        tx: Sender<Batch>,
        resume_after: Option<String>,
        page_size: usize,
        batch_size: usize,
        retry: RetryPolicy,
        stop: StopSignal,
        halt: StopSignal,
    ) -> Self {
        Self {
            source,
            tx,
            resume_after,
            page_size,
            batch_size,
            retry,
            stop,
            halt,
        }
    }
}

/// 🧺 The batch being filled.
#[derive(Debug, Default)]
struct Pending {
    seq: u64,
    documents: Vec<Document>,
    last_film_id: Option<String>,
    skipped: u64,
}

impl Pending {
    fn take(&mut self, assembled: Assembled) {
        match assembled {
            Assembled::Document(document) => {
                self.last_film_id = Some(document.id.clone());
                self.documents.push(document);
            }
            Assembled::Skipped(err) => {
                warn!("⚠️ skipping film: {err}");
                if let MigrationError::MalformedRecord { film_id, .. } = err {
                    self.last_film_id = Some(film_id);
                }
                self.skipped += 1;
            }
        }
    }

    /// ✂️ Cut a batch if there is anything to account for.
    fn cut(&mut self) -> Option<Batch> {
        let last_film_id = self.last_film_id.take()?;
        let batch = Batch {
            seq: self.seq,
            documents: std::mem::take(&mut self.documents),
            last_film_id,
            skipped: std::mem::take(&mut self.skipped),
        };
        self.seq += 1;
        Some(batch)
    }
}

impl SourceWorker {
    /// 📤 Returns false once nobody is listening anymore.
    async fn ship(&self, batch: Batch) -> bool {
        debug!(
            "📦 batch #{} ready: {} documents, {} skipped, up to '{}'",
            batch.seq,
            batch.documents.len(),
            batch.skipped,
            batch.last_film_id
        );
        self.tx.send(batch).await.is_ok()
    }

    async fn pump(self) -> Result<ExtractReport, MigrationError> {
        let mut cursor = self.resume_after.clone();
        let mut assembler = Assembler::new();
        let mut pending = Pending::default();
        let mut interrupted = false;

        'pages: loop {
            if self.stop.is_stopped() || self.halt.is_stopped() {
                interrupted = true;
                break;
            }

            let page = with_retries(&self.retry, "extracting a page of films", || {
                self.source.next_page(cursor.as_deref(), self.page_size)
            })
            .await?;
            let Some(last_row) = page.last() else {
                info!("🏁 source ran dry after '{}'", cursor.as_deref().unwrap_or("<start>"));
                break;
            };
            cursor = Some(last_row.film_id.clone());

            for row in page {
                if let Some(done) = assembler.push(row)? {
                    pending.take(done);
                }
                if pending.documents.len() >= self.batch_size {
                    if let Some(batch) = pending.cut() {
                        if !self.ship(batch).await {
                            interrupted = true;
                            break 'pages;
                        }
                    }
                }
            }
            // 📄 film-aligned pages: the film on the belt is complete
            if let Some(done) = assembler.finish() {
                pending.take(done);
            }
            if pending.documents.len() >= self.batch_size {
                if let Some(batch) = pending.cut() {
                    if !self.ship(batch).await {
                        interrupted = true;
                        break;
                    }
                }
            }
        }

        // 🧹 whatever is left is made of whole films, so it is safe to commit even when stopping
        if let Some(batch) = pending.cut() {
            if !self.ship(batch).await {
                interrupted = true;
            }
        }

        Ok(ExtractReport {
            batches: pending.seq,
            interrupted,
        })
    }
}

impl Worker for SourceWorker {
    type Output = ExtractReport;

    fn start(self) -> JoinHandle<Result<ExtractReport, MigrationError>> {
        tokio::spawn(async move {
            debug!("🚰 SourceWorker started after '{:?}'", self.resume_after);
            self.pump().await
        })
    }
}
