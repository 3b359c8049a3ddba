//! 🎬 mqx — moves a film catalogue out of SQLite and into a search index.
//!
//! 🎞️ *[INT. RELATIONAL DATABASE — NIGHT. Five tables. Zero documents.]*
//! *[a narrator, gravelly:]* "They said you couldn't denormalize a catalogue in one pass.
//! They said the checkpoint would never hold. They were wrong about the second thing."
//!
//! The library is three operations:
//!
//! - [`migrate`] — extract → assemble → bulk-load, resumable, then verify.
//! - [`verify`] — the verification pass on its own. Reads both sides, writes neither.
//! - [`create_index`] — create the target index with the fixed mapping.
//!
//! Everything the exit code depends on comes back as a [`MigrationError`]. 🦆

pub mod app_config;
mod assembler;
mod backends;
pub mod checkpoint;
pub mod common;
mod composers;
pub mod errors;
mod progress;
pub mod retry;
pub mod schema;
mod supervisors;
pub mod verifier;

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL};
use tracing::{info, warn};

pub use app_config::{AppConfig, RuntimeConfig, VerifyConfig, load_config};
pub use backends::{ElasticsearchSinkConfig, SqliteSourceConfig, TableNames};
pub use checkpoint::{Checkpoint, CheckpointConfig};
pub use common::{Document, PersonRef, Rejection};
pub use errors::MigrationError;
pub use supervisors::StopSignal;
pub use verifier::{FieldMismatch, VerificationReport};

use backends::elasticsearch::ElasticsearchSink;
use backends::sqlite::SqliteSource;
use backends::{Sink, SinkBackend, Source, SourceBackend};
use checkpoint::{CheckpointBackend, CheckpointStore};
use composers::NdjsonComposer;
use progress::{ProgressMetrics, format_number};
use retry::with_retries;
use supervisors::Supervisor;
use verifier::Verifier;

/// 🎛️ Per-invocation switches that do not belong in the config file.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// 🔄 Ignore any saved checkpoint and start from the first film.
    pub restart: bool,
    /// 🔍 Run the verifier after a completed pass.
    pub verify: bool,
    /// 🔨 Remove an existing checkpoint lock before taking it, owner alive or not.
    pub break_lock: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            restart: false,
            verify: true,
            break_lock: false,
        }
    }
}

/// 🧾 The final word on a migration run.
#[derive(Debug, Clone, Default)]
pub struct MigrationSummary {
    /// 🔖 Where this run started; `None` for a pass from the very first film.
    pub resumed_after: Option<String>,
    /// 🔖 Where the checkpoint sits now.
    pub last_film_id: Option<String>,
    pub batches_committed: u64,
    pub documents_loaded: u64,
    pub documents_skipped: u64,
    pub documents_rejected: u64,
    /// 🚫 Refusals seen by this invocation (counters above include earlier runs of the same pass).
    pub rejections: Vec<Rejection>,
    /// 🛑 Stopped by the operator; run `migrate` again to carry on.
    pub interrupted: bool,
    /// 🏁 The source ran dry and every batch committed.
    pub completed: bool,
    pub verification: Option<VerificationReport>,
}

impl MigrationSummary {
    fn from_checkpoint(checkpoint: &Checkpoint, resumed_after: Option<String>) -> Self {
        Self {
            resumed_after,
            last_film_id: checkpoint.last_film_id.clone(),
            batches_committed: checkpoint.batches_committed,
            documents_loaded: checkpoint.documents_loaded,
            documents_skipped: checkpoint.documents_skipped,
            documents_rejected: checkpoint.documents_rejected,
            completed: checkpoint.completed,
            ..Default::default()
        }
    }

    /// 🚦 A finished load with a bad verification is still a non-zero exit.
    pub fn verdict(&self) -> Result<(), MigrationError> {
        match &self.verification {
            Some(report) => report.verdict(),
            None => Ok(()),
        }
    }

    /// 🍽️ The summary table the CLI prints.
    pub fn render(&self) -> String {
        let outcome = if self.interrupted {
            "🛑 interrupted (resumable)"
        } else if self.completed {
            "🏁 completed"
        } else {
            "⏸️ incomplete"
        };
        let verification = match &self.verification {
            Some(report) if report.is_clean() => "✅ clean".to_string(),
            Some(report) => format!(
                "🔍 MISMATCH ({} of {} counted, {} field mismatches)",
                format_number(report.target_count),
                format_number(report.source_count),
                report.mismatches.len()
            ),
            None => "skipped".to_string(),
        };

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["migration", "value"]);
        let rows: Vec<(&str, String)> = vec![
            ("outcome", outcome.to_string()),
            ("resumed after", self.resumed_after.clone().unwrap_or_else(|| "-".into())),
            ("checkpoint", self.last_film_id.clone().unwrap_or_else(|| "-".into())),
            ("batches committed", format_number(self.batches_committed)),
            ("documents loaded", format_number(self.documents_loaded)),
            ("documents skipped", format_number(self.documents_skipped)),
            ("documents rejected", format_number(self.documents_rejected)),
            ("verification", verification),
        ];
        for (label, value) in rows {
            table.add_row(vec![Cell::new(label), Cell::new(value)]);
        }

        let mut out = table.to_string();
        for rejection in self.rejections.iter().take(20) {
            out.push_str(&format!("\n  🚫 {}: {}", rejection.film_id, rejection.reason));
        }
        if self.rejections.len() > 20 {
            out.push_str(&format!("\n  … and {} more", self.rejections.len() - 20));
        }
        out
    }
}

/// 🗄️ Open the source, retrying while it is merely unavailable.
async fn connect_source(config: &AppConfig) -> Result<SourceBackend, MigrationError> {
    let source = with_retries(&config.runtime.retry, "connecting to the source", || {
        SqliteSource::connect(&config.source)
    })
    .await?;
    Ok(SourceBackend::Sqlite(source))
}

async fn connect_sink(config: &AppConfig, require_index: bool) -> Result<ElasticsearchSink, MigrationError> {
    ElasticsearchSink::connect(config.sink.clone(), require_index).await
}

/// 🔖 Where a run starts: the saved checkpoint, unless it is finished or the operator said otherwise.
async fn starting_point(store: &CheckpointBackend, restart: bool) -> Result<Checkpoint, MigrationError> {
    if restart {
        info!("🔄 restart requested; ignoring any saved checkpoint");
        return Ok(Checkpoint::fresh());
    }
    match store.load().await? {
        None => {
            info!("🆕 no checkpoint found; starting from the first film");
            Ok(Checkpoint::fresh())
        }
        Some(previous) if previous.completed => {
            info!(
                "🏁 the previous pass completed ({} documents); starting a fresh one",
                format_number(previous.documents_loaded)
            );
            Ok(Checkpoint::fresh())
        }
        Some(previous) => {
            info!(
                "⏩ resuming after '{}' ({} batches already committed)",
                previous.last_film_id.as_deref().unwrap_or("<start>"),
                previous.batches_committed
            );
            Ok(previous)
        }
    }
}

/// 🚀 Run (or resume) a migration, then verify it.
///
/// Takes the checkpoint lock first and releases it on the way out, whatever
/// happened in between.
///
/// 💀 `SourceUnavailable`/`SourceQueryError` when the source fails,
/// `TargetUnavailable` when the cluster cannot be reached or the index is
/// missing, `LoadAborted` when a batch cannot be delivered, `CheckpointLocked`
/// when another run holds the lock. A verification mismatch is *not* an error
/// here; see [`MigrationSummary::verdict`].
pub async fn migrate(
    config: &AppConfig,
    options: MigrateOptions,
    stop: StopSignal,
) -> Result<MigrationSummary, MigrationError> {
    config.validate()?;
    let store = CheckpointBackend::from_config(&config.checkpoint);
    if options.break_lock {
        store.break_lock().await?;
    }
    store.acquire().await?;

    let outcome = async {
        let source = connect_source(config).await?;
        let sink = SinkBackend::Elasticsearch(connect_sink(config, true).await?);
        run_migration(config, &options, stop, source, sink, store.clone()).await
    }
    .await;

    if let Err(err) = store.release().await {
        warn!("⚠️ could not release the checkpoint lock: {err}");
    }
    outcome
}

/// 🎬 The migration proper, on already-connected backends.
async fn run_migration(
    config: &AppConfig,
    options: &MigrateOptions,
    stop: StopSignal,
    source: SourceBackend,
    sink: SinkBackend,
    store: CheckpointBackend,
) -> Result<MigrationSummary, MigrationError> {
    let start = starting_point(&store, options.restart).await?;
    let resumed_after = start.last_film_id.clone();

    let total = with_retries(&config.runtime.retry, "counting films", || source.count_films()).await?;
    info!("🎬 source holds {} films", format_number(total));
    let already_done = start.documents_loaded + start.documents_skipped + start.documents_rejected;
    let progress = config
        .runtime
        .show_progress
        .then(|| ProgressMetrics::new(config.sink.index.clone(), total, already_done));

    let composer = NdjsonComposer::new(config.sink.index.clone(), config.sink.compress_requests);
    let report = Supervisor::new(config.runtime.clone())
        .run(
            source.clone(),
            sink.clone(),
            composer,
            store.clone(),
            start,
            stop,
            progress,
        )
        .await?;

    let mut checkpoint = report.checkpoint;
    if report.interrupted {
        info!(
            "🛑 stopped after '{}'; run `mqx migrate` again to carry on",
            checkpoint.last_film_id.as_deref().unwrap_or("<start>")
        );
    } else {
        checkpoint.completed = true;
        store.save(&checkpoint).await?;
        info!(
            "🏁 pass complete: {} loaded, {} skipped, {} rejected",
            format_number(checkpoint.documents_loaded),
            format_number(checkpoint.documents_skipped),
            format_number(checkpoint.documents_rejected)
        );
    }

    let mut summary = MigrationSummary::from_checkpoint(&checkpoint, resumed_after);
    summary.rejections = report.rejections;
    summary.interrupted = report.interrupted;

    if checkpoint.completed && options.verify {
        let report = Verifier::new(&source, &sink, &config.verify, &config.runtime.retry)
            .run()
            .await?;
        summary.verification = Some(report);
    }
    Ok(summary)
}

/// 🔍 Verification only. No lock needed: it never writes anything.
pub async fn verify(config: &AppConfig) -> Result<VerificationReport, MigrationError> {
    config.validate()?;
    let source = connect_source(config).await?;
    let sink = SinkBackend::Elasticsearch(connect_sink(config, true).await?);
    Verifier::new(&source, &sink, &config.verify, &config.runtime.retry)
        .run()
        .await
}

/// 🏗️ Create the target index with the fixed mapping. `Ok(false)` if it was already there.
pub async fn create_index(config: &AppConfig) -> Result<bool, MigrationError> {
    config.validate()?;
    connect_sink(config, false).await?.create_index().await
}
