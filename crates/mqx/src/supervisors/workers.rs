//! 🧵 Workers: the backbone of the pipeline, the unsung heroes, the ones who actually
//! do the work while the Supervisor takes all the credit in the sprint retro.
//!
//! 🚀 Three kinds of minion, wired together by bounded channels:
//!
//! ```text
//! SourceWorker ──Batch──▶ SinkWorker ×N ──BatchOutcome──▶ Committer
//! ```
//!
//! ⚠️ "If you're reading this, the code review went poorly."

use tokio::task::JoinHandle;

use crate::backends::BulkReport;
use crate::errors::MigrationError;

mod committer;
mod sink_worker;
mod source_worker;

pub(in crate::supervisors) use committer::Committer;
pub(in crate::supervisors) use sink_worker::SinkWorker;
pub(in crate::supervisors) use source_worker::SourceWorker;

/// 🏗️ A background worker, that does work. duh.
///
/// "What's the DEAL with lifetime annotations? You borrow something,
///  you give it back. It's not that hard, Jerry!" — Seinfeld, on Rust
pub(in crate::supervisors) trait Worker {
    /// 📦 What the worker hands back when its channel runs dry.
    type Output: Send + 'static;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust
    /// but verify. Mostly verify. Okay, we don't trust at all.
    fn start(self) -> JoinHandle<Result<Self::Output, MigrationError>>;
}

/// 📬 What a sink worker says about one batch once it is done with it.
#[derive(Debug)]
pub(in crate::supervisors) struct BatchOutcome {
    pub seq: u64,
    pub last_film_id: String,
    pub skipped: u64,
    /// 📦 uncompressed bulk body size, for the throughput display
    pub bytes: u64,
    /// ✅ the bulk report, or why the whole batch could not be delivered
    pub result: Result<BulkReport, String>,
}
