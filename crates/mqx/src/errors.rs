//! 💀 Errors — the official taxonomy of things that go wrong at 3am.
//!
//! Every failure the exit code cares about has a name here. Sub-batch trouble
//! (a malformed film, a document the cluster refused) gets absorbed into
//! counters by the pipeline; everything at batch level or above stops the run
//! and leaves the checkpoint behind like a bookmark in a very long novel. 🦆

use thiserror::Error;

/// 🏷️ What went wrong, by name, so the operator knows which runbook to open.
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    /// 📡 The source database could not be reached (connect, IO, pool, timeout).
    #[error("💀 source unavailable: {0}")]
    SourceUnavailable(String),

    /// 🧨 The source accepted the connection but rejected or garbled the query.
    /// Never retried — a broken query does not get better with age.
    #[error("💀 source query failed: {0}")]
    SourceQueryError(String),

    /// 🐛 One film could not be assembled into a valid document. Skipped, counted, logged.
    #[error("⚠️ malformed record '{film_id}': {reason}")]
    MalformedRecord { film_id: String, reason: String },

    /// 🛑 A batch could not be committed after every retry. The checkpoint stays put.
    #[error("💀 load aborted after {batches_committed} committed batches (resume after {resume_after:?}): {reason}")]
    LoadAborted {
        reason: String,
        batches_committed: u64,
        resume_after: Option<String>,
    },

    /// 📡 The search target could not be reached or answered nonsense outside a bulk load
    /// (ping, index setup, verification reads).
    #[error("💀 target unavailable: {0}")]
    TargetUnavailable(String),

    /// 🔍 Source and target disagree. Reported, never auto-corrected.
    #[error("🔍 verification mismatch: {0}")]
    VerificationMismatch(String),

    /// 🔒 Somebody else holds the checkpoint. One writer at a time, please.
    #[error("🔒 checkpoint is locked by another run: {0}")]
    CheckpointLocked(String),

    /// 📝 The checkpoint marker itself could not be read or written.
    #[error("💀 checkpoint store failure: {0}")]
    Checkpoint(String),

    /// 🔧 Configuration that cannot possibly work.
    #[error("🔧 invalid configuration: {0}")]
    Config(String),
}

impl MigrationError {
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn source_query(msg: impl Into<String>) -> Self {
        Self::SourceQueryError(msg.into())
    }

    pub fn malformed(film_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            film_id: film_id.into(),
            reason: reason.into(),
        }
    }

    pub fn target(msg: impl Into<String>) -> Self {
        Self::TargetUnavailable(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// 🚦 Process exit code for this error.
    ///
    /// | code | meaning |
    /// |---|---|
    /// | 1 | config / checkpoint plumbing / anything unclassified |
    /// | 2 | source unavailable or source query error |
    /// | 3 | load aborted, target unreachable, or another run holds the lock |
    /// | 4 | verification mismatch |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SourceUnavailable(_) | Self::SourceQueryError(_) => 2,
            Self::LoadAborted { .. } | Self::TargetUnavailable(_) | Self::CheckpointLocked(_) => 3,
            Self::VerificationMismatch(_) => 4,
            Self::MalformedRecord { .. } | Self::Checkpoint(_) | Self::Config(_) => 1,
        }
    }

    /// 🔄 Whether retrying the same operation could plausibly succeed.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_every_fatal_condition_gets_a_nonzero_exit() {
        assert_eq!(MigrationError::source_unavailable("nope").exit_code(), 2);
        assert_eq!(MigrationError::source_query("bad sql").exit_code(), 2);
        let aborted = MigrationError::LoadAborted {
            reason: "cluster took a nap".into(),
            batches_committed: 3,
            resume_after: Some("f3".into()),
        };
        assert_eq!(aborted.exit_code(), 3);
        assert_eq!(MigrationError::target("ping timed out").exit_code(), 3);
        assert_eq!(
            MigrationError::VerificationMismatch("1 != 2".into()).exit_code(),
            4
        );
    }

    #[test]
    fn the_one_where_only_unavailability_is_worth_a_retry() {
        assert!(MigrationError::source_unavailable("io").is_transient());
        assert!(!MigrationError::source_query("syntax").is_transient());
        assert!(!MigrationError::malformed("f1", "no title").is_transient());
    }
}
