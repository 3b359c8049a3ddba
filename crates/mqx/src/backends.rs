//! 🔌 Backends — where the real I/O happens.
//!
//! 🚰 Source backends pour film rows, Sink backends slurp up bulk payloads.
//! And in between, we panic! (kidding, we return `MigrationError`)
//!
//! 🎭 This module is the casting agency. Need films out of SQLite? Documents
//! into an Elasticsearch-shaped cluster? A pretend cluster in RAM that
//! misbehaves on cue for the test suite? We've got a backend for that.
//!
//! Pattern: trait → concrete impls → enum dispatcher. Callers hold the enum and
//! never learn which concrete backend they are talking to.
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

use async_trait::async_trait;
use thiserror::Error;

use crate::common::{Document, FilmRow, Rejection};
use crate::composers::BulkPayload;
use crate::errors::MigrationError;

pub(crate) mod elasticsearch;
#[cfg(test)]
pub(crate) mod in_mem;
pub(crate) mod sqlite;

// 🎯 Re-export backend-specific configs so callers can do `backends::SqliteSourceConfig`
// instead of spelunking into `backends::sqlite::SqliteSourceConfig`.
pub use elasticsearch::ElasticsearchSinkConfig;
pub use sqlite::{SqliteSourceConfig, TableNames};

// ===== Source Trait and Backend Enum =====

/// 🚰 A relational source of film rows.
///
/// # Contract
/// - `next_page` returns the rows for the next `page_size` **films** whose id
///   sorts after `after`, ordered by film id. A film's rows never straddle two
///   pages. An empty page means the well is dry.
/// - Films with no genre or no cast still produce a row, with `None` in the gaps.
/// - Same `after` → same rows. Resuming depends on it.
/// - Errors are `SourceUnavailable` (worth retrying) or `SourceQueryError` (not).
#[async_trait]
pub(crate) trait Source: std::fmt::Debug + Send + Sync {
    /// 📄 The next film-aligned page of rows after the keyset cursor.
    async fn next_page(&self, after: Option<&str>, page_size: usize) -> Result<Vec<FilmRow>, MigrationError>;

    /// 🔢 How many films the source holds.
    async fn count_films(&self) -> Result<u64, MigrationError>;

    /// 🔑 Up to `limit` film ids after the cursor, ascending.
    async fn film_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>, MigrationError>;

    /// 🎯 The full row set for a handful of films, in the same shape and order as `next_page`.
    async fn rows_for_films(&self, ids: &[String]) -> Result<Vec<FilmRow>, MigrationError>;
}

/// 🎭 The many faces of a Source.
#[derive(Debug, Clone)]
pub(crate) enum SourceBackend {
    Sqlite(sqlite::SqliteSource),
    #[cfg(test)]
    InMemory(in_mem::InMemorySource),
}

#[async_trait]
impl Source for SourceBackend {
    async fn next_page(&self, after: Option<&str>, page_size: usize) -> Result<Vec<FilmRow>, MigrationError> {
        match self {
            SourceBackend::Sqlite(s) => s.next_page(after, page_size).await,
            #[cfg(test)]
            SourceBackend::InMemory(s) => s.next_page(after, page_size).await,
        }
    }

    async fn count_films(&self) -> Result<u64, MigrationError> {
        match self {
            SourceBackend::Sqlite(s) => s.count_films().await,
            #[cfg(test)]
            SourceBackend::InMemory(s) => s.count_films().await,
        }
    }

    async fn film_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>, MigrationError> {
        match self {
            SourceBackend::Sqlite(s) => s.film_ids(after, limit).await,
            #[cfg(test)]
            SourceBackend::InMemory(s) => s.film_ids(after, limit).await,
        }
    }

    async fn rows_for_films(&self, ids: &[String]) -> Result<Vec<FilmRow>, MigrationError> {
        match self {
            SourceBackend::Sqlite(s) => s.rows_for_films(ids).await,
            #[cfg(test)]
            SourceBackend::InMemory(s) => s.rows_for_films(ids).await,
        }
    }
}

// ===== Sink Trait and Backend Enum =====

/// 📬 What the target said about a bulk request that it accepted as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BulkReport {
    /// ✅ Documents written (created or replaced).
    pub accepted: u64,
    /// 🚫 Documents refused individually. The rest of the batch still counts.
    pub rejections: Vec<Rejection>,
}

/// 💥 Why a whole bulk request failed. The retry state machine keys off the variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub(crate) enum SendError {
    /// 🔄 Transport error, timeout, 429, 5xx. Try again later.
    #[error("transient: {0}")]
    Transient(String),
    /// 🛑 Anything else. Trying again just gets the same answer, slower.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl SendError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// 🕳️ A search-index target.
///
/// # Contract
/// - `send` delivers one bulk payload. Per-document refusals come back in the
///   [`BulkReport`]; only whole-request failures are errors.
/// - Writing the same document twice leaves exactly one document (upsert by id).
/// - The read operations exist for the verifier and never mutate anything.
#[async_trait]
pub(crate) trait Sink: std::fmt::Debug + Send + Sync {
    /// 📥 Deliver one bulk payload.
    async fn send(&self, payload: &BulkPayload) -> Result<BulkReport, SendError>;

    /// 🔄 Make everything written so far visible to reads.
    async fn refresh(&self) -> Result<(), MigrationError>;

    /// 🔢 Documents currently in the index.
    async fn count_documents(&self) -> Result<u64, MigrationError>;

    /// 🔍 One document by id, or `None` if the index has never heard of it.
    async fn fetch_document(&self, id: &str) -> Result<Option<Document>, MigrationError>;

    /// 🏗️ Create the index with the fixed mapping. `Ok(false)` if it already existed.
    async fn create_index(&self) -> Result<bool, MigrationError>;
}

/// 🎭 The many faces of a Sink. Cheap to clone; every sink worker gets its own handle.
#[derive(Debug, Clone)]
pub(crate) enum SinkBackend {
    Elasticsearch(elasticsearch::ElasticsearchSink),
    #[cfg(test)]
    InMemory(in_mem::InMemorySink),
}

#[async_trait]
impl Sink for SinkBackend {
    async fn send(&self, payload: &BulkPayload) -> Result<BulkReport, SendError> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.send(payload).await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.send(payload).await,
        }
    }

    async fn refresh(&self) -> Result<(), MigrationError> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.refresh().await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.refresh().await,
        }
    }

    async fn count_documents(&self) -> Result<u64, MigrationError> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.count_documents().await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.count_documents().await,
        }
    }

    async fn fetch_document(&self, id: &str) -> Result<Option<Document>, MigrationError> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.fetch_document(id).await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.fetch_document(id).await,
        }
    }

    async fn create_index(&self) -> Result<bool, MigrationError> {
        match self {
            SinkBackend::Elasticsearch(sink) => sink.create_index().await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.create_index().await,
        }
    }
}
