//! 🧠 In-memory backends — a pretend database and a pretend cluster.
//!
//! 🎬 *[a soundstage. cardboard servers. a fog machine labelled "latency".]*
//!
//! Both sides of the pipeline, living entirely in RAM, so the pipeline can be
//! tested without Docker, without ports, and without asking anyone's permission.
//! The sink misbehaves on cue: it refuses chosen documents, stops answering
//! after N bulk requests, or stumbles a few times before it recovers.
//!
//! Clone-able because tests need to peek inside after handing a copy off to
//! the pipeline. The `Arc` means every clone shares the same state. 🦆

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::backends::{BulkReport, SendError, Sink, Source};
use crate::common::{Document, FilmRow, Rejection};
use crate::composers::BulkPayload;
use crate::errors::MigrationError;

// ===== Source =====

#[derive(Debug, Default)]
struct SourceFaults {
    /// 🔄 The next this-many calls fail with `SourceUnavailable`.
    unavailable_for: u32,
    /// 🧨 Every call fails with `SourceQueryError`.
    broken_query: bool,
}

/// 🚰 Film rows from a `Vec`. Sorted by film id on the way in, just like a real `ORDER BY`.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemorySource {
    rows: Arc<Vec<FilmRow>>,
    faults: Arc<tokio::sync::Mutex<SourceFaults>>,
}

impl InMemorySource {
    pub(crate) fn new(mut rows: Vec<FilmRow>) -> Self {
        // 🧷 stable sort: rows of one film keep their relative order
        rows.sort_by(|a, b| a.film_id.cmp(&b.film_id));
        Self {
            rows: Arc::new(rows),
            faults: Arc::default(),
        }
    }

    /// 🔄 Make the next `calls` source calls fail as if the database blinked.
    pub(crate) async fn blink(&self, calls: u32) {
        self.faults.lock().await.unavailable_for = calls;
    }

    /// 🧨 Break every query for good.
    pub(crate) async fn break_queries(&self) {
        self.faults.lock().await.broken_query = true;
    }

    async fn check_faults(&self) -> Result<(), MigrationError> {
        let mut faults = self.faults.lock().await;
        if faults.broken_query {
            return Err(MigrationError::source_query("no such column: film_work.ratting"));
        }
        if faults.unavailable_for > 0 {
            faults.unavailable_for -= 1;
            return Err(MigrationError::source_unavailable("database is taking a nap"));
        }
        Ok(())
    }

    fn distinct_ids(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.film_id.as_str()).collect()
    }
}

#[async_trait]
impl Source for InMemorySource {
    async fn next_page(&self, after: Option<&str>, page_size: usize) -> Result<Vec<FilmRow>, MigrationError> {
        self.check_faults().await?;
        let page: HashSet<&str> = self
            .distinct_ids()
            .into_iter()
            .filter(|id| after.is_none_or(|cursor| *id > cursor))
            .take(page_size.max(1))
            .collect();
        Ok(self
            .rows
            .iter()
            .filter(|r| page.contains(r.film_id.as_str()))
            .cloned()
            .collect())
    }

    async fn count_films(&self) -> Result<u64, MigrationError> {
        self.check_faults().await?;
        Ok(self.distinct_ids().len() as u64)
    }

    async fn film_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>, MigrationError> {
        self.check_faults().await?;
        Ok(self
            .distinct_ids()
            .into_iter()
            .filter(|id| after.is_none_or(|cursor| *id > cursor))
            .take(limit.max(1))
            .map(str::to_string)
            .collect())
    }

    async fn rows_for_films(&self, ids: &[String]) -> Result<Vec<FilmRow>, MigrationError> {
        self.check_faults().await?;
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .rows
            .iter()
            .filter(|r| wanted.contains(r.film_id.as_str()))
            .cloned()
            .collect())
    }
}

// ===== Sink =====

#[derive(Debug, Default)]
struct SinkState {
    index: BTreeMap<String, Document>,
    index_created: bool,
    /// 📜 Ids per accepted bulk request, in arrival order.
    requests: Vec<Vec<String>>,
    send_attempts: u64,
    reject_ids: HashSet<String>,
    /// 🔌 Stop answering once this many bulk requests have been accepted.
    unreachable_after: Option<usize>,
    /// 🔄 The next this-many sends fail with a 503.
    stumbles: u32,
    /// 🛑 Every send fails with a 400.
    permanently_broken: bool,
}

#[derive(Deserialize)]
struct ActionLine {
    index: ActionMeta,
}

#[derive(Deserialize)]
struct ActionMeta {
    #[serde(rename = "_id")]
    id: String,
}

/// 📦 A sink that never forgets. Upserts by id, exactly like the real thing.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemorySink {
    state: Arc<tokio::sync::Mutex<SinkState>>,
}

impl InMemorySink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🚫 Refuse these documents individually, inside otherwise-successful bulk requests.
    pub(crate) async fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().await.reject_ids.extend(ids.into_iter().map(Into::into));
    }

    /// 🔌 Accept `n` more bulk requests, then go dark.
    pub(crate) async fn go_dark_after(&self, n: usize) {
        let mut state = self.state.lock().await;
        state.unreachable_after = Some(state.requests.len() + n);
    }

    /// 💡 Come back online.
    pub(crate) async fn heal(&self) {
        let mut state = self.state.lock().await;
        state.unreachable_after = None;
        state.stumbles = 0;
        state.permanently_broken = false;
    }

    /// 🔄 Fail the next `n` sends with a 503, then behave.
    pub(crate) async fn stumble(&self, n: u32) {
        self.state.lock().await.stumbles = n;
    }

    /// 🛑 Answer every send with a 400, forever (or until `heal`).
    pub(crate) async fn break_permanently(&self) {
        self.state.lock().await.permanently_broken = true;
    }

    pub(crate) async fn documents(&self) -> BTreeMap<String, Document> {
        self.state.lock().await.index.clone()
    }

    /// 🔀 Overwrite one stored document, for testing the verifier's eyesight.
    pub(crate) async fn tamper(&self, document: Document) {
        self.state.lock().await.index.insert(document.id.clone(), document);
    }

    pub(crate) async fn forget(&self, id: &str) {
        self.state.lock().await.index.remove(id);
    }

    pub(crate) async fn requests(&self) -> Vec<Vec<String>> {
        self.state.lock().await.requests.clone()
    }

    pub(crate) async fn send_attempts(&self) -> u64 {
        self.state.lock().await.send_attempts
    }
}

/// ✂️ NDJSON lines, split on `\n` with memchr, empty lines skipped.
fn ndjson_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for end in memchr::memchr_iter(b'\n', body) {
        if end > start {
            lines.push(&body[start..end]);
        }
        start = end + 1;
    }
    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}

#[async_trait]
impl Sink for InMemorySink {
    async fn send(&self, payload: &BulkPayload) -> Result<BulkReport, SendError> {
        let mut state = self.state.lock().await;
        state.send_attempts += 1;

        if state.permanently_broken {
            return Err(SendError::Permanent("_bulk answered 400 Bad Request: injected".into()));
        }
        if state
            .unreachable_after
            .is_some_and(|limit| state.requests.len() >= limit)
        {
            return Err(SendError::Transient("_bulk could not connect: connection refused".into()));
        }
        if state.stumbles > 0 {
            state.stumbles -= 1;
            return Err(SendError::Transient("_bulk answered 503 Service Unavailable".into()));
        }

        let body = payload
            .plain_body()
            .map_err(|e| SendError::Permanent(format!("body is not valid gzip: {e}")))?;
        let lines = ndjson_lines(&body);
        if lines.len() % 2 != 0 {
            return Err(SendError::Permanent(format!(
                "_bulk answered 400: odd number of NDJSON lines ({})",
                lines.len()
            )));
        }

        let mut report = BulkReport::default();
        let mut ids = Vec::with_capacity(lines.len() / 2);
        for pair in lines.chunks(2) {
            let action: ActionLine = serde_json::from_slice(pair[0])
                .map_err(|e| SendError::Permanent(format!("_bulk answered 400: bad action line: {e}")))?;
            let id = action.index.id;
            ids.push(id.clone());
            if state.reject_ids.contains(&id) {
                report.rejections.push(Rejection {
                    film_id: id,
                    reason: "mapper_parsing_exception: injected rejection".into(),
                });
                continue;
            }
            match serde_json::from_slice::<Document>(pair[1]) {
                Ok(document) => {
                    state.index.insert(id, document);
                    report.accepted += 1;
                }
                Err(e) => report.rejections.push(Rejection {
                    film_id: id,
                    reason: format!("document_parsing_exception: {e}"),
                }),
            }
        }
        state.requests.push(ids);
        Ok(report)
    }

    async fn refresh(&self) -> Result<(), MigrationError> {
        Ok(())
    }

    async fn count_documents(&self) -> Result<u64, MigrationError> {
        Ok(self.state.lock().await.index.len() as u64)
    }

    async fn fetch_document(&self, id: &str) -> Result<Option<Document>, MigrationError> {
        Ok(self.state.lock().await.index.get(id).cloned())
    }

    async fn create_index(&self) -> Result<bool, MigrationError> {
        let mut state = self.state.lock().await;
        let created = !state.index_created;
        state.index_created = true;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RoleKind;
    use crate::composers::NdjsonComposer;
    use anyhow::Result;

    fn film(id: &str) -> Document {
        Document {
            id: id.into(),
            title: format!("Film {id}"),
            description: None,
            imdb_rating: None,
            genre: vec![],
            director: None,
            actors: vec![],
            actors_names: String::new(),
            writers: vec![],
            writers_names: String::new(),
        }
    }

    #[tokio::test]
    async fn the_one_where_pages_are_film_aligned() -> Result<()> {
        let source = InMemorySource::new(vec![
            FilmRow::film("f2", "Beta"),
            FilmRow::film("f1", "Alpha").with_genre("Drama"),
            FilmRow::film("f1", "Alpha").with_person("p1", "Jane", RoleKind::Actor),
            FilmRow::film("f3", "Gamma"),
        ]);
        let first = source.next_page(None, 1).await?;
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.film_id == "f1"));
        assert_eq!(first[0].genre.as_deref(), Some("Drama"));
        let rest = source.next_page(Some("f1"), 5).await?;
        assert_eq!(rest.iter().map(|r| r.film_id.as_str()).collect::<Vec<_>>(), vec!["f2", "f3"]);
        assert!(source.next_page(Some("f3"), 5).await?.is_empty());
        assert_eq!(source.count_films().await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_source_blinks_twice() -> Result<()> {
        let source = InMemorySource::new(vec![FilmRow::film("f1", "Alpha")]);
        source.blink(2).await;
        assert!(matches!(source.count_films().await, Err(MigrationError::SourceUnavailable(_))));
        assert!(source.count_films().await.is_err());
        assert_eq!(source.count_films().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_writing_twice_leaves_one_document() -> Result<()> {
        let sink = InMemorySink::new();
        let composer = NdjsonComposer::new("movies", false);
        let payload = composer.compose(&[film("f1"), film("f2")])?;
        sink.send(&payload).await?;
        sink.send(&payload).await?;
        assert_eq!(sink.count_documents().await?, 2);
        assert_eq!(sink.requests().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_sink_reads_gzip_too() -> Result<()> {
        let sink = InMemorySink::new();
        let payload = NdjsonComposer::new("movies", true).compose(&[film("f1")])?;
        let report = sink.send(&payload).await?;
        assert_eq!(report.accepted, 1);
        assert_eq!(sink.fetch_document("f1").await?, Some(film("f1")));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_chosen_documents_bounce() -> Result<()> {
        let sink = InMemorySink::new();
        sink.reject_ids(["f2"]).await;
        let payload = NdjsonComposer::new("movies", false).compose(&[film("f1"), film("f2")])?;
        let report = sink.send(&payload).await?;
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejections.len(), 1);
        assert_eq!(report.rejections[0].film_id, "f2");
        assert_eq!(sink.fetch_document("f2").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_cluster_goes_dark_and_comes_back() -> Result<()> {
        let sink = InMemorySink::new();
        let payload = NdjsonComposer::new("movies", false).compose(&[film("f1")])?;
        sink.go_dark_after(1).await;
        sink.send(&payload).await?;
        let err = sink.send(&payload).await.expect_err("🔌 should be dark now");
        assert!(err.is_transient());
        sink.heal().await;
        sink.send(&payload).await?;
        assert_eq!(sink.send_attempts().await, 3);
        Ok(())
    }

    #[test]
    fn the_one_where_memchr_splits_lines_and_skips_blanks() {
        let lines = ndjson_lines(b"a\n\nb\nc");
        assert_eq!(lines, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
    }
}
