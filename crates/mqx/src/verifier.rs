//! 🔍 Migration Verifier — trust, but verify. Mostly verify.
//!
//! 🎬 *[the load is done. everyone is about to go home.]*
//! *[the verifier clears its throat.]*
//!
//! Runs after a full pass (or on its own via `mqx verify`). It never writes to
//! either side. It refreshes the index so every committed document is
//! readable, compares the source film count with the target document count,
//! then takes every Nth film id, rebuilds those films from the source exactly
//! the way the load did, and compares them field by field with what the
//! target hands back. Disagreements are reported, not fixed.

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL};
use tracing::{debug, info, warn};

use crate::app_config::VerifyConfig;
use crate::assembler::{Assembled, assemble_all};
use crate::backends::{Sink, SinkBackend, Source, SourceBackend};
use crate::common::{Document, PersonRef, split_names};
use crate::errors::MigrationError;
use crate::progress::format_number;
use crate::retry::{RetryPolicy, with_retries};

/// 📄 Ids fetched per listing call while walking the source for samples.
const ID_PAGE: usize = 1000;
/// 🎯 Films re-extracted per source query.
const SAMPLE_CHUNK: usize = 100;

/// 🧾 One field that disagrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMismatch {
    pub film_id: String,
    pub field: String,
    pub expected: String,
    pub actual: String,
}

/// 📋 What the verifier found. Printed, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub source_count: u64,
    pub target_count: u64,
    /// 🎯 Films rebuilt and compared.
    pub sampled: u64,
    /// ⚠️ Sampled films that are malformed in the source and so were never loaded.
    pub sampled_malformed: u64,
    pub mismatches: Vec<FieldMismatch>,
}

impl VerificationReport {
    pub fn counts_match(&self) -> bool {
        self.source_count == self.target_count
    }

    pub fn is_clean(&self) -> bool {
        self.counts_match() && self.mismatches.is_empty()
    }

    /// 🚦 `Ok` when clean, `VerificationMismatch` with a one-line summary otherwise.
    pub fn verdict(&self) -> Result<(), MigrationError> {
        if self.is_clean() {
            return Ok(());
        }
        let mut problems = Vec::new();
        if !self.counts_match() {
            problems.push(format!(
                "source has {} films but target has {} documents",
                self.source_count, self.target_count
            ));
        }
        if !self.mismatches.is_empty() {
            problems.push(format!(
                "{} field mismatch(es) across {} sampled films",
                self.mismatches.len(),
                self.sampled
            ));
        }
        Err(MigrationError::VerificationMismatch(problems.join("; ")))
    }

    /// 🍽️ The report as a table, plus up to 20 mismatches underneath.
    pub fn render(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["verification", "value"]);
        table.add_row(vec![Cell::new("source films"), Cell::new(format_number(self.source_count))]);
        table.add_row(vec![Cell::new("target documents"), Cell::new(format_number(self.target_count))]);
        table.add_row(vec![Cell::new("sampled"), Cell::new(format_number(self.sampled))]);
        table.add_row(vec![
            Cell::new("sampled but malformed in source"),
            Cell::new(format_number(self.sampled_malformed)),
        ]);
        table.add_row(vec![
            Cell::new("field mismatches"),
            Cell::new(format_number(self.mismatches.len() as u64)),
        ]);
        table.add_row(vec![
            Cell::new("outcome"),
            Cell::new(if self.is_clean() { "✅ clean" } else { "🔍 MISMATCH" }),
        ]);

        let mut out = table.to_string();
        for m in self.mismatches.iter().take(20) {
            out.push_str(&format!(
                "\n  {} .{}: expected {}, found {}",
                m.film_id, m.field, m.expected, m.actual
            ));
        }
        if self.mismatches.len() > 20 {
            out.push_str(&format!("\n  … and {} more", self.mismatches.len() - 20));
        }
        out
    }
}

/// 🔎 Compare one field, recording a mismatch if the two sides differ.
fn compare<T: PartialEq + std::fmt::Debug>(
    out: &mut Vec<FieldMismatch>,
    film_id: &str,
    field: &str,
    expected: &T,
    actual: &T,
) {
    if expected != actual {
        out.push(FieldMismatch {
            film_id: film_id.to_string(),
            field: field.to_string(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        });
    }
}

/// 🔗 The flattened names on the target document must split back into its own nested list.
fn check_names(out: &mut Vec<FieldMismatch>, film_id: &str, field: &str, people: &[PersonRef], flat: &str) {
    let nested: Vec<&str> = people.iter().map(|p| p.name.as_str()).collect();
    let split = split_names(flat);
    if split != nested {
        out.push(FieldMismatch {
            film_id: film_id.to_string(),
            field: field.to_string(),
            expected: format!("names of the nested list {nested:?}"),
            actual: format!("{flat:?}"),
        });
    }
}

/// 🧮 Field-by-field comparison of a rebuilt document with the stored one.
pub(crate) fn compare_documents(expected: &Document, actual: &Document) -> Vec<FieldMismatch> {
    let id = expected.id.as_str();
    let mut out = Vec::new();
    compare(&mut out, id, "id", &expected.id, &actual.id);
    compare(&mut out, id, "title", &expected.title, &actual.title);
    compare(&mut out, id, "description", &expected.description, &actual.description);
    compare(&mut out, id, "imdb_rating", &expected.imdb_rating, &actual.imdb_rating);
    compare(&mut out, id, "genre", &expected.genre, &actual.genre);
    compare(&mut out, id, "director", &expected.director, &actual.director);
    compare(&mut out, id, "actors", &expected.actors, &actual.actors);
    compare(&mut out, id, "actors_names", &expected.actors_names, &actual.actors_names);
    compare(&mut out, id, "writers", &expected.writers, &actual.writers);
    compare(&mut out, id, "writers_names", &expected.writers_names, &actual.writers_names);
    check_names(&mut out, id, "actors_names (vs actors)", &actual.actors, &actual.actors_names);
    check_names(&mut out, id, "writers_names (vs writers)", &actual.writers, &actual.writers_names);
    out
}

/// 🔍 Reads both sides. Writes neither.
#[derive(Debug)]
pub(crate) struct Verifier<'a> {
    source: &'a SourceBackend,
    sink: &'a SinkBackend,
    config: &'a VerifyConfig,
    retry: &'a RetryPolicy,
}

impl<'a> Verifier<'a> {
    pub(crate) fn new(
        source: &'a SourceBackend,
        sink: &'a SinkBackend,
        config: &'a VerifyConfig,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            retry,
        }
    }

    /// 🎯 Every Nth id, starting with the first, until `max_samples`.
    async fn sample_ids(&self) -> Result<Vec<String>, MigrationError> {
        let rate = self.config.sample_rate.max(1);
        let mut picked = Vec::new();
        let mut cursor: Option<String> = None;
        let mut position = 0u64;

        while picked.len() < self.config.max_samples {
            let ids = with_retries(self.retry, "listing film ids", || {
                self.source.film_ids(cursor.as_deref(), ID_PAGE)
            })
            .await?;
            let Some(last) = ids.last().cloned() else {
                break;
            };
            for id in ids {
                if position % rate == 0 && picked.len() < self.config.max_samples {
                    picked.push(id);
                }
                position += 1;
            }
            cursor = Some(last);
        }
        Ok(picked)
    }

    pub(crate) async fn run(&self) -> Result<VerificationReport, MigrationError> {
        self.sink.refresh().await?;
        let source_count = with_retries(self.retry, "counting films", || self.source.count_films()).await?;
        let target_count = self.sink.count_documents().await?;
        info!(
            "🔍 source has {} films, target has {} documents",
            format_number(source_count),
            format_number(target_count)
        );

        let mut report = VerificationReport {
            source_count,
            target_count,
            ..Default::default()
        };

        let ids = self.sample_ids().await?;
        debug!("🎯 sampling {} films (every {}th)", ids.len(), self.config.sample_rate);
        for chunk in ids.chunks(SAMPLE_CHUNK) {
            let rows = with_retries(self.retry, "re-extracting sampled films", || {
                self.source.rows_for_films(chunk)
            })
            .await?;
            for rebuilt in assemble_all(rows)? {
                report.sampled += 1;
                let expected = match rebuilt {
                    Assembled::Document(document) => document,
                    Assembled::Skipped(err) => {
                        debug!("⚠️ sampled film is malformed in the source: {err}");
                        report.sampled_malformed += 1;
                        continue;
                    }
                };
                match self.sink.fetch_document(&expected.id).await? {
                    Some(actual) => report.mismatches.extend(compare_documents(&expected, &actual)),
                    None => report.mismatches.push(FieldMismatch {
                        film_id: expected.id.clone(),
                        field: "_document".into(),
                        expected: "present".into(),
                        actual: "missing".into(),
                    }),
                }
            }
        }

        if report.is_clean() {
            info!("✅ verification clean: {} films sampled", report.sampled);
        } else {
            warn!(
                "🔍 verification found problems: counts {} vs {}, {} field mismatch(es)",
                report.source_count,
                report.target_count,
                report.mismatches.len()
            );
        }
        Ok(report)
    }
}
