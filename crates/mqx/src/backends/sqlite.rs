//! # 🗄️ THE SQLITE SOURCE
//!
//! 🎬 COLD OPEN — INT. A SINGLE FILE ON A LAPTOP — THE PRESENT DAY
//!
//! Five tables. A film table, a genre table, a person table, and two junction
//! tables holding the whole thing together like duct tape. Somewhere in
//! `person_film_work` a role column says `"actor"`, somewhere else `"Actor "`,
//! and once, memorably, `"producer"`. We read all of it, read-only, in film id
//! order, one film-aligned page at a time.
//!
//! Keyset pagination: each page is "the next N film ids after the cursor",
//! then everything those films join to. A film's rows never straddle two
//! pages, so the assembler never has to guess whether a group is finished. 🦆

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, info, trace};

use crate::backends::Source;
use crate::common::{FilmRow, RoleKind};
use crate::errors::MigrationError;

/// 🏷️ The five tables, by name. Defaults match the classic movies schema.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TableNames {
    #[serde(default = "default_film_work")]
    pub film_work: String,
    #[serde(default = "default_genre")]
    pub genre: String,
    #[serde(default = "default_genre_film_work")]
    pub genre_film_work: String,
    #[serde(default = "default_person")]
    pub person: String,
    #[serde(default = "default_person_film_work")]
    pub person_film_work: String,
}

fn default_film_work() -> String {
    "film_work".into()
}
fn default_genre() -> String {
    "genre".into()
}
fn default_genre_film_work() -> String {
    "genre_film_work".into()
}
fn default_person() -> String {
    "person".into()
}
fn default_person_film_work() -> String {
    "person_film_work".into()
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            film_work: default_film_work(),
            genre: default_genre(),
            genre_film_work: default_genre_film_work(),
            person: default_person(),
            person_film_work: default_person_film_work(),
        }
    }
}

impl TableNames {
    /// 🔒 Table names get spliced into SQL, so they had better look like identifiers.
    fn validate(&self) -> Result<(), MigrationError> {
        for name in [
            &self.film_work,
            &self.genre,
            &self.genre_film_work,
            &self.person,
            &self.person_film_work,
        ] {
            let looks_ok = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
            if !looks_ok {
                return Err(MigrationError::Config(format!(
                    "table name '{name}' is not a plain identifier"
                )));
            }
        }
        Ok(())
    }
}

/// 🔧 How to reach the source database.
#[derive(Debug, Deserialize, Clone)]
pub struct SqliteSourceConfig {
    /// 📁 Path to the database file. Opened read-only; never created.
    #[serde(alias = "database", alias = "file_name")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// ⏱️ Ceiling on any single query (and on waiting for a pooled connection).
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default)]
    pub tables: TableNames,
}

fn default_max_connections() -> u32 {
    4
}
fn default_query_timeout_secs() -> u64 {
    30
}

impl SqliteSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: default_max_connections(),
            query_timeout_secs: default_query_timeout_secs(),
            tables: TableNames::default(),
        }
    }
}

/// 🏷️ Sort a sqlx failure into "try again later" or "this will never work".
fn classify(err: sqlx::Error, what: &str) -> MigrationError {
    match err {
        sqlx::Error::Database(db) => {
            // 🔒 SQLITE_BUSY (5) / SQLITE_LOCKED (6), extended codes included
            let busy = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .is_some_and(|c| matches!(c & 0xff, 5 | 6));
            if busy {
                MigrationError::source_unavailable(format!("{what}: database busy: {}", db.message()))
            } else {
                MigrationError::source_query(format!("{what}: {}", db.message()))
            }
        }
        sqlx::Error::Io(e) => MigrationError::source_unavailable(format!("{what}: io: {e}")),
        sqlx::Error::PoolTimedOut => MigrationError::source_unavailable(format!("{what}: timed out waiting for a connection")),
        sqlx::Error::PoolClosed => MigrationError::source_unavailable(format!("{what}: connection pool is closed")),
        sqlx::Error::WorkerCrashed => MigrationError::source_unavailable(format!("{what}: sqlite worker crashed")),
        sqlx::Error::Protocol(msg) => MigrationError::source_unavailable(format!("{what}: {msg}")),
        other => MigrationError::source_query(format!("{what}: {other}")),
    }
}

/// 🗄️ Film rows out of SQLite.
#[derive(Debug, Clone)]
pub(crate) struct SqliteSource {
    pool: SqlitePool,
    tables: TableNames,
    query_timeout: Duration,
}

impl SqliteSource {
    /// 🚀 Open the database read-only. A missing file is `SourceUnavailable`.
    pub(crate) async fn connect(config: &SqliteSourceConfig) -> Result<Self, MigrationError> {
        config.tables.validate()?;
        let query_timeout = Duration::from_secs(config.query_timeout_secs.max(1));
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .read_only(true)
            .create_if_missing(false)
            .busy_timeout(query_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(query_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                MigrationError::source_unavailable(format!(
                    "could not open '{}': {e}",
                    config.path.display()
                ))
            })?;
        info!("🗄️ source database '{}' opened read-only", config.path.display());
        Ok(Self {
            pool,
            tables: config.tables.clone(),
            query_timeout,
        })
    }

    /// ⏱️ Every query gets a deadline. Missing it counts as "unavailable".
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, MigrationError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(|e| classify(e, what)),
            Err(_) => Err(MigrationError::source_unavailable(format!(
                "{what}: no answer within {:?}",
                self.query_timeout
            ))),
        }
    }

    /// 🧾 The row query, given the CTE that picks which film ids to include.
    ///
    /// Films are ordered by the text form of their id, the same order the
    /// assembler and the checkpoint cursor compare in. An INTEGER-keyed table
    /// therefore goes 1, 10, 11, 2, ... and never trips the ordering guard.
    fn rows_sql(&self, page_cte: &str) -> String {
        let t = &self.tables;
        format!(
            "WITH page AS ({page_cte}) \
             SELECT CAST(fw.id AS TEXT) AS film_id, fw.title AS title, fw.description AS description, \
                    CAST(fw.rating AS TEXT) AS rating, g.name AS genre, \
                    CAST(p.id AS TEXT) AS person_id, p.full_name AS person_name, pfw.role AS role \
             FROM page \
             JOIN {film} fw ON fw.id = page.id \
             LEFT JOIN {gfw} gfw ON gfw.film_work_id = fw.id \
             LEFT JOIN {genre} g ON g.id = gfw.genre_id \
             LEFT JOIN {pfw} pfw ON pfw.film_work_id = fw.id \
                  AND LOWER(TRIM(pfw.role)) IN ('actor', 'writer', 'director') \
             LEFT JOIN {person} p ON p.id = pfw.person_id \
             ORDER BY CAST(fw.id AS TEXT), pfw.id, g.name",
            film = t.film_work,
            gfw = t.genre_film_work,
            genre = t.genre,
            pfw = t.person_film_work,
            person = t.person,
        )
    }

    fn decode(row: &SqliteRow) -> Result<FilmRow, sqlx::Error> {
        let role: Option<String> = row.try_get("role")?;
        let person_id: Option<String> = row.try_get("person_id")?;
        let role = role.as_deref().and_then(RoleKind::parse);
        Ok(FilmRow {
            film_id: row.try_get("film_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            rating: row.try_get("rating")?,
            genre: row.try_get("genre")?,
            // 👻 a junction row pointing at a person who does not exist is no person at all
            person_name: if person_id.is_some() { row.try_get("person_name")? } else { None },
            person_id: person_id.filter(|_| role.is_some()),
            role,
        })
    }

    async fn fetch_rows(&self, what: &str, sql: String, binds: Vec<BindValue<'_>>) -> Result<Vec<FilmRow>, MigrationError> {
        trace!("🧾 {what}: {sql}");
        let rows = self
            .bounded(what, async {
                let mut query = sqlx::query(&sql);
                for bind in binds {
                    query = match bind {
                        BindValue::Text(s) => query.bind(s),
                        BindValue::Int(n) => query.bind(n),
                    };
                }
                query.fetch_all(&self.pool).await
            })
            .await?;
        rows.iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| classify(e, what))
    }
}

enum BindValue<'a> {
    Text(&'a str),
    Int(i64),
}

/// 📏 SQLite has opinions about how many `?` one statement may carry.
const IN_CHUNK: usize = 500;

#[async_trait]
impl Source for SqliteSource {
    async fn next_page(&self, after: Option<&str>, page_size: usize) -> Result<Vec<FilmRow>, MigrationError> {
        let film = &self.tables.film_work;
        let (cte, mut binds) = match after {
            Some(cursor) => (
                format!("SELECT id FROM {film} WHERE CAST(id AS TEXT) > ? ORDER BY CAST(id AS TEXT) LIMIT ?"),
                vec![BindValue::Text(cursor)],
            ),
            None => (format!("SELECT id FROM {film} ORDER BY CAST(id AS TEXT) LIMIT ?"), vec![]),
        };
        binds.push(BindValue::Int(page_size.max(1) as i64));
        let rows = self.fetch_rows("next page", self.rows_sql(&cte), binds).await?;
        debug!("📄 page after {:?}: {} rows", after, rows.len());
        Ok(rows)
    }

    async fn count_films(&self) -> Result<u64, MigrationError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.tables.film_work);
        let count: i64 = self
            .bounded("count films", sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool))
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn film_ids(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>, MigrationError> {
        let film = &self.tables.film_work;
        let limit = limit.max(1) as i64;
        let ids: Vec<String> = match after {
            Some(cursor) => {
                let sql = format!(
                    "SELECT CAST(id AS TEXT) FROM {film} WHERE CAST(id AS TEXT) > ? ORDER BY CAST(id AS TEXT) LIMIT ?"
                );
                self.bounded(
                    "list film ids",
                    sqlx::query_scalar::<_, String>(&sql).bind(cursor).bind(limit).fetch_all(&self.pool),
                )
                .await?
            }
            None => {
                let sql = format!("SELECT CAST(id AS TEXT) FROM {film} ORDER BY CAST(id AS TEXT) LIMIT ?");
                self.bounded(
                    "list film ids",
                    sqlx::query_scalar::<_, String>(&sql).bind(limit).fetch_all(&self.pool),
                )
                .await?
            }
        };
        Ok(ids)
    }

    async fn rows_for_films(&self, ids: &[String]) -> Result<Vec<FilmRow>, MigrationError> {
        let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut out = Vec::new();
        for chunk in sorted.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let cte = format!(
                "SELECT id FROM {} WHERE CAST(id AS TEXT) IN ({placeholders})",
                self.tables.film_work
            );
            let binds = chunk.iter().map(|id| BindValue::Text(id)).collect();
            out.extend(self.fetch_rows("rows for films", self.rows_sql(&cte), binds).await?);
        }
        Ok(out)
    }
}
