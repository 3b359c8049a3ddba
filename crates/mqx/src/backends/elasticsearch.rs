//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. One engineer, alone,
//! stares into the abyss of a YELLOW cluster. The abyss stares back and
//! offers a 429. Our hero's coffee has gone cold.
//!
//! "I'll just rerun the migration," they whispered. "It's idempotent," they said.
//! And for once, the person at the conference was telling the truth.
//!
//! 🚀 This module sends assembled film documents into the elastic void with
//! `_bulk`, one request per batch, and tells the loader exactly how it went:
//! whole-request failures come back as [`SendError`] (transient or not),
//! per-document refusals come back inside the [`BulkReport`]. It also answers
//! the verifier's questions: how many documents, and what does this one look like.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::backends::{BulkReport, SendError, Sink};
use crate::common::{Document, Rejection};
use crate::composers::BulkPayload;
use crate::errors::MigrationError;
use crate::schema;

/// 🔧 How to reach the cluster.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchSinkConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔑 Preferred over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_index")]
    pub index: String,
    /// 🫁 Gzip bulk bodies. Worth it on slow links, wasted CPU on localhost.
    #[serde(default)]
    pub compress_requests: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_index() -> String {
    schema::DEFAULT_INDEX.to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl ElasticsearchSinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            index: default_index(),
            compress_requests: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<std::collections::HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Document>,
}

/// 🧾 "mapper_parsing_exception: failed to parse field [imdb_rating]" beats a raw JSON blob.
fn describe_item_error(error: &Value) -> String {
    match (error.get("type").and_then(Value::as_str), error.get("reason").and_then(Value::as_str)) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

/// 📬 Turn a `_bulk` response body into a report.
fn parse_bulk_response(body: &str) -> Result<BulkReport, SendError> {
    let response: BulkResponse = serde_json::from_str(body).map_err(|e| {
        // 🔄 the request may or may not have landed; rewriting by id is harmless, so try again
        SendError::Transient(format!("unreadable _bulk response ({e}): {body}"))
    })?;
    let mut report = BulkReport::default();
    // 🪆 `items` is a list of single-key maps (`{"index": {...}}`); only the values matter
    for item in response.items.into_iter().flat_map(|m| m.into_values()) {
        if item.error.is_some() || item.status >= 300 {
            report.rejections.push(Rejection {
                film_id: item.id.unwrap_or_default(),
                reason: item
                    .error
                    .as_ref()
                    .map(describe_item_error)
                    .unwrap_or_else(|| format!("status {}", item.status)),
            });
        } else {
            report.accepted += 1;
        }
    }
    if response.errors && report.rejections.is_empty() {
        warn!("⚠️ _bulk said errors=true but no item carried an error. Trusting the items.");
    }
    Ok(report)
}

/// 📡 The sink. Clone-able: `reqwest::Client` is an `Arc` inside, so every
/// sink worker shares one connection pool.
#[derive(Debug, Clone)]
pub(crate) struct ElasticsearchSink {
    client: reqwest::Client,
    base: Url,
    config: ElasticsearchSinkConfig,
}

impl ElasticsearchSink {
    /// 🚀 Build the client and ping the cluster.
    ///
    /// With `require_index`, the target index must already exist: a bulk
    /// request into a missing index would auto-create it with guessed mappings,
    /// which is worse than failing.
    pub(crate) async fn connect(config: ElasticsearchSinkConfig, require_index: bool) -> Result<Self, MigrationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                MigrationError::Config(format!(
                    "the HTTP client refused to be born (TLS stack trouble?): {e}"
                ))
            })?;
        let base = Url::parse(config.url.trim_end_matches('/'))
            .map_err(|e| MigrationError::Config(format!("sink url '{}' is not a URL: {e}", config.url)))?;

        let sink = Self { client, base, config };

        let ping = sink
            .authorize(sink.client.get(sink.base.clone()))
            .send()
            .await
            .map_err(|e| MigrationError::target(format!("ping {} failed: {e}", sink.base)))?;
        if !ping.status().is_success() {
            return Err(MigrationError::target(format!(
                "ping {} answered {}",
                sink.base,
                ping.status()
            )));
        }
        debug!("✅ cluster at {} answered the ping", sink.base);

        if require_index && !sink.index_exists().await? {
            return Err(MigrationError::target(format!(
                "index '{}' does not exist. We knocked. Nobody answered. Run `mqx create-index` first.",
                sink.config.index
            )));
        }
        Ok(sink)
    }

    /// 🔑 API key if we have one, basic auth if we have that, anonymous otherwise.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 🧭 `{base}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, MigrationError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MigrationError::Config(format!("sink url '{}' cannot have a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn index_exists(&self) -> Result<bool, MigrationError> {
        let url = self.endpoint(&[self.config.index.as_str()])?;
        let response = self.read(self.client.get(url)).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(MigrationError::target(format!(
                "checking index '{}' answered {other}: {}",
                self.config.index,
                response.text().await.unwrap_or_default()
            ))),
        }
    }

    /// 📖 Send a read-side request; transport failures become `TargetUnavailable`.
    async fn read(&self, request: RequestBuilder) -> Result<Response, MigrationError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| MigrationError::target(format!("request to {} failed: {e}", self.base)))
    }

    async fn expect_success(&self, response: Response, what: &str) -> Result<String, MigrationError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MigrationError::target(format!("{what}: could not read response: {e}")))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(MigrationError::target(format!("{what} answered {status}: {body}")))
        }
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    async fn send(&self, payload: &BulkPayload) -> Result<BulkReport, SendError> {
        let url = self
            .endpoint(&["_bulk"])
            .map_err(|e| SendError::Permanent(e.to_string()))?;
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/x-ndjson");
        if payload.gzip {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = self
            .authorize(request)
            .body(payload.body.clone())
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    "timed out"
                } else if e.is_connect() {
                    "could not connect"
                } else {
                    "transport error"
                };
                SendError::Transient(format!("_bulk {kind}: {e}"))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SendError::Transient(format!("_bulk response body went missing: {e}")))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SendError::Transient(format!("_bulk answered {status}: {body}")));
        }
        if !status.is_success() {
            return Err(SendError::Permanent(format!("_bulk answered {status}: {body}")));
        }
        trace!("🚀 _bulk landed: {} docs, {} bytes", payload.documents, payload.body.len());
        parse_bulk_response(&body)
    }

    async fn refresh(&self) -> Result<(), MigrationError> {
        let url = self.endpoint(&[self.config.index.as_str(), "_refresh"])?;
        let response = self.read(self.client.post(url)).await?;
        self.expect_success(response, "refresh").await.map(|_| ())
    }

    async fn count_documents(&self) -> Result<u64, MigrationError> {
        let url = self.endpoint(&[self.config.index.as_str(), "_count"])?;
        let response = self.read(self.client.get(url)).await?;
        let body = self.expect_success(response, "count").await?;
        let parsed: CountResponse = serde_json::from_str(&body)
            .map_err(|e| MigrationError::target(format!("count response is not what we expected ({e}): {body}")))?;
        Ok(parsed.count)
    }

    async fn fetch_document(&self, id: &str) -> Result<Option<Document>, MigrationError> {
        let url = self.endpoint(&[self.config.index.as_str(), "_doc", id])?;
        let response = self.read(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self.expect_success(response, "get document").await?;
        let parsed: GetResponse = serde_json::from_str(&body).map_err(|e| {
            MigrationError::target(format!("document '{id}' does not look like a film document ({e})"))
        })?;
        Ok(parsed.source.filter(|_| parsed.found))
    }

    async fn create_index(&self) -> Result<bool, MigrationError> {
        if self.index_exists().await? {
            info!("📛 index '{}' already exists, leaving it alone", self.config.index);
            return Ok(false);
        }
        let url = self.endpoint(&[self.config.index.as_str()])?;
        let definition = serde_json::to_vec(&schema::index_definition())
            .map_err(|e| MigrationError::Config(format!("index definition would not serialize: {e}")))?;
        let response = self
            .read(
                self.client
                    .put(url)
                    .header("Content-Type", "application/json")
                    .body(definition),
            )
            .await?;
        self.expect_success(response, "create index").await?;
        info!("🏗️ index '{}' created with the movies mapping", self.config.index);
        Ok(true)
    }
}
