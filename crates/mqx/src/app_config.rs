//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! Layers, lowest to highest: serde defaults → optional TOML file → `MQX_*`
//! environment variables (`__` separates nesting, so `MQX_SINK__API_KEY`
//! lands in `sink.api_key`). The CLI flags go on top of all of that.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::backends::{ElasticsearchSinkConfig, SqliteSourceConfig};
use crate::checkpoint::CheckpointConfig;
use crate::errors::MigrationError;
use crate::retry::RetryPolicy;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🗄️ Where the films live today.
    #[serde(alias = "source_config")]
    pub source: SqliteSourceConfig,
    /// 📡 Where the films are moving to.
    #[serde(alias = "sink_config")]
    pub sink: ElasticsearchSinkConfig,
    #[serde(default, alias = "supervisor_config")]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

/// 🧵 How the pipeline behaves: batch sizes, queue depth, worker count, stubbornness.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 📦 Documents per bulk request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 📄 Films per extraction page.
    #[serde(default = "default_page_size", alias = "extract_page_size")]
    pub page_size: usize,
    /// 🚧 Batches allowed to wait between the source worker and the sink workers.
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 🧵 Concurrent bulk requests in flight.
    #[serde(default = "default_sink_parallelism", alias = "num_sink_workers")]
    pub sink_parallelism: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// 📊 Draw the progress bar. Turn off for log-scraped environments.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_batch_size() -> usize {
    500
}
fn default_page_size() -> usize {
    500
}
fn default_queue_capacity() -> usize {
    4
}
fn default_sink_parallelism() -> usize {
    2
}
fn default_show_progress() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            queue_capacity: default_queue_capacity(),
            sink_parallelism: default_sink_parallelism(),
            retry: RetryPolicy::default(),
            show_progress: default_show_progress(),
        }
    }
}

/// 🔍 How hard the verifier looks.
#[derive(Debug, Deserialize, Clone)]
pub struct VerifyConfig {
    /// 🎯 Check every Nth film. `1` checks them all.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u64,
    /// 🧢 Stop sampling after this many films, whatever the rate says.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// ✅ Run verification after a completed migration.
    #[serde(default = "default_verify_enabled")]
    pub enabled: bool,
}

fn default_sample_rate() -> u64 {
    10
}
fn default_max_samples() -> usize {
    1000
}
fn default_verify_enabled() -> bool {
    true
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            max_samples: default_max_samples(),
            enabled: default_verify_enabled(),
        }
    }
}

impl AppConfig {
    /// 🧪 A config with every tunable at its default. Handy for tests and embedding.
    pub fn new(source: SqliteSourceConfig, sink: ElasticsearchSinkConfig) -> Self {
        Self {
            source,
            sink,
            runtime: RuntimeConfig::default(),
            checkpoint: CheckpointConfig::default(),
            verify: VerifyConfig::default(),
        }
    }

    /// 🚦 Reject knob settings that cannot possibly work before anything connects.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let zero = |what: &str| Err(MigrationError::Config(format!("{what} must be at least 1")));
        if self.runtime.batch_size == 0 {
            return zero("runtime.batch_size");
        }
        if self.runtime.page_size == 0 {
            return zero("runtime.page_size");
        }
        if self.runtime.queue_capacity == 0 {
            return zero("runtime.queue_capacity");
        }
        if self.runtime.sink_parallelism == 0 {
            return zero("runtime.sink_parallelism");
        }
        if self.runtime.retry.max_attempts == 0 {
            return zero("runtime.retry.max_attempts");
        }
        if self.verify.sample_rate == 0 {
            return zero("verify.sample_rate");
        }
        if self.sink.url.trim().is_empty() {
            return Err(MigrationError::Config("sink.url is empty".into()));
        }
        if self.sink.index.trim().is_empty() {
            return Err(MigrationError::Config("sink.index is empty".into()));
        }
        Ok(())
    }
}

/// 🚀 Load the config — from a file, from env vars, or from the sheer power of hoping.
///
///   - `config_file_name` is None → env vars only.
///   - `config_file_name` is Some → TOML file, then env vars on top. Env wins on conflicts.
///
/// 💀 Returns an error if config is unparseable. Check the error message though —
/// it's contextual, informative, and written with love. Or despair.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = match config_file_name {
        Some(file_name) => Figment::new().merge(Toml::file(file_name)),
        None => Figment::new(),
    };
    // 🏗️ env last, so an operator can override one knob without editing the file
    let config = config.merge(Env::prefixed("MQX_").split("__"));

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (MQX_*). \
             The file exists in our hearts, but apparently not in a shape serde recognizes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (MQX_*). \
                 No file was provided — this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .validate()
        .context("💀 The configuration parsed, but the numbers in it cannot work together.")?;
    Ok(app_config)
}
