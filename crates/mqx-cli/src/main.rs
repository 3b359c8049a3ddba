//! 🚀 mqx-cli — the front door, the bouncer, the maitre d' of marquee.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config,
//! sets up logging, wires Ctrl-C to the stop signal, and then lets the real
//! code do the heavy lifting. Like a manager. 🦆
//!
//! Exit codes: 0 success (or stopped, resumable), 1 config/other,
//! 2 source trouble, 3 load aborted / target unreachable / lock held,
//! 4 verification mismatch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mqx::{AppConfig, MigrateOptions, MigrationError, StopSignal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🎬 Move a film catalogue from SQLite into a search index, resumably.
#[derive(Debug, Parser)]
#[command(name = "mqx", version, about)]
struct Cli {
    /// 📋 TOML config file. `MQX_*` environment variables override it.
    #[arg(long, short, global = true, env = "MQX_CONFIG", default_value = "mqx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 🚚 Start or resume a migration, then verify it.
    Migrate(MigrateArgs),
    /// 🔍 Compare source and target without changing either.
    Verify(VerifyArgs),
    /// 🏗️ Create the target index with the movies mapping.
    CreateIndex,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    /// 📦 Documents per bulk request.
    #[arg(long)]
    batch_size: Option<usize>,
    /// 🎯 Verify every Nth film.
    #[arg(long)]
    sample_rate: Option<u64>,
    /// 🔄 Ignore the saved checkpoint and start from the first film.
    #[arg(long)]
    restart: bool,
    /// 🙈 Skip the verification pass.
    #[arg(long)]
    skip_verify: bool,
    /// 🔨 Remove the checkpoint lock first, even if its owner looks alive.
    #[arg(long)]
    break_lock: bool,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    /// 🎯 Verify every Nth film.
    #[arg(long)]
    sample_rate: Option<u64>,
}

/// 🔒 Load the config if the file is there, env-only if it is not.
fn load(config_file: &Path) -> Result<AppConfig> {
    let exists = config_file.try_exists().context(format!(
        "💀 Couldn't check whether the configuration file exists. Maybe it's an issue with \
         pwd/cwd and relative paths; use an absolute path to be absolutely certain. Was checking here: '{}'",
        config_file.display()
    ))?;
    let config_file = exists.then_some(config_file);
    if config_file.is_none() {
        // 💤 Not there. Like my motivation on Mondays. Env vars it is.
        info!("📋 no config file at that path; using MQX_* environment variables only");
    }
    mqx::load_config(config_file).context(
        "💀 In mqx-cli, main, we couldn't load the configuration. Take a look at the file and the \
         MQX_* environment, make sure nothing obvious is missing (source.path? sink.url?)",
    )
}

/// 🛑 First Ctrl-C asks nicely. The pipeline finishes the batches in flight and exits.
fn hook_ctrl_c(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received; finishing in-flight batches, then stopping. The checkpoint will hold.");
            stop.stop();
        }
    });
}

/// 🎯 Run the chosen subcommand. `Ok(code)` is the exit code for runs that completed.
async fn run(cli: Cli) -> Result<i32> {
    let mut config = load(&cli.config)?;

    match cli.command {
        Command::Migrate(args) => {
            if let Some(batch_size) = args.batch_size {
                config.runtime.batch_size = batch_size;
            }
            if let Some(sample_rate) = args.sample_rate {
                config.verify.sample_rate = sample_rate;
            }
            let options = MigrateOptions {
                restart: args.restart,
                verify: config.verify.enabled && !args.skip_verify,
                break_lock: args.break_lock,
            };
            let stop = StopSignal::new();
            hook_ctrl_c(stop.clone());

            let summary = mqx::migrate(&config, options, stop).await?;
            println!("{}", summary.render());
            if let Some(report) = &summary.verification {
                println!("{}", report.render());
            }
            Ok(summary.verdict().map_or_else(|e| e.exit_code(), |_| 0))
        }
        Command::Verify(args) => {
            if let Some(sample_rate) = args.sample_rate {
                config.verify.sample_rate = sample_rate;
            }
            let report = mqx::verify(&config).await?;
            println!("{}", report.render());
            Ok(report.verdict().map_or_else(|e| e.exit_code(), |_| 0))
        }
        Command::CreateIndex => {
            let created = mqx::create_index(&config).await?;
            if created {
                println!("🏗️ index '{}' created", config.sink.index);
            } else {
                println!("📛 index '{}' already exists; left untouched", config.sink.index);
            }
            Ok(0)
        }
    }
}

/// 🕵️ Sniff the whole chain, top-level error included, like a truffle pig hunting for connection problems.
fn looks_like_connection_trouble(err: &anyhow::Error) -> bool {
    const SMELLS: [&str; 6] = [
        "error sending request",
        "connection refused",
        "Connection refused",
        "tcp connect error",
        "dns error",
        "unable to open database file",
    ];
    err.chain().any(|cause| {
        let cause = cause.to_string();
        SMELLS.iter().any(|smell| cause.contains(smell))
    })
}

/// 🚀 main() — where it all begins. The genesis. The big bang.
/// The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() {
    // 📡 Set up tracing — because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let err = match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => err,
    };

    // 💀 Error handling: the part where we find out what went wrong
    // and print it in a way that's helpful at 3am
    error!("💀 error: {}", err);
    for cause in err.chain().skip(1) {
        error!("⚠️  cause: {}", cause);
    }
    if looks_like_connection_trouble(&err) {
        error!(
            "🔧 hint: looks like a service isn't reachable. \
            Double-check that the backing service (Elasticsearch, the SQLite file, etc.) \
            is actually there. If you're using Docker, try: \
            `docker ps` to see what's up, or `docker compose up -d` to resurrect it. ☕"
        );
    }

    // 🗑️ Exit with prejudice, and with the right number.
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<MigrationError>())
        .map_or(1, MigrationError::exit_code);
    std::process::exit(code);
}
