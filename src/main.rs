//! Docpool CLI Entry Point
//!
//! Runs one mode against the store database:
//! - `ping` - liveness check
//! - `drop` - drop the database
//! - `insert` - insert 10 categories and 1000 products
//! - `index` - index products by price and category
//! - `find` - product counts by category and price, plus the category list
//!
//! All output to stdout is JSON-only. Logs go to stderr (`DOCPOOL_LOG`).

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use docpool::{App, ClientSettings, DocpoolError, ErrorEnvelope, Mode, SettingsOverrides};

/// Connection-pooled document database demo client
#[derive(Parser, Debug)]
#[command(name = "docpool")]
#[command(about = "Ping, seed, index and query a document database through a connection pool")]
#[command(version)]
struct Cli {
    /// Operation to run
    #[arg(value_enum)]
    mode: Mode,

    /// Connection string (overrides DOCPOOL_URI and profiles)
    #[arg(long)]
    uri: Option<String>,

    /// Named profile from .docpool/config.json or the user config
    #[arg(long)]
    profile: Option<String>,

    /// Database to operate on
    #[arg(long)]
    database: Option<String>,

    /// Use a fresh in-process server instead of the network
    #[arg(long)]
    memory: bool,
}

const USAGE: &str = "usage: docpool [--uri URI] [--profile NAME] [--database DB] [--memory] \
                     ping|drop|insert|index|find";

fn init_logging() {
    let filter = EnvFilter::try_from_env("DOCPOOL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Could not serialize output")?;
    println!("{json}");
    Ok(())
}

async fn execute(cli: &Cli) -> std::result::Result<serde_json::Value, (String, DocpoolError)> {
    let overrides = SettingsOverrides {
        uri: cli.uri.clone(),
        profile: cli.profile.clone(),
        database: cli.database.clone(),
    };
    let settings = ClientSettings::load(&overrides).map_err(|e| (String::new(), e))?;
    let database = settings.database.clone();

    let app = if cli.memory { App::in_memory(settings) } else { App::connect(settings) };
    let app = app.map_err(|e| (database.clone(), e))?;

    let result = app.run_enveloped(cli.mode).await;
    app.shutdown();

    let envelope = result.map_err(|e| (database, e))?;
    serde_json::to_value(envelope)
        .map_err(|e| (app.database().to_string(), DocpoolError::serialization(e.to_string())))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(_) => {
            eprintln!("{USAGE}");
            return ExitCode::from(1);
        }
    };

    init_logging();

    let (envelope, failed) = match execute(&cli).await {
        Ok(envelope) => (envelope, false),
        Err((database, err)) => {
            eprintln!("docpool: {} failed: {}", cli.mode, err.message());
            let envelope = ErrorEnvelope::from_error(cli.mode.as_str(), database, &err);
            match serde_json::to_value(envelope) {
                Ok(value) => (value, true),
                Err(e) => {
                    eprintln!("docpool: could not serialize error: {e}");
                    return ExitCode::from(1);
                }
            }
        }
    };

    if let Err(err) = print_json(&envelope) {
        eprintln!("docpool: {err:#}");
        return ExitCode::from(1);
    }
    if failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
