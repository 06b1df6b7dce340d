//! engine-broker - command line front end for an engine pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use engine_broker::{AskReply, EnginePool, PoolConfig};

#[derive(Parser)]
#[command(name = "engine-broker", version)]
#[command(about = "Supervise line-protocol analysis engines and multiplex requests to them", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "ENGINE_BROKER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that every configured engine has its executable, model and config
    Check,

    /// Start the pool and answer request lines from stdin on stdout
    Serve {
        /// Engine used when a request names none or an unknown one
        #[arg(short, long)]
        engine: Option<String>,
    },

    /// Start the pool, report every engine's status, then shut down
    Status {
        /// How long to let the workers print their banners
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries replies; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = PoolConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Check => check(&config),
        Command::Serve { engine } => {
            if let Some(name) = engine {
                config.default_engine = name;
            }
            serve(config).await
        }
        Command::Status { wait_ms } => status(config, Duration::from_millis(wait_ms)).await,
    }
}

fn check(config: &PoolConfig) -> Result<()> {
    let mut failed = 0;
    for spec in &config.engines {
        match spec.validate() {
            Ok(()) => println!("ok    {:<10} {}", spec.name, spec.executable.display()),
            Err(e) => {
                failed += 1;
                println!("FAIL  {:<10} {}", spec.name, e);
            }
        }
    }
    // Also catches duplicate names and a default outside the set.
    EnginePool::new(config.clone())?;

    if failed > 0 {
        bail!("{} of {} engine(s) failed validation", failed, config.engines.len());
    }
    println!("default engine: {}", config.default_engine);
    Ok(())
}

async fn status(config: PoolConfig, wait: Duration) -> Result<()> {
    let pool = EnginePool::new(config)?;
    pool.start_all();
    tokio::time::sleep(wait).await;

    let statuses = pool.statuses();
    pool.shutdown_all().await;

    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

/// One request line: `{"engine": "...", "payload": {...}}` or a bare payload object.
fn parse_request(line: &str) -> std::result::Result<(Option<String>, Value), String> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| format!("invalid request line: {}", e))?;
    let Value::Object(mut map) = value else {
        return Err("request line must be a JSON object".to_string());
    };

    if let Some(payload) = map.remove("payload") {
        let engine = map
            .get("engine")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((engine, payload))
    } else {
        Ok((None, Value::Object(map)))
    }
}

async fn serve(config: PoolConfig) -> Result<()> {
    let pool = Arc::new(EnginePool::new(config)?);
    let failures = pool.start_all();
    if failures.len() == pool.names().len() {
        bail!("no engine could be started");
    }
    log::info!(
        "serving engines [{}], default {}",
        pool.names().join(", "),
        pool.default_engine()
    );

    // Single stdout writer; replies arrive in completion order.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<AskReply>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = reply_rx.recv().await {
            let mut line = match serde_json::to_string(&reply) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("cannot encode reply: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        log::info!("stdin closed, draining {} request(s)", in_flight.len());
                        while in_flight.join_next().await.is_some() {}
                        break;
                    }
                    Err(e) => {
                        log::error!("stdin read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let pool = Arc::clone(&pool);
                let reply_tx = reply_tx.clone();
                in_flight.spawn(async move {
                    let reply = match parse_request(&line) {
                        Ok((engine, payload)) => pool.ask_reply(engine.as_deref(), payload).await,
                        Err(message) => AskReply::rejected(pool.default_engine(), message),
                    };
                    let _ = reply_tx.send(reply);
                });
            }
        }
    }

    log::info!("shutting down engines...");
    pool.shutdown_all().await;
    while in_flight.join_next().await.is_some() {}

    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received Ctrl+C"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}
