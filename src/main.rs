use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::{LimiterConfig, ENV_PREFIX};
use quotaguard::ratelimit::{AdmissionControl, Key, Limiter, Verdict};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Admit or reject requests read from stdin, one per line.
///
/// Each line is `<key> [cost]`, `peek <key>` or `reset <key>`. A key that
/// collides with a command word is checked with `check <key> [cost]`. One
/// JSON object is printed per line.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries verdicts.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Text => subscriber.with_thread_ids(true).init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting quotaguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = LimiterConfig::load(&args.config, ENV_PREFIX)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(algorithm = %config.algorithm, backend = ?config.storage_backend, "Configuration loaded");

    let limiter: Arc<dyn AdmissionControl> = Arc::new(Limiter::from_config(&config).await?);

    tokio::select! {
        result = serve(limiter) => result?,
        _ = shutdown_signal() => {}
    }

    info!("quotaguard stopped");
    Ok(())
}

/// Answer request lines from stdin until it closes.
async fn serve(limiter: Arc<dyn AdmissionControl>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match handle(limiter.as_ref(), line).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(line = line, error = %e, "Request failed");
                json!({ "error": e.to_string() })
            }
        };

        stdout.write_all(reply.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// One parsed stdin line.
#[derive(Debug, PartialEq)]
enum Request<'a> {
    Check { key: &'a str, cost: u64 },
    Peek(&'a str),
    Reset(&'a str),
}

fn parse(line: &str) -> anyhow::Result<Request<'_>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["check", key] => Ok(Request::Check { key: *key, cost: 1 }),
        ["check", key, cost] => Ok(Request::Check {
            key: *key,
            cost: parse_cost(cost)?,
        }),
        ["peek", key] => Ok(Request::Peek(*key)),
        ["reset", key] => Ok(Request::Reset(*key)),
        [key] => Ok(Request::Check { key: *key, cost: 1 }),
        [key, cost] => Ok(Request::Check {
            key: *key,
            cost: parse_cost(cost)?,
        }),
        _ => anyhow::bail!(
            "expected `<key> [cost]`, `check <key> [cost]`, `peek <key>` or `reset <key>`"
        ),
    }
}

fn parse_cost(cost: &str) -> anyhow::Result<u64> {
    cost.parse::<u64>()
        .with_context(|| format!("invalid cost `{}`", cost))
}

async fn handle(limiter: &dyn AdmissionControl, line: &str) -> anyhow::Result<Value> {
    match parse(line)? {
        Request::Check { key, cost } => {
            let key = Key::new(key);
            Ok(verdict_json(&key, limiter.check(&key, cost).await?))
        }
        Request::Peek(key) => {
            let key = Key::new(key);
            Ok(verdict_json(&key, limiter.peek(&key).await?))
        }
        Request::Reset(key) => {
            let key = Key::new(key);
            limiter.reset(&key).await?;
            Ok(json!({ "key": key.as_str(), "reset": true }))
        }
    }
}

fn verdict_json(key: &Key, verdict: Verdict) -> Value {
    match verdict {
        Verdict::Allowed {
            remaining,
            reset_at,
        } => json!({
            "key": key.as_str(),
            "allowed": true,
            "remaining": remaining,
            "reset_at_ms": reset_at.as_millis(),
        }),
        Verdict::Denied { retry_after } => json!({
            "key": key.as_str(),
            "allowed": false,
            "retry_after_ms": retry_after.as_millis() as u64,
        }),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requests() {
        assert_eq!(parse("user:1").unwrap(), Request::Check { key: "user:1", cost: 1 });
        assert_eq!(parse("user:1 5").unwrap(), Request::Check { key: "user:1", cost: 5 });
        assert_eq!(parse("peek user:1").unwrap(), Request::Peek("user:1"));
        assert_eq!(parse("  reset   user:1 ").unwrap(), Request::Reset("user:1"));
        assert_eq!(parse("check peek").unwrap(), Request::Check { key: "peek", cost: 1 });
        assert_eq!(parse("check reset 3").unwrap(), Request::Check { key: "reset", cost: 3 });
        assert_eq!(parse("peek 5").unwrap(), Request::Peek("5"));
        assert!(parse("user:1 lots").is_err());
        assert!(parse("a b c").is_err());
    }
}
