use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice::config::{LoggingConfig, SluiceConfig};
use sluice::ratelimit::{Decision, RateLimiter, RuleReloader, RuleSetConfig, RulesFile};
use sluice::store;

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Rate limiting decision engine")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rules file, overriding `rate_limiting.rules_path`
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests for a key and print each decision
    Check {
        /// Caller key
        key: String,
        /// Rule name; falls back to key prefix and default rule matching
        #[arg(long, default_value = "")]
        rule: String,
        /// Number of requests to count
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Print the current decision for a key without counting a request
    Status {
        key: String,
        #[arg(long, default_value = "")]
        rule: String,
    },
    /// Validate a rules file and exit
    Validate {
        /// Rules file; defaults to the configured one
        path: Option<PathBuf>,
    },
    /// Read `<rule> <key>` lines from stdin and answer each with a decision,
    /// reloading rules as the file changes
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = SluiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let rules_path = cli.rules.or_else(|| config.rate_limiting.rules_path.clone());

    match cli.command {
        Command::Check { key, rule, count } => {
            let (limiter, _) = build_limiter(&config, rules_path.as_deref()).await?;
            for _ in 0..count {
                print_decision(&limiter.check_key(&key, &rule).await?)?;
            }
        }
        Command::Status { key, rule } => {
            let (limiter, _) = build_limiter(&config, rules_path.as_deref()).await?;
            print_decision(&limiter.status_key(&key, &rule).await?)?;
        }
        Command::Validate { path } => {
            let path = path.or(rules_path).context("No rules file given")?;
            let (rules, default_rule) = RuleSetConfig::from_file(&path)?.into_rules()?;
            println!(
                "{}: {} rules valid (default rule: {})",
                path.display(),
                rules.len(),
                default_rule.as_deref().unwrap_or("none")
            );
        }
        Command::Watch => watch(&config, rules_path.as_deref()).await?,
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // stdout carries decisions; logs go to stderr
    if logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn build_limiter(
    config: &SluiceConfig,
    rules_path: Option<&Path>,
) -> anyhow::Result<(Arc<RateLimiter>, RulesFile)> {
    let rules_path = rules_path.context("No rules file configured (use --rules or rate_limiting.rules_path)")?;

    let store = store::connect(&config.store).await?;
    let mut limiter = RateLimiter::new(store).with_failure_policy(config.rate_limiting.failure_policy);
    if let Some(timeout) = config.store.timeout() {
        limiter = limiter.with_store_timeout(timeout);
    }

    let mut file = RulesFile::new(rules_path);
    file.reload(&limiter)
        .await
        .with_context(|| format!("Failed to load rules from {}", rules_path.display()))?;

    Ok((Arc::new(limiter), file))
}

async fn watch(config: &SluiceConfig, rules_path: Option<&Path>) -> anyhow::Result<()> {
    let (limiter, file) = build_limiter(config, rules_path).await?;

    let reloader = config
        .rate_limiting
        .reload_interval()
        .map(|interval| RuleReloader::spawn(limiter.clone(), file, interval));

    info!("Reading requests from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else { break };

        let mut parts = line.split_whitespace();
        let (Some(rule), Some(key)) = (parts.next(), parts.next()) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Expected `<rule> <key>`");
            }
            continue;
        };

        match limiter.check_key(key, rule).await {
            Ok(decision) => print_decision(&decision)?,
            Err(e) => println!("{}", serde_json::json!({ "error": e.code(), "message": e.to_string() })),
        }
    }

    if let Some(reloader) = reloader {
        reloader.shutdown().await;
    }
    info!("Sluice stopped");
    Ok(())
}

fn print_decision(decision: &Decision) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(decision)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
