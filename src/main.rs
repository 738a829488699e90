// QuotaGuard - Main Entry Point
//
// Runs the guarded generation server and provides operator commands:
// - serve: HTTP API with inbound rate limiting and upstream quota governance
// - check: dry-run an endpoint's rate limits against a running server
// - quota-status: upstream quota snapshot from a running server
// - show-config: print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quotaguard::clock::SystemClock;
use quotaguard::config::Config;
use quotaguard::rate_limit::maintenance::spawn_compaction;
use quotaguard::server::{self, AppState};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// QuotaGuard: admission control in front of a quota-limited AI provider
#[derive(Parser, Debug)]
#[command(name = "quotaguard")]
#[command(version)]
#[command(about = "Rate limiting and upstream quota governance for AI generation", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the XDG config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve,
    /// Probe an endpoint's rate limits without consuming any budget
    Check {
        /// Logical endpoint name
        #[arg(long, default_value = "generate_questions")]
        endpoint: String,

        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,

        /// Client IP address
        #[arg(long)]
        ip: Option<String>,

        /// Server URL (defaults to the configured bind address)
        #[arg(long)]
        url: Option<String>,
    },
    /// Show the upstream quota status of a running server
    QuotaStatus {
        /// Server URL (defaults to the configured bind address)
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Serve) => serve(config).await?,
        Some(Commands::Check {
            endpoint,
            user,
            ip,
            url,
        }) => {
            let base = url.unwrap_or_else(|| config.server.base_url());
            check(&base, &endpoint, user, ip).await?;
        }
        Some(Commands::QuotaStatus { url }) => {
            let base = url.unwrap_or_else(|| config.server.base_url());
            quota_status(&base).await?;
        }
        Some(Commands::ShowConfig) => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", text);
        }
        None => {
            info!("No command specified. Use \"quotaguard --help\" for usage.");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { config.log_level()? };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = AppState::from_config(&config, shutdown.clone())?;

    let compaction = if config.maintenance.enabled {
        Some(spawn_compaction(
            state.limiter.store().clone(),
            Arc::new(SystemClock),
            config.rate_limit.max_window(),
            config.maintenance.interval(),
            shutdown.clone(),
        ))
    } else {
        None
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    let result = server::serve(&config, state).await;
    shutdown.cancel();
    if let Some(handle) = compaction {
        let _ = handle.await;
    }
    result
}

async fn get_json(url: &str) -> Result<Value> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .with_context(|| format!("Invalid response from {}", url))?;
    if !status.is_success() {
        anyhow::bail!("{} returned {}: {}", url, status, body);
    }
    Ok(body)
}

async fn check(base: &str, endpoint: &str, user: Option<String>, ip: Option<String>) -> Result<()> {
    let mut url = reqwest::Url::parse(base)
        .with_context(|| format!("Invalid server URL {}", base))?
        .join(&format!("rate-limit/{}", endpoint))
        .context("Invalid endpoint name")?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(user) = &user {
            query.append_pair("user", user);
        }
        if let Some(ip) = &ip {
            query.append_pair("ip", ip);
        }
    }

    let body = get_json(url.as_str()).await?;
    let allowed = body.get("allowed").and_then(Value::as_bool).unwrap_or(false);

    println!("{}", serde_json::to_string_pretty(&body)?);
    if allowed {
        println!("\n✅ {} would be admitted", endpoint);
    } else {
        println!("\n⛔ {} would be denied", endpoint);
    }
    Ok(())
}

async fn quota_status(base: &str) -> Result<()> {
    let url = format!("{}/quota/status", base.trim_end_matches('/'));
    let body = get_json(&url).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
