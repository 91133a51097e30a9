use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use tether::agent::AgentType;
use tether::discovery::DiscoveryHints;
use tether::events::HubEvent;
use tether::hub::{Hub, HubDeps};
use tether::settings::{self, AppConfig};
use tether::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Prompt delivery hub for local coding-agent CLIs")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Config file (default: $XDG_CONFIG_HOME/tether/config.toml)
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the hub HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run session discovery once and print the result
    Discover {
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "opencode")]
        cli: AgentType,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        tty: Option<String>,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Config { command } => run_config(&cli.common, command),
        command => {
            let (config, path) = AppConfig::load_or_init(cli.common.config.as_deref())?;
            init_logging(&cli.common, &config);
            debug!("loaded config from {}", path.display());
            match command {
                Command::Serve { host, port } => serve(config, host, port).await,
                Command::Discover {
                    project,
                    cli: cli_type,
                    pid,
                    tty,
                } => discover(config, project, cli_type, pid, tty).await,
                Command::Config { .. } => Ok(()),
            }
        }
    }
}

fn init_logging(common: &CommonOpts, config: &AppConfig) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = effective_log_level(common, &config.logging.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_str().to_lowercase();
        EnvFilter::new(format!("tether={level},tower_http={level}"))
    });

    if common.json_logs || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stderr().is_terminal()))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

fn effective_log_level(common: &CommonOpts, configured: &str) -> LevelFilter {
    if common.quiet {
        return LevelFilter::Error;
    }
    match common.verbose {
        0 => configured.parse().unwrap_or(LevelFilter::Info),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn run_config(common: &CommonOpts, command: ConfigCommand) -> Result<()> {
    let path = match &common.config {
        Some(path) => path.clone(),
        None => settings::default_config_file()?,
    };
    match command {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            settings::write_default_config(&path)?;
            println!("wrote {}", path.display());
        }
        ConfigCommand::Show => {
            let config = AppConfig::load_from(&path, None)?;
            print!(
                "{}",
                toml::to_string_pretty(&config).context("serializing configuration")?
            );
        }
    }
    Ok(())
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);
    if config.server.internal_secret.is_none() {
        warn!("no internal secret configured; the API is open to local callers");
    }

    let hub = Hub::open(config).await?;
    hub.start().await;
    spawn_event_logger(&hub);

    let app = tether::api::create_router(hub.clone());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("tether listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    hub.shutdown().await;
    Ok(())
}

/// Log hub events until the channel closes.
fn spawn_event_logger(hub: &Arc<Hub>) {
    let mut rx = hub.events.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match rx.recv().await {
                Ok(HubEvent::TypingStopped {
                    agent,
                    error: Some(error),
                    ..
                }) => warn!("delivery to {} failed: {}", agent, error),
                Ok(HubEvent::AgentUnreachable { agent, channel_id }) => {
                    info!("{} unreachable for {}", agent, channel_id)
                }
                Ok(event) => debug!("event: {:?}", event),
                Err(RecvError::Lagged(n)) => warn!("event logger lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn discover(
    config: AppConfig,
    project: String,
    cli: AgentType,
    pid: Option<u32>,
    tty: Option<String>,
) -> Result<()> {
    let deps = HubDeps::system(&config, Arc::new(MemoryStore::new()))?;

    let result = if cli == AgentType::Opencode {
        let mut hints = DiscoveryHints::for_project(project.clone());
        hints.pid = pid;
        hints.tty = tty;
        let credential = deps.resolver.discover(hints).await;
        serde_json::json!({
            "project": project,
            "cli": cli,
            "strategies": deps.resolver.strategy_names(),
            "credential": credential,
        })
    } else {
        let latest = deps.registries.latest_session(cli, &project).await;
        serde_json::json!({
            "project": project,
            "cli": cli,
            "session_id": latest.as_ref().map(|e| e.session_id.clone()),
            "directory": latest.as_ref().map(|e| e.directory.clone()),
        })
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
