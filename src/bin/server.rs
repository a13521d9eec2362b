//! SMTP Mux Server Binary

use anyhow::{Context, Result};
use clap::Parser;
use smtp_mux::config::{generate_example_config, Config, UsersConfig};
use smtp_mux::Server;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SMTP Mux Server
#[derive(Parser, Debug)]
#[command(name = "smtp-mux-server")]
#[command(about = "Multiplexed TCP tunnel server disguised as SMTP")]
#[command(version = smtp_mux::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Users file (overrides server.users_file)
    #[arg(short, long)]
    users: Option<PathBuf>,

    /// Listen port (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print an example configuration file and exit
    #[arg(long)]
    example_config: bool,
}

fn init_logging(default_level: &str, debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.example_config {
        print!("{}", generate_example_config());
        return Ok(());
    }

    // Load config
    let config_found = args.config.exists();
    let mut config = if config_found {
        Config::from_file(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?
    } else {
        Config::default()
    };

    init_logging(&config.logging.level, args.debug)?;
    if !config_found {
        info!("No config file found, using defaults");
    }

    if let Some(users) = &args.users {
        config.server.users_file = users.display().to_string();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.server.validate()?;

    // Load users
    let users = UsersConfig::from_file(&config.server.users_file)
        .with_context(|| format!("reading users file {}", config.server.users_file))?;
    if users.users.is_empty() {
        anyhow::bail!("no users configured in {}", config.server.users_file);
    }

    info!("SMTP Mux Server {}", smtp_mux::VERSION);
    info!("Loaded {} users", users.users.len());

    let server = Server::new(config.server, users)
        .context("loading TLS certificate (generate one with smtp-mux-gen-certs)")?;

    tokio::spawn(handle_signals(server.clone()));
    server.run().await
}

#[cfg(unix)]
async fn handle_signals(server: Server) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) =
        match (signal(SignalKind::hangup()), signal(SignalKind::terminate())) {
            (Ok(hangup), Ok(terminate)) => (hangup, terminate),
            (Err(e), _) | (_, Err(e)) => {
                error!("Cannot install signal handlers: {}", e);
                return;
            }
        };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                if let Err(e) = server.reload_users() {
                    warn!("Reload failed, keeping current users: {:#}", e);
                }
            }
            _ = terminate.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    server.shutdown();
}

#[cfg(not(unix))]
async fn handle_signals(server: Server) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
        server.shutdown();
    }
}
