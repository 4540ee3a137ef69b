use std::net::{IpAddr, SocketAddr};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use spindle::server::startup::{run_server_with_config, ServerConfig};
use spindle::{config, logging};

#[derive(Parser)]
#[command(name = "spindle", version, about = "Traffic-shaping control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (the default).
    Start,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as JSON (secrets redacted).
    Show,
    /// Print the resolved config file path.
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Start) => run_server().await,
        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => handle_config_show()?,
                ConfigCommand::Path => {
                    println!("{}", config::get_config_path().display());
                }
            }
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;
    let cfg = config::load_config()?;

    let host: IpAddr = cfg.server.host.parse()?;
    let bind_address = SocketAddr::new(host, cfg.server.port);

    info!(target: "server", "spindle v{}", env!("CARGO_PKG_VERSION"));
    log_startup_banner(&cfg);

    let handle = run_server_with_config(ServerConfig {
        config: cfg,
        bind_address,
        spawn_background_tasks: true,
    })
    .await?;

    let reason = await_shutdown_trigger().await;
    info!(target: "server", "shutdown signal received ({reason})");
    handle.shutdown().await;
    info!(target: "server", "bye");
    Ok(())
}

/// Initialize logging based on the SPINDLE_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("SPINDLE_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

fn log_startup_banner(cfg: &config::Config) {
    info!(
        target: "server",
        postgres = cfg.store.postgres_url.is_some(),
        clickhouse = cfg.store.clickhouse_url.is_some(),
        redis = cfg.store.redis_url.is_some(),
        geoip = cfg.geoip.database_path.is_some(),
        "store configuration"
    );
    if cfg.store.postgres_url.is_none() && cfg.store.clickhouse_url.is_none() {
        warn!(target: "server", "no stores configured; running from memory only");
    }
}

fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load_config_file(&config::get_config_path())?;
    config::apply_env_overrides(&mut cfg);
    // Redact secrets before printing.
    if !cfg.admin.api_key.is_empty() {
        cfg.admin.api_key = "***".to_string();
    }
    cfg.store.postgres_url = cfg.store.postgres_url.map(redact_url);
    cfg.store.clickhouse_url = cfg.store.clickhouse_url.map(redact_url);
    cfg.store.redis_url = cfg.store.redis_url.map(redact_url);
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

/// Strip userinfo from a URL for display.
fn redact_url(url: String) -> String {
    match url.split_once('@') {
        Some((scheme_and_user, rest)) => match scheme_and_user.split_once("://") {
            Some((scheme, _)) => format!("{scheme}://***@{rest}"),
            None => format!("***@{rest}"),
        },
        None => url,
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            warn!(target: "server", %err, "SIGTERM handler unavailable, Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
