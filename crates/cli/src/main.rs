mod config_commands;

use {
    clap::{Parser, Subcommand},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    wsgate_common::Context,
};

#[derive(Parser)]
#[command(name = "gatewayd", about = "wsgate — WebSocket connection and routing gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides the config file's `server.host`).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides the config file's `server.port`).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Path to a config file (falls back to discovery if unset).
    #[arg(long, global = true, env = "WSGATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Inspect or validate the configuration.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(cli.config, cli.bind, cli.port).await,
        Commands::Config { action } => config_commands::handle_config(action).await,
    }
}

async fn serve(config_path: Option<std::path::PathBuf>, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => wsgate_config::loader::load_config(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => wsgate_config::discover_and_load(),
    };
    config.normalize();

    if let Some(bind) = bind {
        config.server.host = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    wsgate_gateway::run(config).await?;
    Ok(())
}
