mod gateway;
mod remote;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mobyclaw_config::GatewayConfig;

#[derive(Debug, Parser)]
#[command(
    name = "mobyclaw",
    version,
    about = "Personal-agent gateway: one shared session, schedules, heartbeats"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the gateway (default).
    Start,
    /// Query a running gateway's /status endpoint.
    Status,
    /// Manage schedules on a running gateway.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Check the gateway's external dependencies.
    Doctor,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommands {
    /// List schedules, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Create a schedule.  One of --message/--prompt is required.
    Add {
        /// Due time, RFC 3339 (e.g. 2030-01-01T09:00:00Z).
        #[arg(long)]
        due: String,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        /// Delivery channel (<platform>:<id>); defaults to the gateway's
        /// most recently active one.
        #[arg(long)]
        channel: Option<String>,
        /// daily | weekdays | weekly | monthly | 5-field cron.
        #[arg(long)]
        repeat: Option<String>,
    },
    /// Cancel a pending schedule by id.
    Cancel {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = GatewayConfig::from_env();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            let _log_guard = init_tracing(&config)?;
            gateway::run(config).await
        }
        Commands::Status => remote::status(&config).await,
        Commands::Schedule { command } => remote::schedule(&config, command).await,
        Commands::Doctor => remote::doctor(&config).await,
    }
}

/// Stderr plus a daily-rolling file under `<data_root>/logs/`.  The returned
/// guard must stay alive for the process lifetime or buffered lines are lost.
fn init_tracing(config: &GatewayConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(config.logs_dir(), "mobyclaw.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}
