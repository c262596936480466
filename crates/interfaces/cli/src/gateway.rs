//! Single-`main` wiring: construct every component, spawn the background
//! loops, serve HTTP, and tear it all down on Ctrl-C.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use mobyclaw_channels::{AdapterRegistry, ChannelStore};
use mobyclaw_config::GatewayConfig;
use mobyclaw_http::AppState;
use mobyclaw_memory::{ContextOptimizer, DashboardClient, ShortTermMemory};
use mobyclaw_runtime::{Heartbeat, Orchestrator, SessionStore};
use mobyclaw_scheduler::{ScheduleStore, SchedulerLoop};
use mobyclaw_telegram::TelegramBot;
use mobyclaw_upstream::{AgentClient, UpstreamAgent};

pub async fn run(config: GatewayConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_root)
        .with_context(|| format!("create data root {}", config.data_root.display()))?;
    info!(data_root = %config.data_root.display(), "gateway starting");

    // Upstream must answer before anything else is worth wiring.
    let agent = Arc::new(AgentClient::new(&config.upstream)?);
    agent
        .wait_for_ready(config.upstream.ready_timeout)
        .await
        .context("upstream agent runtime never became ready")?;

    let session = Arc::new(SessionStore::new(
        config.session_file(),
        config.session.clone(),
        config.heartbeat.tz(),
    )?);

    // A persisted session id is only useful if the upstream still has it.
    if let Some(id) = session.session_id() {
        match agent.validate_session(&id).await {
            Ok(true) => info!(session_id = %id, "resuming persisted session"),
            Ok(false) => {
                warn!(session_id = %id, "persisted session is gone upstream — clearing");
                session.clear();
            }
            Err(err) => {
                warn!(?err, "session validation failed — clearing");
                session.clear();
            }
        }
    }

    let stm = Arc::new(ShortTermMemory::new(config.stm_file(), &config.stm)?);
    let dashboard = DashboardClient::new(&config.dashboard);
    let context = config
        .dashboard
        .context_enabled
        .then(|| Arc::new(ContextOptimizer::new(&config, dashboard.clone())));
    if context.is_none() {
        info!("context optimizer disabled");
    }

    let channels = Arc::new(ChannelStore::new(config.channels_file())?);
    let registry = Arc::new(AdapterRegistry::new());
    let orchestrator = Orchestrator::new(
        agent,
        session,
        stm,
        context,
        dashboard,
        config.session.clone(),
    );
    let schedules = Arc::new(ScheduleStore::new(config.schedules_file())?);
    let heartbeat = Arc::new(Heartbeat::new(
        orchestrator.clone(),
        channels.clone(),
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    orchestrator.spawn_busy_watchdog(shutdown_rx.clone());
    tokio::spawn(
        SchedulerLoop::new(
            schedules.clone(),
            registry.clone(),
            Arc::new(orchestrator.clone()),
        )
        .run(shutdown_rx.clone()),
    );
    tokio::spawn(heartbeat.clone().run(shutdown_rx.clone()));

    if config.telegram.enabled() {
        let bot = TelegramBot::new(&config.telegram, orchestrator.clone(), channels.clone())?;
        registry.register("telegram", bot.sender());
        tokio::spawn(bot.run(shutdown_rx.clone()));
        info!("telegram adapter enabled");
    } else {
        info!("TELEGRAM_BOT_TOKEN unset — telegram adapter disabled");
    }

    let state = AppState {
        orchestrator,
        schedules,
        channels,
        registry,
        heartbeat,
        started_at: Instant::now(),
    };
    let server = tokio::spawn(mobyclaw_http::serve(
        config.http.port,
        state,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(result) => result?,
        Err(err) => warn!(?err, "http server task failed"),
    }
    Ok(())
}
