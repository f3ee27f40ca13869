use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pairbot::clock::{Clock, SystemClock};
use pairbot::commands::{BuiltinDeps, CommandDispatcher, register_builtins};
use pairbot::config::{BotConfig, LogFormat};
use pairbot::http::{AppState, HttpServer, HttpServerConfig, pairing_routes};
use pairbot::pairing::{
    CodeIssuer, CredentialStore, PairingService, UpstreamCodeClient, spawn_sweeper,
};
use pairbot::session::{
    BridgeConnector, ConnectionSupervisor, FileCredentialStorage, SupervisorEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let config = BotConfig::parse();
    config.validate()?;
    init_tracing(config.log_format);

    tracing::info!(
        prefix = %config.prefix,
        auth_dir = %config.auth_dir.display(),
        bridge = %config.bridge_url,
        "Starting {}",
        config.bot_name
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let started_at = clock.now();

    let store = Arc::new(CredentialStore::new(Arc::clone(&clock), config.code_ttl()));
    let sweeper = spawn_sweeper(Arc::clone(&store), config.sweep_interval());
    let pairing = Arc::new(PairingService::new(store, Arc::clone(&clock)));

    let issuer = match config.upstream_base_url() {
        Some(base) => {
            tracing::info!(upstream = %base, "Relaying pairing codes to upstream");
            let upstream = UpstreamCodeClient::new(base, config.upstream_timeout())
                .context("failed to build upstream client")?;
            CodeIssuer::Relay {
                upstream,
                fallback: Arc::clone(&pairing),
            }
        }
        None => CodeIssuer::Local(Arc::clone(&pairing)),
    };
    let issuer = Arc::new(issuer);

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        Arc::new(BridgeConnector::new(
            config.bridge_url.clone(),
            config.bridge_connect_timeout(),
        )),
        Arc::new(FileCredentialStorage::new(config.auth_dir.clone())),
        config.reconnect_policy(),
        config.supervisor_options(),
        inbound_tx,
    ));

    let dispatcher = register_builtins(
        CommandDispatcher::builder(config.prefix.clone(), Arc::clone(&pairing), supervisor.clone()),
        BuiltinDeps {
            bot_name: config.bot_name.clone(),
            pairing: Arc::clone(&pairing),
            issuer: Arc::clone(&issuer),
            clock: Arc::clone(&clock),
            started_at,
            session_state: supervisor.subscribe_state(),
        },
    )
    .build();
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(inbound_rx).await });

    let events_task = tokio::spawn(log_events(supervisor.subscribe_events()));

    let mut server = HttpServer::new(HttpServerConfig {
        addr: config.http_addr(),
    });
    server.add_routes(pairing_routes(AppState {
        issuer,
        pairing,
        session: supervisor.subscribe_state(),
    }));
    server.start().await?;

    let mut run_task = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.run().await }
    });

    let outcome = tokio::select! {
        result = &mut run_task => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, shutting down");
            supervisor.shutdown();
            run_task.await
        }
    };

    server.shutdown().await;
    sweeper.abort();
    dispatcher_task.abort();
    events_task.abort();

    outcome
        .context("session supervisor task panicked")?
        .context("session ended")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn log_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::StateChanged(state)) => {
                tracing::info!(state = %state, "Session state changed");
            }
            Ok(event) => tracing::debug!(?event, "Supervisor event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Supervisor event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
