mod api;
mod config;
mod directory;
mod dispatcher;
mod entity;
mod modes;
mod mqtt;
mod payload;
mod recorder;
mod state;
mod topic;
mod triggers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::BridgeConfig;
use dispatcher::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sleep_bridge=debug")),
        )
        .init();

    tracing::info!("Starting sleep-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path = BridgeConfig::path_from_env();
    let mut config = BridgeConfig::load(&config_path)?;
    config.apply_env_overrides()?;
    config.validate()?;

    let states = Arc::new(state::StateMachine::new(4096));
    let bus = Arc::new(state::EventBus::new(1024));

    // Restore persisted states before any message can arrive
    let restored = recorder::restore(&config.db_path, &states)?;
    tracing::info!("Restored {} entity states from {}", restored, config.db_path.display());

    let dispatcher = Arc::new(Dispatcher::new(&config, states.clone(), bus.clone()));
    let devices = dispatcher.restore_entities();
    tracing::info!("Recreated {} bridge entities", devices);

    // Forward state changes to the recorder
    let writer = recorder::spawn_writer(config.db_path.clone(), config.retention_days);
    let mut changes = states.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(event) => {
                    if writer.send(event).is_err() {
                        tracing::error!("Recorder writer stopped");
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Recorder lagged, {} state changes not persisted", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Log matched device triggers
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.event_type == triggers::TRIGGER_EVENT => {
                    tracing::info!("Trigger {}", event.data);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Trigger log skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (client, mqtt_task) = mqtt::start(&config, dispatcher.clone());

    let app_state = Arc::new(AppState {
        states,
        bus,
        dispatcher: dispatcher.clone(),
        db_path: config.db_path.clone(),
        started_at: std::time::Instant::now(),
    });
    let app = api::router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    mqtt::shutdown(&client, &dispatcher).await;
    match tokio::time::timeout(Duration::from_secs(5), mqtt_task).await {
        Ok(Err(e)) => tracing::warn!("MQTT task ended abnormally: {}", e),
        Err(_) => tracing::warn!("MQTT task did not stop in time"),
        Ok(Ok(())) => {}
    }

    Ok(())
}
